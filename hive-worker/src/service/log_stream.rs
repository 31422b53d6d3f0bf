//! Log streaming
//!
//! Tails the job's user log and forwards complete lines to a sink at a fixed
//! interval. The byte offset of the last forwarded line is shared with the
//! supervisor so that a fallback dump resumes exactly where the stream
//! stopped.

use anyhow::{Context, Result};
use hive_core::domain::log::LogLine;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::repository::LogSink;

/// How often new lines are shipped while the job runs
pub const LOG_STREAM_INTERVAL: Duration = Duration::from_secs(1);

/// Handle to a running log-streaming task
pub struct LogStream {
    cancel: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

impl LogStream {
    /// Starts tailing `path` from the byte position held in `offset`
    pub fn spawn(
        path: PathBuf,
        sink: Arc<dyn LogSink>,
        offset: Arc<AtomicU64>,
        interval: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(tail(path, sink, offset, interval, cancel.clone()));

        Self { cancel, handle }
    }

    /// Whether the task already ended on its own (it only does so on error)
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Flushes what is left, stops the task and waits for it
    pub async fn stop(self) -> Result<()> {
        self.cancel.cancel();
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(anyhow::anyhow!("Log stream task panicked: {}", e)),
        }
    }
}

async fn tail(
    path: PathBuf,
    sink: Arc<dyn LogSink>,
    offset: Arc<AtomicU64>,
    interval: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let mut ticker = time::interval(interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Final flush includes a trailing line without newline.
                forward(&path, sink.as_ref(), &offset, true).await?;
                debug!("Log stream for {} stopped", path.display());
                return Ok(());
            }
            _ = ticker.tick() => {
                forward(&path, sink.as_ref(), &offset, false).await?;
            }
        }
    }
}

/// Sends the lines past `offset` and commits the new offset once they are out
async fn forward(
    path: &Path,
    sink: &dyn LogSink,
    offset: &AtomicU64,
    include_partial: bool,
) -> Result<()> {
    let start = offset.load(Ordering::Acquire);
    let (lines, end) = read_new_lines(path, start, include_partial).await?;

    if lines.is_empty() {
        return Ok(());
    }

    let count = lines.len();
    let now = chrono::Utc::now();
    let batch = lines
        .into_iter()
        .map(|line| LogLine {
            timestamp: now,
            line,
        })
        .collect();

    if let Err(e) = sink.send(batch).await {
        warn!("Failed to forward {} log line(s): {:#}", count, e);
        return Err(e);
    }

    offset.store(end, Ordering::Release);
    Ok(())
}

/// Reads the lines written to `path` after byte `offset`
///
/// Only newline-terminated lines are returned unless `include_partial` is
/// set. A missing file yields nothing.
///
/// # Returns
/// The lines and the offset just past the last returned byte
pub async fn read_new_lines(
    path: &Path,
    offset: u64,
    include_partial: bool,
) -> Result<(Vec<String>, u64)> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), offset)),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to open {}", path.display()));
        }
    };

    file.seek(SeekFrom::Start(offset))
        .await
        .with_context(|| format!("Failed to seek in {}", path.display()))?;

    let mut buf = Vec::new();
    file.read_to_end(&mut buf)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let consumed = if include_partial {
        buf.len()
    } else {
        match buf.iter().rposition(|b| *b == b'\n') {
            Some(pos) => pos + 1,
            None => 0,
        }
    };

    let lines = String::from_utf8_lossy(&buf[..consumed])
        .lines()
        .map(|l| l.trim_end_matches('\r').to_string())
        .collect();

    Ok((lines, offset + consumed as u64))
}
