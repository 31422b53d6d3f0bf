//! Task execution supervisor
//!
//! Owns one started job and its log stream for the duration of the signal
//! loop. The supervisor only observes and tears down; every decision about
//! what to report to the master stays with the worker.

use anyhow::Result;
use hive_core::domain::log::LogLine;
use hive_core::domain::task::PresignedPost;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::environment::WorkLayout;
use super::executor::JobHandle;
use crate::container::ALIVE_STATES;
use crate::repository::LogSink;
use crate::service::{LogStream, read_new_lines};

/// Server-error retries allowed during one signal exchange
pub const RETRY_BUDGET: u32 = 10;

/// Snapshot of the job as seen by [`TaskSupervisor::monitor`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorStatus {
    pub alive: bool,
    /// `false` once the job crashed or wrote the failure marker
    pub graceful: bool,
}

pub struct TaskSupervisor {
    handle: JobHandle,
    log_dir: PathBuf,
    user_log: PathBuf,
    failure_marker: PathBuf,
    sink: Arc<dyn LogSink>,
    log_stream: Option<LogStream>,
    offset: Arc<AtomicU64>,
    stream_failed: bool,
    retry_budget: u32,
    /// Upload target handed out by the master with its final reply
    pub output_upload: Option<PresignedPost>,
}

impl TaskSupervisor {
    pub fn new(handle: JobHandle, layout: &WorkLayout, sink: Arc<dyn LogSink>) -> Self {
        Self {
            handle,
            log_dir: layout.log.clone(),
            user_log: layout.user_log(),
            failure_marker: layout.failure_marker(),
            sink,
            log_stream: None,
            offset: Arc::new(AtomicU64::new(0)),
            stream_failed: false,
            retry_budget: RETRY_BUDGET,
            output_upload: None,
        }
    }

    /// Starts forwarding the user log to the sink
    pub fn start_log_stream(&mut self, interval: Duration) {
        if self.log_stream.is_some() {
            return;
        }

        self.log_stream = Some(LogStream::spawn(
            self.user_log.clone(),
            self.sink.clone(),
            self.offset.clone(),
            interval,
        ));
    }

    pub fn retry_budget(&self) -> u32 {
        self.retry_budget
    }

    /// `true` once the log stream ended with an error
    pub fn stream_failed(&self) -> bool {
        self.stream_failed
            || self
                .log_stream
                .as_ref()
                .map(LogStream::is_finished)
                .unwrap_or(false)
    }

    pub async fn monitor(&mut self) -> MonitorStatus {
        let mut status = match &mut self.handle {
            JobHandle::Process(child) => match child.try_wait() {
                Ok(None) => MonitorStatus {
                    alive: true,
                    graceful: true,
                },
                Ok(Some(exit)) => {
                    debug!("Job process exited with {}", exit);
                    MonitorStatus {
                        alive: false,
                        graceful: exit.success(),
                    }
                }
                Err(e) => {
                    warn!("Failed to query job process: {}", e);
                    MonitorStatus {
                        alive: false,
                        graceful: false,
                    }
                }
            },
            JobHandle::Container { runtime, id } => match runtime.status(id).await {
                Ok(state) if ALIVE_STATES.contains(&state.as_str()) => MonitorStatus {
                    alive: true,
                    graceful: true,
                },
                Ok(state) => {
                    let code = runtime.exit_code(id).await;
                    debug!("Job container {} is {} ({:?})", id, state, code);
                    MonitorStatus {
                        alive: false,
                        graceful: matches!(code, Ok(0)),
                    }
                }
                Err(e) => {
                    warn!("Failed to inspect job container {}: {:#}", id, e);
                    MonitorStatus {
                        alive: false,
                        graceful: false,
                    }
                }
            },
        };

        if tokio::fs::try_exists(&self.failure_marker)
            .await
            .unwrap_or(false)
        {
            debug!("Failure marker present in {}", self.log_dir.display());
            status.graceful = false;
        }

        status
    }

    /// Kills the job if it still runs and stops the log stream
    ///
    /// Safe to call any number of times.
    pub async fn terminate(&mut self) {
        match &mut self.handle {
            JobHandle::Process(child) => {
                if let Ok(None) = child.try_wait() {
                    info!("Killing job process");
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill job process: {}", e);
                    }
                }
            }
            JobHandle::Container { runtime, id } => {
                if let Ok(state) = runtime.status(id).await {
                    if ALIVE_STATES.contains(&state.as_str()) {
                        info!("Killing job container {}", id);
                        if let Err(e) = runtime.kill(id).await {
                            warn!("Failed to kill job container {}: {:#}", id, e);
                        }
                    }
                }
            }
        }

        if let Some(stream) = self.log_stream.take() {
            if let Err(e) = stream.stop().await {
                warn!("Log stream ended with an error: {:#}", e);
                self.stream_failed = true;
            }
        }
    }

    /// Spends one server-error retry
    pub fn can_retry(&mut self) -> bool {
        if self.retry_budget == 0 {
            return false;
        }
        self.retry_budget -= 1;
        true
    }

    /// Forwards everything the log stream did not deliver
    ///
    /// Reads the user log past the last committed offset and, for container
    /// jobs, the container's own output.
    pub async fn dump_output(&mut self) -> Result<()> {
        let start = self.offset.load(Ordering::Acquire);
        let (mut lines, end) = read_new_lines(&self.user_log, start, true).await?;

        if let JobHandle::Container { runtime, id } = &self.handle {
            match runtime.logs(id).await {
                Ok(output) => lines.extend(output.lines().map(str::to_string)),
                Err(e) => warn!("Failed to collect container output: {:#}", e),
            }
        }

        if lines.is_empty() {
            return Ok(());
        }

        info!("Dumping {} remaining log line(s)", lines.len());
        self.sink
            .send(lines.into_iter().map(LogLine::now).collect())
            .await?;
        self.offset.store(end, Ordering::Release);
        Ok(())
    }

    /// Removes the job container; nothing to do for processes
    pub async fn dispose(&mut self) {
        if let JobHandle::Container { runtime, id } = &self.handle {
            runtime.remove(id).await;
        }
    }
}
