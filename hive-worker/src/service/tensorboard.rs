//! Tensorboard dashboard for a running job

use anyhow::{Context, Result};
use std::path::Path;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{debug, info};

/// Executable started when the master asks for a dashboard
pub const TENSORBOARD_BINARY: &str = "tensorboard";

pub struct Tensorboard {
    child: Child,
    port: u16,
}

impl Tensorboard {
    /// Serves `logdir` on all interfaces at `port`
    pub fn spawn(binary: &str, logdir: &Path, port: u16) -> Result<Self> {
        let child = Command::new(binary)
            .arg("--logdir")
            .arg(logdir)
            .arg("--port")
            .arg(port.to_string())
            .arg("--bind_all")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start {}", binary))?;

        info!("Tensorboard serving {} on port {}", logdir.display(), port);
        Ok(Self { child, port })
    }

    /// Kills the dashboard unless it already exited
    pub async fn kill(mut self) -> Result<()> {
        if let Some(status) = self.child.try_wait()? {
            debug!("Tensorboard already exited with {}", status);
            return Ok(());
        }

        self.child
            .kill()
            .await
            .context("Failed to kill tensorboard")?;
        debug!("Tensorboard on port {} killed", self.port);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_binary_fails_to_spawn() {
        let result = Tensorboard::spawn("hive-no-such-tensorboard", Path::new("/tmp"), 6006);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_kill_after_exit_is_ok() {
        let board = Tensorboard::spawn("true", Path::new("/tmp"), 6006).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        board.kill().await.unwrap();
    }
}
