//! Log sink
//!
//! Destination for user job output. The log-streaming task and the
//! supervisor's fallback dump both write through this trait.

use anyhow::{Context, Result};
use async_trait::async_trait;
use hive_core::domain::log::LogLine;
use std::sync::Arc;

use super::master::MasterApi;

#[async_trait]
pub trait LogSink: Send + Sync {
    async fn send(&self, lines: Vec<LogLine>) -> Result<()>;
}

/// Ships log lines of one task to the master
pub struct MasterLogSink {
    master: Arc<dyn MasterApi>,
    token: String,
    task_uuid: String,
}

impl MasterLogSink {
    pub fn new(master: Arc<dyn MasterApi>, token: String, task_uuid: String) -> Self {
        Self {
            master,
            token,
            task_uuid,
        }
    }
}

#[async_trait]
impl LogSink for MasterLogSink {
    async fn send(&self, lines: Vec<LogLine>) -> Result<()> {
        if lines.is_empty() {
            return Ok(());
        }

        self.master
            .send_logs(&self.token, &self.task_uuid, lines)
            .await
            .context("Failed to send logs")
    }
}
