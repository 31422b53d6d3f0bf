//! Log DTOs

use serde::{Deserialize, Serialize};

use crate::domain::log::LogLine;

/// Batch of user log lines shipped from a worker to the master
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogBatch {
    pub task_uuid: String,
    pub lines: Vec<LogLine>,
}
