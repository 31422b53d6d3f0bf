//! Log domain types

use serde::{Deserialize, Serialize};

/// One line of user job output, stamped when the worker read it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub line: String,
}

impl LogLine {
    pub fn now(line: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            line: line.into(),
        }
    }
}
