//! Task DTOs
//!
//! Bodies of the progress/finish report and tensorboard endpoints.

use serde::{Deserialize, Serialize};

use crate::domain::task::{Directive, PresignedPost, TaskAction};

/// Progress ping or final report for a running task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_uuid: String,
    pub action: TaskAction,
}

/// Master reply to a [`TaskReport`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskReply {
    #[serde(default)]
    pub result: String,
    #[serde(default, deserialize_with = "flag")]
    pub create_tensorboard: bool,
    #[serde(default)]
    pub task_data: Option<TaskData>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskData {
    #[serde(default)]
    pub upload_urls: Option<UploadUrls>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadUrls {
    #[serde(default)]
    pub output: Option<PresignedPost>,
}

impl TaskReply {
    pub fn directive(&self) -> Directive {
        match self.result.as_str() {
            "continue" => Directive::Continue,
            "stop" => Directive::Stop,
            other => Directive::Unexpected(other.to_string()),
        }
    }

    /// Pre-signed target for the output archive, if the master issued one
    pub fn output_upload(&self) -> Option<&PresignedPost> {
        self.task_data
            .as_ref()
            .and_then(|data| data.upload_urls.as_ref())
            .and_then(|urls| urls.output.as_ref())
    }
}

/// Notifies the master that a dashboard is up for a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorboardUpdate {
    pub tensorboard_created: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorboardResponse {
    pub tensorboard_url: String,
}

/// Accepts `true`/`false` as well as `0`/`1` for boolean flags
fn flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Bool(b) => b,
        serde_json::Value::Number(n) => n.as_i64().unwrap_or(0) != 0,
        _ => false,
    })
}
