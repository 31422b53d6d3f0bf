//! Training task domain types

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Keep-alive interval used when the master does not send one
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 30;

/// One job assignment handed out by the master on poll
///
/// Built from the `config` blob of a successful poll. Only the worker mutates
/// `dataset_local_path` (at fetch time) and `finished` (after the master
/// acknowledged a final report).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingTask {
    pub task_uuid: String,
    pub job_uuid: String,
    pub task_role: TaskRole,
    #[serde(default)]
    pub task_index: u32,
    #[serde(default)]
    pub cluster_spec: serde_json::Value,
    #[serde(default)]
    pub dataset_name: Option<String>,
    #[serde(skip)]
    pub dataset_local_path: Option<PathBuf>,
    #[serde(default)]
    pub is_dataset_persisted: bool,
    #[serde(default)]
    pub download_urls: HashMap<ContentType, Vec<String>>,
    #[serde(default)]
    pub job_type: String,
    #[serde(default = "default_keep_alive", alias = "keep_alive_interval_seconds")]
    pub keep_alive_interval: u64,
    #[serde(default)]
    pub signal_finish: bool,
    #[serde(skip)]
    pub finished: bool,
}

fn default_keep_alive() -> u64 {
    DEFAULT_KEEP_ALIVE_SECS
}

impl TrainingTask {
    /// Parses the task out of a poll `config` value
    ///
    /// The master embeds the config as a JSON string; a plain object is
    /// accepted as well.
    pub fn from_config(config: &serde_json::Value) -> Result<Self, serde_json::Error> {
        match config {
            serde_json::Value::String(blob) => serde_json::from_str(blob),
            other => serde_json::from_value(other.clone()),
        }
    }

    /// First six characters of the task uuid, used to name artifacts
    pub fn short_uuid(&self) -> &str {
        let end = self
            .task_uuid
            .char_indices()
            .nth(6)
            .map(|(i, _)| i)
            .unwrap_or(self.task_uuid.len());
        &self.task_uuid[..end]
    }

    /// URLs of one content type, empty if the master sent none
    pub fn urls(&self, content: ContentType) -> &[String] {
        self.download_urls
            .get(&content)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Role of a task inside its distributed job
///
/// Only `worker` tasks consume the dataset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskRole {
    Worker,
    Chief,
    Ps,
    Evaluator,
    Other(String),
}

impl TaskRole {
    pub fn as_str(&self) -> &str {
        match self {
            TaskRole::Worker => "worker",
            TaskRole::Chief => "chief",
            TaskRole::Ps => "ps",
            TaskRole::Evaluator => "evaluator",
            TaskRole::Other(role) => role,
        }
    }

    pub fn consumes_dataset(&self) -> bool {
        matches!(self, TaskRole::Worker)
    }
}

impl From<String> for TaskRole {
    fn from(role: String) -> Self {
        match role.as_str() {
            "worker" => TaskRole::Worker,
            "chief" | "master" => TaskRole::Chief,
            "ps" => TaskRole::Ps,
            "evaluator" => TaskRole::Evaluator,
            _ => TaskRole::Other(role),
        }
    }
}

impl From<TaskRole> for String {
    fn from(role: TaskRole) -> Self {
        role.as_str().to_string()
    }
}

impl std::fmt::Display for TaskRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of content behind a pre-signed download URL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Code,
    Dataset,
}

/// State reported to the master through the task endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskAction {
    Progress,
    Finished,
    Failed,
}

impl std::fmt::Display for TaskAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskAction::Progress => write!(f, "progress"),
            TaskAction::Finished => write!(f, "finished"),
            TaskAction::Failed => write!(f, "failed"),
        }
    }
}

/// What the master wants the worker to do next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Continue,
    Stop,
    /// Anything else; handled like `Stop` but logged as a protocol mismatch
    Unexpected(String),
}

/// A pre-signed multipart POST target in object storage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresignedPost {
    pub url: String,
    #[serde(default)]
    pub fields: HashMap<String, String>,
}
