//! Work directory layout and job environment

use anyhow::{Context, Result};
use hive_core::domain::task::TrainingTask;
use hive_core::domain::worker::WorkerKind;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Name of the file user output is appended to, inside the log directory
pub const USER_LOG: &str = "user.log";

/// File user code creates in the log directory to signal an internal failure
pub const FAILURE_MARKER: &str = "FAILED";

/// Mount points inside a job container
pub const CONTAINER_CODE_DIR: &str = "/workspace/code";
pub const CONTAINER_OUTPUT_DIR: &str = "/workspace/output";
pub const CONTAINER_LOG_DIR: &str = "/workspace/log";
pub const CONTAINER_VENV_DIR: &str = "/workspace/venv";
pub const CONTAINER_DATASET_DIR: &str = "/dataset";

/// `workdir/{code,venv,output,log}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkLayout {
    pub root: PathBuf,
    pub code: PathBuf,
    pub venv: PathBuf,
    pub output: PathBuf,
    pub log: PathBuf,
}

impl WorkLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            code: root.join("code"),
            venv: root.join("venv"),
            output: root.join("output"),
            log: root.join("log"),
            root,
        }
    }

    pub fn user_log(&self) -> PathBuf {
        self.log.join(USER_LOG)
    }

    pub fn failure_marker(&self) -> PathBuf {
        self.log.join(FAILURE_MARKER)
    }

    /// Dependency file shipped with the code
    pub fn requirements(&self) -> PathBuf {
        self.code.join("requirements.txt")
    }

    /// Creates the work directory if needed and deletes everything inside it
    pub async fn clear(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("Failed to create work dir {}", self.root.display()))?;

        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .with_context(|| format!("Failed to list work dir {}", self.root.display()))?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let result = if entry.file_type().await?.is_dir() {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };
            result.with_context(|| format!("Failed to remove {}", path.display()))?;
        }

        debug!("Work dir {} cleared", self.root.display());
        Ok(())
    }

    /// Creates the output and log directories a job writes to
    pub async fn create_run_dirs(&self) -> Result<()> {
        for dir in [&self.output, &self.log] {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Variables every job receives, independent of the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskEnvironment {
    pub task_uuid: String,
    pub task_index: String,
    pub cluster_spec: String,
    pub worker_type: String,
    pub resource_id: String,
    pub task_role: String,
}

impl TaskEnvironment {
    pub fn from_task(task: &TrainingTask, kind: WorkerKind, resource_id: &str) -> Self {
        Self {
            task_uuid: task.task_uuid.clone(),
            task_index: task.task_index.to_string(),
            cluster_spec: task.cluster_spec.to_string(),
            worker_type: kind.as_str().to_string(),
            resource_id: resource_id.to_string(),
            task_role: task.task_role.as_str().to_string(),
        }
    }

    /// Variables for a job running directly on the host
    pub fn host_vars(&self, layout: &WorkLayout, dataset: Option<&Path>) -> Vec<(String, String)> {
        let dataset = dataset
            .map(|p| p.display().to_string())
            .unwrap_or_default();

        self.with_dirs(
            dataset,
            layout.code.display().to_string(),
            layout.output.display().to_string(),
            layout.log.display().to_string(),
        )
    }

    /// Variables for a job running in a container, mapped to its mount points
    pub fn container_vars(&self, dataset: bool) -> Vec<(String, String)> {
        let dataset = if dataset {
            CONTAINER_DATASET_DIR.to_string()
        } else {
            String::new()
        };

        self.with_dirs(
            dataset,
            CONTAINER_CODE_DIR.to_string(),
            CONTAINER_OUTPUT_DIR.to_string(),
            CONTAINER_LOG_DIR.to_string(),
        )
    }

    fn with_dirs(
        &self,
        dataset_dir: String,
        code_dir: String,
        output_dir: String,
        log_dir: String,
    ) -> Vec<(String, String)> {
        vec![
            ("task_uuid".to_string(), self.task_uuid.clone()),
            ("task_index".to_string(), self.task_index.clone()),
            ("cluster_spec".to_string(), self.cluster_spec.clone()),
            ("worker_type".to_string(), self.worker_type.clone()),
            ("resource_id".to_string(), self.resource_id.clone()),
            ("task_role".to_string(), self.task_role.clone()),
            ("dataset_dir".to_string(), dataset_dir),
            ("code_dir".to_string(), code_dir),
            ("output_dir".to_string(), output_dir),
            ("log_dir".to_string(), log_dir),
        ]
    }
}
