//! Task stages between poll and the signal loop, and the cleanup after it

use anyhow::{Context, Result};
use hive_core::domain::task::{ContentType, TaskAction};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::Worker;
use crate::execution::{TaskEnvironment, TaskSupervisor};
use crate::repository::MasterLogSink;
use crate::storage;

impl Worker {
    /// Downloads the code and, for worker-role tasks, obtains the dataset
    pub async fn fetch(&mut self, download_code: bool, download_dataset: bool) -> Result<()> {
        let task = self.current_task.as_mut().context("No task to fetch")?;

        if download_code {
            let urls = task.urls(ContentType::Code);
            info!("Downloading {} code archive(s)", urls.len());
            storage::download_all(&self.http, urls, &self.layout.code)
                .await
                .context("Failed to download code")?;
        }

        if !download_dataset {
            return Ok(());
        }

        if !task.task_role.consumes_dataset() {
            debug!("Role {} does not consume the dataset", task.task_role);
            return Ok(());
        }

        let Some(name) = task.dataset_name.clone() else {
            debug!("Task has no dataset");
            return Ok(());
        };

        let path = self
            .datasets
            .acquire(&name, task.urls(ContentType::Dataset), task.is_dataset_persisted)
            .await
            .with_context(|| format!("Failed to obtain dataset {}", name))?;

        task.dataset_local_path = Some(path);
        self.dataset_held = Some(name);
        Ok(())
    }

    /// Creates the output and log folders and the job's virtual environment
    pub async fn pre_run(&mut self) -> Result<()> {
        info!(
            in_container = self.executor.in_container(),
            "Preparing job environment"
        );
        self.layout.create_run_dirs().await?;
        self.executor.create_venv(&self.layout).await?;

        if self.executor.install_requirements(&self.layout).await? {
            info!("Job dependencies installed");
        }
        Ok(())
    }

    /// Starts the job and its log stream
    pub async fn run(&mut self) -> Result<()> {
        let task = self.current_task.as_ref().context("No task to run")?;
        let token = self.auth_token.clone().context("Not enrolled")?;

        let env = TaskEnvironment::from_task(task, self.config.worker_kind, &self.config.resource_id);
        let handle = self
            .executor
            .start(
                &self.layout,
                &env,
                task.dataset_local_path.as_deref(),
                &task.task_uuid,
            )
            .await
            .context("Failed to start job")?;

        let sink = Arc::new(MasterLogSink::new(
            self.master.clone(),
            token,
            task.task_uuid.clone(),
        ));
        let mut supervisor = TaskSupervisor::new(handle, &self.layout, sink);
        supervisor.start_log_stream(self.log_interval);

        info!(task_uuid = %task.task_uuid, "Job started");
        self.supervisor = Some(supervisor);
        Ok(())
    }

    /// Ships the job's artifacts, then stops the dashboard and gives the
    /// dataset back
    ///
    /// Artifacts go to `output_folder` when one is given, otherwise to the
    /// upload target the master issued. Nothing is shipped when both the
    /// output directory and the user log are empty.
    pub async fn post_run(&mut self, output_folder: Option<&Path>) -> Result<()> {
        let result = self.ship_artifacts(output_folder).await;

        if let Some(board) = self.tensorboard.take() {
            if let Err(e) = board.kill().await {
                warn!("Failed to stop tensorboard: {:#}", e);
            }
        }

        self.release_dataset().await;
        result
    }

    async fn ship_artifacts(&mut self, output_folder: Option<&Path>) -> Result<()> {
        let task = self.current_task.as_ref().context("No task to finish")?;
        let short = task.short_uuid().to_string();

        let has_output = dir_has_entries(&self.layout.output).await;
        let has_log = file_has_bytes(&self.layout.user_log()).await;
        if !has_output && !has_log {
            info!("No artifacts to upload");
            return Ok(());
        }

        if let Some(folder) = output_folder {
            let dest = folder.join(&short);
            storage::copy_dir(self.layout.output.clone(), dest.join("output")).await?;
            storage::copy_dir(self.layout.log.clone(), dest.join("log")).await?;
            info!("Artifacts copied to {}", dest.display());
            return Ok(());
        }

        let Some(target) = self.output_upload.take() else {
            warn!("Master issued no upload target, artifacts stay local");
            return Ok(());
        };

        let archive = storage::pack(
            self.layout.root.join(format!("{}-output.tar.gz", short)),
            vec![
                ("output".to_string(), self.layout.output.clone()),
                ("log".to_string(), self.layout.log.clone()),
            ],
        )
        .await?;

        storage::upload_presigned(&self.http, &target, &archive)
            .await
            .context("Failed to upload artifacts")?;
        info!("Artifacts uploaded");
        Ok(())
    }

    pub(super) async fn release_dataset(&mut self) {
        if let Some(name) = self.dataset_held.take() {
            if let Err(e) = self.datasets.release(&name).await {
                warn!(dataset = %name, "Failed to release dataset: {:#}", e);
            }
        }
    }

    /// Returns the worker to an idle state after a task, whatever happened
    ///
    /// Stops anything still running, gives back the dataset reference, wipes
    /// the work directory and, if the task was never acknowledged as
    /// finished, tells the master it failed. Errors are logged, never
    /// returned.
    pub async fn task_cleanup(&mut self) {
        if let Some(mut supervisor) = self.supervisor.take() {
            supervisor.terminate().await;
            supervisor.dispose().await;
        }

        if let Some(board) = self.tensorboard.take() {
            if let Err(e) = board.kill().await {
                warn!("Failed to stop tensorboard: {:#}", e);
            }
        }

        self.release_dataset().await;

        if let Err(e) = self.layout.clear().await {
            warn!("Failed to clear work dir: {:#}", e);
        }

        let finished = self
            .current_task
            .as_ref()
            .map(|task| task.finished)
            .unwrap_or(false);

        if let Some(task_uuid) = self.task_uuid.take() {
            if !finished {
                self.report_failed(&task_uuid).await;
            }
        }

        self.current_task = None;
        self.output_upload = None;
    }

    async fn report_failed(&self, task_uuid: &str) {
        let Some(token) = self.auth_token.as_deref() else {
            warn!(task_uuid, "Cannot report failure without a session");
            return;
        };

        match self
            .master
            .report_task(token, task_uuid, TaskAction::Failed)
            .await
        {
            Ok(_) => info!(task_uuid, "Reported task as failed"),
            Err(e) => warn!(task_uuid, "Failed to report task failure: {}", e),
        }
    }
}

async fn dir_has_entries(dir: &Path) -> bool {
    match tokio::fs::read_dir(dir).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(Some(_))),
        Err(_) => false,
    }
}

async fn file_has_bytes(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.len() > 0)
        .unwrap_or(false)
}
