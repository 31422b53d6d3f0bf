//! Worker lifecycle
//!
//! The [`Worker`] drives one task at a time through
//! enroll → poll → fetch → pre-run → run → signal → post-run → cleanup.
//! Each stage runs to completion before the next starts; the only
//! concurrent activity is the job itself and its log stream.
//!
//! Stages that the caller branches on return typed outcomes
//! ([`PollOutcome`], [`signal::SignalOutcome`]); stages that either work or abort
//! the task return `anyhow::Result`.

mod signal;
mod stages;

use anyhow::{Context, Result};
use hive_client::PollReply;
use hive_core::domain::task::{PresignedPost, TrainingTask};
use hive_core::dto::worker::PollResponse;
use reqwest::Client;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::dataset::DatasetCache;
use crate::execution::{Executor, TaskSupervisor, WorkLayout};
use crate::repository::MasterApi;
use crate::service::{LOG_STREAM_INTERVAL, Tensorboard};

/// Result of one poll
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollOutcome {
    pub success: bool,
    pub task_ready: bool,
    /// The session is gone; enroll again before the next poll
    pub reenroll: bool,
    /// A task was claimed but could not be parsed; fail it back
    pub need_cleanup: bool,
}

impl PollOutcome {
    fn idle() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    fn task() -> Self {
        Self {
            success: true,
            task_ready: true,
            ..Default::default()
        }
    }

    fn reenroll() -> Self {
        Self {
            reenroll: true,
            ..Default::default()
        }
    }

    fn cleanup() -> Self {
        Self {
            need_cleanup: true,
            ..Default::default()
        }
    }

    fn failed() -> Self {
        Self::default()
    }
}

pub struct Worker {
    config: Config,
    master: Arc<dyn MasterApi>,
    datasets: DatasetCache,
    executor: Executor,
    http: Client,
    layout: WorkLayout,
    auth_token: Option<String>,
    current_task: Option<TrainingTask>,
    task_uuid: Option<String>,
    supervisor: Option<TaskSupervisor>,
    /// Dataset name this worker holds a reference on
    dataset_held: Option<String>,
    tensorboard: Option<Tensorboard>,
    output_upload: Option<PresignedPost>,
    log_interval: std::time::Duration,
}

impl Worker {
    pub fn new(
        config: Config,
        master: Arc<dyn MasterApi>,
        datasets: DatasetCache,
        executor: Executor,
    ) -> Self {
        let layout = WorkLayout::new(config.work_dir.clone());
        Self {
            config,
            master,
            datasets,
            executor,
            http: Client::new(),
            layout,
            auth_token: None,
            current_task: None,
            task_uuid: None,
            supervisor: None,
            dataset_held: None,
            tensorboard: None,
            output_upload: None,
            log_interval: LOG_STREAM_INTERVAL,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    #[cfg(test)]
    pub fn layout(&self) -> &WorkLayout {
        &self.layout
    }

    pub fn is_enrolled(&self) -> bool {
        self.auth_token.is_some()
    }

    pub fn current_task(&self) -> Option<&TrainingTask> {
        self.current_task.as_ref()
    }

    pub fn task_uuid(&self) -> Option<&str> {
        self.task_uuid.as_deref()
    }

    /// Exchanges the worker credentials for a session token
    ///
    /// Drops any current task and wipes the work directory first, so a
    /// successful enroll always starts from an empty work directory.
    pub async fn enroll(&mut self) -> Result<()> {
        self.current_task = None;
        self.task_uuid = None;

        self.layout
            .clear()
            .await
            .context("Failed to prepare work dir")?;

        let reply = match self
            .master
            .enroll(&self.config.worker_id, &self.config.passcode)
            .await
        {
            Ok(reply) => reply,
            Err(e) if e.is_transport() => {
                return Err(e).context("Master unreachable during enroll");
            }
            Err(e) => {
                self.auth_token = None;
                return Err(e).context("Enroll rejected");
            }
        };

        match reply.auth_token {
            Some(token) => {
                self.auth_token = Some(token);
                info!("Enrolled with master");
                Ok(())
            }
            None => {
                self.auth_token = None;
                anyhow::bail!("Enroll reply carried no auth token")
            }
        }
    }

    /// Asks the master for a task
    pub async fn poll(&mut self) -> PollOutcome {
        let Some(token) = self.auth_token.clone() else {
            debug!("Not enrolled, skipping poll");
            return PollOutcome::reenroll();
        };

        match self.master.poll(&token, self.config.port).await {
            Ok(PollReply::NoTask) => {
                debug!("No task available");
                PollOutcome::idle()
            }
            Ok(PollReply::Assigned(body)) => match parse_assignment(&body) {
                Ok(task) => {
                    info!(
                        task_uuid = %task.task_uuid,
                        role = %task.task_role,
                        "Task assigned"
                    );
                    self.task_uuid = Some(task.task_uuid.clone());
                    self.current_task = Some(task);
                    PollOutcome::task()
                }
                Err(e) => {
                    warn!("Failed to parse assigned task: {:#}", e);
                    // The master already claimed it; keep the uuid so cleanup can fail it back.
                    self.task_uuid = salvage_task_uuid(&body);
                    PollOutcome::cleanup()
                }
            },
            Err(e) if e.is_unauthorized() => {
                warn!("Session rejected by master, re-enrolling");
                self.auth_token = None;
                PollOutcome::reenroll()
            }
            Err(e) => {
                if let Some(status) = e.status() {
                    warn!(protocol_mismatch = true, status, "Unexpected poll reply: {}", e);
                } else {
                    warn!("Poll failed: {}", e);
                }
                PollOutcome::failed()
            }
        }
    }
}

fn parse_assignment(body: &str) -> Result<TrainingTask> {
    let response: PollResponse =
        serde_json::from_str(body).context("Poll reply is not valid JSON")?;
    TrainingTask::from_config(&response.config).context("Invalid task config")
}

/// Best-effort extraction of `task_uuid` from an unparsable assignment
fn salvage_task_uuid(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let config = match value.get("config")? {
        serde_json::Value::String(blob) => serde_json::from_str(blob).ok()?,
        other => other.clone(),
    };
    config
        .get("task_uuid")?
        .as_str()
        .map(str::to_string)
}
