//! Agent loop

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::worker::Worker;

/// What one pass of the loop did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    EnrollFailed,
    /// The session was rejected; the next cycle enrolls again
    Reenroll,
    PollFailed,
    Idle,
    TaskCompleted,
    TaskFailed,
}

impl CycleOutcome {
    /// Whether to back off before the next cycle
    pub fn should_sleep(&self) -> bool {
        !matches!(self, CycleOutcome::TaskCompleted | CycleOutcome::TaskFailed)
    }
}

pub struct WorkerLoop {
    worker: Worker,
    poll_interval: Duration,
    output_dir: Option<PathBuf>,
}

impl WorkerLoop {
    pub fn new(worker: Worker) -> Self {
        let poll_interval = worker.config().poll_interval;
        let output_dir = worker.config().output_dir.clone();
        Self {
            worker,
            poll_interval,
            output_dir,
        }
    }

    #[cfg(test)]
    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    /// Runs cycles until the process is stopped
    pub async fn run(mut self) -> Result<()> {
        info!("Starting worker loop (poll interval: {:?})", self.poll_interval);

        loop {
            let outcome = self.run_cycle().await;
            debug!("Cycle finished: {:?}", outcome);

            if outcome.should_sleep() {
                tokio::time::sleep(self.poll_interval).await;
            }
        }
    }

    /// Enrolls if needed, polls once and processes the task, if any
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        if !self.worker.is_enrolled() {
            if let Err(e) = self.worker.enroll().await {
                warn!("Enroll failed: {:#}", e);
                return CycleOutcome::EnrollFailed;
            }
        }

        let poll = self.worker.poll().await;
        if poll.reenroll {
            return CycleOutcome::Reenroll;
        }
        if poll.need_cleanup {
            self.worker.task_cleanup().await;
            return CycleOutcome::TaskFailed;
        }
        if !poll.success {
            return CycleOutcome::PollFailed;
        }
        if !poll.task_ready {
            return CycleOutcome::Idle;
        }

        let task_uuid = self.worker.task_uuid().unwrap_or_default().to_string();
        if let Some(task) = self.worker.current_task() {
            info!(
                task_uuid = %task_uuid,
                job_uuid = %task.job_uuid,
                job_type = %task.job_type,
                "Processing task"
            );
        }

        let result = self.process_task().await;
        self.worker.task_cleanup().await;

        match result {
            Ok(()) => {
                info!(task_uuid = %task_uuid, "Task completed");
                CycleOutcome::TaskCompleted
            }
            Err(e) => {
                error!(task_uuid = %task_uuid, "Task failed: {:#}", e);
                CycleOutcome::TaskFailed
            }
        }
    }

    async fn process_task(&mut self) -> Result<()> {
        self.worker
            .fetch(true, true)
            .await
            .context("Fetch failed")?;
        self.worker
            .pre_run()
            .await
            .context("Environment setup failed")?;
        self.worker.run().await.context("Job start failed")?;

        let signal = self.worker.signal(false).await;
        if let Some(error) = signal.error {
            anyhow::bail!("Signal loop failed: {}", error);
        }

        self.worker
            .post_run(self.output_dir.as_deref())
            .await
            .context("Artifact upload failed")
    }
}
