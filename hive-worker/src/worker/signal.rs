//! Signal loop
//!
//! While the job is alive and well the worker pings the master every
//! keep-alive interval and obeys its `continue`/`stop` answer. Once the job
//! is gone (or wrote its failure marker) the worker reports `finished` or
//! `failed`. A task only counts as finished after the master acknowledged
//! it.
//!
//! Server errors are retried against the supervisor's budget with the
//! keep-alive interval as backoff; any other error ends the loop.

use hive_client::ClientError;
use hive_core::domain::task::{Directive, TaskAction};
use hive_core::dto::task::TaskReply;
use std::time::Duration;
use tracing::{error, info, warn};

use super::Worker;
use crate::execution::TaskSupervisor;
use crate::service::{TENSORBOARD_BINARY, Tensorboard};

/// Result of the signal loop
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignalOutcome {
    /// The master acknowledged the end of the task
    pub finished: bool,
    pub error: Option<String>,
}

impl SignalOutcome {
    fn finished() -> Self {
        Self {
            finished: true,
            error: None,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            finished: false,
            error: Some(error.into()),
        }
    }
}

/// What to do after a failed report
enum Recovery {
    Retry,
    GiveUp(String),
}

struct Signal {
    token: String,
    task_uuid: String,
    interval: Duration,
    signal_finish: bool,
}

impl Worker {
    /// Runs the keep-alive exchange until the job is over, then tears it down
    ///
    /// `finish_signaled` skips the final report when the caller already
    /// knows the master was told.
    pub async fn signal(&mut self, finish_signaled: bool) -> SignalOutcome {
        let Some(mut supervisor) = self.supervisor.take() else {
            return SignalOutcome::failed("No running job to supervise");
        };

        let outcome = match self.signal_context() {
            Some(signal) => {
                self.signal_loop(&mut supervisor, &signal, finish_signaled)
                    .await
            }
            None => SignalOutcome::failed("No task or session for the running job"),
        };

        supervisor.terminate().await;
        if supervisor.stream_failed() {
            if let Err(e) = supervisor.dump_output().await {
                warn!("Failed to dump job output: {:#}", e);
            }
        }
        supervisor.dispose().await;

        if let Some(target) = supervisor.output_upload.take() {
            self.output_upload = Some(target);
        }
        if let Some(error) = &outcome.error {
            error!("Signal loop ended: {}", error);
        }
        outcome
    }

    fn signal_context(&self) -> Option<Signal> {
        let task = self.current_task.as_ref()?;
        Some(Signal {
            token: self.auth_token.clone()?,
            task_uuid: task.task_uuid.clone(),
            interval: Duration::from_secs(task.keep_alive_interval),
            signal_finish: task.signal_finish,
        })
    }

    async fn signal_loop(
        &mut self,
        supervisor: &mut TaskSupervisor,
        signal: &Signal,
        finish_signaled: bool,
    ) -> SignalOutcome {
        let mut tensorboard_requested = false;

        let status = loop {
            let status = supervisor.monitor().await;
            if !status.alive || !status.graceful {
                break status;
            }

            let reply = match self
                .master
                .report_task(&signal.token, &signal.task_uuid, TaskAction::Progress)
                .await
            {
                Ok(reply) => reply,
                Err(e) => match self.recover(supervisor, &e) {
                    Recovery::Retry => {
                        tokio::time::sleep(signal.interval).await;
                        continue;
                    }
                    Recovery::GiveUp(error) => {
                        supervisor.terminate().await;
                        return SignalOutcome::failed(error);
                    }
                },
            };

            match reply.directive() {
                Directive::Continue => {
                    if reply.create_tensorboard && !tensorboard_requested {
                        tensorboard_requested = true;
                        self.start_tensorboard(signal).await;
                    }
                    tokio::time::sleep(signal.interval).await;
                }
                directive => {
                    if let Directive::Unexpected(result) = directive {
                        warn!(
                            protocol_mismatch = true,
                            result = %result,
                            "Unexpected task reply, stopping the job"
                        );
                    }
                    info!("Master stopped the task");
                    self.mark_finished(supervisor, &reply);
                    supervisor.terminate().await;
                    return SignalOutcome::finished();
                }
            }
        };

        // Kill a job that is still up after writing its failure marker and
        // flush its log before the final report.
        supervisor.terminate().await;

        let crashed = !status.graceful;
        if crashed {
            warn!(task_uuid = %signal.task_uuid, "Job exited ungracefully");
        } else {
            info!(task_uuid = %signal.task_uuid, "Job exited");
        }

        if finish_signaled {
            if let Some(task) = self.current_task.as_mut() {
                task.finished = true;
            }
            return SignalOutcome::finished();
        }

        if !signal.signal_finish && !crashed {
            return SignalOutcome::default();
        }

        let action = if crashed {
            TaskAction::Failed
        } else {
            TaskAction::Finished
        };

        loop {
            match self
                .master
                .report_task(&signal.token, &signal.task_uuid, action)
                .await
            {
                Ok(reply) => {
                    info!("Master acknowledged {} report", action);
                    self.mark_finished(supervisor, &reply);
                    return SignalOutcome::finished();
                }
                Err(e) => match self.recover(supervisor, &e) {
                    Recovery::Retry => tokio::time::sleep(signal.interval).await,
                    Recovery::GiveUp(error) => return SignalOutcome::failed(error),
                },
            }
        }
    }

    fn recover(&mut self, supervisor: &mut TaskSupervisor, e: &ClientError) -> Recovery {
        if e.is_server_error() {
            if supervisor.can_retry() {
                warn!(
                    remaining = supervisor.retry_budget(),
                    "Master error, retrying: {}", e
                );
                return Recovery::Retry;
            }
            return Recovery::GiveUp(format!("Retry budget exhausted: {}", e));
        }

        if e.is_unauthorized() {
            self.auth_token = None;
        }
        Recovery::GiveUp(format!("Task report failed: {}", e))
    }

    fn mark_finished(&mut self, supervisor: &mut TaskSupervisor, reply: &TaskReply) {
        if let Some(task) = self.current_task.as_mut() {
            task.finished = true;
        }
        if let Some(target) = reply.output_upload() {
            supervisor.output_upload = Some(target.clone());
        }
    }

    async fn start_tensorboard(&mut self, signal: &Signal) {
        let board = match Tensorboard::spawn(
            TENSORBOARD_BINARY,
            &self.layout.output,
            self.config.tensorboard_port,
        ) {
            Ok(board) => board,
            Err(e) => {
                warn!("Failed to start tensorboard: {:#}", e);
                return;
            }
        };
        self.tensorboard = Some(board);

        match self
            .master
            .mark_tensorboard_created(&signal.token, &signal.task_uuid)
            .await
        {
            Ok(url) => info!("Tensorboard available at {}", url),
            Err(e) => warn!("Failed to announce tensorboard: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::worker;
    use super::*;
    use crate::execution::supervisor::RETRY_BUDGET;
    use crate::testing::{ScriptedMaster, reply, sample_task};
    use hive_core::domain::task::PresignedPost;
    use hive_core::dto::task::{TaskData, UploadUrls};
    use std::sync::Arc;

    /// Enrolled worker running `script` as the job of a fresh task
    async fn running(
        dir: &std::path::Path,
        master: Arc<ScriptedMaster>,
        script: &str,
        signal_finish: bool,
    ) -> Worker {
        let mut worker = worker(dir, master).await;
        worker.enroll().await.unwrap();

        let mut task = sample_task("abcdef-run", 0);
        task.signal_finish = signal_finish;
        worker.task_uuid = Some(task.task_uuid.clone());
        worker.current_task = Some(task);

        std::fs::create_dir_all(&worker.layout.code).unwrap();
        std::fs::write(worker.layout.code.join("main.py"), script).unwrap();
        worker.pre_run().await.unwrap();
        worker.run().await.unwrap();
        worker
    }

    fn server_error() -> ClientError {
        ClientError::api_error(503, "unavailable")
    }

    #[tokio::test]
    async fn test_continue_three_times_then_stop() {
        let dir = tempfile::tempdir().unwrap();
        let master = Arc::new(ScriptedMaster::new());
        for _ in 0..3 {
            master.push_task(Ok(reply("continue")));
        }
        let mut stop = reply("stop");
        stop.task_data = Some(TaskData {
            upload_urls: Some(UploadUrls {
                output: Some(PresignedPost {
                    url: "http://store/bucket".to_string(),
                    fields: Default::default(),
                }),
            }),
        });
        master.push_task(Ok(stop));

        let mut worker = running(dir.path(), master.clone(), "echo training\nsleep 30\n", true).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        let outcome = worker.signal(false).await;

        assert_eq!(outcome, SignalOutcome::finished());
        assert_eq!(master.actions(), vec![TaskAction::Progress; 4]);
        assert!(worker.current_task().unwrap().finished);
        assert!(worker.supervisor.is_none());
        assert_eq!(
            worker.output_upload.as_ref().map(|t| t.url.as_str()),
            Some("http://store/bucket")
        );
        assert!(master.log_text().contains("training"));
    }

    #[tokio::test]
    async fn test_unexpected_reply_is_treated_as_stop() {
        let dir = tempfile::tempdir().unwrap();
        let master = Arc::new(ScriptedMaster::new());
        master.push_task(Ok(reply("pause")));

        let mut worker = running(dir.path(), master.clone(), "sleep 30\n", true).await;
        let outcome = worker.signal(false).await;

        assert!(outcome.finished);
        assert_eq!(master.actions(), vec![TaskAction::Progress]);
    }

    #[tokio::test]
    async fn test_graceful_exit_reports_finished() {
        let dir = tempfile::tempdir().unwrap();
        let master = Arc::new(ScriptedMaster::new());

        let mut worker = running(dir.path(), master.clone(), "echo done\n", true).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        let outcome = worker.signal(false).await;

        assert_eq!(outcome, SignalOutcome::finished());
        assert_eq!(master.actions().last(), Some(&TaskAction::Finished));
        assert!(worker.current_task().unwrap().finished);
        assert!(master.log_text().contains("done"));
    }

    #[tokio::test]
    async fn test_empty_final_ack_marks_finished() {
        let dir = tempfile::tempdir().unwrap();
        let master = Arc::new(ScriptedMaster::new());

        let mut worker = running(dir.path(), master.clone(), "echo done\n", true).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        master.push_task(Ok(TaskReply::default()));
        let outcome = worker.signal(false).await;

        assert_eq!(outcome, SignalOutcome::finished());
        assert_eq!(master.actions(), vec![TaskAction::Finished]);
        assert!(worker.current_task().unwrap().finished);
        assert!(worker.output_upload.is_none());
    }

    #[tokio::test]
    async fn test_crash_reports_failed() {
        let dir = tempfile::tempdir().unwrap();
        let master = Arc::new(ScriptedMaster::new());

        let mut worker = running(dir.path(), master.clone(), "exit 4\n", false).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        let outcome = worker.signal(false).await;

        assert!(outcome.finished);
        assert_eq!(master.actions().last(), Some(&TaskAction::Failed));
    }

    #[tokio::test]
    async fn test_failure_marker_kills_job_and_reports_failed() {
        let dir = tempfile::tempdir().unwrap();
        let master = Arc::new(ScriptedMaster::new());

        let mut worker = running(
            dir.path(),
            master.clone(),
            "touch \"$log_dir/FAILED\"\nsleep 30\n",
            true,
        )
        .await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        let outcome = worker.signal(false).await;

        assert!(outcome.finished);
        assert_eq!(master.actions(), vec![TaskAction::Failed]);
    }

    #[tokio::test]
    async fn test_server_errors_never_mark_finished() {
        let dir = tempfile::tempdir().unwrap();
        let master = Arc::new(ScriptedMaster::new());
        for _ in 0..=RETRY_BUDGET {
            master.push_task(Err(server_error()));
        }

        let mut worker = running(dir.path(), master.clone(), "true\n", true).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        let outcome = worker.signal(false).await;

        assert!(!outcome.finished);
        assert!(outcome.error.unwrap().contains("budget"));
        assert_eq!(master.actions().len(), RETRY_BUDGET as usize + 1);
        assert!(!worker.current_task().unwrap().finished);
    }

    #[tokio::test]
    async fn test_server_error_then_ack_marks_finished() {
        let dir = tempfile::tempdir().unwrap();
        let master = Arc::new(ScriptedMaster::new());
        master.push_task(Err(server_error()));
        master.push_task(Ok(reply("stop")));

        let mut worker = running(dir.path(), master.clone(), "true\n", true).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        let outcome = worker.signal(false).await;

        assert_eq!(outcome, SignalOutcome::finished());
        assert_eq!(
            master.actions(),
            vec![TaskAction::Finished, TaskAction::Finished]
        );
    }

    #[tokio::test]
    async fn test_client_error_terminates_job() {
        let dir = tempfile::tempdir().unwrap();
        let master = Arc::new(ScriptedMaster::new());
        master.push_task(Err(ClientError::api_error(401, "expired")));

        let mut worker = running(dir.path(), master.clone(), "sleep 30\n", true).await;
        let outcome = worker.signal(false).await;

        assert!(!outcome.finished);
        assert!(outcome.error.is_some());
        assert!(!worker.is_enrolled());
        assert_eq!(master.actions(), vec![TaskAction::Progress]);
    }

    #[tokio::test]
    async fn test_finish_already_signaled_skips_report() {
        let dir = tempfile::tempdir().unwrap();
        let master = Arc::new(ScriptedMaster::new());

        let mut worker = running(dir.path(), master.clone(), "true\n", true).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        let outcome = worker.signal(true).await;

        assert!(outcome.finished);
        assert!(master.actions().is_empty());
        assert!(worker.current_task().unwrap().finished);
    }

    #[tokio::test]
    async fn test_tensorboard_requested_once() {
        let dir = tempfile::tempdir().unwrap();
        let master = Arc::new(ScriptedMaster::new());
        let mut first = reply("continue");
        first.create_tensorboard = true;
        master.push_task(Ok(first.clone()));
        master.push_task(Ok(first));
        master.push_task(Ok(reply("stop")));

        let mut worker = running(dir.path(), master.clone(), "sleep 30\n", true).await;
        let outcome = worker.signal(false).await;

        assert!(outcome.finished);
        assert_eq!(master.actions().len(), 3);
        // Whether the binary exists or not, the master hears at most once.
        assert!(master.tensorboards.lock().unwrap().len() <= 1);
        worker.task_cleanup().await;
    }
}
