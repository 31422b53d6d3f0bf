//! Task reporting endpoints

use hive_core::domain::task::TaskAction;
use hive_core::dto::task::{TaskReply, TaskReport, TensorboardResponse, TensorboardUpdate};

use crate::MasterClient;
use crate::error::Result;

impl MasterClient {
    // =============================================================================
    // Task Reporting
    // =============================================================================

    /// Report progress, completion or failure of a task
    ///
    /// # Arguments
    /// * `token` - Session token from enroll
    /// * `task_uuid` - The task being reported
    /// * `action` - `progress` while running, `finished`/`failed` once it stopped
    pub async fn report_task(
        &self,
        token: &str,
        task_uuid: &str,
        action: TaskAction,
    ) -> Result<TaskReply> {
        let response = self
            .client
            .post(self.url("/api/v1/worker/task/"))
            .bearer_auth(token)
            .json(&TaskReport {
                task_uuid: task_uuid.to_string(),
                action,
            })
            .send()
            .await?;

        // Final reports only need the acknowledgment; progress replies
        // carry the directive and must parse.
        match action {
            TaskAction::Progress => self.handle_response(response).await,
            TaskAction::Finished | TaskAction::Failed => self.handle_ack(response).await,
        }
    }

    /// Tell the master a tensorboard instance is serving this task
    ///
    /// # Returns
    /// The public URL the master assigned to the dashboard
    pub async fn mark_tensorboard_created(&self, token: &str, task_uuid: &str) -> Result<String> {
        let response = self
            .client
            .put(self.url(&format!("/api/v1/worker/task/{}/", task_uuid)))
            .bearer_auth(token)
            .json(&TensorboardUpdate {
                tensorboard_created: 1,
            })
            .send()
            .await?;

        let body: TensorboardResponse = self.handle_response(response).await?;
        Ok(body.tensorboard_url)
    }
}
