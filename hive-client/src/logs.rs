//! Log shipping endpoint

use hive_core::domain::log::LogLine;
use hive_core::dto::log::LogBatch;

use crate::MasterClient;
use crate::error::Result;

impl MasterClient {
    /// Send a batch of user log lines for a task
    pub async fn send_logs(&self, token: &str, task_uuid: &str, lines: Vec<LogLine>) -> Result<()> {
        if lines.is_empty() {
            return Ok(());
        }

        let response = self
            .client
            .post(self.url("/api/v1/worker/log/"))
            .bearer_auth(token)
            .json(&LogBatch {
                task_uuid: task_uuid.to_string(),
                lines,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }

        Ok(())
    }
}
