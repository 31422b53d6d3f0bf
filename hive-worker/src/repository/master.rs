//! Master repository
//!
//! The subset of the master's worker API the state machine needs. Errors are
//! kept as [`ClientError`] so callers can branch on transport, auth,
//! validation and server failures.

use async_trait::async_trait;
use hive_client::{ClientError, MasterClient, PollReply};
use hive_core::domain::log::LogLine;
use hive_core::domain::task::TaskAction;
use hive_core::dto::task::TaskReply;
use hive_core::dto::worker::EnrollResponse;

type ApiResult<T> = Result<T, ClientError>;

#[async_trait]
pub trait MasterApi: Send + Sync {
    async fn enroll(&self, uuid: &str, passcode: &str) -> ApiResult<EnrollResponse>;

    async fn poll(&self, token: &str, port: u16) -> ApiResult<PollReply>;

    async fn report_task(
        &self,
        token: &str,
        task_uuid: &str,
        action: TaskAction,
    ) -> ApiResult<TaskReply>;

    /// Returns the dashboard URL assigned by the master
    async fn mark_tensorboard_created(&self, token: &str, task_uuid: &str) -> ApiResult<String>;

    async fn send_logs(&self, token: &str, task_uuid: &str, lines: Vec<LogLine>) -> ApiResult<()>;
}

#[async_trait]
impl MasterApi for MasterClient {
    async fn enroll(&self, uuid: &str, passcode: &str) -> ApiResult<EnrollResponse> {
        MasterClient::enroll(self, uuid, passcode).await
    }

    async fn poll(&self, token: &str, port: u16) -> ApiResult<PollReply> {
        MasterClient::poll(self, token, port).await
    }

    async fn report_task(
        &self,
        token: &str,
        task_uuid: &str,
        action: TaskAction,
    ) -> ApiResult<TaskReply> {
        MasterClient::report_task(self, token, task_uuid, action).await
    }

    async fn mark_tensorboard_created(&self, token: &str, task_uuid: &str) -> ApiResult<String> {
        MasterClient::mark_tensorboard_created(self, token, task_uuid).await
    }

    async fn send_logs(&self, token: &str, task_uuid: &str, lines: Vec<LogLine>) -> ApiResult<()> {
        MasterClient::send_logs(self, token, task_uuid, lines).await
    }
}
