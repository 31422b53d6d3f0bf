//! Worker identity endpoints

use hive_core::dto::worker::{
    EnrollRequest, EnrollResponse, PollRequest, RegisterWorker, WorkerCredentials,
};
use reqwest::StatusCode;

use crate::MasterClient;
use crate::error::{ClientError, Result};

/// Outcome of a poll that the master answered with a success status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollReply {
    /// `202`: nothing to do yet
    NoTask,
    /// `200`: a task was claimed for this worker; raw body, parsed by the caller
    Assigned(String),
}

impl MasterClient {
    // =============================================================================
    // Worker Registration & Session
    // =============================================================================

    /// Bootstrap a new worker identity
    ///
    /// Called once per machine; the returned uuid and passcode are kept in
    /// the worker's configuration.
    pub async fn register(&self, req: &RegisterWorker) -> Result<WorkerCredentials> {
        let response = self
            .client
            .post(self.url("/api/v1/worker/register/"))
            .json(req)
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Exchange worker credentials for a session token
    pub async fn enroll(&self, uuid: &str, passcode: &str) -> Result<EnrollResponse> {
        let response = self
            .client
            .post(self.url("/api/v1/worker/enroll/"))
            .json(&EnrollRequest {
                uuid: uuid.to_string(),
                passcode: passcode.to_string(),
            })
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Ask the master for a new assignment
    ///
    /// Only `200` and `202` are successful replies; every other status,
    /// including other 2xx codes, is returned as [`ClientError::ApiError`].
    pub async fn poll(&self, token: &str, port: u16) -> Result<PollReply> {
        let response = self
            .client
            .post(self.url("/api/v1/worker/poll/"))
            .bearer_auth(token)
            .json(&PollRequest { port })
            .send()
            .await?;

        match response.status() {
            StatusCode::ACCEPTED => Ok(PollReply::NoTask),
            StatusCode::OK => {
                let body = response.text().await.map_err(ClientError::RequestFailed)?;
                Ok(PollReply::Assigned(body))
            }
            _ => Err(Self::api_error(response).await),
        }
    }
}
