//! Worker DTOs
//!
//! Bodies of the register, enroll and poll endpoints.

use serde::{Deserialize, Serialize};

use crate::domain::worker::WorkerKind;

/// Bootstrap request issuing a new worker identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterWorker {
    pub name: String,
    pub worker_type: WorkerKind,
}

/// Identity issued by the master on registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerCredentials {
    pub uuid: String,
    pub passcode: String,
}

/// Credentials exchanged for a session token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollRequest {
    pub uuid: String,
    pub passcode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollResponse {
    #[serde(default)]
    pub auth_token: Option<String>,
}

/// Request for a new assignment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollRequest {
    pub port: u16,
}

/// Body of a `200` poll reply
///
/// `config` is usually a JSON document embedded as a string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollResponse {
    pub config: serde_json::Value,
}
