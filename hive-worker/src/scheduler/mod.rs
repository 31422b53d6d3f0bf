//! Scheduler layer for the worker
//!
//! Drives the [`Worker`](crate::worker::Worker) through its lifecycle
//! forever: enroll when there is no session, poll, run any assigned task
//! stage by stage and always clean up after it.

pub mod lifecycle;

pub use lifecycle::WorkerLoop;
