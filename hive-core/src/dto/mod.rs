//! Data Transfer Objects for the master's worker API
//!
//! Request and response bodies exchanged between a worker and the master.
//! DTOs are lightweight wire representations; behaviour lives in the worker.

pub mod log;
pub mod task;
pub mod worker;
