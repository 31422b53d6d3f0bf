//! Core domain types
//!
//! These types describe what a worker is asked to do and what it reports back.
//! They are shared between the HTTP client (wire format) and the worker
//! (execution).

pub mod log;
pub mod task;
pub mod worker;
