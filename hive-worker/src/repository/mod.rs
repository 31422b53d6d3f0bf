//! Repository layer
//!
//! Repositories abstract communication with the master behind traits so the
//! worker's state machine can be driven by scripted fakes in tests.

mod logs;
mod master;

pub use logs::{LogSink, MasterLogSink};
pub use master::MasterApi;
