//! Service layer
//!
//! Long-running helpers that live next to a job: the task tailing the user
//! log into a [`LogSink`](crate::repository::LogSink) and the optional
//! tensorboard dashboard.

mod log_stream;
mod tensorboard;

pub use log_stream::{LOG_STREAM_INTERVAL, LogStream, read_new_lines};
pub use tensorboard::{TENSORBOARD_BINARY, Tensorboard};
