//! Job execution
//!
//! - [`environment`]: the work directory layout and the variables that form
//!   the contract between the worker and user code
//! - [`executor`]: builds the virtual environment and starts the job on the
//!   bare-metal or container backend
//! - [`supervisor`]: watches one running job and tears it down

pub mod environment;
pub mod executor;
pub mod supervisor;

pub use environment::{TaskEnvironment, WorkLayout};
pub use executor::Executor;
pub use supervisor::TaskSupervisor;
