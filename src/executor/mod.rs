//! Test execution engine
//!
//! Supervisor side of a run: the run controller, the worker instances it
//! drives, and the hooks and compiler they are configured with.

mod compile;
mod error;
mod hooks;
mod instance;
mod run;

pub use error::WorkerError;
pub use hooks::{LoggingHooks, NoHooks, RunHooks, SetupFiles, WorkerHooks};
pub use instance::{TestWorker, WorkerOptions};
pub use run::{RunConfig, RunOutcome, TestRunController};
