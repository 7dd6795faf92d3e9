//! Data models for test orchestration
//!
//! This module contains the data structures shared by the supervisor,
//! the worker processes and the run controller.

mod messages;
mod report;
mod test_file;

pub use messages::{
    CompletionStatus, ErrorPayload, EvaluateCodePayload, ExecuteTestPayload,
    ExecutionCompletePayload, ExecutionState, Message, MessageKind,
};
pub use report::{RunReport, TestError};
pub use test_file::{QueuedTest, SourceFile};
