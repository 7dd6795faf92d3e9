//! Supervisor/worker message vocabulary
//!
//! Every message crossing the process boundary is one variant of [`Message`],
//! serialized as `{"type": "<kind>", "payload": ...}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::deps::{DependencyDictionary, DEFAULT_IMPORT_CALLEE};

/// Messages exchanged between the supervisor and its workers
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum Message {
    // supervisor -> worker
    ExecuteTest(ExecuteTestPayload),
    PauseTestExecution,
    RunTillNextExecution,
    ResumeTestExecution,
    ReleaseTest,
    EvaluateCode(EvaluateCodePayload),

    // worker -> supervisor
    ExecutionComplete(ExecutionCompletePayload),
    Register(ExecutionState),
    Unregister(ExecutionState),
    UpdateExecutionState(ExecutionState),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::ExecuteTest(_) => MessageKind::ExecuteTest,
            Message::PauseTestExecution => MessageKind::PauseTestExecution,
            Message::RunTillNextExecution => MessageKind::RunTillNextExecution,
            Message::ResumeTestExecution => MessageKind::ResumeTestExecution,
            Message::ReleaseTest => MessageKind::ReleaseTest,
            Message::EvaluateCode(_) => MessageKind::EvaluateCode,
            Message::ExecutionComplete(_) => MessageKind::ExecutionComplete,
            Message::Register(_) => MessageKind::Register,
            Message::Unregister(_) => MessageKind::Unregister,
            Message::UpdateExecutionState(_) => MessageKind::UpdateExecutionState,
        }
    }
}

/// Discriminant of [`Message`], used to filter listeners
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    ExecuteTest,
    PauseTestExecution,
    RunTillNextExecution,
    ResumeTestExecution,
    ReleaseTest,
    EvaluateCode,
    ExecutionComplete,
    Register,
    Unregister,
    UpdateExecutionState,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::ExecuteTest => "executeTest",
            MessageKind::PauseTestExecution => "pauseTestExecution",
            MessageKind::RunTillNextExecution => "runTillNextExecution",
            MessageKind::ResumeTestExecution => "resumeTestExecution",
            MessageKind::ReleaseTest => "releaseTest",
            MessageKind::EvaluateCode => "evaluateCode",
            MessageKind::ExecutionComplete => "executionComplete",
            MessageKind::Register => "register",
            MessageKind::Unregister => "unregister",
            MessageKind::UpdateExecutionState => "updateExecutionState",
        };
        f.write_str(name)
    }
}

/// Everything a worker needs to run one test without touching the disk
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteTestPayload {
    /// Compiled test source
    pub content: String,
    /// Absolute path of the test file
    pub path: String,
    pub dependencies: DependencyDictionary,
    pub parameters: Value,
    pub env_parameters: Value,
    /// Keep the test open for debugging until `releaseTest` arrives
    pub wait_for_release: bool,
    /// Callee the sandbox treats as an import
    #[serde(default = "default_import_callee")]
    pub import_callee: String,
}

fn default_import_callee() -> String {
    DEFAULT_IMPORT_CALLEE.to_string()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluateCodePayload {
    pub path: String,
    pub content: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionStatus {
    Done,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionCompletePayload {
    pub status: CompletionStatus,
    pub error: Option<ErrorPayload>,
}

impl ExecutionCompletePayload {
    pub fn done() -> Self {
        Self {
            status: CompletionStatus::Done,
            error: None,
        }
    }

    pub fn failed(error: ErrorPayload) -> Self {
        Self {
            status: CompletionStatus::Failed,
            error: Some(error),
        }
    }
}

/// An error normalized for transport across the process boundary
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorPayload {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        let stack = stack.into();
        if !stack.is_empty() {
            self.stack = Some(stack);
        }
        self
    }
}

impl fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for ErrorPayload {}

/// Worker-side debug state, broadcast to the supervisor on every change
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionState {
    pub paused: bool,
    pub pending: bool,
    pub paused_til_next: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_control_message_wire_format() {
        let encoded = serde_json::to_value(Message::PauseTestExecution).unwrap();
        assert_eq!(encoded, json!({"type": "pauseTestExecution"}));

        let decoded: Message = serde_json::from_value(json!({"type": "releaseTest"})).unwrap();
        assert_eq!(decoded, Message::ReleaseTest);
    }

    #[test]
    fn test_execution_state_wire_format() {
        let state = ExecutionState {
            paused: true,
            pending: false,
            paused_til_next: true,
        };
        let encoded = serde_json::to_value(Message::UpdateExecutionState(state)).unwrap();
        assert_eq!(
            encoded,
            json!({
                "type": "updateExecutionState",
                "payload": {"paused": true, "pending": false, "pausedTilNext": true}
            })
        );
    }

    #[test]
    fn test_execution_complete_wire_format() {
        let failed = ExecutionCompletePayload::failed(ErrorPayload::new("Error", "boom"));
        let encoded = serde_json::to_value(Message::ExecutionComplete(failed)).unwrap();
        assert_eq!(encoded["payload"]["status"], "failed");
        assert_eq!(encoded["payload"]["error"]["message"], "boom");

        let done = serde_json::to_value(ExecutionCompletePayload::done()).unwrap();
        assert_eq!(done, json!({"status": "done", "error": null}));
    }

    #[test]
    fn test_message_kind() {
        let message = Message::Register(ExecutionState::default());
        assert_eq!(message.kind(), MessageKind::Register);
        assert_eq!(message.kind().to_string(), "register");
    }
}
