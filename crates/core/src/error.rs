//! Error taxonomy shared by the poll-mode orchestrator and the tool registry.

use crate::run::RunStatus;
use std::time::Duration;

/// Fallback text shown to a user when a turn cannot be completed.
pub const FALLBACK_REPLY: &str = "I apologize, but I encountered an error. Please try again.";

/// Failures that abort an operation before any network call is made.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("User input must not be empty")]
    EmptyInput,
    #[error("Thread {0} already has an active run")]
    ThreadBusy(String),
    #[error("Missing tool outputs for call ids: {}", .0.join(", "))]
    MissingToolOutputs(Vec<String>),
    #[error("Tool output references unknown call id '{0}'")]
    UnknownToolCallId(String),
    #[error("Tool output for call id '{0}' was supplied more than once")]
    DuplicateToolOutput(String),
    #[error("Run is {0}, not waiting for tool outputs")]
    RunNotAwaitingOutputs(RunStatus),
    #[error("Unknown tool '{0}'")]
    UnknownTool(String),
    #[error("Invalid arguments for tool '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },
    #[error("Invalid schema for tool '{name}': {reason}")]
    InvalidToolSchema { name: String, reason: String },
    #[error("Tool '{0}' is registered more than once")]
    DuplicateTool(String),
}

/// Errors surfaced by `Session` operations.
#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Run ended as {status}: {reason}")]
    RemoteFailure { status: RunStatus, reason: String },
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Run did not finish within {0:?}")]
    Timeout(Duration),
}

impl TurnError {
    /// Text suitable for the chat transcript.
    pub fn user_message(&self) -> String {
        match self {
            TurnError::Validation(e) => e.to_string(),
            _ => FALLBACK_REPLY.to_string(),
        }
    }

    /// The remote failure reason, if the run itself failed.
    pub fn remote_reason(&self) -> Option<&str> {
        match self {
            TurnError::RemoteFailure { reason, .. } => Some(reason),
            _ => None,
        }
    }
}

/// A tool's own execution failure. Never aborts a turn: it is packaged into
/// the tool output so the model can react to it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolError {
    #[error("{0}")]
    Failed(String),
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),
}

impl ToolError {
    pub fn failed(message: impl Into<String>) -> Self {
        ToolError::Failed(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message_hides_transport_details() {
        let err = TurnError::Transport("connection reset by peer".into());
        assert_eq!(err.user_message(), FALLBACK_REPLY);

        let err = TurnError::RemoteFailure {
            status: RunStatus::Failed,
            reason: "rate_limited".into(),
        };
        assert_eq!(err.user_message(), FALLBACK_REPLY);
        assert_eq!(err.remote_reason(), Some("rate_limited"));
    }

    #[test]
    fn test_validation_messages_are_presentable() {
        let err: TurnError = ValidationError::EmptyInput.into();
        assert_eq!(err.user_message(), "User input must not be empty");

        let err = ValidationError::MissingToolOutputs(vec!["call_1".into(), "call_2".into()]);
        assert_eq!(
            err.to_string(),
            "Missing tool outputs for call ids: call_1, call_2"
        );
    }
}
