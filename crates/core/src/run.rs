//! Remote run data model: statuses, tool calls and the outputs that answer them.

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Lifecycle of one remote turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    RequiresAction,
    Completed,
    Failed,
    Expired,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Expired
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Queued => "queued",
            RunStatus::InProgress => "in_progress",
            RunStatus::RequiresAction => "requires_action",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// A request from the remote runtime to execute a named local function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON arguments as produced by the model.
    pub arguments: String,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }
}

/// The serialized answer to exactly one `ToolCall`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub tool_call_id: String,
    pub output: String,
}

/// What the orchestrator knows about a run after one status read.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSnapshot {
    pub id: String,
    pub status: RunStatus,
    /// Pending calls; only populated while `requires_action`.
    pub tool_calls: Vec<ToolCall>,
    pub last_error: Option<String>,
}

impl RunSnapshot {
    pub fn new(id: impl Into<String>, status: RunStatus) -> Self {
        Self {
            id: id.into(),
            status,
            tool_calls: Vec::new(),
            last_error: None,
        }
    }

    pub fn with_tool_calls(mut self, calls: Vec<ToolCall>) -> Self {
        self.tool_calls = calls;
        self
    }

    pub fn with_error(mut self, reason: impl Into<String>) -> Self {
        self.last_error = Some(reason.into());
        self
    }
}

/// A complete, validated set of outputs for one `requires_action` step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutputBatch {
    outputs: Vec<ToolOutput>,
}

impl ToolOutputBatch {
    /// Checks that every pending call is answered exactly once and that no
    /// output references a call the run did not issue.
    pub fn for_run(run: &RunSnapshot, outputs: Vec<ToolOutput>) -> Result<Self, ValidationError> {
        if run.status != RunStatus::RequiresAction {
            return Err(ValidationError::RunNotAwaitingOutputs(run.status));
        }

        let pending: HashSet<&str> = run.tool_calls.iter().map(|c| c.id.as_str()).collect();
        let mut answered = HashSet::new();
        for output in &outputs {
            if !pending.contains(output.tool_call_id.as_str()) {
                return Err(ValidationError::UnknownToolCallId(
                    output.tool_call_id.clone(),
                ));
            }
            if !answered.insert(output.tool_call_id.as_str()) {
                return Err(ValidationError::DuplicateToolOutput(
                    output.tool_call_id.clone(),
                ));
            }
        }

        let missing: Vec<String> = run
            .tool_calls
            .iter()
            .filter(|c| !answered.contains(c.id.as_str()))
            .map(|c| c.id.clone())
            .collect();
        if !missing.is_empty() {
            return Err(ValidationError::MissingToolOutputs(missing));
        }

        Ok(Self { outputs })
    }

    pub fn outputs(&self) -> &[ToolOutput] {
        &self.outputs
    }

    pub fn into_outputs(self) -> Vec<ToolOutput> {
        self.outputs
    }
}
