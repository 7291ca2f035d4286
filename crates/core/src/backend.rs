//! The remote thread/run abstraction the poll-mode orchestrator drives.

use crate::error::TurnError;
use crate::history::{Message, Role};
use crate::run::{RunSnapshot, ToolOutputBatch};
use crate::tools::ToolSchema;
use async_trait::async_trait;

/// Identifies the remote assistant a run is created against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssistantConfig {
    pub assistant_id: String,
    /// Per-run instruction override.
    pub instructions: Option<String>,
}

impl AssistantConfig {
    pub fn new(assistant_id: impl Into<String>) -> Self {
        Self {
            assistant_id: assistant_id.into(),
            instructions: None,
        }
    }
}

/// Stateful remote runtime exposing threads, messages and runs.
///
/// Every call is a single request; retry and polling policy live in the
/// orchestrator so this trait can be scripted in tests.
#[async_trait]
pub trait AssistantBackend: Send + Sync {
    async fn create_thread(&self) -> Result<String, TurnError>;

    async fn create_message(
        &self,
        thread_id: &str,
        role: Role,
        content: &str,
    ) -> Result<Message, TurnError>;

    async fn create_run(
        &self,
        thread_id: &str,
        assistant: &AssistantConfig,
        tools: &[ToolSchema],
    ) -> Result<RunSnapshot, TurnError>;

    async fn get_run(&self, thread_id: &str, run_id: &str) -> Result<RunSnapshot, TurnError>;

    async fn submit_tool_outputs(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: &ToolOutputBatch,
    ) -> Result<RunSnapshot, TurnError>;

    /// The newest assistant message on the thread, if any.
    async fn latest_assistant_message(&self, thread_id: &str) -> Result<Option<Message>, TurnError>;
}
