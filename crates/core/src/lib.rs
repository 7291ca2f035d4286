//! Core of the conversational runtime: conversation history, the tool
//! registry, and the poll-mode turn orchestrator.

pub mod backend;
pub mod backoff;
pub mod error;
pub mod history;
pub mod openai;
pub mod orchestrator;
pub mod run;
pub mod tools;

pub use backend::{AssistantBackend, AssistantConfig};
pub use backoff::{Backoff, PollPolicy};
pub use error::{FALLBACK_REPLY, ToolError, TurnError, ValidationError};
pub use history::{ConversationHistory, Message, Role};
pub use orchestrator::{ConversationThread, Session};
pub use run::{RunSnapshot, RunStatus, ToolCall, ToolOutput, ToolOutputBatch};
pub use tools::{InvokeError, ToolHandler, ToolRegistry, ToolSchema, typed};
