//! `AssistantBackend` implementation for the OpenAI Assistants API.

use crate::backend::{AssistantBackend, AssistantConfig};
use crate::error::TurnError;
use crate::history::{Message, Role};
use crate::run::{RunSnapshot, RunStatus, ToolCall, ToolOutputBatch};
use crate::tools::ToolSchema;
use async_openai::{
    Client,
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        AssistantTools, AssistantToolsFunction, CreateAssistantRequestArgs,
        CreateMessageRequestArgs, CreateRunRequestArgs,
        CreateThreadRequestArgs, FunctionObjectArgs, MessageContent, MessageObject,
        MessageRole, RunObject, RunStatus as RemoteRunStatus, SubmitToolOutputsRunRequest,
        ToolsOutputs,
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

impl From<OpenAIError> for TurnError {
    fn from(e: OpenAIError) -> Self {
        match e {
            OpenAIError::ApiError(api) => TurnError::RemoteFailure {
                status: RunStatus::Failed,
                reason: api.message,
            },
            other => TurnError::Transport(other.to_string()),
        }
    }
}

/// Thread/run backend speaking to an OpenAI-compatible Assistants endpoint.
pub struct OpenAIAssistants {
    client: Client<OpenAIConfig>,
}

impl OpenAIAssistants {
    /// Creates a backend for the given API configuration.
    ///
    /// # Arguments
    ///
    /// * `config` - API key and base URL for the Assistants endpoint.
    pub fn new(config: OpenAIConfig) -> Self {
        Self {
            client: Client::with_config(config),
        }
    }

    /// Registers a new assistant declaring the given tool table and returns
    /// its identifier.
    pub async fn create_assistant(
        &self,
        model: &str,
        instructions: &str,
        tools: &[ToolSchema],
    ) -> Result<AssistantConfig, TurnError> {
        let request = CreateAssistantRequestArgs::default()
            .model(model)
            .instructions(instructions)
            .tools(function_tools(tools)?)
            .build()?;
        let assistant = self.client.assistants().create(request).await?;
        info!(assistant_id = %assistant.id, %model, "Created assistant");
        Ok(AssistantConfig::new(assistant.id))
    }
}

#[async_trait]
impl AssistantBackend for OpenAIAssistants {
    async fn create_thread(&self) -> Result<String, TurnError> {
        let request = CreateThreadRequestArgs::default().build()?;
        let thread = self.client.threads().create(request).await?;
        Ok(thread.id)
    }

    async fn create_message(
        &self,
        thread_id: &str,
        role: Role,
        content: &str,
    ) -> Result<Message, TurnError> {
        let request = CreateMessageRequestArgs::default()
            .role(match role {
                Role::User => MessageRole::User,
                Role::Assistant => MessageRole::Assistant,
            })
            .content(content)
            .build()?;
        let message = self
            .client
            .threads()
            .messages(thread_id)
            .create(request)
            .await?;
        Ok(to_message(&message))
    }

    async fn create_run(
        &self,
        thread_id: &str,
        assistant: &AssistantConfig,
        tools: &[ToolSchema],
    ) -> Result<RunSnapshot, TurnError> {
        let mut args = CreateRunRequestArgs::default();
        args.assistant_id(&assistant.assistant_id)
            .tools(function_tools(tools)?);
        if let Some(instructions) = &assistant.instructions {
            args.instructions(instructions);
        }
        let run = self
            .client
            .threads()
            .runs(thread_id)
            .create(args.build()?)
            .await?;
        Ok(to_snapshot(run))
    }

    async fn get_run(&self, thread_id: &str, run_id: &str) -> Result<RunSnapshot, TurnError> {
        let run = self
            .client
            .threads()
            .runs(thread_id)
            .retrieve(run_id)
            .await?;
        Ok(to_snapshot(run))
    }

    async fn submit_tool_outputs(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: &ToolOutputBatch,
    ) -> Result<RunSnapshot, TurnError> {
        let request = SubmitToolOutputsRunRequest {
            tool_outputs: outputs
                .outputs()
                .iter()
                .map(|o| ToolsOutputs {
                    tool_call_id: Some(o.tool_call_id.clone()),
                    output: Some(o.output.clone()),
                })
                .collect(),
            stream: None,
        };
        debug!(%run_id, outputs = outputs.outputs().len(), "Submitting tool outputs");
        let run = self
            .client
            .threads()
            .runs(thread_id)
            .submit_tool_outputs(run_id, request)
            .await?;
        Ok(to_snapshot(run))
    }

    async fn latest_assistant_message(&self, thread_id: &str) -> Result<Option<Message>, TurnError> {
        let page = self
            .client
            .threads()
            .messages(thread_id)
            .list(&[("order", "desc"), ("limit", "20")])
            .await?;
        Ok(latest_assistant(&page.data))
    }
}

fn function_tools(tools: &[ToolSchema]) -> Result<Vec<AssistantTools>, TurnError> {
    tools
        .iter()
        .map(|t| {
            let function = FunctionObjectArgs::default()
                .name(&t.name)
                .description(&t.description)
                .parameters(t.parameters.clone())
                .build()?;
            Ok(AssistantTools::Function(AssistantToolsFunction { function }))
        })
        .collect()
}

/// First assistant message of a newest-first page.
fn latest_assistant(messages: &[MessageObject]) -> Option<Message> {
    messages
        .iter()
        .find(|m| matches!(m.role, MessageRole::Assistant))
        .map(to_message)
}

fn to_message(message: &MessageObject) -> Message {
    let content = message
        .content
        .iter()
        .filter_map(|part| match part {
            MessageContent::Text(text) => Some(text.text.value.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n");
    Message {
        id: Some(message.id.clone()),
        role: match message.role {
            MessageRole::User => Role::User,
            MessageRole::Assistant => Role::Assistant,
        },
        content,
        created_at: DateTime::from_timestamp(message.created_at as i64, 0).unwrap_or_else(Utc::now),
    }
}

fn to_snapshot(run: RunObject) -> RunSnapshot {
    let (status, implied_reason) = match run.status {
        RemoteRunStatus::Queued => (RunStatus::Queued, None),
        RemoteRunStatus::InProgress | RemoteRunStatus::Cancelling => (RunStatus::InProgress, None),
        RemoteRunStatus::RequiresAction => (RunStatus::RequiresAction, None),
        RemoteRunStatus::Completed => (RunStatus::Completed, None),
        RemoteRunStatus::Failed => (RunStatus::Failed, None),
        RemoteRunStatus::Cancelled => (RunStatus::Failed, Some("cancelled")),
        RemoteRunStatus::Incomplete => (RunStatus::Failed, Some("incomplete")),
        RemoteRunStatus::Expired => (RunStatus::Expired, None),
    };

    let tool_calls = run
        .required_action
        .map(|action| {
            action
                .submit_tool_outputs
                .tool_calls
                .into_iter()
                .map(|call| ToolCall::new(call.id, call.function.name, call.function.arguments))
                .collect()
        })
        .unwrap_or_default();

    let last_error = run
        .last_error
        .map(|e| format!("{}: {}", wire_name(&e.code), e.message))
        .or_else(|| implied_reason.map(str::to_string));

    RunSnapshot {
        id: run.id,
        status,
        tool_calls,
        last_error,
    }
}

/// The serialized (snake_case) name of a remote enum value.
fn wire_name<T: Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "error".to_string())
}
