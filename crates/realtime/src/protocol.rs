//! Wire events exchanged with the realtime runtime, one JSON object per event.

use parley_core::{Message, Role, ToolSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Events sent to the runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },
    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },
    /// One base64 PCM16LE chunk.
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },
    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit,
    #[serde(rename = "response.create")]
    ResponseCreate,
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::SessionUpdate { .. } => "session.update",
            ClientEvent::ConversationItemCreate { .. } => "conversation.item.create",
            ClientEvent::InputAudioBufferAppend { .. } => "input_audio_buffer.append",
            ClientEvent::InputAudioBufferCommit => "input_audio_buffer.commit",
            ClientEvent::ResponseCreate => "response.create",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    InputText { text: String },
    Text { text: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationItem {
    Message {
        role: ItemRole,
        content: Vec<ContentPart>,
    },
    FunctionCallOutput {
        call_id: String,
        output: String,
    },
}

impl ConversationItem {
    /// User text goes out as `input_text`, assistant text as `text`.
    pub fn from_message(message: &Message) -> Self {
        match message.role {
            Role::User => ConversationItem::Message {
                role: ItemRole::User,
                content: vec![ContentPart::InputText {
                    text: message.content.clone(),
                }],
            },
            Role::Assistant => ConversationItem::Message {
                role: ItemRole::Assistant,
                content: vec![ContentPart::Text {
                    text: message.content.clone(),
                }],
            },
        }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        ConversationItem::Message {
            role: ItemRole::User,
            content: vec![ContentPart::InputText { text: text.into() }],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Audio,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    pub model: String,
}

/// Server-side voice activity detection parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnDetection {
    ServerVad {
        threshold: f32,
        prefix_padding_ms: u32,
        silence_duration_ms: u32,
    },
}

/// A function tool as declared in `session.update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeTool {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl From<&ToolSchema> for RealtimeTool {
    fn from(schema: &ToolSchema) -> Self {
        Self {
            kind: "function".into(),
            name: schema.name.clone(),
            description: schema.description.clone(),
            parameters: schema.parameters.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub modalities: Vec<Modality>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    pub voice: String,
    pub input_audio_format: String,
    pub output_audio_format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<TranscriptionConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_detection: Option<TurnDetection>,
    #[serde(default)]
    pub tools: Vec<RealtimeTool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            modalities: vec![Modality::Text, Modality::Audio],
            instructions: None,
            voice: "alloy".into(),
            input_audio_format: "pcm16".into(),
            output_audio_format: "pcm16".into(),
            input_audio_transcription: Some(TranscriptionConfig {
                model: "whisper-1".into(),
            }),
            turn_detection: Some(TurnDetection::ServerVad {
                threshold: 0.5,
                prefix_padding_ms: 300,
                silence_duration_ms: 500,
            }),
            tools: Vec::new(),
            tool_choice: None,
        }
    }
}

impl SessionConfig {
    pub fn with_tools(mut self, tools: &[ToolSchema]) -> Self {
        self.tools = tools.iter().map(RealtimeTool::from).collect();
        self.tool_choice = if self.tools.is_empty() {
            None
        } else {
            Some("auto".into())
        };
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    InProgress,
    Completed,
    Cancelled,
    Failed,
    Incomplete,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ResponseStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_details: Option<Value>,
}

impl ResponseInfo {
    pub fn with_status(status: ResponseStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// True when the response ended without usable output.
    pub fn is_failure(&self) -> bool {
        matches!(
            self.status,
            Some(ResponseStatus::Failed | ResponseStatus::Cancelled)
        )
    }

    pub fn failure_reason(&self) -> String {
        let detail = self
            .status_details
            .as_ref()
            .and_then(|d| {
                d.pointer("/error/message")
                    .or_else(|| d.get("reason"))
                    .and_then(Value::as_str)
            })
            .map(str::to_string);
        match (self.status, detail) {
            (_, Some(detail)) => detail,
            (Some(ResponseStatus::Cancelled), None) => "response cancelled".into(),
            _ => "response failed".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
}

/// Events received from the runtime. Anything not listed is `Unknown`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated { session: SessionInfo },
    #[serde(rename = "session.updated")]
    SessionUpdated { session: SessionInfo },
    #[serde(rename = "conversation.item.created")]
    ConversationItemCreated { item: ItemRef },
    #[serde(rename = "response.text.delta")]
    ResponseTextDelta { delta: String },
    #[serde(rename = "response.audio_transcript.delta")]
    ResponseAudioTranscriptDelta { delta: String },
    #[serde(rename = "response.audio.delta")]
    ResponseAudioDelta { delta: String },
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputAudioTranscriptionCompleted {
        #[serde(default)]
        item_id: Option<String>,
        transcript: String,
    },
    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallArgumentsDone {
        call_id: String,
        name: String,
        arguments: String,
    },
    #[serde(rename = "response.done")]
    ResponseDone {
        #[serde(default)]
        response: ResponseInfo,
    },
    #[serde(rename = "error")]
    Error { error: ErrorDetail },
    #[serde(other)]
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_session_update_shape() {
        let schema = ToolSchema::new(
            "get_events",
            "List calendar events",
            json!({"type": "object", "properties": {}}),
        );
        let event = ClientEvent::SessionUpdate {
            session: SessionConfig::default().with_tools(&[schema]),
        };
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["type"], "session.update");
        assert_eq!(value["session"]["modalities"], json!(["text", "audio"]));
        assert_eq!(value["session"]["input_audio_format"], "pcm16");
        assert_eq!(
            value["session"]["turn_detection"],
            json!({
                "type": "server_vad",
                "threshold": 0.5,
                "prefix_padding_ms": 300,
                "silence_duration_ms": 500
            })
        );
        assert_eq!(value["session"]["tools"][0]["type"], "function");
        assert_eq!(value["session"]["tools"][0]["name"], "get_events");
        assert_eq!(value["session"]["tool_choice"], "auto");
        assert!(value["session"].get("instructions").is_none());
    }

    #[test]
    fn test_control_events_carry_only_their_type() {
        assert_eq!(
            serde_json::to_string(&ClientEvent::InputAudioBufferCommit).unwrap(),
            r#"{"type":"input_audio_buffer.commit"}"#
        );
        assert_eq!(
            serde_json::to_string(&ClientEvent::ResponseCreate).unwrap(),
            r#"{"type":"response.create"}"#
        );
    }

    #[test]
    fn test_history_items_use_role_specific_content() {
        let user = ConversationItem::from_message(&Message::new(Role::User, "hi"));
        assert_eq!(
            serde_json::to_value(&user).unwrap(),
            json!({"type": "message", "role": "user", "content": [{"type": "input_text", "text": "hi"}]})
        );

        let assistant = ConversationItem::from_message(&Message::new(Role::Assistant, "hello"));
        assert_eq!(
            serde_json::to_value(&assistant).unwrap()["content"][0],
            json!({"type": "text", "text": "hello"})
        );

        let output = ConversationItem::FunctionCallOutput {
            call_id: "call_1".into(),
            output: "[]".into(),
        };
        assert_eq!(
            serde_json::to_value(&output).unwrap(),
            json!({"type": "function_call_output", "call_id": "call_1", "output": "[]"})
        );
    }

    #[test]
    fn test_server_events_ignore_extra_fields() {
        let raw = r#"{
            "type": "response.function_call_arguments.done",
            "event_id": "evt_1",
            "response_id": "resp_1",
            "item_id": "item_1",
            "output_index": 0,
            "call_id": "call_9",
            "name": "get_events",
            "arguments": "{\"days\":7}"
        }"#;
        let event: ServerEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(
            event,
            ServerEvent::FunctionCallArgumentsDone {
                call_id: "call_9".into(),
                name: "get_events".into(),
                arguments: r#"{"days":7}"#.into(),
            }
        );
    }

    #[test]
    fn test_unlisted_server_events_are_unknown() {
        let event: ServerEvent =
            serde_json::from_str(r#"{"type": "rate_limits.updated", "rate_limits": []}"#).unwrap();
        assert_eq!(event, ServerEvent::Unknown);
    }

    #[test]
    fn test_failed_response_reason() {
        let raw = r#"{"type": "response.done", "response": {
            "id": "resp_1",
            "status": "failed",
            "status_details": {"type": "failed", "error": {"code": "rate_limit_exceeded", "message": "rate_limited"}}
        }}"#;
        let ServerEvent::ResponseDone { response } = serde_json::from_str(raw).unwrap() else {
            panic!("expected response.done");
        };
        assert!(response.is_failure());
        assert_eq!(response.failure_reason(), "rate_limited");

        assert!(!ResponseInfo::with_status(ResponseStatus::Completed).is_failure());
        assert_eq!(
            ResponseInfo::with_status(ResponseStatus::Cancelled).failure_reason(),
            "response cancelled"
        );
    }
}
