//! Ordered, append-only conversation log shared by both interaction modes.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// One immutable entry of a conversation.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Message {
    /// Identifier assigned by the remote runtime, when known.
    pub id: Option<String>,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: None,
            role,
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// Cheaply clonable handle to a shared message log.
///
/// Messages can only be appended; nothing is edited or removed.
#[derive(Debug, Clone, Default)]
pub struct ConversationHistory {
    messages: Arc<RwLock<Vec<Message>>>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self {
            messages: Arc::new(RwLock::new(messages)),
        }
    }

    /// Appends a new local message and returns a copy of it.
    pub fn append(&self, role: Role, content: impl Into<String>) -> Message {
        let message = Message::new(role, content);
        self.messages.write().push(message.clone());
        message
    }

    /// Appends a message received from the remote side. A message whose id is
    /// already present is ignored; returns whether it was appended.
    pub fn record(&self, message: Message) -> bool {
        let mut messages = self.messages.write();
        if let Some(id) = &message.id {
            if messages.iter().any(|m| m.id.as_ref() == Some(id)) {
                return false;
            }
        }
        messages.push(message);
        true
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.read().clone()
    }

    pub fn len(&self) -> usize {
        self.messages.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.read().is_empty()
    }

    pub fn last(&self) -> Option<Message> {
        self.messages.read().last().cloned()
    }

    pub fn last_assistant(&self) -> Option<Message> {
        self.messages
            .read()
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .cloned()
    }

    pub fn count_role(&self, role: Role) -> usize {
        self.messages.read().iter().filter(|m| m.role == role).count()
    }
}
