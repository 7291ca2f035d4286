use crate::session::SessionState;
use parley_audio::AudioError;
use parley_core::{FALLBACK_REPLY, ValidationError};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Remote failure: {0}")]
    RemoteFailure(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Cannot {operation} while session is {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
    #[error("Timed out during {stage} after {after:?}")]
    Timeout { stage: &'static str, after: Duration },
    #[error(transparent)]
    Audio(#[from] AudioError),
    #[error("Malformed event: {0}")]
    Encode(#[from] serde_json::Error),
}

impl RealtimeError {
    pub fn user_message(&self) -> String {
        match self {
            RealtimeError::Validation(e) => e.to_string(),
            RealtimeError::Audio(e) => e.to_string(),
            RealtimeError::InvalidState { .. } => self.to_string(),
            _ => FALLBACK_REPLY.to_string(),
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, RealtimeError::Transport(_))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for RealtimeError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        RealtimeError::Transport(e.to_string())
    }
}
