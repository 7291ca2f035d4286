//! Duplex (streaming) mode: a long-lived event channel to a realtime runtime
//! carrying text and audio turns.

pub mod error;
pub mod memory;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod ws;

pub use error::RealtimeError;
pub use protocol::{ClientEvent, ConversationItem, ServerEvent, SessionConfig, TurnDetection};
pub use session::{SessionEvent, SessionHandle, SessionState, StreamingConfig, StreamingSession};
pub use transport::{Connection, Connector, EventSink, EventSource};
pub use ws::WsConnector;
