//! Transport seam between the session state machine and the wire.

use crate::error::RealtimeError;
use crate::protocol::{ClientEvent, ServerEvent};
use async_trait::async_trait;

/// Write half of a connection.
#[async_trait]
pub trait EventSink: Send {
    async fn send(&mut self, event: &ClientEvent) -> Result<(), RealtimeError>;

    /// Closes the connection. Later sends fail with a transport error.
    async fn close(&mut self) -> Result<(), RealtimeError>;
}

/// Read half of a connection.
#[async_trait]
pub trait EventSource: Send {
    /// The next event, or `None` once the connection has closed.
    ///
    /// Undecodable payloads surface as `RealtimeError::Encode` and do not end
    /// the stream.
    async fn next_event(&mut self) -> Option<Result<ServerEvent, RealtimeError>>;
}

pub struct Connection {
    pub sink: Box<dyn EventSink>,
    pub source: Box<dyn EventSource>,
}

/// Opens fresh connections to the runtime, one per session.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Connection, RealtimeError>;
}
