//! In-process transport. Events cross the channel as JSON text, so both
//! sides exercise the same encoding as the WebSocket transport.

use crate::error::RealtimeError;
use crate::protocol::{ClientEvent, ServerEvent};
use crate::transport::{Connection, Connector, EventSink, EventSource};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Creates a connector and the remote peer that accepts its connections.
pub fn pair() -> (MemoryConnector, RemotePeer) {
    let (tx, rx) = mpsc::unbounded_channel();
    (MemoryConnector { accept_tx: tx }, RemotePeer { accept_rx: rx })
}

#[derive(Clone)]
pub struct MemoryConnector {
    accept_tx: mpsc::UnboundedSender<RemoteConnection>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Connection, RealtimeError> {
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        self.accept_tx
            .send(RemoteConnection {
                inbound: client_rx,
                outbound: server_tx,
            })
            .map_err(|_| RealtimeError::Transport("connection refused".into()))?;
        Ok(Connection {
            sink: Box::new(MemorySink {
                tx: Some(client_tx),
            }),
            source: Box::new(MemorySource { rx: server_rx }),
        })
    }
}

/// The runtime's side of the in-memory transport.
pub struct RemotePeer {
    accept_rx: mpsc::UnboundedReceiver<RemoteConnection>,
}

impl RemotePeer {
    /// Waits for the next client connection.
    pub async fn accept(&mut self) -> Option<RemoteConnection> {
        self.accept_rx.recv().await
    }
}

/// One accepted connection. Dropping it drops the transport.
pub struct RemoteConnection {
    inbound: mpsc::UnboundedReceiver<String>,
    outbound: mpsc::UnboundedSender<String>,
}

impl RemoteConnection {
    /// The next client event, or `None` after the client closed its sink.
    pub async fn recv(&mut self) -> Option<ClientEvent> {
        loop {
            let text = self.inbound.recv().await?;
            match serde_json::from_str(&text) {
                Ok(event) => return Some(event),
                Err(e) => tracing::warn!(error = %e, "Peer received malformed client event"),
            }
        }
    }

    pub fn send(&self, event: ServerEvent) -> Result<(), RealtimeError> {
        self.send_raw(serde_json::to_string(&event)?)
    }

    /// Sends a payload verbatim, e.g. an event type the client does not model.
    pub fn send_raw(&self, text: impl Into<String>) -> Result<(), RealtimeError> {
        self.outbound
            .send(text.into())
            .map_err(|_| RealtimeError::Transport("client went away".into()))
    }
}

struct MemorySink {
    tx: Option<mpsc::UnboundedSender<String>>,
}

#[async_trait]
impl EventSink for MemorySink {
    async fn send(&mut self, event: &ClientEvent) -> Result<(), RealtimeError> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| RealtimeError::Transport("sink closed".into()))?;
        tx.send(serde_json::to_string(event)?)
            .map_err(|_| RealtimeError::Transport("peer went away".into()))
    }

    async fn close(&mut self) -> Result<(), RealtimeError> {
        self.tx = None;
        Ok(())
    }
}

struct MemorySource {
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl EventSource for MemorySource {
    async fn next_event(&mut self) -> Option<Result<ServerEvent, RealtimeError>> {
        let text = self.rx.recv().await?;
        Some(serde_json::from_str(&text).map_err(RealtimeError::from))
    }
}
