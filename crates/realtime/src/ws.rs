//! WebSocket transport to an OpenAI-compatible realtime endpoint.

use crate::error::RealtimeError;
use crate::protocol::{ClientEvent, ServerEvent};
use crate::transport::{Connection, Connector, EventSink, EventSource};
use async_trait::async_trait;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, protocol::Message as WsMessage},
};
use tracing::{debug, info, warn};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WsConnector {
    url: String,
    model: String,
    api_key: SecretString,
}

impl WsConnector {
    /// # Arguments
    ///
    /// * `url` - Base realtime endpoint, e.g. `wss://api.openai.com/v1/realtime`.
    /// * `model` - Realtime model, sent as the `model` query parameter.
    /// * `api_key` - Sent as a bearer token.
    pub fn new(url: impl Into<String>, model: impl Into<String>, api_key: SecretString) -> Self {
        Self {
            url: url.into(),
            model: model.into(),
            api_key,
        }
    }

    fn endpoint(&self) -> String {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}model={}", self.url, separator, self.model)
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Connection, RealtimeError> {
        let mut request = self.endpoint().into_client_request()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.api_key.expose_secret()))
            .map_err(|e| RealtimeError::Transport(format!("invalid API key header: {}", e)))?;
        request.headers_mut().insert("Authorization", bearer);
        request
            .headers_mut()
            .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        let (socket, _) = connect_async(request).await?;
        let (tx, rx) = socket.split();
        info!(model = %self.model, "Connected to realtime endpoint");
        Ok(Connection {
            sink: Box::new(WsSink { tx }),
            source: Box::new(WsSource { rx }),
        })
    }
}

struct WsSink {
    tx: SplitSink<Socket, WsMessage>,
}

#[async_trait]
impl EventSink for WsSink {
    async fn send(&mut self, event: &ClientEvent) -> Result<(), RealtimeError> {
        let text = serde_json::to_string(event)?;
        debug!(event = event.name(), bytes = text.len(), "Sending realtime event");
        self.tx.send(WsMessage::Text(text.into())).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), RealtimeError> {
        self.tx.close().await?;
        Ok(())
    }
}

struct WsSource {
    rx: SplitStream<Socket>,
}

#[async_trait]
impl EventSource for WsSource {
    async fn next_event(&mut self) -> Option<Result<ServerEvent, RealtimeError>> {
        loop {
            match self.rx.next().await? {
                Ok(WsMessage::Text(text)) => {
                    return Some(serde_json::from_str(&text).map_err(RealtimeError::from));
                }
                Ok(WsMessage::Close(frame)) => {
                    info!(?frame, "Realtime endpoint closed the connection");
                    return None;
                }
                Ok(other) => debug!(kind = ?other, "Ignoring non-text frame"),
                Err(e) => {
                    warn!(error = %e, "Realtime socket error");
                    return Some(Err(e.into()));
                }
            }
        }
    }
}
