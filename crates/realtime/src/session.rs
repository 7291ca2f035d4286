//! Duplex session lifecycle.
//!
//! `connecting → configuring → active ⇄ responding → closed`. The handshake
//! runs inline in [`StreamingSession::establish`]; afterwards a spawned read
//! loop owns the in-flight response while [`SessionHandle`] is the write path.

use crate::error::RealtimeError;
use crate::protocol::{ClientEvent, ConversationItem, ServerEvent, SessionConfig};
use crate::transport::{Connector, EventSink, EventSource};
use parley_audio::{
    AudioChunk, AudioSink, DEFAULT_CHUNK_MS, EncodedAudio, REALTIME_SAMPLE_RATE, ResponseAudio,
    encode_for_wire,
};
use parley_core::{ConversationHistory, Role, ToolCall, ToolRegistry, ValidationError};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Configuring,
    Active,
    Responding,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Connecting => "connecting",
            SessionState::Configuring => "configuring",
            SessionState::Active => "active",
            SessionState::Responding => "responding",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// What the presentation layer sees of a running session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    TranscriptDelta(String),
    /// The runtime's transcription of the user's spoken turn.
    UserTranscript(String),
    ToolInvoked { call_id: String, name: String },
    ResponseComplete { text: String, audio: Duration },
    Error(String),
    Closed,
}

#[derive(Debug, Clone)]
pub struct StreamingConfig {
    pub session: SessionConfig,
    /// Upper bound for connect, each handshake step and each replay ack.
    pub handshake_timeout: Duration,
    pub chunk_ms: u32,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            handshake_timeout: Duration::from_secs(15),
            chunk_ms: DEFAULT_CHUNK_MS,
        }
    }
}

type SharedSink = Arc<Mutex<Box<dyn EventSink>>>;

/// Factory for duplex sessions sharing one history and tool table.
///
/// Each call to [`establish`](Self::establish) opens a fresh connection and
/// replays the committed history, so recovering from a drop is just
/// establishing again.
pub struct StreamingSession {
    connector: Arc<dyn Connector>,
    config: StreamingConfig,
    tools: Arc<ToolRegistry>,
    history: ConversationHistory,
}

impl StreamingSession {
    pub fn new(
        connector: Arc<dyn Connector>,
        config: StreamingConfig,
        tools: Arc<ToolRegistry>,
        history: ConversationHistory,
    ) -> Self {
        Self {
            connector,
            config,
            tools,
            history,
        }
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    /// Connects, configures the session and replays history.
    ///
    /// Returns the write handle and the stream of presentation events.
    #[instrument(name = "establish", skip_all, fields(history = self.history.len()))]
    pub async fn establish(
        &self,
        audio_sink: Box<dyn AudioSink>,
    ) -> Result<(SessionHandle, mpsc::UnboundedReceiver<SessionEvent>), RealtimeError> {
        let timeout = self.config.handshake_timeout;
        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);
        let deadline = Instant::now() + timeout;

        let connection = tokio::time::timeout_at(deadline, self.connector.connect())
            .await
            .map_err(|_| RealtimeError::Timeout {
                stage: "connect",
                after: timeout,
            })??;
        let mut sink = connection.sink;
        let mut source = connection.source;

        let session_id = await_event(&mut *source, deadline, "session.created", timeout, |e| match e {
            ServerEvent::SessionCreated { session } => Some(session.id.clone()),
            _ => None,
        })
        .await?;
        info!(session_id = session_id.as_deref().unwrap_or("-"), "Realtime session created");

        state_tx.send_replace(SessionState::Configuring);
        let session = self
            .config
            .session
            .clone()
            .with_tools(&self.tools.schemas());
        sink.send(&ClientEvent::SessionUpdate { session }).await?;
        await_event(&mut *source, deadline, "session.updated", timeout, |e| {
            matches!(e, ServerEvent::SessionUpdated { .. }).then_some(())
        })
        .await?;

        state_tx.send_replace(SessionState::Active);
        let replayed = replay_history(&self.history, &mut *sink, &mut *source, timeout).await?;
        if replayed > 0 {
            info!(items = replayed, "Replayed conversation history");
        }

        let sink: SharedSink = Arc::new(Mutex::new(sink));
        let state_tx = Arc::new(state_tx);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let read_loop = ReadLoop {
            source,
            sink: Arc::clone(&sink),
            tools: Arc::clone(&self.tools),
            history: self.history.clone(),
            audio_sink,
            state: Arc::clone(&state_tx),
            events: events_tx,
            shutdown: shutdown_rx,
            pending: None,
        };
        let span = info_span!("realtime_read_loop", session_id = session_id.as_deref().unwrap_or("-"));
        tokio::spawn(read_loop.run().instrument(span));

        let handle = SessionHandle {
            sink,
            state: state_rx,
            state_tx,
            shutdown: Arc::new(shutdown_tx),
            history: self.history.clone(),
            chunk_ms: self.config.chunk_ms,
        };
        Ok((handle, events_rx))
    }
}

/// Sends every committed message in order, waiting for each acknowledgment
/// before the next.
async fn replay_history(
    history: &ConversationHistory,
    sink: &mut dyn EventSink,
    source: &mut dyn EventSource,
    timeout: Duration,
) -> Result<usize, RealtimeError> {
    let messages = history.snapshot();
    for (index, message) in messages.iter().enumerate() {
        sink.send(&ClientEvent::ConversationItemCreate {
            item: ConversationItem::from_message(message),
        })
        .await?;
        let ack_deadline = Instant::now() + timeout;
        let item_id = await_event(source, ack_deadline, "history replay", timeout, |e| match e {
            ServerEvent::ConversationItemCreated { item } => Some(item.id.clone()),
            _ => None,
        })
        .await?;
        debug!(index, role = %message.role, item_id = item_id.as_deref().unwrap_or("-"), "Replay item acknowledged");
    }
    Ok(messages.len())
}

/// Reads until `pick` accepts an event, the deadline passes or the
/// connection fails. An `error` event aborts the wait.
async fn await_event<T>(
    source: &mut dyn EventSource,
    deadline: Instant,
    stage: &'static str,
    timeout: Duration,
    mut pick: impl FnMut(&ServerEvent) -> Option<T>,
) -> Result<T, RealtimeError> {
    loop {
        let event = match tokio::time::timeout_at(deadline, source.next_event()).await {
            Err(_) => {
                warn!(stage, "Handshake step timed out");
                return Err(RealtimeError::Timeout {
                    stage,
                    after: timeout,
                });
            }
            Ok(None) => {
                return Err(RealtimeError::Transport(format!(
                    "connection closed while waiting for {stage}"
                )));
            }
            Ok(Some(Err(RealtimeError::Encode(e)))) => {
                warn!(stage, error = %e, "Skipping undecodable event");
                continue;
            }
            Ok(Some(Err(e))) => return Err(e),
            Ok(Some(Ok(ServerEvent::Error { error }))) => {
                return Err(RealtimeError::RemoteFailure(error.message));
            }
            Ok(Some(Ok(event))) => event,
        };
        match pick(&event) {
            Some(value) => return Ok(value),
            None => debug!(stage, ?event, "Ignoring event during handshake"),
        }
    }
}

/// Write path of an established session. Cheap to clone and usable from
/// any task.
#[derive(Clone)]
pub struct SessionHandle {
    sink: SharedSink,
    state: watch::Receiver<SessionState>,
    state_tx: Arc<watch::Sender<SessionState>>,
    shutdown: Arc<watch::Sender<bool>>,
    history: ConversationHistory,
    chunk_ms: u32,
}

impl SessionHandle {
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// A receiver observing every state change.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    /// Encodes a capture and appends it to the input buffer.
    ///
    /// Empty, silent or mixed-format captures are rejected before anything
    /// is sent.
    pub async fn send_audio(&self, capture: &[AudioChunk]) -> Result<EncodedAudio, RealtimeError> {
        self.require("send audio", SessionState::Active)?;
        let encoded = encode_for_wire(capture, REALTIME_SAMPLE_RATE, self.chunk_ms)?;
        let mut sink = self.sink.lock().await;
        for chunk in &encoded.chunks {
            sink.send(&ClientEvent::InputAudioBufferAppend {
                audio: chunk.clone(),
            })
            .await?;
        }
        debug!(chunks = encoded.chunks.len(), duration_ms = encoded.duration().as_millis() as u64, "Appended user audio");
        Ok(encoded)
    }

    /// Ends the user's spoken turn and requests a response.
    pub async fn commit_turn(&self) -> Result<(), RealtimeError> {
        self.require("commit a turn", SessionState::Active)?;
        self.send(ClientEvent::InputAudioBufferCommit).await?;
        self.request_response().await
    }

    /// Sends a typed user turn and requests a response.
    pub async fn send_text(&self, text: &str) -> Result<(), RealtimeError> {
        if text.trim().is_empty() {
            return Err(ValidationError::EmptyInput.into());
        }
        self.require("send text", SessionState::Active)?;
        self.history.append(Role::User, text);
        self.send(ClientEvent::ConversationItemCreate {
            item: ConversationItem::user_text(text),
        })
        .await?;
        self.request_response().await
    }

    /// Shuts the session down, discarding any partial response. Safe to call
    /// more than once and from any task.
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s == SessionState::Closed).await;
    }

    async fn request_response(&self) -> Result<(), RealtimeError> {
        // Enter responding first: the read loop may see response.done
        // before this call returns.
        self.state_tx.send_if_modified(|s| {
            if *s == SessionState::Active {
                *s = SessionState::Responding;
                true
            } else {
                false
            }
        });
        self.send(ClientEvent::ResponseCreate).await
    }

    async fn send(&self, event: ClientEvent) -> Result<(), RealtimeError> {
        self.sink.lock().await.send(&event).await
    }

    fn require(&self, operation: &'static str, expected: SessionState) -> Result<(), RealtimeError> {
        let state = self.state();
        if state != expected {
            return Err(RealtimeError::InvalidState { operation, state });
        }
        Ok(())
    }
}

/// The assistant message under construction.
struct PendingResponse {
    text: String,
    audio: ResponseAudio,
    tool_calls: Vec<ToolCall>,
}

impl PendingResponse {
    fn new() -> Self {
        Self {
            text: String::new(),
            audio: ResponseAudio::new(REALTIME_SAMPLE_RATE),
            tool_calls: Vec::new(),
        }
    }
}

struct ReadLoop {
    source: Box<dyn EventSource>,
    sink: SharedSink,
    tools: Arc<ToolRegistry>,
    history: ConversationHistory,
    audio_sink: Box<dyn AudioSink>,
    state: Arc<watch::Sender<SessionState>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    shutdown: watch::Receiver<bool>,
    pending: Option<PendingResponse>,
}

impl ReadLoop {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.changed() => {
                    info!("Session closed locally");
                    if let Err(e) = self.sink.lock().await.close().await {
                        debug!(error = %e, "Error closing transport");
                    }
                    break;
                }
                next = self.source.next_event() => match next {
                    None => {
                        warn!(state = %self.current(), "Realtime transport dropped");
                        break;
                    }
                    Some(Err(RealtimeError::Encode(e))) => {
                        warn!(error = %e, "Skipping undecodable event");
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Realtime transport failed");
                        self.emit(SessionEvent::Error(e.user_message()));
                        break;
                    }
                    Some(Ok(event)) => {
                        if let Err(e) = self.handle(event).await {
                            error!(error = %e, "Failed to answer the runtime");
                            self.emit(SessionEvent::Error(e.user_message()));
                            break;
                        }
                    }
                },
            }
        }
    }

    async fn handle(&mut self, event: ServerEvent) -> Result<(), RealtimeError> {
        match event {
            ServerEvent::ResponseTextDelta { delta }
            | ServerEvent::ResponseAudioTranscriptDelta { delta } => {
                self.response().text.push_str(&delta);
                self.emit(SessionEvent::TranscriptDelta(delta));
            }
            ServerEvent::ResponseAudioDelta { delta } => {
                if let Err(e) = self.response().audio.push_base64(&delta) {
                    warn!(error = %e, "Dropping undecodable audio delta");
                }
            }
            ServerEvent::InputAudioTranscriptionCompleted { transcript, .. } => {
                let transcript = transcript.trim();
                if !transcript.is_empty() {
                    self.history.append(Role::User, transcript);
                    self.emit(SessionEvent::UserTranscript(transcript.to_string()));
                }
            }
            ServerEvent::FunctionCallArgumentsDone {
                call_id,
                name,
                arguments,
            } => {
                info!(tool = %name, %call_id, "Runtime requested a tool call");
                self.emit(SessionEvent::ToolInvoked {
                    call_id: call_id.clone(),
                    name: name.clone(),
                });
                self.response()
                    .tool_calls
                    .push(ToolCall::new(call_id, name, arguments));
            }
            ServerEvent::ResponseDone { response } if response.is_failure() => {
                let reason = response.failure_reason();
                warn!(%reason, "Response failed");
                self.pending = None;
                self.set_active();
                self.emit(SessionEvent::Error(reason));
            }
            ServerEvent::ResponseDone { .. } => self.finish_response().await?,
            ServerEvent::Error { error } => {
                warn!(code = error.code.as_deref().unwrap_or("-"), message = %error.message, "Runtime reported an error");
                // Errors are request-scoped: a response already streaming
                // keeps going and ends with its own response.done.
                if self.pending.is_none() {
                    self.state.send_if_modified(|s| {
                        let responding = *s == SessionState::Responding;
                        if responding {
                            *s = SessionState::Active;
                        }
                        responding
                    });
                }
                self.emit(SessionEvent::Error(error.message));
            }
            ServerEvent::SessionCreated { .. }
            | ServerEvent::SessionUpdated { .. }
            | ServerEvent::ConversationItemCreated { .. }
            | ServerEvent::Unknown => {}
        }
        Ok(())
    }

    /// Answers pending tool calls, or commits the finished message.
    async fn finish_response(&mut self) -> Result<(), RealtimeError> {
        let Some(mut pending) = self.pending.take() else {
            debug!("response.done without a pending response");
            self.set_active();
            return Ok(());
        };

        if !pending.tool_calls.is_empty() {
            let calls = std::mem::take(&mut pending.tool_calls);
            let outputs = self.tools.dispatch(&calls).await;
            {
                let mut sink = self.sink.lock().await;
                for output in outputs {
                    sink.send(&ClientEvent::ConversationItemCreate {
                        item: ConversationItem::FunctionCallOutput {
                            call_id: output.tool_call_id,
                            output: output.output,
                        },
                    })
                    .await?;
                }
                sink.send(&ClientEvent::ResponseCreate).await?;
            }
            debug!(calls = calls.len(), "Submitted tool outputs");
            self.pending = Some(pending);
            return Ok(());
        }

        let clip = pending.audio.finish();
        let text = pending.text;
        if !text.is_empty() {
            self.history.append(Role::Assistant, text.clone());
        }
        if !clip.is_empty() {
            if let Err(e) = self.audio_sink.play(&clip) {
                warn!(error = %e, "Playback failed");
            }
        }
        info!(chars = text.len(), audio_ms = clip.duration().as_millis() as u64, "Response complete");
        self.set_active();
        self.emit(SessionEvent::ResponseComplete {
            text,
            audio: clip.duration(),
        });
        Ok(())
    }

    /// The pending response, starting one (and entering `responding`) if
    /// the runtime began answering on its own.
    fn response(&mut self) -> &mut PendingResponse {
        if self.pending.is_none() {
            self.state.send_if_modified(|s| {
                if *s == SessionState::Active {
                    *s = SessionState::Responding;
                    true
                } else {
                    false
                }
            });
        }
        self.pending.get_or_insert_with(PendingResponse::new)
    }

    fn set_active(&self) {
        self.state.send_replace(SessionState::Active);
    }

    fn current(&self) -> SessionState {
        *self.state.borrow()
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

/// Publishes `Closed` however the loop ends, a panicking tool handler
/// included.
impl Drop for ReadLoop {
    fn drop(&mut self) {
        if let Some(partial) = self.pending.take() {
            info!(chars = partial.text.len(), chunks = partial.audio.chunks(), "Discarding partial response");
        }
        self.state.send_replace(SessionState::Closed);
        self.emit(SessionEvent::Closed);
    }
}
