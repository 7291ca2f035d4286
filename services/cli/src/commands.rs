//! The `chat`, `voice` and `tools` commands.

use crate::config::Config;
use anyhow::Context;
use async_openai::config::OpenAIConfig;
use chrono::{DateTime, Local, TimeZone};
use parley_audio::{AudioCapture, AudioChunk, BufferedSource, WavSink};
use parley_core::openai::OpenAIAssistants;
use parley_core::{AssistantConfig, ConversationHistory, ConversationThread, Session, ToolRegistry};
use parley_realtime::{
    RealtimeError, SessionEvent, SessionHandle, SessionState, StreamingSession, WsConnector,
};
use secrecy::ExposeSecret;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{error, info, warn};

const DEFAULT_INSTRUCTIONS: &str = "You are a helpful assistant with access to the user's calendar. \
Use the calendar tools to look up, create and delete events when asked.";

/// Interleaved samples per captured frame.
const CAPTURE_FRAME: usize = 2048;
const MAX_RECONNECTS: usize = 3;

/// `Current date: 2026-10-16, Day: Friday, Time: 14:03:00`. Relative dates
/// in a request are resolved against this.
pub fn date_context<Tz: TimeZone>(now: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!(
        "Current date: {}, Day: {}, Time: {}",
        now.format("%Y-%m-%d"),
        now.format("%A"),
        now.format("%H:%M:%S")
    )
}

/// Prefixes a typed chat turn with the date context.
pub fn with_date_context<Tz: TimeZone>(now: &DateTime<Tz>, user_text: &str) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("{}\n\nUser message: {}", date_context(now), user_text)
}

pub fn openai_config(config: &Config) -> OpenAIConfig {
    OpenAIConfig::new()
        .with_api_key(config.openai_api_key.expose_secret())
        .with_api_base(&config.openai_api_base)
}

/// Prints the tool-schema table as JSON.
pub fn tools(registry: &ToolRegistry) -> anyhow::Result<()> {
    let schemas = serde_json::to_string_pretty(&registry.schemas())?;
    println!("{}", schemas);
    Ok(())
}

/// Poll-mode REPL: one turn per stdin line until EOF or `exit`.
pub async fn chat(
    config: &Config,
    registry: Arc<ToolRegistry>,
    thread_id: Option<String>,
) -> anyhow::Result<()> {
    let backend = Arc::new(OpenAIAssistants::new(openai_config(config)));

    let assistant = match &config.assistant_id {
        Some(id) => AssistantConfig {
            assistant_id: id.clone(),
            instructions: config.assistant_instructions.clone(),
        },
        None => {
            let instructions = config
                .assistant_instructions
                .as_deref()
                .unwrap_or(DEFAULT_INSTRUCTIONS);
            backend
                .create_assistant(&config.assistant_model, instructions, &registry.schemas())
                .await
                .context("Failed to create assistant")?
        }
    };
    info!(assistant_id = %assistant.assistant_id, "Using assistant");

    let session = Session::new(backend, assistant, registry, config.poll_policy());
    let thread = match thread_id {
        Some(id) => ConversationThread::resume(id),
        None => session
            .create_thread()
            .await
            .context("Failed to create thread")?,
    };
    println!("Thread {} (type 'exit' to quit)", thread.id());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if matches!(line, "exit" | "quit") {
            break;
        }
        if line.is_empty() {
            continue;
        }
        let turn = with_date_context(&Local::now(), line);
        match session.submit_turn(&thread, &turn).await {
            Ok(reply) => println!("{}", reply),
            Err(e) => {
                error!(error = %e, "Turn failed");
                println!("{}", e.user_message());
            }
        }
    }
    info!(thread_id = %thread.id(), messages = thread.history().len(), "Chat ended");
    Ok(())
}

enum TurnOutcome {
    Replied,
    Failed(String),
    Disconnected,
}

/// Duplex mode: one spoken turn per WAV file over a single session,
/// re-establishing (and replaying history) when the transport drops.
pub async fn voice(
    config: &Config,
    registry: Arc<ToolRegistry>,
    inputs: &[PathBuf],
    output_dir: &Path,
) -> anyhow::Result<()> {
    let connector = Arc::new(WsConnector::new(
        config.realtime_url.clone(),
        config.realtime_model.clone(),
        config.openai_api_key.clone(),
    ));
    let mut streaming_config = config.streaming_config();
    let instructions = streaming_config
        .session
        .instructions
        .take()
        .unwrap_or_else(|| DEFAULT_INSTRUCTIONS.to_string());
    streaming_config.session.instructions =
        Some(format!("{}\n\n{}", instructions, date_context(&Local::now())));
    let streaming = StreamingSession::new(
        connector,
        streaming_config,
        registry,
        ConversationHistory::new(),
    );

    let mut connections = 0usize;
    let mut live: Option<(SessionHandle, UnboundedReceiver<SessionEvent>)> = None;

    for input in inputs {
        let chunks = capture_file(input)
            .await
            .with_context(|| format!("Failed to capture {}", input.display()))?;

        let mut attempts = 0;
        loop {
            if live
                .as_ref()
                .is_some_and(|(handle, _)| handle.state() == SessionState::Closed)
            {
                info!("Realtime session closed between turns");
                live = None;
            }
            if live.is_none() {
                connections += 1;
                let sink = WavSink::new(output_dir, format!("session{}", connections))?;
                live = Some(
                    streaming
                        .establish(Box::new(sink))
                        .await
                        .context("Failed to establish realtime session")?,
                );
            }
            let Some((handle, events)) = live.as_mut() else {
                continue;
            };

            match spoken_turn(handle, events, &chunks).await {
                Ok(TurnOutcome::Replied) => break,
                Ok(TurnOutcome::Failed(reason)) => {
                    warn!(input = %input.display(), %reason, "Turn failed");
                    println!("{}", parley_core::FALLBACK_REPLY);
                    break;
                }
                Ok(TurnOutcome::Disconnected) => {}
                Err(e) if e.is_transport() => warn!(error = %e, "Transport failed mid-turn"),
                Err(RealtimeError::InvalidState {
                    state: SessionState::Closed,
                    ..
                }) => warn!("Session closed mid-turn"),
                Err(e) => {
                    error!(error = %e, "Turn rejected");
                    println!("{}", e.user_message());
                    break;
                }
            }

            if let Some((handle, _)) = live.take() {
                handle.close().await;
            }
            attempts += 1;
            if attempts > MAX_RECONNECTS {
                anyhow::bail!("Realtime session dropped {} times; giving up", attempts);
            }
            info!(attempts, "Re-establishing realtime session");
        }
    }

    if let Some((handle, _)) = live {
        handle.close().await;
    }
    info!(
        messages = streaming.history().len(),
        connections, "Voice session ended"
    );
    Ok(())
}

async fn capture_file(path: &Path) -> anyhow::Result<Vec<AudioChunk>> {
    let mut capture = AudioCapture::new(BufferedSource::from_wav(path, CAPTURE_FRAME)?);
    capture.start()?;
    while !capture.is_finished() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    Ok(capture.stop_and_drain()?)
}

async fn spoken_turn(
    handle: &SessionHandle,
    events: &mut UnboundedReceiver<SessionEvent>,
    chunks: &[AudioChunk],
) -> Result<TurnOutcome, RealtimeError> {
    let encoded = handle.send_audio(chunks).await?;
    info!(
        chunks = encoded.chunks.len(),
        duration_ms = encoded.duration().as_millis() as u64,
        "Sent spoken turn"
    );
    handle.commit_turn().await?;

    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::UserTranscript(text) => println!("You: {}", text.trim()),
            SessionEvent::TranscriptDelta(delta) => {
                print!("{}", delta);
                let _ = std::io::stdout().flush();
            }
            SessionEvent::ToolInvoked { call_id, name } => {
                info!(%call_id, tool = %name, "Assistant called a tool");
            }
            SessionEvent::ResponseComplete { audio, .. } => {
                println!();
                info!(audio_ms = audio.as_millis() as u64, "Response complete");
                return Ok(TurnOutcome::Replied);
            }
            SessionEvent::Error(reason) => return Ok(TurnOutcome::Failed(reason)),
            SessionEvent::Closed => return Ok(TurnOutcome::Disconnected),
        }
    }
    Ok(TurnOutcome::Disconnected)
}
