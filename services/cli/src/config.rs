use parley_core::PollPolicy;
use parley_realtime::{SessionConfig, StreamingConfig, TurnDetection};
use parley_realtime::protocol::TranscriptionConfig;
use secrecy::SecretString;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub openai_api_key: SecretString,
    pub openai_api_base: String,
    /// When absent, `chat` registers a fresh assistant.
    pub assistant_id: Option<String>,
    pub assistant_model: String,
    pub assistant_instructions: Option<String>,
    pub realtime_url: String,
    pub realtime_model: String,
    pub realtime_voice: String,
    pub transcription_model: String,
    pub vad_threshold: f32,
    pub vad_prefix_padding_ms: u32,
    pub vad_silence_duration_ms: u32,
    pub poll_initial_backoff: Duration,
    pub poll_max_backoff: Duration,
    pub turn_timeout: Duration,
    pub handshake_timeout: Duration,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let openai_api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty())
            .map(SecretString::from)
            .ok_or_else(|| ConfigError::MissingVar("OPENAI_API_KEY".to_string()))?;

        let openai_api_base = var_or("OPENAI_API_BASE", "https://api.openai.com/v1");
        let assistant_id = optional_var("ASSISTANT_ID");
        let assistant_model = var_or("ASSISTANT_MODEL", "gpt-4o");
        let assistant_instructions = optional_var("ASSISTANT_INSTRUCTIONS");

        let realtime_url = var_or("REALTIME_URL", "wss://api.openai.com/v1/realtime");
        let realtime_model = var_or("REALTIME_MODEL", "gpt-4o-realtime-preview-2024-10-01");
        let realtime_voice = var_or("REALTIME_VOICE", "alloy");
        let transcription_model = var_or("TRANSCRIPTION_MODEL", "whisper-1");

        let vad_threshold: f32 = parse_var("VAD_THRESHOLD", 0.5)?;
        if !(0.0..=1.0).contains(&vad_threshold) {
            return Err(ConfigError::InvalidValue(
                "VAD_THRESHOLD".to_string(),
                format!("{} is outside 0.0..=1.0", vad_threshold),
            ));
        }
        let vad_prefix_padding_ms = parse_var("VAD_PREFIX_PADDING_MS", 300)?;
        let vad_silence_duration_ms = parse_var("VAD_SILENCE_DURATION_MS", 500)?;

        let poll_initial_backoff = Duration::from_millis(parse_var("POLL_INITIAL_BACKOFF_MS", 250)?);
        let poll_max_backoff = Duration::from_millis(parse_var("POLL_MAX_BACKOFF_MS", 2000)?);
        if poll_initial_backoff.is_zero() || poll_max_backoff < poll_initial_backoff {
            return Err(ConfigError::InvalidValue(
                "POLL_MAX_BACKOFF_MS".to_string(),
                format!(
                    "backoff must satisfy 0 < initial ({:?}) <= max ({:?})",
                    poll_initial_backoff, poll_max_backoff
                ),
            ));
        }
        let turn_timeout = Duration::from_secs(parse_var("TURN_TIMEOUT_SECS", 120)?);
        let handshake_timeout = Duration::from_secs(parse_var("HANDSHAKE_TIMEOUT_SECS", 15)?);

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            openai_api_key,
            openai_api_base,
            assistant_id,
            assistant_model,
            assistant_instructions,
            realtime_url,
            realtime_model,
            realtime_voice,
            transcription_model,
            vad_threshold,
            vad_prefix_padding_ms,
            vad_silence_duration_ms,
            poll_initial_backoff,
            poll_max_backoff,
            turn_timeout,
            handshake_timeout,
            log_level,
        })
    }

    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            initial_backoff: self.poll_initial_backoff,
            max_backoff: self.poll_max_backoff,
            timeout: self.turn_timeout,
        }
    }

    /// Duplex session settings; tools are attached when the session is built.
    pub fn streaming_config(&self) -> StreamingConfig {
        let session = SessionConfig {
            instructions: self.assistant_instructions.clone(),
            voice: self.realtime_voice.clone(),
            input_audio_transcription: Some(TranscriptionConfig {
                model: self.transcription_model.clone(),
            }),
            turn_detection: Some(TurnDetection::ServerVad {
                threshold: self.vad_threshold,
                prefix_padding_ms: self.vad_prefix_padding_ms,
                silence_duration_ms: self.vad_silence_duration_ms,
            }),
            ..SessionConfig::default()
        };
        StreamingConfig {
            session,
            handshake_timeout: self.handshake_timeout,
            ..StreamingConfig::default()
        }
    }
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn var_or(name: &str, default: &str) -> String {
    optional_var(name).unwrap_or_else(|| default.to_string())
}

fn parse_var<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional_var(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("'{}': {}", raw, e))),
    }
}
