use std::time::Duration;

use crate::errors::AppError;

const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
const DEFAULT_MODEL: &str = "llama3.2";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_RETENTION_SECS: u64 = 5;
const DEFAULT_STOP_GRACE_SECS: u64 = 10;
const DEFAULT_MAX_MESSAGE_LENGTH: usize = 8000;

/// Runtime configuration, read from the environment (after `.env`).
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Postgres URL. `None` runs the server on the in-memory message store.
    pub database_url: Option<String>,
    pub ollama_base_url: String,
    pub ollama_model: String,
    pub port: u16,
    pub streams: StreamSettings,
}

/// Knobs shared by the registry and the generation driver.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// How long a retired stream stays visible to late subscribers.
    pub retention: Duration,
    /// Upper bound between `stop` and the stream's terminal event.
    pub stop_grace: Duration,
    pub max_message_length: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(DEFAULT_RETENTION_SECS),
            stop_grace: Duration::from_secs(DEFAULT_STOP_GRACE_SECS),
            max_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup so parsing is testable
    /// without touching the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let streams = StreamSettings {
            retention: Duration::from_secs(parse_or(
                &lookup,
                "STREAM_RETENTION_SECS",
                DEFAULT_RETENTION_SECS,
            )?),
            stop_grace: Duration::from_secs(parse_or(
                &lookup,
                "STOP_GRACE_SECS",
                DEFAULT_STOP_GRACE_SECS,
            )?),
            max_message_length: parse_or(
                &lookup,
                "MAX_MESSAGE_LENGTH",
                DEFAULT_MAX_MESSAGE_LENGTH,
            )?,
        };

        Ok(Self {
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            ollama_base_url: lookup("OLLAMA_API_BASE_URL")
                .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string()),
            ollama_model: lookup("OLLAMA_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            port: parse_or(&lookup, "PORT", DEFAULT_PORT)?,
            streams,
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, AppError> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| AppError::InvalidConfig {
            key: key.to_string(),
            value: raw,
        }),
    }
}
