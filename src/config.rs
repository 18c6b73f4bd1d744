//! Configuration management
//!
//! Layered configuration: a TOML file (`callbridge.toml` or the path in
//! `CALLBRIDGE_CONFIG`) with environment overrides for credentials.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server settings
    #[serde(default)]
    pub server: ServerConfig,
    /// Realtime model endpoint settings
    #[serde(default)]
    pub realtime: RealtimeConfig,
    /// Telephony provider settings
    #[serde(default)]
    pub telephony: TelephonyConfig,
    /// Object storage settings
    #[serde(default)]
    pub storage: StorageConfig,
    /// Call store settings
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Per-call behavior
    #[serde(default)]
    pub calls: CallsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Externally reachable host used in media-stream and callback URLs.
    #[serde(default = "default_public_host")]
    pub public_host: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_public_host() -> String {
    "localhost:8080".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_host: default_public_host(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Realtime websocket endpoint.
    #[serde(default = "default_realtime_url")]
    pub url: String,
    /// Realtime model identifier.
    #[serde(default = "default_realtime_model")]
    pub model: String,
    /// Bearer token; the `OPENAI_API_KEY` environment variable overrides.
    #[serde(default)]
    pub api_key: String,
    /// Synthesis voice identity.
    #[serde(default = "default_voice")]
    pub voice: String,
    /// Transcription sub-model for user audio.
    #[serde(default = "default_transcription_model")]
    pub transcription_model: String,
    /// Chat-completions base URL for the knowledge-base lookup.
    #[serde(default = "default_chat_url")]
    pub chat_url: String,
    /// Chat model for the knowledge-base lookup.
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
}

fn default_realtime_url() -> String {
    "wss://api.openai.com/v1/realtime".to_string()
}

fn default_realtime_model() -> String {
    "gpt-4o-realtime-preview".to_string()
}

fn default_voice() -> String {
    "shimmer".to_string()
}

fn default_transcription_model() -> String {
    "whisper-1".to_string()
}

fn default_chat_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_chat_model() -> String {
    "gpt-4o".to_string()
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            url: default_realtime_url(),
            model: default_realtime_model(),
            api_key: String::new(),
            voice: default_voice(),
            transcription_model: default_transcription_model(),
            chat_url: default_chat_url(),
            chat_model: default_chat_model(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelephonyConfig {
    #[serde(default = "default_telephony_url")]
    pub base_url: String,
    #[serde(default)]
    pub account_sid: String,
    /// Auth token; `TELEPHONY_AUTH_TOKEN` overrides.
    #[serde(default)]
    pub auth_token: String,
    /// Default sending number for outbound calls.
    #[serde(default)]
    pub from_number: String,
    /// Shared secret for status-webhook signature verification; unset
    /// disables verification.
    #[serde(default)]
    pub webhook_secret: Option<String>,
}

fn default_telephony_url() -> String {
    "https://api.twilio.com".to_string()
}

impl Default for TelephonyConfig {
    fn default() -> Self {
        Self {
            base_url: default_telephony_url(),
            account_sid: String::new(),
            auth_token: String::new(),
            from_number: String::new(),
            webhook_secret: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Object store base URL; paths are appended directly.
    #[serde(default)]
    pub base_url: String,
    /// Bearer token; `STORAGE_TOKEN` overrides.
    #[serde(default)]
    pub token: Option<String>,
    /// Prefix for pre-recorded sounds.
    #[serde(default = "default_sounds_prefix")]
    pub sounds_prefix: String,
}

fn default_sounds_prefix() -> String {
    "sounds".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            token: None,
            sounds_prefix: default_sounds_prefix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("callbridge.db")
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallsConfig {
    /// Directory for in-flight session logs.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// How long to wait for the human before the assistant speaks first
    /// (inbound and browser calls).
    #[serde(default = "default_kickoff_ms")]
    pub start_speaking_buffer_ms: u64,
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_kickoff_ms() -> u64 {
    500
}

impl Default for CallsConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            start_speaking_buffer_ms: default_kickoff_ms(),
        }
    }
}

impl Config {
    /// Load configuration from disk, falling back to defaults, then apply
    /// environment overrides for credentials.
    pub fn load() -> Result<Self> {
        let path = std::env::var("CALLBRIDGE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("callbridge.toml"));

        let mut config: Config = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            toml::from_str(&raw)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?
        } else {
            Config::default()
        };

        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            config.realtime.api_key = key;
        }
        if let Ok(sid) = std::env::var("TELEPHONY_ACCOUNT_SID") {
            config.telephony.account_sid = sid;
        }
        if let Ok(token) = std::env::var("TELEPHONY_AUTH_TOKEN") {
            config.telephony.auth_token = token;
        }
        if let Ok(token) = std::env::var("STORAGE_TOKEN") {
            config.storage.token = Some(token);
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.realtime.voice, "shimmer");
        assert_eq!(config.calls.start_speaking_buffer_ms, 500);
    }

    #[test]
    fn test_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [server]
            port = 9000

            [realtime]
            model = "gpt-4o-realtime"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.realtime.model, "gpt-4o-realtime");
        assert_eq!(config.realtime.transcription_model, "whisper-1");
    }
}
