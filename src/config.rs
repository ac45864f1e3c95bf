//! Runtime configuration.
//!
//! Grounded in `examples/Rapheal7-My-Agent/src/config.rs`'s TOML-file +
//! serde-default layering, narrowed to what this service's components
//! actually consume: the HTTP/WS bind address, TLS material, the STT/LLM
//! upstream addresses, the voice catalog, auth settings, and the user-record
//! directory (spec.md §6 "Persisted state").

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::server::auth::AuthConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub stt: SttConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub tts: TtsConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub voices: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default)]
    pub tls_cert: Option<PathBuf>,
    #[serde(default)]
    pub tls_key: Option<PathBuf>,
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

fn default_bind() -> String {
    "0.0.0.0:8443".to_string()
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            tls_cert: None,
            tls_key: None,
            cors_origins: default_cors_origins(),
        }
    }
}

/// How the STT service's address is obtained (spec.md §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttConfig {
    #[serde(default = "default_stt_url")]
    pub url: String,
    #[serde(default = "default_max_trials")]
    pub max_trials: usize,
    #[serde(default = "default_start_up_timeout_ms")]
    pub start_up_timeout_ms: u64,
}

fn default_stt_url() -> String {
    "ws://stt.internal:8090".to_string()
}

fn default_max_trials() -> usize {
    3
}

fn default_start_up_timeout_ms() -> u64 {
    500
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            url: default_stt_url(),
            max_trials: default_max_trials(),
            start_up_timeout_ms: default_start_up_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_url")]
    pub url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_max_trials")]
    pub max_trials: usize,
    #[serde(default = "default_start_up_timeout_ms")]
    pub start_up_timeout_ms: u64,
}

fn default_llm_url() -> String {
    "http://llm.internal:9000".to_string()
}

fn default_llm_model() -> String {
    "unmute-suggestion-model".to_string()
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            url: default_llm_url(),
            api_key: String::new(),
            model: default_llm_model(),
            max_trials: default_max_trials(),
            start_up_timeout_ms: default_start_up_timeout_ms(),
        }
    }
}

/// TTS is an external collaborator specified only at its HTTP boundary
/// (spec.md §1 Non-goals): this service proxies to it, it doesn't implement it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    #[serde(default = "default_tts_url")]
    pub url: String,
}

fn default_tts_url() -> String {
    "http://tts.internal:9100".to_string()
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self { url: default_tts_url() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_users_dir")]
    pub users_dir: PathBuf,
}

fn default_users_dir() -> PathBuf {
    directories::ProjectDirs::from("com", "unmute", "unmute-backend")
        .map(|dirs| dirs.data_dir().join("users"))
        .unwrap_or_else(|| PathBuf::from("./users"))
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { users_dir: default_users_dir() }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            stt: SttConfig::default(),
            llm: LlmConfig::default(),
            tts: TtsConfig::default(),
            auth: AuthConfig::default(),
            storage: StorageConfig::default(),
            voices: vec!["ember".to_string(), "marin".to_string(), "cove".to_string()],
        }
    }
}

impl Config {
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file at {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing config file at {}", path.display()))
    }

    pub fn load_or_default(path: &std::path::Path) -> Self {
        if path.exists() {
            match Self::load(path) {
                Ok(config) => return config,
                Err(e) => tracing::warn!(error = %e, "failed to load config, using defaults"),
            }
        }
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_a_non_empty_voice_catalog() {
        assert!(!Config::default().voices.is_empty());
    }

    #[test]
    fn toml_round_trips_through_defaults() {
        let rendered = toml::to_string(&Config::default()).unwrap();
        let parsed: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.stt.max_trials, Config::default().stt.max_trials);
    }
}
