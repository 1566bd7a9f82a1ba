//! Configuration loading, validation, and management for Cortex.
//!
//! Loads configuration from `~/.cortex/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use cortex_core::{ServerConfig, TransportKind};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The root configuration structure.
///
/// Maps directly to `~/.cortex/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Strategy loop settings
    #[serde(default)]
    pub agent: AgentConfig,

    /// Which planner drives PLAN/EVALUATE
    #[serde(default)]
    pub planner: PlannerConfig,

    /// Where session records are kept
    #[serde(default)]
    pub session: SessionConfig,

    /// Inbound event stream
    #[serde(default)]
    pub stimulus: StimulusConfig,

    /// Where final answers go
    #[serde(default)]
    pub sink: SinkConfig,

    /// Tool backends
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<ServerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Upper bound on PLAN → ACT → EVALUATE rounds per turn
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Per tool call timeout
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    /// How many earlier turns PERCEIVE includes as context
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
}

fn default_max_iterations() -> u32 {
    5
}
fn default_call_timeout_secs() -> u64 {
    30
}
fn default_history_turns() -> usize {
    3
}

impl AgentConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            call_timeout_secs: default_call_timeout_secs(),
            history_turns: default_history_turns(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlannerKind {
    /// Slash commands only, no model
    Command,
    /// OpenAI-compatible chat completions
    #[default]
    Llm,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    #[serde(default)]
    pub kind: PlannerKind,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".into()
}
fn default_model() -> String {
    "openai/gpt-4o-mini".into()
}
fn default_temperature() -> f32 {
    0.2
}
fn default_max_tokens() -> u32 {
    1024
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            kind: PlannerKind::default(),
            base_url: default_base_url(),
            model: default_model(),
            api_key: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for PlannerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlannerConfig")
            .field("kind", &self.kind)
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &redact(&self.api_key))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionBackend {
    #[default]
    File,
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub backend: SessionBackend,

    /// Directory (file) or database path (sqlite). Defaults under the
    /// config directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl SessionConfig {
    pub fn resolved_path(&self) -> PathBuf {
        if let Some(path) = &self.path {
            return path.clone();
        }
        match self.backend {
            SessionBackend::Sqlite => AppConfig::config_dir().join("sessions.db"),
            SessionBackend::File | SessionBackend::Memory => {
                AppConfig::config_dir().join("sessions")
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StimulusConfig {
    /// SSE endpoint of the chat bridge, e.g. `http://localhost:8000/events`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Session used when an event names neither a session nor a chat
    #[serde(default = "default_session")]
    pub default_session: String,

    /// Cap for the reconnect backoff
    #[serde(default = "default_reconnect_max_secs")]
    pub reconnect_max_secs: u64,
}

fn default_session() -> String {
    "default".into()
}
fn default_reconnect_max_secs() -> u64 {
    30
}

impl Default for StimulusConfig {
    fn default() -> Self {
        Self {
            url: None,
            default_session: default_session(),
            reconnect_max_secs: default_reconnect_max_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    #[default]
    Log,
    Http,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SinkConfig {
    #[serde(default)]
    pub kind: SinkKind,

    /// Reply endpoint (http)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl AppConfig {
    /// Load configuration from the default path (~/.cortex/config.toml),
    /// or from `CORTEX_CONFIG` when set.
    ///
    /// Also checks environment variables:
    /// - `CORTEX_API_KEY` (highest priority), `OPENAI_API_KEY`, `OPENROUTER_API_KEY`
    /// - `CORTEX_MODEL`
    /// - `CORTEX_STIMULUS_URL`
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_at(&Self::config_path())
    }

    /// Like [`load`](Self::load) but reads `path` instead of the default
    /// location. Environment overrides still apply.
    pub fn load_at(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_from(path)?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// `CORTEX_CONFIG`, else `~/.cortex/config.toml`.
    pub fn config_path() -> PathBuf {
        std::env::var("CORTEX_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Self::config_dir().join("config.toml"))
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Environment overrides, looked up through `var`.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if self.planner.api_key.is_none() {
            self.planner.api_key = var("CORTEX_API_KEY")
                .or_else(|| var("OPENAI_API_KEY"))
                .or_else(|| var("OPENROUTER_API_KEY"));
        }

        if let Some(model) = var("CORTEX_MODEL") {
            self.planner.model = model;
        }

        if let Some(url) = var("CORTEX_STIMULUS_URL") {
            self.stimulus.url = Some(url);
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".cortex")
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.max_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_iterations must be at least 1".into(),
            ));
        }

        if self.agent.call_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "agent.call_timeout_secs must be at least 1".into(),
            ));
        }

        if !(0.0..=2.0).contains(&self.planner.temperature) {
            return Err(ConfigError::ValidationError(
                "planner.temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.sink.kind == SinkKind::Http && self.sink.url.is_none() {
            return Err(ConfigError::ValidationError(
                "sink.kind = \"http\" requires sink.url".into(),
            ));
        }

        let mut seen = HashSet::new();
        for server in &self.servers {
            if server.id.trim().is_empty() {
                return Err(ConfigError::ValidationError("server id must not be empty".into()));
            }
            if !seen.insert(server.id.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate server id '{}'",
                    server.id
                )));
            }
            validate_server(server)?;
        }

        Ok(())
    }

    /// Check if a planner API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.planner.api_key.is_some()
    }

    /// Look up a configured server by id.
    pub fn server(&self, id: &str) -> Option<&ServerConfig> {
        self.servers.iter().find(|s| s.id == id)
    }

    /// Generate a default config TOML string (for the `init` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        let mut out = toml::to_string_pretty(&config).unwrap_or_default();
        out.push_str(SAMPLE_SERVERS);
        out
    }
}

const SAMPLE_SERVERS: &str = r#"
# Tool backends. Each server is reached over one transport.
#
# [[servers]]
# id = "math"
# transport = "stdio"
# command = "python"
# args = ["mcp_server_math.py"]
#
# [[servers]]
# id = "documents"
# transport = "sse"
# url = "http://localhost:8100/sse"
#
# [[servers]]
# id = "gmail"
# transport = "http"
# url = "http://localhost:8200"
# [[servers.tools]]
# name = "send_email"
# endpoint = "/send_email"
# method = "POST"
# description = "Send an email"
"#;

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    let missing = |field: &str| {
        ConfigError::ValidationError(format!(
            "server '{}' ({} transport) requires '{}'",
            server.id, server.transport, field
        ))
    };
    match server.transport {
        TransportKind::Stdio => {
            if server.command.as_deref().is_none_or(|c| c.trim().is_empty()) {
                return Err(missing("command"));
            }
        }
        TransportKind::Sse => {
            if server.url.is_none() {
                return Err(missing("url"));
            }
        }
        TransportKind::Http => {
            if server.url.is_none() {
                return Err(missing("url"));
            }
            if server.tools.is_empty() {
                return Err(missing("tools"));
            }
        }
    }
    Ok(())
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for cortex_core::Error {
    fn from(err: ConfigError) -> Self {
        cortex_core::Error::Config {
            message: err.to_string(),
        }
    }
}
