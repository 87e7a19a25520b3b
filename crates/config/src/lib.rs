//! Configuration loading, validation, and management for Agentry.
//!
//! Loads configuration from `~/.agentry/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.agentry/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key (can be overridden per-provider)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Default LLM provider
    #[serde(default = "default_provider")]
    pub default_provider: String,

    /// Default model
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Default temperature
    #[serde(default = "default_temperature")]
    pub default_temperature: f32,

    /// Engine behaviour
    #[serde(default)]
    pub engine: EngineConfig,

    /// Persistence backend
    #[serde(default)]
    pub store: StoreConfig,

    /// Gateway configuration
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Upstream services used by the built-in tools
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Provider-specific configurations
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    /// Token budgets keyed by "provider/model"
    #[serde(default)]
    pub models: HashMap<String, ModelConfig>,

    /// Per-persona settings keyed by agent name ("chat", "suggest", ...)
    #[serde(default)]
    pub agents: HashMap<String, AgentProfileConfig>,
}

fn default_provider() -> String {
    "openai".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_temperature() -> f32 {
    0.7
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("default_provider", &self.default_provider)
            .field("default_model", &self.default_model)
            .field("default_temperature", &self.default_temperature)
            .field("engine", &self.engine)
            .field("store", &self.store)
            .field("gateway", &self.gateway)
            .field("tools", &self.tools)
            .field("providers", &self.providers)
            .field("models", &self.models)
            .field("agents", &self.agents)
            .finish()
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &redact(&self.api_key))
            .field("api_url", &self.api_url)
            .finish()
    }
}

impl std::fmt::Debug for ToolsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolsConfig")
            .field("project_api_url", &self.project_api_url)
            .field("knowledge_api_url", &self.knowledge_api_url)
            .field("search_api_url", &self.search_api_url)
            .field("api_token", &redact(&self.api_token))
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

/// Whether an oversized prompt is rejected before dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenLimitMode {
    /// Fail the turn with a prompt-too-large error
    #[default]
    Enforce,
    /// Log a warning and send anyway
    Advisory,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub token_limit: TokenLimitMode,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Memory,
    #[default]
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// SQLite database file; defaults to `~/.agentry/agentry.db`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: None,
        }
    }
}

impl StoreConfig {
    pub fn database_path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| AppConfig::config_dir().join("agentry.db"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,

    /// Stop a streaming turn that produced no message chunk within this many seconds (0 = off)
    #[serde(default = "default_first_token_timeout")]
    pub first_token_timeout_secs: u64,
}

fn default_port() -> u16 {
    42618
}
fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_first_token_timeout() -> u64 {
    60
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            first_token_timeout_secs: default_first_token_timeout(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Base URL of the project catalog API
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_api_url: Option<String>,

    /// Base URL of the knowledge retrieval API
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub knowledge_api_url: Option<String>,

    /// Base URL of the web search API
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_api_url: Option<String>,

    /// Bearer token sent to all tool upstreams
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,

    #[serde(default = "default_tool_timeout")]
    pub timeout_secs: u64,
}

fn default_tool_timeout() -> u64 {
    30
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            project_api_url: None,
            knowledge_api_url: None,
            search_api_url: None,
            api_token: None,
            timeout_secs: default_tool_timeout(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
}

/// Context window, reserved output budget and tokenizer of one model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_context_window")]
    pub context_window: usize,

    #[serde(default = "default_output_tokens")]
    pub output_tokens: usize,

    /// BPE encoding used to count prompt tokens, e.g. `cl100k_base` or `o200k_base`.
    #[serde(default = "default_token_encoding")]
    pub token_encoding: String,
}

fn default_context_window() -> usize {
    128_000
}
fn default_output_tokens() -> usize {
    4096
}
fn default_token_encoding() -> String {
    "cl100k_base".into()
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            context_window: default_context_window(),
            output_tokens: default_output_tokens(),
            token_encoding: default_token_encoding(),
        }
    }
}

/// Settings of one agent persona.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentProfileConfig {
    /// Round on which the model must give its final answer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_round: Option<u32>,

    /// "provider/model" used by this persona
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl AppConfig {
    /// Load configuration from the default path (~/.agentry/config.toml).
    ///
    /// Also checks environment variables for API keys:
    /// - `AGENTRY_API_KEY` (highest priority)
    /// - `OPENAI_API_KEY`
    pub fn load() -> Result<Self, ConfigError> {
        let config_dir = Self::config_dir();
        let config_path = config_dir.join("config.toml");
        let mut config = Self::load_from(&config_path)?;

        if config.api_key.is_none() {
            config.api_key = std::env::var("AGENTRY_API_KEY")
                .ok()
                .or_else(|| std::env::var("OPENAI_API_KEY").ok());
        }

        if let Ok(provider) = std::env::var("AGENTRY_PROVIDER") {
            config.default_provider = provider;
        }

        if let Ok(model) = std::env::var("AGENTRY_MODEL") {
            config.default_model = model;
        }

        config.validate()?;
        Ok(config)
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

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".agentry")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_temperature < 0.0 || self.default_temperature > 2.0 {
            return Err(ConfigError::ValidationError(
                "default_temperature must be between 0.0 and 2.0".into(),
            ));
        }

        for (name, model) in &self.models {
            if model.output_tokens >= model.context_window {
                return Err(ConfigError::ValidationError(format!(
                    "models.\"{name}\": output_tokens must be smaller than context_window"
                )));
            }
        }

        for (name, agent) in &self.agents {
            if agent.max_round == Some(0) {
                return Err(ConfigError::ValidationError(format!(
                    "agents.{name}: max_round must be at least 1"
                )));
            }
            if let Some(t) = agent.temperature
                && !(0.0..=2.0).contains(&t)
            {
                return Err(ConfigError::ValidationError(format!(
                    "agents.{name}: temperature must be between 0.0 and 2.0"
                )));
            }
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
            || self.providers.values().any(|p| p.api_key.is_some())
    }

    /// The "provider/model" a persona runs on when nothing else is requested.
    pub fn model_for(&self, agent: &str) -> String {
        self.agents
            .get(agent)
            .and_then(|a| a.model.clone())
            .unwrap_or_else(|| format!("{}/{}", self.default_provider, self.default_model))
    }

    /// Token budget of a "provider/model"; unknown models get the defaults.
    pub fn model_limits(&self, model: &str) -> ModelConfig {
        self.models.get(model).cloned().unwrap_or_default()
    }

    /// Generate a default config TOML string (for the `init` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            default_provider: default_provider(),
            default_model: default_model(),
            default_temperature: default_temperature(),
            engine: EngineConfig::default(),
            store: StoreConfig::default(),
            gateway: GatewayConfig::default(),
            tools: ToolsConfig::default(),
            providers: HashMap::new(),
            models: HashMap::new(),
            agents: HashMap::new(),
        }
    }
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
