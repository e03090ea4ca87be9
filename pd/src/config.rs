//! PlanDaemon configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::scheduler::SchedulerConfig;

/// Main PlanDaemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Plan store location
    pub store: StoreConfig,

    /// Execution scheduler settings
    pub scheduler: SchedulerConfig,

    /// Decomposition engine defaults
    pub decomposer: DecomposerConfig,

    /// Background job manager settings
    pub jobs: JobsConfig,

    /// LLM provider configuration
    pub llm: LlmConfig,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,
}

impl Config {
    /// Validate configuration before talking to the LLM
    ///
    /// Only commands that generate need this; store-only commands skip it.
    pub fn validate(&self) -> Result<()> {
        if std::env::var(&self.llm.api_key_env).is_err() {
            return Err(eyre::eyre!(
                "LLM API key not found. Set the {} environment variable.",
                self.llm.api_key_env
            ));
        }
        Ok(())
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Project-local config: .plandaemon.yml
        let local_config = PathBuf::from(".plandaemon.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // User config: ~/.config/plandaemon/plandaemon.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("plandaemon").join("plandaemon.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Log level from the config chain, read before logging is initialised
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        Self::load(config_path).ok().and_then(|c| c.log_level)
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Plan store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding registry.sqlite and plans/
    #[serde(rename = "root-dir")]
    pub root_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        // XDG data directory (~/.local/share/plandaemon on Linux)
        let root_dir = dirs::data_dir()
            .map(|d| d.join("plandaemon"))
            .unwrap_or_else(|| PathBuf::from(".plandaemon"));
        Self { root_dir }
    }
}

/// Decomposition engine defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecomposerConfig {
    /// Maximum relative depth to expand
    #[serde(rename = "max-depth")]
    pub max_depth: u32,

    /// Maximum number of new tasks per run
    #[serde(rename = "node-budget")]
    pub node_budget: usize,

    /// Children kept per expanded node
    #[serde(rename = "max-children")]
    pub max_children: usize,

    /// Stop the whole run when a node yields no children
    #[serde(rename = "stop-on-empty")]
    pub stop_on_empty: bool,

    /// Expand nodes that already have children
    #[serde(rename = "allow-existing-children")]
    pub allow_existing_children: bool,
}

impl Default for DecomposerConfig {
    fn default() -> Self {
        Self {
            max_depth: 2,
            node_budget: 50,
            max_children: 6,
            stop_on_empty: false,
            allow_existing_children: false,
        }
    }
}

/// Job manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// In-memory log lines kept per job
    #[serde(rename = "log-capacity")]
    pub log_capacity: usize,

    /// Seconds a finished job stays in memory
    #[serde(rename = "ttl-secs")]
    pub ttl_secs: u64,

    /// Seconds of silence before a subscriber gets a heartbeat
    #[serde(rename = "heartbeat-secs")]
    pub heartbeat_secs: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            log_capacity: 500,
            ttl_secs: 3600,
            heartbeat_secs: 15,
        }
    }
}

impl JobsConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

/// LLM provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Model identifier
    pub model: String,

    /// Environment variable containing the API key
    #[serde(rename = "api-key-env")]
    pub api_key_env: String,

    /// API base URL (OpenAI-compatible)
    #[serde(rename = "base-url")]
    pub base_url: String,

    /// Maximum tokens per response
    #[serde(rename = "max-tokens")]
    pub max_tokens: u32,

    /// Request timeout in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,

    /// Sampling temperature
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            base_url: "https://api.openai.com".to_string(),
            max_tokens: 4096,
            timeout_ms: 120_000,
            temperature: 0.2,
        }
    }
}

impl LlmConfig {
    /// Read the API key from the configured environment variable
    pub fn get_api_key(&self) -> Result<String> {
        std::env::var(&self.api_key_env).context(format!("{} is not set", self.api_key_env))
    }
}
