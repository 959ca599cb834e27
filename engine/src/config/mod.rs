//! Configuration management
//!
//! This module handles loading, validation, and management of the Quill configuration.
//! Configuration is stored in TOML format at ~/.quill/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: Log level, data directory
//! - **llm**: OpenAI-compatible model gateway settings
//! - **agent**: Iteration budgets, tool timeouts, retries and worker pool size
//! - **knowledge**: Local knowledge directory used by the retrieval tool
//!
//! Every section is optional; omitted keys take the defaults below.
//!
//! # Examples
//!
//! ```no_run
//! use quill_engine::config::Config;
//! use sdk::types::RunMode;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_create()?;
//!
//! println!("Database: {:?}", config.database_path());
//! println!("Budget: {}", config.agent.max_iterations_for(RunMode::FastDraft));
//! # Ok(())
//! # }
//! ```

use sdk::errors::EngineError;
use sdk::types::RunMode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Core engine settings
    #[serde(default)]
    pub core: CoreConfig,

    /// Model gateway settings
    #[serde(default)]
    pub llm: LLMConfig,

    /// Agent loop settings
    #[serde(default)]
    pub agent: AgentConfig,

    /// Knowledge retrieval settings
    #[serde(default)]
    pub knowledge: KnowledgeConfig,
}

/// Core engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Data directory path (supports ~ expansion)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// OpenAI-compatible gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMConfig {
    /// Base URL ending before `/chat/completions`
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_chat_model")]
    pub chat_model: String,

    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    /// Name of the environment variable holding the API key. The key itself
    /// never lives in the config file.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Agent loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Iteration budget for STANDARD runs
    #[serde(default = "default_max_iterations_standard")]
    pub max_iterations_standard: i64,

    /// Iteration budget for FAST_DRAFT runs
    #[serde(default = "default_max_iterations_fast_draft")]
    pub max_iterations_fast_draft: i64,

    /// Per-attempt tool timeout when the planner supplies none
    #[serde(default = "default_tool_timeout_ms")]
    pub tool_timeout_ms: u64,

    /// Floor applied to planner supplied timeouts
    #[serde(default = "default_min_tool_timeout_ms")]
    pub min_tool_timeout_ms: u64,

    /// Retries after the first failed attempt
    #[serde(default = "default_tool_max_retries")]
    pub tool_max_retries: u32,

    #[serde(default = "default_tool_retry_backoff_ms")]
    pub tool_retry_backoff_ms: u64,

    #[serde(default = "default_max_retry_backoff_ms")]
    pub max_retry_backoff_ms: u64,

    /// Bound on a single planning call
    #[serde(default = "default_planner_timeout_ms")]
    pub planner_timeout_ms: u64,

    /// Slack added to step and planner deadlines before restart recovery
    /// treats RUNNING work as abandoned
    #[serde(default = "default_reconcile_grace_ms")]
    pub reconcile_grace_ms: u64,

    /// Number of tasks that may run concurrently
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,

    /// Pick the next tool from document progress when the planner reply
    /// cannot be parsed, instead of failing the task
    #[serde(default)]
    pub fallback_on_unparseable_plan: bool,

    /// Observations kept in working memory
    #[serde(default = "default_observation_window")]
    pub observation_window: usize,

    /// Observations shown to the planner each iteration
    #[serde(default = "default_prompt_observations")]
    pub prompt_observations: usize,
}

impl AgentConfig {
    /// Resolve the iteration budget for a run mode
    pub fn max_iterations_for(&self, mode: RunMode) -> i64 {
        match mode {
            RunMode::Standard => self.max_iterations_standard,
            RunMode::FastDraft => self.max_iterations_fast_draft,
        }
    }
}

/// Knowledge retrieval configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeConfig {
    /// Directory of .md/.txt files (supports ~ expansion)
    #[serde(default)]
    pub dir: Option<PathBuf>,

    #[serde(default = "default_top_k")]
    pub top_k: usize,

    #[serde(default = "default_chunk_chars")]
    pub chunk_chars: usize,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.quill/data")
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_chat_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_api_key_env() -> String {
    "QUILL_API_KEY".to_string()
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_max_iterations_standard() -> i64 {
    14
}

fn default_max_iterations_fast_draft() -> i64 {
    10
}

fn default_tool_timeout_ms() -> u64 {
    90_000
}

fn default_min_tool_timeout_ms() -> u64 {
    5_000
}

fn default_tool_max_retries() -> u32 {
    1
}

fn default_tool_retry_backoff_ms() -> u64 {
    800
}

fn default_max_retry_backoff_ms() -> u64 {
    5_000
}

fn default_planner_timeout_ms() -> u64 {
    300_000
}

fn default_reconcile_grace_ms() -> u64 {
    30000
}

fn default_worker_pool_size() -> usize {
    2
}

fn default_observation_window() -> usize {
    30
}

fn default_prompt_observations() -> usize {
    6
}

fn default_top_k() -> usize {
    8
}

fn default_chunk_chars() -> usize {
    800
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            chat_model: default_chat_model(),
            embedding_model: default_embedding_model(),
            api_key_env: default_api_key_env(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations_standard: default_max_iterations_standard(),
            max_iterations_fast_draft: default_max_iterations_fast_draft(),
            tool_timeout_ms: default_tool_timeout_ms(),
            min_tool_timeout_ms: default_min_tool_timeout_ms(),
            tool_max_retries: default_tool_max_retries(),
            tool_retry_backoff_ms: default_tool_retry_backoff_ms(),
            max_retry_backoff_ms: default_max_retry_backoff_ms(),
            planner_timeout_ms: default_planner_timeout_ms(),
            reconcile_grace_ms: default_reconcile_grace_ms(),
            worker_pool_size: default_worker_pool_size(),
            fallback_on_unparseable_plan: false,
            observation_window: default_observation_window(),
            prompt_observations: default_prompt_observations(),
        }
    }
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            dir: None,
            top_k: default_top_k(),
            chunk_chars: default_chunk_chars(),
        }
    }
}

impl Config {
    /// Load configuration from the default location (~/.quill/config.toml)
    ///
    /// If the configuration file doesn't exist, creates a default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration file cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    pub fn load_or_create() -> Result<Self, EngineError> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Self::create_default(&config_path)
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, EngineError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration text
    pub fn from_toml_str(contents: &str) -> Result<Self, EngineError> {
        let mut config: Config = toml::from_str(contents)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate_and_process()?;

        Ok(config)
    }

    /// Create default configuration and save to path
    fn create_default(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        // Written before processing so ~ stays unexpanded on disk
        let toml_string = toml::to_string_pretty(&Self::default())
            .map_err(|e| EngineError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| EngineError::Config(format!("Failed to write config file: {}", e)))?;

        let mut config = Self::default();
        config.validate_and_process()?;

        Ok(config)
    }

    /// Get the default configuration file path (~/.quill/config.toml)
    fn default_config_path() -> Result<PathBuf, EngineError> {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".quill").join("config.toml"))
    }

    /// Location of the SQLite task store
    pub fn database_path(&self) -> PathBuf {
        self.core.data_dir.join("quill.db")
    }

    /// Validate and process configuration
    ///
    /// Validates value ranges, expands ~ in paths and creates the data
    /// directory if it doesn't exist.
    fn validate_and_process(&mut self) -> Result<(), EngineError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        if self.llm.base_url.trim().is_empty() {
            return Err(EngineError::Config("llm.base_url must not be empty".to_string()));
        }

        let agent = &self.agent;
        if agent.max_iterations_standard < 1 || agent.max_iterations_fast_draft < 1 {
            return Err(EngineError::Config(
                "Iteration budgets must be at least 1".to_string(),
            ));
        }
        if agent.worker_pool_size == 0 {
            return Err(EngineError::Config(
                "worker_pool_size must be at least 1".to_string(),
            ));
        }
        if agent.tool_max_retries > 5 {
            return Err(EngineError::Config(
                "tool_max_retries must be between 0 and 5".to_string(),
            ));
        }
        if agent.min_tool_timeout_ms == 0 || agent.tool_timeout_ms < agent.min_tool_timeout_ms {
            return Err(EngineError::Config(
                "tool_timeout_ms must be at least min_tool_timeout_ms".to_string(),
            ));
        }
        if agent.observation_window == 0 {
            return Err(EngineError::Config(
                "observation_window must be at least 1".to_string(),
            ));
        }
        if self.knowledge.top_k == 0 || self.knowledge.chunk_chars == 0 {
            return Err(EngineError::Config(
                "knowledge.top_k and knowledge.chunk_chars must be positive".to_string(),
            ));
        }

        self.core.data_dir = expand_path(&self.core.data_dir)?;
        if !self.core.data_dir.exists() {
            fs::create_dir_all(&self.core.data_dir).map_err(|e| {
                EngineError::Config(format!("Failed to create data directory: {}", e))
            })?;
        }

        if let Some(dir) = &self.knowledge.dir {
            self.knowledge.dir = Some(expand_path(dir)?);
        }

        Ok(())
    }
}

/// Expand ~ in path to user's home directory
fn expand_path(path: &Path) -> Result<PathBuf, EngineError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| EngineError::Config("Invalid UTF-8 in path".to_string()))?;

    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(rest))
    } else if path_str == "~" {
        dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))
    } else {
        Ok(path.to_path_buf())
    }
}
