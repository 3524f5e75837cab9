//! Configuration loading, validation, and management for Tierwise.
//!
//! Loads configuration from `~/.tierwise/config.toml` with environment
//! variable overrides. Validates all settings at startup. Tool server
//! definitions may live in a separate file so they can be hot-reloaded.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tierwise_core::tool::ToolServerConfig;

/// The root configuration structure.
///
/// Maps directly to `~/.tierwise/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Chunking configuration
    #[serde(default)]
    pub chunking: ChunkingConfig,

    /// Embedding provider chain
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Memory tiers and consolidation
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Tool servers and dispatch
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Logging output
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_true() -> bool {
    true
}

/// How text is cut into units before chunking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentationMode {
    #[default]
    Characters,
    Tokens,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Maximum chunk size in units
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Units shared by consecutive chunks
    #[serde(default = "default_overlap")]
    pub overlap: usize,

    /// How far back from a hard cut to look for a paragraph/sentence break
    #[serde(default = "default_boundary_window")]
    pub boundary_window: usize,

    #[serde(default)]
    pub segmentation: SegmentationMode,

    /// Tokenizer file (`tokenizer.json`), required for token segmentation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokenizer_path: Option<PathBuf>,
}

fn default_chunk_size() -> usize {
    1000
}
fn default_overlap() -> usize {
    100
}
fn default_boundary_window() -> usize {
    100
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            overlap: default_overlap(),
            boundary_window: default_boundary_window(),
            segmentation: SegmentationMode::default(),
            tokenizer_path: None,
        }
    }
}

/// One entry in the ordered embedding provider chain.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EmbeddingProviderConfig {
    /// Local feature-hashing embedder, always available
    Hashing {
        #[serde(default = "default_hashing_dimension")]
        dimension: usize,
    },
    /// Any OpenAI-compatible `/embeddings` endpoint
    OpenaiCompat {
        base_url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        api_key: Option<String>,
        model: String,
        dimension: usize,
        #[serde(default = "default_embedding_timeout_secs")]
        timeout_secs: u64,
    },
}

fn default_hashing_dimension() -> usize {
    384
}
fn default_embedding_timeout_secs() -> u64 {
    30
}

impl EmbeddingProviderConfig {
    pub fn dimension(&self) -> usize {
        match self {
            Self::Hashing { dimension } | Self::OpenaiCompat { dimension, .. } => *dimension,
        }
    }
}

/// Redact a secret for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for EmbeddingProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hashing { dimension } => f
                .debug_struct("Hashing")
                .field("dimension", dimension)
                .finish(),
            Self::OpenaiCompat {
                base_url,
                api_key,
                model,
                dimension,
                timeout_secs,
            } => f
                .debug_struct("OpenaiCompat")
                .field("base_url", base_url)
                .field("api_key", &redact(api_key))
                .field("model", model)
                .field("dimension", dimension)
                .field("timeout_secs", timeout_secs)
                .finish(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Tried in order; later entries are fallbacks
    #[serde(default = "default_embedding_providers")]
    pub providers: Vec<EmbeddingProviderConfig>,
}

fn default_embedding_providers() -> Vec<EmbeddingProviderConfig> {
    vec![EmbeddingProviderConfig::Hashing {
        dimension: default_hashing_dimension(),
    }]
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            providers: default_embedding_providers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Short-term chunk count that triggers consolidation when exceeded
    #[serde(default = "default_max_short_term_chunks")]
    pub max_short_term_chunks: usize,

    /// Short-term token count that triggers consolidation when exceeded
    #[serde(default = "default_max_memory_tokens")]
    pub max_memory_tokens: usize,

    /// Tokens a consolidation batch must exceed
    #[serde(default = "default_consolidation_batch_tokens")]
    pub consolidation_batch_tokens: usize,

    /// Newest short-term chunks kept verbatim unless the count bound needs them
    #[serde(default = "default_retain_recent_chunks")]
    pub retain_recent_chunks: usize,

    /// Upper bound on a summary chunk, in characters
    #[serde(default = "default_summary_max_chars")]
    pub summary_max_chars: usize,

    /// Capacity of the pending-consolidation queue
    #[serde(default = "default_consolidation_queue")]
    pub consolidation_queue: usize,

    /// Default number of search results
    #[serde(default = "default_search_limit")]
    pub search_limit: usize,

    /// Persisted index location (defaults to `~/.tierwise/index.json`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_path: Option<PathBuf>,
}

fn default_max_short_term_chunks() -> usize {
    50
}
fn default_max_memory_tokens() -> usize {
    4000
}
fn default_consolidation_batch_tokens() -> usize {
    500
}
fn default_retain_recent_chunks() -> usize {
    4
}
fn default_summary_max_chars() -> usize {
    2000
}
fn default_consolidation_queue() -> usize {
    256
}
fn default_search_limit() -> usize {
    10
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_short_term_chunks: default_max_short_term_chunks(),
            max_memory_tokens: default_max_memory_tokens(),
            consolidation_batch_tokens: default_consolidation_batch_tokens(),
            retain_recent_chunks: default_retain_recent_chunks(),
            summary_max_chars: default_summary_max_chars(),
            consolidation_queue: default_consolidation_queue(),
            search_limit: default_search_limit(),
            index_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Declarative servers file (`[[servers]]` tables)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub servers_file: Option<PathBuf>,

    /// Watch `servers_file` and reload the registry on change
    #[serde(default = "default_true")]
    pub auto_reload: bool,

    /// Deadline applied to invocations that do not carry one
    #[serde(default = "default_deadline_ms")]
    pub default_deadline_ms: u64,

    /// Servers defined inline in the main config
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<ToolServerConfig>,
}

fn default_deadline_ms() -> u64 {
    30_000
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            servers_file: None,
            auto_reload: true,
            default_deadline_ms: default_deadline_ms(),
            servers: vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// On-disk layout of a servers file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServersFile {
    #[serde(default)]
    pub servers: Vec<ToolServerConfig>,
}

impl ServersFile {
    /// Parse a servers file. A missing file is an error: the caller asked for it.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::parse(&content).map_err(|e| match e {
            ConfigError::ParseError { reason, .. } => ConfigError::ParseError {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })
    }

    /// Parse servers file content.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let file: Self = toml::from_str(content).map_err(|e| ConfigError::ParseError {
            path: PathBuf::new(),
            reason: e.to_string(),
        })?;
        for server in &file.servers {
            server
                .validate()
                .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        }
        Ok(file)
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.tierwise/config.toml).
    ///
    /// Environment overrides:
    /// - `TIERWISE_EMBEDDING_API_KEY` (fills unset OpenAI-compatible keys)
    /// - `TIERWISE_INDEX_PATH`
    /// - `TIERWISE_SERVERS_FILE`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "No config file found, using defaults");
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

    fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("TIERWISE_EMBEDDING_API_KEY") {
            for provider in &mut self.embedding.providers {
                if let EmbeddingProviderConfig::OpenaiCompat { api_key, .. } = provider {
                    if api_key.is_none() {
                        *api_key = Some(key.clone());
                    }
                }
            }
        }
        if let Ok(path) = std::env::var("TIERWISE_INDEX_PATH") {
            self.memory.index_path = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("TIERWISE_SERVERS_FILE") {
            self.tools.servers_file = Some(PathBuf::from(path));
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".tierwise")
    }

    /// Where the persisted index lives.
    pub fn index_path(&self) -> PathBuf {
        self.memory
            .index_path
            .clone()
            .unwrap_or_else(|| Self::config_dir().join("index.json"))
    }

    /// Inline servers followed by those from `servers_file`.
    pub fn tool_servers(&self) -> Result<Vec<ToolServerConfig>, ConfigError> {
        let mut servers = self.tools.servers.clone();
        if let Some(path) = &self.tools.servers_file {
            servers.extend(ServersFile::load(path)?.servers);
        }
        Ok(servers)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let chunking = &self.chunking;
        if chunking.chunk_size == 0 {
            return Err(ConfigError::ValidationError(
                "chunking.chunk_size must be > 0".into(),
            ));
        }
        if chunking.overlap >= chunking.chunk_size {
            return Err(ConfigError::ValidationError(
                "chunking.overlap must be smaller than chunking.chunk_size".into(),
            ));
        }
        if chunking.segmentation == SegmentationMode::Tokens && chunking.tokenizer_path.is_none() {
            return Err(ConfigError::ValidationError(
                "chunking.tokenizer_path is required for token segmentation".into(),
            ));
        }

        if self.embedding.providers.is_empty() {
            return Err(ConfigError::ValidationError(
                "embedding.providers must list at least one provider".into(),
            ));
        }
        if self.embedding.providers.iter().any(|p| p.dimension() == 0) {
            return Err(ConfigError::ValidationError(
                "embedding provider dimension must be > 0".into(),
            ));
        }

        let memory = &self.memory;
        if memory.max_short_term_chunks == 0 || memory.max_memory_tokens == 0 {
            return Err(ConfigError::ValidationError(
                "memory thresholds must be > 0".into(),
            ));
        }
        if memory.summary_max_chars < 2 {
            return Err(ConfigError::ValidationError(
                "memory.summary_max_chars must be >= 2".into(),
            ));
        }
        if memory.consolidation_queue == 0 {
            return Err(ConfigError::ValidationError(
                "memory.consolidation_queue must be > 0".into(),
            ));
        }

        for server in &self.tools.servers {
            server
                .validate()
                .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        }

        Ok(())
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
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
