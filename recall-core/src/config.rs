//! Configuration for the recall memory engine.
//!
//! Maps directly to `recall.toml`. Every field has a default, so an empty
//! file is a valid configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{RecallError, Result};

/// Top-level configuration, loadable from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecallConfig {
    /// Logging settings.
    #[serde(default)]
    pub general: GeneralConfig,
    /// Namespace detection.
    #[serde(default)]
    pub context: ContextConfig,
    /// SQLite store settings.
    #[serde(default)]
    pub store: StoreConfig,
    /// Embedding service settings.
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    /// Hybrid retrieval settings.
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    /// Graph query caps.
    #[serde(default)]
    pub graph: GraphConfig,
    /// Decay and duplicate detection.
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
}

impl RecallConfig {
    /// Load configuration from a TOML string.
    ///
    /// # Errors
    /// Returns `RecallError::Config` if the TOML is invalid or a value is out
    /// of range.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(toml_str).map_err(|e| RecallError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Reject values the engines cannot work with.
    ///
    /// # Errors
    /// Returns `RecallError::Config` naming the offending key.
    pub fn validate(&self) -> Result<()> {
        let m = &self.maintenance;
        if self.embedding.dimensions == 0 {
            return Err(config_err("embedding.dimensions must be > 0"));
        }
        if !(m.decay_factor > 0.0 && m.decay_factor < 1.0) {
            return Err(config_err("maintenance.decay_factor must be within (0, 1)"));
        }
        if !(m.decay_floor > 0.0 && m.decay_floor < 1.0) {
            return Err(config_err("maintenance.decay_floor must be within (0, 1)"));
        }
        if !(0.0..=1.0).contains(&m.default_similarity_threshold) {
            return Err(config_err(
                "maintenance.default_similarity_threshold must be within [0, 1]",
            ));
        }
        if m.similarity_neighbors == 0 || m.max_pair_limit == 0 {
            return Err(config_err("maintenance neighbor and pair caps must be > 0"));
        }
        if self.graph.max_traverse_depth == 0 || self.graph.max_path_depth == 0 {
            return Err(config_err("graph depth caps must be > 0"));
        }
        if self.retrieval.rrf_k == 0 {
            return Err(config_err("retrieval.rrf_k must be > 0"));
        }
        if self.retrieval.vector_window_multiplier == 0 {
            return Err(config_err("retrieval.vector_window_multiplier must be > 0"));
        }
        if self.retrieval.access_queue_capacity == 0 {
            return Err(config_err("retrieval.access_queue_capacity must be > 0"));
        }
        Ok(())
    }
}

fn config_err(msg: &str) -> RecallError {
    RecallError::Config(msg.to_string())
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level: trace, debug, info, warn, error. `RUST_LOG` overrides it.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit JSON log lines instead of human-readable ones.
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// How the default namespace is chosen.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Namespace used when the caller gives none.
    #[serde(default)]
    pub default_context: Option<String>,
    /// Derive the namespace from the working directory's git remote or name.
    #[serde(default)]
    pub context_from_cwd: bool,
}

/// SQLite store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Database file.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    /// Use WAL mode for concurrent reads.
    #[serde(default = "default_true")]
    pub wal_mode: bool,
    /// How long a writer waits on a locked database.
    #[serde(default = "default_5000")]
    pub busy_timeout_ms: u64,
    /// Below this many vectors per kind, nearest-neighbor search is exact.
    #[serde(default = "default_2048")]
    pub brute_force_threshold: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            wal_mode: true,
            busy_timeout_ms: 5000,
            brute_force_threshold: 2048,
        }
    }
}

/// Embedding service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Backend: "ollama", "openai", "hashing", "stub" or "none".
    #[serde(default = "default_ollama")]
    pub provider: String,
    /// Service base URL.
    #[serde(default = "default_ollama_url")]
    pub base_url: String,
    /// Model name.
    #[serde(default = "default_embedding_model")]
    pub model: String,
    /// Expected vector length; anything else is rejected.
    #[serde(default = "default_384")]
    pub dimensions: usize,
    /// Environment variable holding the API key (OpenAI-compatible only).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Per-request timeout in milliseconds.
    #[serde(default = "default_10000")]
    pub timeout_ms: u64,
    /// Retries after the first attempt.
    #[serde(default = "default_2")]
    pub max_retries: u32,
    /// LRU cache entries (0 disables caching).
    #[serde(default = "default_1024")]
    pub cache_size: usize,
    /// Input text is cut to this many characters before embedding.
    #[serde(default = "default_8000")]
    pub max_input_chars: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            base_url: "http://localhost:11434".to_string(),
            model: "all-minilm".to_string(),
            dimensions: 384,
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_ms: 10_000,
            max_retries: 2,
            cache_size: 1024,
            max_input_chars: 8000,
        }
    }
}

/// Hybrid retrieval settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// RRF smoothing constant.
    #[serde(default = "default_60")]
    pub rrf_k: u32,
    /// Vector candidate window as a multiple of the limit.
    #[serde(default = "default_2_usize")]
    pub vector_window_multiplier: usize,
    /// Pending access-tracking updates before new ones are dropped.
    #[serde(default = "default_1024")]
    pub access_queue_capacity: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            rrf_k: 60,
            vector_window_multiplier: 2,
            access_queue_capacity: 1024,
        }
    }
}

/// Graph query caps and defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Largest traverse depth accepted.
    #[serde(default = "default_10")]
    pub max_traverse_depth: u32,
    /// Largest path length accepted.
    #[serde(default = "default_20")]
    pub max_path_depth: u32,
    /// Depth used when the caller gives none.
    #[serde(default = "default_2")]
    pub default_traverse_depth: u32,
    /// Path bound used when the caller gives none.
    #[serde(default = "default_5")]
    pub default_path_depth: u32,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            max_traverse_depth: 10,
            max_path_depth: 20,
            default_traverse_depth: 2,
            default_path_depth: 5,
        }
    }
}

/// Decay and duplicate detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Multiplier applied to decay weight and importance per pass.
    #[serde(default = "default_0_9")]
    pub decay_factor: f32,
    /// Decay never drives a value below this.
    #[serde(default = "default_0_1")]
    pub decay_floor: f32,
    /// Entities not accessed for this many days are decayed.
    #[serde(default = "default_30")]
    pub default_cutoff_days: u32,
    /// Nearest neighbors inspected per entity when looking for duplicates.
    #[serde(default = "default_10_usize")]
    pub similarity_neighbors: usize,
    /// Cosine similarity at or above which two entities are flagged.
    #[serde(default = "default_0_85")]
    pub default_similarity_threshold: f32,
    /// Pairs returned when the caller gives no limit.
    #[serde(default = "default_10_usize")]
    pub default_pair_limit: usize,
    /// Largest pair limit accepted.
    #[serde(default = "default_50")]
    pub max_pair_limit: usize,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            decay_factor: 0.9,
            decay_floor: 0.1,
            default_cutoff_days: 30,
            similarity_neighbors: 10,
            default_similarity_threshold: 0.85,
            default_pair_limit: 10,
            max_pair_limit: 50,
        }
    }
}

// ---------------------------------------------------------------------------
// Serde default helpers
// ---------------------------------------------------------------------------

fn default_true() -> bool { true }
fn default_log_level() -> String { "info".to_string() }
fn default_store_path() -> PathBuf { PathBuf::from("recall.db") }
fn default_ollama() -> String { "ollama".to_string() }
fn default_ollama_url() -> String { "http://localhost:11434".to_string() }
fn default_embedding_model() -> String { "all-minilm".to_string() }
fn default_api_key_env() -> String { "OPENAI_API_KEY".to_string() }
fn default_0_1() -> f32 { 0.1 }
fn default_0_85() -> f32 { 0.85 }
fn default_0_9() -> f32 { 0.9 }
fn default_2() -> u32 { 2 }
fn default_2_usize() -> usize { 2 }
fn default_5() -> u32 { 5 }
fn default_10() -> u32 { 10 }
fn default_10_usize() -> usize { 10 }
fn default_20() -> u32 { 20 }
fn default_30() -> u32 { 30 }
fn default_50() -> usize { 50 }
fn default_60() -> u32 { 60 }
fn default_384() -> usize { 384 }
fn default_1024() -> usize { 1024 }
fn default_2048() -> usize { 2048 }
fn default_5000() -> u64 { 5000 }
fn default_8000() -> usize { 8000 }
fn default_10000() -> u64 { 10_000 }
