//! Configuration for the knowledge service.
//!
//! Supports a `lorebase.toml` file, environment variables with the `KB_`
//! prefix, and runtime overrides.
//!
//! # Priority (highest to lowest)
//!
//! 1. Environment variables (`KB_*`)
//! 2. Configuration file (`lorebase.toml`)
//! 3. Default values

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Search mode for queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    /// Dense-vector similarity only.
    Vector,
    /// Lexical (inverted-index / full-text) only.
    Keyword,
    /// Vector + keyword fused via Reciprocal Rank Fusion (default).
    #[default]
    Hybrid,
}

impl SearchMode {
    /// Returns the mode as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Vector => "vector",
            Self::Keyword => "keyword",
            Self::Hybrid => "hybrid",
        }
    }
}

impl std::str::FromStr for SearchMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "vector" => Ok(Self::Vector),
            "keyword" => Ok(Self::Keyword),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(Error::InvalidInput(format!(
                "unknown search mode '{other}', expected vector, keyword or hybrid"
            ))),
        }
    }
}

/// Strategy used when splitting documents into chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkingStrategy {
    /// Split on semantic-similarity boundaries.
    Semantic,
    /// Recursive character splitting.
    Recursive,
    /// Split on markdown structure.
    Markdown,
    /// Split on code structure.
    Code,
    /// Pick a strategy per document (default).
    #[default]
    Auto,
}

/// Main configuration for a knowledge base.
///
/// Every field has a `KB_`-prefixed environment override, e.g.
/// `KB_MAX_CACHE_SIZE`, `KB_EMBEDDING_MODEL`, `KB_VECTOR_SEARCH_MODE`.
/// List-valued overrides use TOML array syntax
/// (`KB_KNOWLEDGE_DIRS='["kb1", "kb2"]'`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KnowledgeConfig {
    /// Directories to ingest.
    pub knowledge_dirs: Vec<PathBuf>,
    /// Path to the JSON snapshot file.
    pub cache_file: PathBuf,
    /// Per-project query cache capacity.
    pub max_cache_size: usize,
    /// Background heartbeat tick in seconds.
    pub heartbeat_interval: u64,
    /// Run warming queries when a knowledge base is opened.
    pub auto_warm: bool,
    /// Queries pre-executed during warm-up to populate the cache.
    pub warming_queries: Vec<String>,
    /// Parallelism for ingestion. `None` = host CPU count.
    pub max_workers: Option<usize>,
    /// Embedding model identifier.
    pub embedding_model: String,
    /// Default search mode for queries.
    pub vector_search_mode: SearchMode,
    /// Document chunk size.
    pub chunk_size: usize,
    /// Overlap between consecutive chunks. Must be smaller than `chunk_size`.
    pub chunk_overlap: usize,
    /// Chunking strategy.
    pub chunking_strategy: ChunkingStrategy,
    /// Master switch for the vector path. When false, queries use the legacy
    /// lexical path over the in-memory inverted index.
    pub use_vector_search: bool,
    /// Vector backend location (directory for the embedded store, database
    /// file for the SQL store).
    pub backend_path: PathBuf,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            knowledge_dirs: vec![PathBuf::from("knowledge-base")],
            cache_file: PathBuf::from(".knowledge_cache.json"),
            max_cache_size: 100,
            heartbeat_interval: 300,
            auto_warm: true,
            warming_queries: vec![
                "getting started".to_string(),
                "configuration reference".to_string(),
                "troubleshooting common errors".to_string(),
            ],
            max_workers: None,
            embedding_model: "all-MiniLM-L6-v2".to_string(),
            vector_search_mode: SearchMode::Hybrid,
            chunk_size: 1000,
            chunk_overlap: 200,
            chunking_strategy: ChunkingStrategy::Auto,
            use_vector_search: true,
            backend_path: PathBuf::from("./data/vectors"),
        }
    }
}

impl KnowledgeConfig {
    /// Loads configuration from default sources (`lorebase.toml` + env).
    ///
    /// # Errors
    ///
    /// Returns an error if parsing or validation fails.
    pub fn load() -> Result<Self> {
        Self::load_from_path("lorebase.toml")
    }

    /// Loads configuration from a specific file path, then applies `KB_*`
    /// environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if parsing or validation fails.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("KB_"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::config("config", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Creates a configuration from a TOML string (no env overrides).
    ///
    /// # Errors
    ///
    /// Returns an error if parsing or validation fails.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::string(toml_str));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::config("config", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the offending key.
    pub fn validate(&self) -> Result<()> {
        if self.knowledge_dirs.is_empty() {
            return Err(Error::config(
                "knowledge_dirs",
                "at least one knowledge directory must be specified",
            ));
        }

        if self.max_cache_size == 0 {
            return Err(Error::config("max_cache_size", "must be positive"));
        }

        if self.heartbeat_interval < 10 {
            return Err(Error::config(
                "heartbeat_interval",
                format!(
                    "value {} is below the minimum of 10 seconds",
                    self.heartbeat_interval
                ),
            ));
        }

        if self.max_workers == Some(0) {
            return Err(Error::config("max_workers", "must be at least 1"));
        }

        if self.embedding_model.trim().is_empty() {
            return Err(Error::config("embedding_model", "must not be empty"));
        }

        if self.chunk_size == 0 {
            return Err(Error::config("chunk_size", "must be positive"));
        }

        if self.chunk_overlap >= self.chunk_size {
            return Err(Error::config(
                "chunk_overlap",
                format!(
                    "value {} must be less than chunk_size {}",
                    self.chunk_overlap, self.chunk_size
                ),
            ));
        }

        Ok(())
    }

    /// Serializes the configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::config("config", e.to_string()))
    }

    /// Returns the effective ingestion parallelism.
    ///
    /// Explicit `max_workers` if set, otherwise the host CPU count.
    #[must_use]
    pub fn effective_workers(&self) -> usize {
        self.max_workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(1)
        })
    }
}
