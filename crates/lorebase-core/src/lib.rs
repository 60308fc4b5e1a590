//! # Lorebase Core
//!
//! Multi-tenant retrieval-augmented knowledge service engine.
//!
//! Lorebase lets clients register isolated projects, ingest text documents
//! into them, and run low-latency hybrid queries that fuse dense-vector
//! similarity with lexical (inverted-index) matching.
//!
//! ## Subsystems
//!
//! - **Hybrid query engine**: vector search, keyword search, Reciprocal Rank
//!   Fusion and optional MMR re-ranking ([`HybridQueryEngine`])
//! - **Project isolation**: per-project vector collections, per-project query
//!   caches, SQLite-backed metadata ([`ProjectManager`])
//! - **Concurrent ingestion**: parallel document conversion, atomic index
//!   swap, JSON snapshot caching ([`DocumentIndexer`])
//! - **Thread-safe LRU cache**: the primitive behind query-result caching and
//!   embedding memoization ([`LruCache`])
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use lorebase_core::{KnowledgeBase, KnowledgeConfig, ProjectManager};
//!
//! let manager = ProjectManager::new("./projects.db", 100)?;
//! let project = manager.create("docs", "team docs", "all-MiniLM-L6-v2", None)?;
//!
//! let kb = KnowledgeBase::open(KnowledgeConfig::default(), project, &manager, monitor)?;
//! kb.ingest_all()?;
//! let hits = kb.query("hybrid retrieval", None, 10, None, true)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod cache;
pub mod config;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod health;
pub mod heartbeat;
pub mod indexer;
pub mod knowledge;
pub mod project;
pub mod repository;
pub mod retry;
pub mod similarity;
pub mod text;

pub use backend::{
    BackendHealth, EmbeddedStore, Metadata, MetadataFilter, SearchHit, SqliteStore, VectorBackend,
    VectorRecord, VectorStore,
};
pub use cache::{CacheStats, LruCache};
pub use config::{ChunkingStrategy, KnowledgeConfig, SearchMode};
pub use embedding::{Embedder, EmbedderStats, EmbeddingModel};
pub use engine::{HybridQueryEngine, DEFAULT_ALPHA, RRF_K};
pub use error::{Error, Result};
pub use health::{HealthMonitor, HealthStatus, ProjectHealth};
pub use heartbeat::{Heartbeat, HeartbeatStatus};
pub use indexer::{ConvertedDocument, Converter, DocumentIndexer, MarkdownConverter};
pub use knowledge::{DocumentInput, KnowledgeBase, KnowledgeBaseStats};
pub use project::{Project, ProjectManager, ProjectUpdate};
pub use repository::{DocumentRecord, DocumentRepository};
