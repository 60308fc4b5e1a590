//! Per-project knowledge base facade.
//!
//! Wires one project's embedder, backend collection, repository, and query
//! engine together and exposes the ingest/query surface. Query results are
//! cached per project; every query is recorded with the health monitor.

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{info, warn};

use crate::backend::{BackendHealth, Metadata, MetadataFilter, SearchHit, VectorBackend};
use crate::cache::{CacheStats, LruCache};
use crate::config::{KnowledgeConfig, SearchMode};
use crate::embedding::{Embedder, EmbedderStats};
use crate::engine::HybridQueryEngine;
use crate::error::{Error, Result};
use crate::health::{HealthMonitor, HealthStatus, ProjectHealth};
use crate::heartbeat::{Heartbeat, HeartbeatStatus};
use crate::indexer::{Converter, DocumentIndexer, MarkdownConverter};
use crate::project::{Project, ProjectManager};
use crate::repository::{DocumentRecord, DocumentRepository};
use crate::text::normalize_query;

/// Batch size for embedding during ingestion.
const EMBED_BATCH: usize = 32;

/// A document supplied for direct ingestion.
#[derive(Debug, Clone)]
pub struct DocumentInput {
    /// Unique id within the project.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Full text.
    pub content: String,
    /// Metadata stored alongside the vector record.
    pub metadata: Metadata,
}

/// Aggregated statistics for one knowledge base.
#[derive(Debug, Clone)]
pub struct KnowledgeBaseStats {
    /// Project id.
    pub project_id: String,
    /// Documents in the in-memory repository.
    pub documents: usize,
    /// Distinct indexed terms.
    pub terms: usize,
    /// Documents in the backend collection.
    pub backend_documents: usize,
    /// Query cache statistics.
    pub cache: CacheStats,
    /// Embedder statistics.
    pub embedder: EmbedderStats,
    /// Warming queries executed.
    pub warm_queries: u64,
    /// Seconds the last warm-up took, if one ran.
    pub last_warm_seconds: Option<f64>,
    /// Backend health report.
    pub backend: BackendHealth,
    /// Metric-derived project health; status folds in the backend state.
    pub health: ProjectHealth,
}

/// Per-project facade over ingest and query.
pub struct KnowledgeBase {
    project: Project,
    config: KnowledgeConfig,
    embedder: Arc<Embedder>,
    backend: Arc<dyn VectorBackend>,
    repository: Arc<DocumentRepository>,
    engine: HybridQueryEngine,
    indexer: DocumentIndexer,
    cache: Arc<LruCache<String, Vec<SearchHit>>>,
    health: Arc<HealthMonitor>,
    heartbeat: Heartbeat,
    warm_queries: AtomicU64,
    last_warm_seconds: Mutex<Option<f64>>,
}

impl KnowledgeBase {
    /// Opens a knowledge base for `project`, borrowing its collection and
    /// query cache from the manager. Runs warm-up when `auto_warm` is set.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] for invalid configuration or an unknown
    ///   embedding model.
    /// - [`Error::ProjectNotFound`] if the project is not in the manager.
    pub fn open(
        config: KnowledgeConfig,
        project: Project,
        manager: &ProjectManager,
        health: Arc<HealthMonitor>,
    ) -> Result<Self> {
        Self::open_with_converter(config, project, manager, health, Arc::new(MarkdownConverter))
    }

    /// [`Self::open`] with an injected document converter.
    ///
    /// # Errors
    ///
    /// See [`Self::open`].
    pub fn open_with_converter(
        config: KnowledgeConfig,
        project: Project,
        manager: &ProjectManager,
        health: Arc<HealthMonitor>,
        converter: Arc<dyn Converter>,
    ) -> Result<Self> {
        config.validate()?;

        let embedder = Arc::new(Embedder::new(&project.embedding_model)?);
        let backend = manager
            .collection(&project.project_id)?
            .ok_or_else(|| Error::ProjectNotFound(project.project_id.clone()))?;
        let cache = manager
            .project_cache(&project.project_id)?
            .ok_or_else(|| Error::ProjectNotFound(project.project_id.clone()))?;

        let repository = Arc::new(DocumentRepository::new());
        let engine = HybridQueryEngine::new(
            Arc::clone(&embedder),
            Arc::clone(&backend),
            Arc::clone(&repository),
        );
        let indexer = DocumentIndexer::new(config.clone(), Arc::clone(&repository), converter);
        let heartbeat = Heartbeat::new(config.heartbeat_interval);

        let kb = Self {
            project,
            config,
            embedder,
            backend,
            repository,
            engine,
            indexer,
            cache,
            health,
            heartbeat,
            warm_queries: AtomicU64::new(0),
            last_warm_seconds: Mutex::new(None),
        };

        if kb.config.auto_warm {
            kb.warm_up();
        }
        Ok(kb)
    }

    /// The wired project.
    #[must_use]
    pub fn project(&self) -> &Project {
        &self.project
    }

    /// Directly ingests documents: embed, store in the backend, and merge
    /// into the lexical repository. Returns the number ingested.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidInput`] for empty ids or content.
    /// - Embedding and backend failures are surfaced.
    pub fn ingest_documents(&self, documents: &[DocumentInput]) -> Result<usize> {
        if documents.is_empty() {
            return Ok(0);
        }
        for doc in documents {
            if doc.id.trim().is_empty() {
                return Err(Error::InvalidInput("document id must not be empty".to_string()));
            }
        }

        let ids: Vec<String> = documents.iter().map(|d| d.id.clone()).collect();
        let contents: Vec<String> = documents.iter().map(|d| d.content.clone()).collect();
        let metadatas: Vec<Metadata> = documents.iter().map(|d| d.metadata.clone()).collect();

        let embeddings: Vec<Vec<f32>> = self
            .embedder
            .embed_batch(&contents, EMBED_BATCH)?
            .into_iter()
            .map(|v| v.as_ref().clone())
            .collect();

        self.backend.add(&ids, &embeddings, &contents, &metadatas)?;
        for doc in documents {
            self.repository.upsert_document(
                &doc.id,
                DocumentRecord {
                    path: String::new(),
                    content: doc.content.clone(),
                    name: doc.name.clone(),
                    kb_dir: String::new(),
                },
            );
        }

        // Results computed against the old document set are now stale.
        self.cache.clear();
        self.record_document_count();

        info!(project = %self.project.project_id, count = documents.len(), "ingested documents");
        Ok(documents.len())
    }

    /// Ingests the configured knowledge directories (snapshot-aware) and
    /// syncs the built documents into the vector backend.
    ///
    /// # Errors
    ///
    /// Indexing, embedding and backend failures are surfaced; per-file
    /// conversion failures were already skipped by the indexer.
    pub fn ingest_all(&self) -> Result<()> {
        self.indexer.ingest_all()?;
        self.sync_backend()?;
        self.cache.clear();
        self.record_document_count();
        Ok(())
    }

    /// Forces a rebuild of the index and the backend sync, then drops all
    /// cached query results.
    ///
    /// # Errors
    ///
    /// See [`Self::ingest_all`].
    pub fn rebuild_index(&self) -> Result<()> {
        self.indexer.rebuild_index()?;
        self.sync_backend()?;
        self.cache.clear();
        self.record_document_count();
        Ok(())
    }

    fn sync_backend(&self) -> Result<()> {
        let snapshot = self.repository.snapshot();
        if snapshot.documents.is_empty() {
            return Ok(());
        }

        let mut ids = Vec::with_capacity(snapshot.documents.len());
        let mut contents = Vec::with_capacity(snapshot.documents.len());
        let mut metadatas = Vec::with_capacity(snapshot.documents.len());
        for (id, record) in &snapshot.documents {
            if record.content.trim().is_empty() {
                continue;
            }
            ids.push(id.clone());
            contents.push(record.content.clone());
            let mut metadata = Metadata::new();
            metadata.insert("name".to_string(), record.name.clone().into());
            metadata.insert("path".to_string(), record.path.clone().into());
            metadata.insert("kb_dir".to_string(), record.kb_dir.clone().into());
            metadatas.push(metadata);
        }
        if ids.is_empty() {
            return Ok(());
        }

        let embeddings: Vec<Vec<f32>> = self
            .embedder
            .embed_batch(&contents, EMBED_BATCH)?
            .into_iter()
            .map(|v| v.as_ref().clone())
            .collect();
        self.backend.add(&ids, &embeddings, &contents, &metadatas)
    }

    /// Queries the knowledge base.
    ///
    /// `mode` and `alpha` default to the configured search mode and 0.7.
    /// With `use_cache`, identical queries are served from the per-project
    /// cache. When `use_vector_search` is off, every mode falls back to the
    /// lexical repository path.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidInput`] for empty text or `alpha` outside `[0, 1]`.
    /// - Embedding and backend failures are surfaced (and recorded as query
    ///   errors).
    pub fn query(
        &self,
        text: &str,
        mode: Option<SearchMode>,
        top_k: usize,
        alpha: Option<f32>,
        use_cache: bool,
    ) -> Result<Vec<SearchHit>> {
        if text.trim().is_empty() {
            return Err(Error::InvalidInput("query must not be empty".to_string()));
        }
        let mode = mode.unwrap_or(self.config.vector_search_mode);
        let alpha = alpha.unwrap_or(crate::engine::DEFAULT_ALPHA);
        if !(0.0..=1.0).contains(&alpha) {
            return Err(Error::InvalidInput(format!(
                "alpha must be in [0, 1], got {alpha}"
            )));
        }

        let start = Instant::now();
        let key = cache_key(text, mode, top_k, alpha, None);

        if use_cache {
            if let Some(hits) = self.cache.get(&key) {
                self.record_query(start, true, true);
                return Ok(hits);
            }
        }

        let result = if self.config.use_vector_search {
            match mode {
                SearchMode::Vector => self.engine.search_vector(text, top_k),
                SearchMode::Keyword => self.engine.search_keyword(text, top_k),
                SearchMode::Hybrid => self.engine.search_hybrid(text, top_k, alpha),
            }
        } else {
            Ok(self.engine.lexical_search(text, top_k))
        };

        match result {
            Ok(hits) => {
                if use_cache {
                    self.cache.put(key, hits.clone());
                }
                self.record_query(start, true, false);
                Ok(hits)
            }
            Err(e) => {
                self.record_query(start, false, false);
                Err(e)
            }
        }
    }

    /// Queries with MMR re-ranking over the given mode's candidates.
    /// Results are not cached; diversity selection is cheap relative to the
    /// candidate fetch and `lambda` rarely repeats.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidInput`] for empty text or `lambda` outside `[0, 1]`.
    /// - Embedding and backend failures are surfaced.
    pub fn query_mmr(
        &self,
        text: &str,
        top_k: usize,
        lambda: f32,
        mode: Option<SearchMode>,
    ) -> Result<Vec<SearchHit>> {
        if text.trim().is_empty() {
            return Err(Error::InvalidInput("query must not be empty".to_string()));
        }
        let mode = mode.unwrap_or(self.config.vector_search_mode);

        let start = Instant::now();
        let result = self.engine.search_with_mmr(text, top_k, lambda, mode);
        self.record_query(start, result.is_ok(), false);
        result
    }

    /// Runs the configured warming queries to populate the cache.
    /// Individual failures are logged and skipped.
    pub fn warm_up(&self) {
        info!(project = %self.project.project_id, "warming up knowledge base");
        let start = Instant::now();

        for query in &self.config.warming_queries {
            match self.query(query, None, 10, None, true) {
                Ok(_) => {
                    self.warm_queries.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => warn!("warming query '{query}' failed: {e}"),
            }
        }

        let elapsed = start.elapsed().as_secs_f64();
        *self.last_warm_seconds.lock() = Some(elapsed);
        info!(
            project = %self.project.project_id,
            seconds = elapsed,
            "knowledge base warmed"
        );
    }

    /// Drops all cached query results.
    pub fn clear_cache(&self) {
        self.cache.clear();
        info!(project = %self.project.project_id, "query cache cleared");
    }

    /// Aggregated statistics. The health status folds in the backend: an
    /// unhealthy backend makes the whole project unhealthy.
    #[must_use]
    pub fn get_stats(&self) -> KnowledgeBaseStats {
        let backend = self.backend.health();
        let mut health = self.health.get_project_health(&self.project.project_id);
        if backend.status == HealthStatus::Unhealthy {
            health.status = HealthStatus::Unhealthy;
        }

        KnowledgeBaseStats {
            project_id: self.project.project_id.clone(),
            documents: self.repository.document_count(),
            terms: self.repository.term_count(),
            backend_documents: backend.documents.unwrap_or(0),
            cache: self.cache.stats(),
            embedder: self.embedder.stats(),
            warm_queries: self.warm_queries.load(Ordering::Relaxed),
            last_warm_seconds: *self.last_warm_seconds.lock(),
            backend,
            health,
        }
    }

    /// Starts the background heartbeat: each beat re-runs the first warming
    /// query to keep caches warm. No-op when already running.
    pub fn start_heartbeat(kb: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(kb);
        let query = kb.config.warming_queries.first().cloned();
        kb.heartbeat.start(move || {
            if let (Some(kb), Some(query)) = (weak.upgrade(), query.as_ref()) {
                let _ = kb.query(query, None, 5, None, true);
            }
        });
    }

    /// Stops the background heartbeat. Idempotent.
    pub fn stop_heartbeat(&self) {
        self.heartbeat.stop();
    }

    /// Heartbeat status.
    #[must_use]
    pub fn heartbeat_status(&self) -> HeartbeatStatus {
        self.heartbeat.status()
    }

    fn record_query(&self, start: Instant, success: bool, cache_hit: bool) {
        self.health.record_query(
            &self.project.project_id,
            start.elapsed().as_secs_f64() * 1000.0,
            success,
            cache_hit,
        );
    }

    fn record_document_count(&self) {
        let count = self
            .backend
            .count()
            .unwrap_or_else(|_| self.repository.document_count());
        self.health
            .record_document_count(&self.project.project_id, count);
    }
}

fn cache_key(
    text: &str,
    mode: SearchMode,
    top_k: usize,
    alpha: f32,
    filter: Option<&MetadataFilter>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_query(text).as_bytes());
    hasher.update([0]);
    hasher.update(mode.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(top_k.to_le_bytes());
    hasher.update(alpha.to_bits().to_le_bytes());
    if let Some(filter) = filter {
        hasher.update(serde_json::to_vec(filter).unwrap_or_default());
    }
    hex::encode(hasher.finalize())
}
