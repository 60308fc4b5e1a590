//! Document discovery, parallel conversion, and index building.
//!
//! The indexer walks the configured knowledge directories, converts each
//! file through the injected [`Converter`] on a worker pool, and swaps the
//! merged result into the repository in one atomic replace. A JSON snapshot
//! of the built state accelerates the next startup; staleness rules decide
//! whether it can be loaded instead of rebuilding.

use rayon::prelude::*;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::config::KnowledgeConfig;
use crate::error::{Error, Result};
use crate::repository::{DocumentRecord, DocumentRepository, RepositoryState};
use crate::retry::{with_retry, RetryPolicy};
use crate::text::unique_terms;

/// Output of a [`Converter`]: display name plus markdown text.
#[derive(Debug, Clone)]
pub struct ConvertedDocument {
    /// Display name (typically the file name).
    pub name: String,
    /// Converted markdown text.
    pub markdown: String,
}

/// Injected document-to-text capability.
///
/// I/O failures are retried by the indexer; any other error skips the file.
pub trait Converter: Send + Sync {
    /// Converts the file at `path`.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] for filesystem failures (retried); other kinds for
    /// unparseable content (not retried).
    fn convert(&self, path: &Path) -> Result<ConvertedDocument>;
}

/// Built-in converter for markdown files: reads the file as UTF-8 and uses
/// the file name as the document name.
pub struct MarkdownConverter;

impl Converter for MarkdownConverter {
    fn convert(&self, path: &Path) -> Result<ConvertedDocument> {
        let markdown = std::fs::read_to_string(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(ConvertedDocument { name, markdown })
    }
}

/// Builds the repository from the configured knowledge directories.
pub struct DocumentIndexer {
    config: KnowledgeConfig,
    repository: Arc<DocumentRepository>,
    converter: Arc<dyn Converter>,
    retry: RetryPolicy,
    extensions: Vec<String>,
}

impl DocumentIndexer {
    /// Creates an indexer over a repository with the default `.md` filter.
    #[must_use]
    pub fn new(
        config: KnowledgeConfig,
        repository: Arc<DocumentRepository>,
        converter: Arc<dyn Converter>,
    ) -> Self {
        Self {
            config,
            repository,
            converter,
            retry: RetryPolicy::default(),
            extensions: vec!["md".to_string()],
        }
    }

    /// Overrides the file-extension filter.
    #[must_use]
    pub fn with_extensions(mut self, extensions: Vec<String>) -> Self {
        self.extensions = extensions;
        self
    }

    /// Overrides the conversion retry policy (tests use fast policies).
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Ingests all configured directories, loading the snapshot instead when
    /// it is present, valid JSON, and not stale.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the rebuilt snapshot cannot be written after
    /// retries. Per-file conversion failures are logged and skipped.
    pub fn ingest_all(&self) -> Result<()> {
        let cache_path = self.config.cache_file.clone();

        if cache_path.exists() && !self.is_cache_stale(&cache_path) {
            match self.repository.load_from_cache(&cache_path) {
                Ok(()) => {
                    info!(
                        documents = self.repository.document_count(),
                        terms = self.repository.term_count(),
                        "loaded knowledge base from snapshot"
                    );
                    return Ok(());
                }
                Err(e) => warn!("snapshot load failed ({e}), rebuilding index"),
            }
        }

        self.build_index()?;
        self.save_snapshot(&cache_path)
    }

    /// Forces a full rebuild and snapshot write.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the snapshot cannot be written after retries.
    pub fn rebuild_index(&self) -> Result<()> {
        info!("forcing index rebuild");
        self.build_index()?;
        self.save_snapshot(&self.config.cache_file)
    }

    /// Enumerates `(kb_dir, file)` pairs across all knowledge directories.
    ///
    /// Missing directories are logged and skipped; symlinks are skipped;
    /// output order is deterministic.
    #[must_use]
    pub fn discover_documents(&self) -> Vec<(PathBuf, PathBuf)> {
        let mut files = Vec::new();
        for kb_dir in &self.config.knowledge_dirs {
            if !kb_dir.exists() {
                warn!(dir = %kb_dir.display(), "skipping non-existent knowledge directory");
                continue;
            }

            for entry in WalkDir::new(kb_dir)
                .follow_links(false)
                .sort_by_file_name()
                .into_iter()
                .filter_map(std::result::Result::ok)
            {
                if entry.path_is_symlink() || !entry.file_type().is_file() {
                    continue;
                }
                let matches_extension = entry
                    .path()
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| self.extensions.iter().any(|want| want == e));
                if matches_extension {
                    files.push((kb_dir.clone(), entry.into_path()));
                }
            }
        }
        files
    }

    /// Checks whether the snapshot at `cache_path` is stale relative to the
    /// discovered source files: newer source mtime, changed file count, or
    /// an unparseable snapshot all force a rebuild.
    #[must_use]
    pub fn is_cache_stale(&self, cache_path: &Path) -> bool {
        let Ok(cache_mtime) = std::fs::metadata(cache_path).and_then(|m| m.modified()) else {
            return true;
        };

        let files = self.discover_documents();
        for (_, file) in &files {
            match std::fs::metadata(file).and_then(|m| m.modified()) {
                Ok(mtime) if mtime > cache_mtime => {
                    debug!(file = %file.display(), "snapshot is stale (newer source file)");
                    return true;
                }
                Ok(_) => {}
                Err(_) => return true,
            }
        }

        match read_snapshot_state(cache_path) {
            Some(state) if state.documents.len() == files.len() => false,
            Some(state) => {
                debug!(
                    cached = state.documents.len(),
                    discovered = files.len(),
                    "snapshot is stale (file count changed)"
                );
                true
            }
            // Not UTF-8 JSON: invalid, rebuild.
            None => true,
        }
    }

    fn build_index(&self) -> Result<()> {
        let files = self.discover_documents();
        info!(
            files = files.len(),
            dirs = self.config.knowledge_dirs.len(),
            workers = self.config.effective_workers(),
            "ingesting knowledge base"
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.effective_workers())
            .build()
            .map_err(|e| Error::Internal(format!("worker pool: {e}")))?;

        let results: Vec<Option<ProcessedDocument>> = pool.install(|| {
            files
                .par_iter()
                .map(|(kb_dir, file)| self.process_single_document(kb_dir, file))
                .collect()
        });

        let mut new_documents: HashMap<String, DocumentRecord> = HashMap::new();
        let mut new_index: HashMap<String, Vec<String>> = HashMap::new();
        let mut failures = 0usize;

        for processed in results {
            let Some(processed) = processed else {
                failures += 1;
                continue;
            };
            for term in processed.terms {
                new_index.entry(term).or_default().push(processed.id.clone());
            }
            new_documents.insert(processed.id, processed.record);
        }

        let documents = new_documents.len();
        let terms = new_index.len();
        self.repository.replace_index(new_documents, new_index);

        info!(documents, terms, failures, "ingestion complete");
        Ok(())
    }

    fn process_single_document(&self, kb_dir: &Path, file: &Path) -> Option<ProcessedDocument> {
        let converted = match with_retry(&self.retry, "convert", || self.converter.convert(file)) {
            Ok(converted) => converted,
            Err(e) => {
                error!(file = %file.display(), "failed to ingest: {e}");
                return None;
            }
        };

        // Document id is the path relative to the knowledge dir's parent, so
        // ids keep the kb dir name as a prefix and stay unique across dirs.
        let base = kb_dir
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(kb_dir);
        let id = file
            .strip_prefix(base)
            .unwrap_or(file)
            .to_string_lossy()
            .replace('\\', "/");

        let terms: Vec<String> = unique_terms(&converted.markdown).into_iter().collect();
        debug!(id = %id, "ingested");

        Some(ProcessedDocument {
            id,
            record: DocumentRecord {
                path: file.to_string_lossy().into_owned(),
                content: converted.markdown,
                name: converted.name,
                kb_dir: kb_dir.to_string_lossy().into_owned(),
            },
            terms,
        })
    }

    fn save_snapshot(&self, cache_path: &Path) -> Result<()> {
        with_retry(&self.retry, "save snapshot", || {
            self.repository.save_to_cache(cache_path)
        })
    }
}

struct ProcessedDocument {
    id: String,
    record: DocumentRecord,
    terms: Vec<String>,
}

fn read_snapshot_state(path: &Path) -> Option<RepositoryState> {
    let bytes = std::fs::read(path).ok()?;
    let text = std::str::from_utf8(&bytes).ok()?;
    serde_json::from_str(text).ok()
}
