//! In-memory document table and inverted term index.
//!
//! The whole state lives behind an `ArcSwap`: readers load the current
//! snapshot and work lock-free on it, writers build a fresh state and swap
//! the owning reference in one atomic store. Readers that captured the old
//! snapshot keep it alive until their copies drop, so a query running
//! concurrently with a rebuild sees either the old index or the new one,
//! never a mixture.
//!
//! The on-disk cache is UTF-8 JSON only. Anything else (legacy binary
//! serializations included) is refused and triggers a rebuild; arbitrary
//! binary deserialization is forbidden.

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// A document as held by the repository and the on-disk snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    /// Source file path; empty for directly ingested documents.
    pub path: String,
    /// Full text after conversion.
    pub content: String,
    /// Display name.
    pub name: String,
    /// Knowledge directory the document came from; empty for direct ingest.
    pub kb_dir: String,
}

/// The swappable repository state: document table + inverted index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepositoryState {
    /// Document id -> record.
    pub documents: HashMap<String, DocumentRecord>,
    /// Term -> sorted, de-duplicated posting list of document ids.
    pub index: HashMap<String, Vec<String>>,
}

impl RepositoryState {
    fn normalize_postings(&mut self) {
        for postings in self.index.values_mut() {
            postings.sort();
            postings.dedup();
        }
        self.index.retain(|_, postings| !postings.is_empty());
    }
}

/// Thread-safe repository with atomic snapshot replacement.
pub struct DocumentRepository {
    state: ArcSwap<RepositoryState>,
}

impl DocumentRepository {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ArcSwap::from_pointee(RepositoryState::default()),
        }
    }

    /// Inserts or replaces a document. Postings are not touched; callers
    /// maintaining the index use [`Self::index_term`] or
    /// [`Self::upsert_document`].
    pub fn add_document(&self, id: &str, record: DocumentRecord) {
        self.state.rcu(|current| {
            let mut state = RepositoryState::clone(current);
            state.documents.insert(id.to_string(), record.clone());
            state
        });
    }

    /// Adds `id` to the posting list of `term`.
    pub fn index_term(&self, term: &str, id: &str) {
        self.state.rcu(|current| {
            let mut state = RepositoryState::clone(current);
            let postings = state.index.entry(term.to_string()).or_default();
            if let Err(pos) = postings.binary_search(&id.to_string()) {
                postings.insert(pos, id.to_string());
            }
            state
        });
    }

    /// Inserts or replaces a document and keeps the inverted index
    /// consistent: postings for the previous content are removed, postings
    /// for the new content added.
    pub fn upsert_document(&self, id: &str, record: DocumentRecord) {
        self.state.rcu(|current| {
            let mut state = RepositoryState::clone(current);
            if state.documents.contains_key(id) {
                for postings in state.index.values_mut() {
                    postings.retain(|doc_id| doc_id != id);
                }
                state.index.retain(|_, postings| !postings.is_empty());
            }
            for term in crate::text::unique_terms(&record.content) {
                let postings = state.index.entry(term).or_default();
                if let Err(pos) = postings.binary_search(&id.to_string()) {
                    postings.insert(pos, id.to_string());
                }
            }
            state.documents.insert(id.to_string(), record.clone());
            state
        });
    }

    /// Atomically replaces the document table and inverted index.
    ///
    /// Posting lists are sorted and de-duplicated before the swap.
    pub fn replace_index(
        &self,
        documents: HashMap<String, DocumentRecord>,
        index: HashMap<String, Vec<String>>,
    ) {
        let mut state = RepositoryState { documents, index };
        state.normalize_postings();
        debug!(
            documents = state.documents.len(),
            terms = state.index.len(),
            "replacing repository state"
        );
        self.state.store(Arc::new(state));
    }

    /// Drops all documents and postings.
    pub fn clear(&self) {
        self.state.store(Arc::new(RepositoryState::default()));
    }

    /// Number of documents.
    #[must_use]
    pub fn document_count(&self) -> usize {
        self.state.load().documents.len()
    }

    /// Number of distinct indexed terms.
    #[must_use]
    pub fn term_count(&self) -> usize {
        self.state.load().index.len()
    }

    /// Fetches a document by id.
    #[must_use]
    pub fn get_document(&self, id: &str) -> Option<DocumentRecord> {
        self.state.load().documents.get(id).cloned()
    }

    /// Copies the posting lists for `terms` out of the current snapshot.
    ///
    /// The caller ranks and fuses on the returned copy without holding any
    /// repository lock; terms with no postings are omitted.
    #[must_use]
    pub fn postings_snapshot(&self, terms: &[String]) -> HashMap<String, Vec<String>> {
        let state = self.state.load();
        terms
            .iter()
            .filter_map(|term| {
                state
                    .index
                    .get(term)
                    .map(|postings| (term.clone(), postings.clone()))
            })
            .collect()
    }

    /// The full current snapshot (cheap: one atomic load + refcount bump).
    #[must_use]
    pub fn snapshot(&self) -> Arc<RepositoryState> {
        self.state.load_full()
    }

    /// Writes the `{documents, index}` JSON snapshot atomically: temp file,
    /// fsync, rename.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] on filesystem failure (retryable).
    pub fn save_to_cache<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let state = self.state.load();
        let json = serde_json::to_vec_pretty(&**state)?;

        let mut tmp_path = path.as_os_str().to_owned();
        tmp_path.push(".tmp");
        let tmp_path = std::path::PathBuf::from(tmp_path);

        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(&json)?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&tmp_path, path)?;

        info!(path = %path.display(), documents = state.documents.len(), "saved snapshot");
        Ok(())
    }

    /// Loads a JSON snapshot, replacing the current state.
    ///
    /// Only UTF-8 JSON is accepted. Bytes that are not valid UTF-8 or not
    /// valid JSON fail with [`Error::CacheInvalid`]; callers treat that as a
    /// cache miss and rebuild.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] if the file cannot be read.
    /// - [`Error::CacheInvalid`] for non-UTF-8 or non-JSON contents.
    pub fn load_from_cache<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let bytes = std::fs::read(path.as_ref())?;
        let text = std::str::from_utf8(&bytes)
            .map_err(|_| Error::CacheInvalid("snapshot is not valid UTF-8".to_string()))?;
        let mut state: RepositoryState = serde_json::from_str(text)
            .map_err(|e| Error::CacheInvalid(format!("snapshot is not valid JSON: {e}")))?;
        state.normalize_postings();

        info!(
            path = %path.as_ref().display(),
            documents = state.documents.len(),
            terms = state.index.len(),
            "loaded snapshot"
        );
        self.state.store(Arc::new(state));
        Ok(())
    }
}

impl Default for DocumentRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(content: &str) -> DocumentRecord {
        DocumentRecord {
            path: String::new(),
            content: content.to_string(),
            name: "doc".to_string(),
            kb_dir: String::new(),
        }
    }

    #[test]
    fn test_add_and_get_document() {
        let repo = DocumentRepository::new();
        repo.add_document("d1", record("alpha beta"));
        assert_eq!(repo.document_count(), 1);
        assert_eq!(repo.get_document("d1").unwrap().content, "alpha beta");
        assert!(repo.get_document("missing").is_none());
    }

    #[test]
    fn test_index_term_sorted_dedup() {
        let repo = DocumentRepository::new();
        repo.index_term("alpha", "d2");
        repo.index_term("alpha", "d1");
        repo.index_term("alpha", "d2");

        let postings = repo.postings_snapshot(&["alpha".to_string()]);
        assert_eq!(postings["alpha"], vec!["d1".to_string(), "d2".to_string()]);
    }

    #[test]
    fn test_upsert_document_keeps_index_consistent() {
        let repo = DocumentRepository::new();
        repo.upsert_document("d1", record("old words here"));
        repo.upsert_document("d1", record("new content"));

        let stale = repo.postings_snapshot(&["old".to_string(), "words".to_string()]);
        assert!(stale.is_empty(), "postings for replaced content must go");

        let fresh = repo.postings_snapshot(&["new".to_string()]);
        assert_eq!(fresh["new"], vec!["d1".to_string()]);
        assert_eq!(repo.document_count(), 1);
    }

    #[test]
    fn test_replace_index_swaps_everything() {
        let repo = DocumentRepository::new();
        repo.upsert_document("old", record("legacy"));

        let mut documents = HashMap::new();
        documents.insert("d1".to_string(), record("fresh"));
        let mut index = HashMap::new();
        index.insert("fresh".to_string(), vec!["d1".to_string(), "d1".to_string()]);

        repo.replace_index(documents, index);

        assert!(repo.get_document("old").is_none());
        assert_eq!(repo.document_count(), 1);
        // Duplicate postings were normalized.
        let postings = repo.postings_snapshot(&["fresh".to_string()]);
        assert_eq!(postings["fresh"], vec!["d1".to_string()]);
    }

    #[test]
    fn test_snapshot_is_stable_across_swap() {
        let repo = DocumentRepository::new();
        repo.upsert_document("d1", record("one"));

        let before = repo.snapshot();
        repo.replace_index(HashMap::new(), HashMap::new());

        // The captured snapshot still sees the old state.
        assert_eq!(before.documents.len(), 1);
        assert_eq!(repo.document_count(), 0);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("cache.json");

        let repo = DocumentRepository::new();
        repo.upsert_document("d1", record("alpha beta"));
        repo.save_to_cache(&path).unwrap();

        let restored = DocumentRepository::new();
        restored.load_from_cache(&path).unwrap();
        assert_eq!(restored.document_count(), 1);
        assert_eq!(
            restored.postings_snapshot(&["alpha".to_string()])["alpha"],
            vec!["d1".to_string()]
        );
    }

    #[test]
    fn test_snapshot_file_shape() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.json");

        let repo = DocumentRepository::new();
        repo.upsert_document("d1", record("hello"));
        repo.save_to_cache(&path).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(value.get("documents").is_some());
        assert!(value.get("index").is_some());
        assert_eq!(value["documents"]["d1"]["content"], "hello");
        assert_eq!(value["index"]["hello"][0], "d1");
    }

    #[test]
    fn test_binary_snapshot_refused() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.json");
        // Legacy pickle-style leading bytes.
        std::fs::write(&path, b"\x80\x04\x95\x00\x00").unwrap();

        let repo = DocumentRepository::new();
        let err = repo.load_from_cache(&path).unwrap_err();
        assert_eq!(err.kind(), "cache_invalid");
        assert_eq!(repo.document_count(), 0);
    }

    #[test]
    fn test_non_json_utf8_refused() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, "not json at all").unwrap();

        let repo = DocumentRepository::new();
        assert_eq!(
            repo.load_from_cache(&path).unwrap_err().kind(),
            "cache_invalid"
        );
    }

    #[test]
    fn test_missing_snapshot_is_io_error() {
        let repo = DocumentRepository::new();
        let err = repo.load_from_cache("/nonexistent/cache.json").unwrap_err();
        assert_eq!(err.kind(), "io");
    }
}
