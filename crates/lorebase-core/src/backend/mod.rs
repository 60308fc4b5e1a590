//! Vector backend capability.
//!
//! A [`VectorStore`] is the process-wide client managing named collections;
//! a [`VectorBackend`] is one collection's operation surface (upsert, vector
//! query, keyword query, delete, count, health). Two realizations ship:
//!
//! - [`memory::EmbeddedStore`] — in-process exact-scan store, the default.
//! - [`sqlite::SqliteStore`] — SQLite-persisted records, exact-scan scoring.
//!
//! Both are exact (recall 1.0); the contract permits approximate
//! implementations provided they document recall.

pub mod memory;
pub mod sqlite;

pub use memory::EmbeddedStore;
pub use sqlite::SqliteStore;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::error::Result;
use crate::health::HealthStatus;

/// JSON-object metadata attached to documents and records.
pub type Metadata = serde_json::Map<String, Value>;

/// A stored vector record. The backend is the authoritative store of text
/// and metadata for vector-searchable documents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRecord {
    /// Document id, unique within a collection.
    pub id: String,
    /// L2-normalized embedding.
    pub embedding: Vec<f32>,
    /// Full document text.
    pub document: String,
    /// Document metadata.
    pub metadata: Metadata,
}

/// A single ranked search result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchHit {
    /// Document id.
    pub id: String,
    /// Relevance score; higher is better. Interpretation depends on the
    /// search mode that produced the hit.
    pub score: f32,
    /// Document metadata.
    pub metadata: Metadata,
}

/// One clause of a metadata predicate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
enum FilterClause {
    /// Field equals value.
    Equals {
        /// Metadata key.
        key: String,
        /// Expected value.
        value: Value,
    },
    /// Array-valued field contains value.
    Contains {
        /// Metadata key.
        key: String,
        /// Value that must appear in the array.
        value: Value,
    },
}

/// Equality/contains predicate over stored metadata. Clauses are ANDed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetadataFilter {
    clauses: Vec<FilterClause>,
}

impl MetadataFilter {
    /// Creates an empty filter that matches everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an equality clause.
    #[must_use]
    pub fn equals(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push(FilterClause::Equals {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    /// Adds an array-contains clause.
    #[must_use]
    pub fn contains(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push(FilterClause::Contains {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    /// Returns true if the filter has no clauses.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Evaluates the predicate against a metadata object.
    #[must_use]
    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.clauses.iter().all(|clause| match clause {
            FilterClause::Equals { key, value } => metadata.get(key) == Some(value),
            FilterClause::Contains { key, value } => metadata
                .get(key)
                .and_then(Value::as_array)
                .is_some_and(|items| items.contains(value)),
        })
    }
}

/// Backend health report.
#[derive(Debug, Clone, Serialize)]
pub struct BackendHealth {
    /// Healthy or unhealthy; backends never report degraded.
    pub status: HealthStatus,
    /// Collection name.
    pub collection: String,
    /// Current document count, when the backend is reachable.
    pub documents: Option<usize>,
    /// Free-form detail (store kind, location, failure reason).
    pub details: String,
}

/// One collection's operation surface.
///
/// Implementations must be thread-safe. Operations on a closed store fail
/// with [`crate::Error::NotInitialized`].
pub trait VectorBackend: Send + Sync {
    /// Upserts records by id. All four sequences must have equal length.
    ///
    /// # Errors
    ///
    /// - [`crate::Error::InvalidInput`] on mismatched lengths.
    /// - [`crate::Error::DimensionMismatch`] if an embedding's dimension
    ///   differs from the collection's established dimension.
    fn add(
        &self,
        ids: &[String],
        embeddings: &[Vec<f32>],
        documents: &[String],
        metadatas: &[Metadata],
    ) -> Result<()>;

    /// Returns up to `top_k` hits sorted by similarity descending, id
    /// ascending on ties. Similarity is `1 / (1 + d_cos)`.
    ///
    /// # Errors
    ///
    /// Returns a backend error on store failure.
    fn query_vector(
        &self,
        query: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchHit>>;

    /// Lexical ranking using the backend's native scoring (term match
    /// counts), sorted descending with id tiebreak.
    ///
    /// # Errors
    ///
    /// Returns a backend error on store failure.
    fn query_keyword(
        &self,
        text: &str,
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchHit>>;

    /// Fetches records by id, in input order; unknown ids are omitted.
    /// An empty `ids` slice fetches every record in the collection.
    ///
    /// # Errors
    ///
    /// Returns a backend error on store failure.
    fn get(&self, ids: &[String]) -> Result<Vec<VectorRecord>>;

    /// Deletes by id list and/or metadata predicate; at least one must be
    /// given. Returns the number of records removed.
    ///
    /// # Errors
    ///
    /// [`crate::Error::InvalidInput`] when neither ids nor filter is given.
    fn delete(&self, ids: Option<&[String]>, filter: Option<&MetadataFilter>) -> Result<usize>;

    /// Exact document count in the collection.
    ///
    /// # Errors
    ///
    /// Returns a backend error on store failure.
    fn count(&self) -> Result<usize>;

    /// Health report. Never fails; failures are reported in the status.
    fn health(&self) -> BackendHealth;

    /// Whether the backend can serve `query_keyword` natively. Engines fall
    /// back to the repository's inverted index when this is false.
    fn supports_keyword_search(&self) -> bool {
        true
    }
}

/// Process-wide client managing named collections.
pub trait VectorStore: Send + Sync {
    /// Creates a collection.
    ///
    /// # Errors
    ///
    /// [`crate::Error::CollectionExists`] if the name is taken.
    fn create_collection(&self, name: &str) -> Result<()>;

    /// Returns a handle to an existing collection.
    ///
    /// # Errors
    ///
    /// [`crate::Error::CollectionNotFound`] if absent.
    fn collection(&self, name: &str) -> Result<Arc<dyn VectorBackend>>;

    /// Returns a handle, creating the collection if needed.
    ///
    /// # Errors
    ///
    /// Returns a backend error on store failure.
    fn get_or_create_collection(&self, name: &str) -> Result<Arc<dyn VectorBackend>>;

    /// Deletes a collection and its records.
    ///
    /// # Errors
    ///
    /// [`crate::Error::CollectionNotFound`] if absent.
    fn delete_collection(&self, name: &str) -> Result<()>;

    /// Lists collection names, sorted.
    ///
    /// # Errors
    ///
    /// Returns a backend error on store failure.
    fn list_collections(&self) -> Result<Vec<String>>;

    /// Releases resources. Idempotent; subsequent operations fail with
    /// [`crate::Error::NotInitialized`].
    fn close(&self);
}

#[cfg(test)]
mod filter_tests {
    use super::*;
    use serde_json::json;

    fn meta(value: Value) -> Metadata {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let filter = MetadataFilter::new();
        assert!(filter.matches(&Metadata::new()));
        assert!(filter.matches(&meta(json!({"lang": "rust"}))));
    }

    #[test]
    fn test_equality_clause() {
        let filter = MetadataFilter::new().equals("lang", "rust");
        assert!(filter.matches(&meta(json!({"lang": "rust"}))));
        assert!(!filter.matches(&meta(json!({"lang": "python"}))));
        assert!(!filter.matches(&Metadata::new()));
    }

    #[test]
    fn test_contains_clause() {
        let filter = MetadataFilter::new().contains("tags", "audio");
        assert!(filter.matches(&meta(json!({"tags": ["audio", "dsp"]}))));
        assert!(!filter.matches(&meta(json!({"tags": ["video"]}))));
        // Non-array values never match a contains clause.
        assert!(!filter.matches(&meta(json!({"tags": "audio"}))));
    }

    #[test]
    fn test_clauses_are_anded() {
        let filter = MetadataFilter::new()
            .equals("lang", "rust")
            .contains("tags", "search");
        assert!(filter.matches(&meta(json!({"lang": "rust", "tags": ["search"]}))));
        assert!(!filter.matches(&meta(json!({"lang": "rust", "tags": []}))));
    }

    #[test]
    fn test_numeric_equality() {
        let filter = MetadataFilter::new().equals("version", 2);
        assert!(filter.matches(&meta(json!({"version": 2}))));
        assert!(!filter.matches(&meta(json!({"version": 3}))));
    }
}
