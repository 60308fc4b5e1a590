//! In-process embedded vector store, the default backend.
//!
//! Exact scan over all records (recall 1.0). Keyword scoring counts distinct
//! query terms per document, against token sets computed once at insert.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::health::HealthStatus;
use crate::similarity::{cosine_distance, distance_to_score};
use crate::text::unique_terms;

use super::{BackendHealth, Metadata, MetadataFilter, SearchHit, VectorBackend, VectorRecord};

struct StoredRecord {
    record: VectorRecord,
    terms: std::collections::BTreeSet<String>,
}

#[derive(Default)]
struct CollectionInner {
    /// Established on first insert; constant afterwards.
    dimension: Option<usize>,
    records: BTreeMap<String, StoredRecord>,
}

/// One in-process collection.
pub struct EmbeddedCollection {
    name: String,
    closed: Arc<AtomicBool>,
    inner: RwLock<CollectionInner>,
}

impl EmbeddedCollection {
    fn new(name: String, closed: Arc<AtomicBool>) -> Self {
        Self {
            name,
            closed,
            inner: RwLock::new(CollectionInner::default()),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::NotInitialized(format!(
                "store for collection '{}' is closed",
                self.name
            )));
        }
        Ok(())
    }
}

impl VectorBackend for EmbeddedCollection {
    fn add(
        &self,
        ids: &[String],
        embeddings: &[Vec<f32>],
        documents: &[String],
        metadatas: &[Metadata],
    ) -> Result<()> {
        self.ensure_open()?;
        if ids.len() != embeddings.len()
            || ids.len() != documents.len()
            || ids.len() != metadatas.len()
        {
            return Err(Error::InvalidInput(format!(
                "mismatched lengths: {} ids, {} embeddings, {} documents, {} metadatas",
                ids.len(),
                embeddings.len(),
                documents.len(),
                metadatas.len()
            )));
        }

        let mut inner = self.inner.write();
        for (((id, embedding), document), metadata) in ids
            .iter()
            .zip(embeddings)
            .zip(documents)
            .zip(metadatas)
        {
            match inner.dimension {
                None => inner.dimension = Some(embedding.len()),
                Some(expected) if expected != embedding.len() => {
                    return Err(Error::DimensionMismatch {
                        expected,
                        actual: embedding.len(),
                    });
                }
                Some(_) => {}
            }

            inner.records.insert(
                id.clone(),
                StoredRecord {
                    record: VectorRecord {
                        id: id.clone(),
                        embedding: embedding.clone(),
                        document: document.clone(),
                        metadata: metadata.clone(),
                    },
                    terms: unique_terms(document),
                },
            );
        }
        Ok(())
    }

    fn query_vector(
        &self,
        query: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchHit>> {
        self.ensure_open()?;
        let inner = self.inner.read();

        if let Some(expected) = inner.dimension {
            if expected != query.len() {
                return Err(Error::DimensionMismatch {
                    expected,
                    actual: query.len(),
                });
            }
        }

        let mut hits: Vec<SearchHit> = inner
            .records
            .values()
            .filter(|stored| {
                filter.is_none_or(|f| f.matches(&stored.record.metadata))
            })
            .map(|stored| SearchHit {
                id: stored.record.id.clone(),
                score: distance_to_score(cosine_distance(query, &stored.record.embedding)),
                metadata: stored.record.metadata.clone(),
            })
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        hits.truncate(top_k);
        Ok(hits)
    }

    fn query_keyword(
        &self,
        text: &str,
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchHit>> {
        self.ensure_open()?;
        let query_terms = unique_terms(text);
        if query_terms.is_empty() {
            return Ok(Vec::new());
        }

        let inner = self.inner.read();
        let mut hits: Vec<SearchHit> = inner
            .records
            .values()
            .filter(|stored| {
                filter.is_none_or(|f| f.matches(&stored.record.metadata))
            })
            .filter_map(|stored| {
                let matched = query_terms
                    .iter()
                    .filter(|term| stored.terms.contains(*term))
                    .count();
                if matched == 0 {
                    return None;
                }
                #[allow(clippy::cast_precision_loss)]
                Some(SearchHit {
                    id: stored.record.id.clone(),
                    score: matched as f32,
                    metadata: stored.record.metadata.clone(),
                })
            })
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        hits.truncate(top_k);
        Ok(hits)
    }

    fn get(&self, ids: &[String]) -> Result<Vec<VectorRecord>> {
        self.ensure_open()?;
        let inner = self.inner.read();
        if ids.is_empty() {
            return Ok(inner.records.values().map(|s| s.record.clone()).collect());
        }
        Ok(ids
            .iter()
            .filter_map(|id| inner.records.get(id).map(|s| s.record.clone()))
            .collect())
    }

    fn delete(&self, ids: Option<&[String]>, filter: Option<&MetadataFilter>) -> Result<usize> {
        self.ensure_open()?;
        if ids.is_none() && filter.is_none() {
            return Err(Error::InvalidInput(
                "delete requires ids or a metadata filter".to_string(),
            ));
        }

        let mut inner = self.inner.write();
        let victims: Vec<String> = match ids {
            Some(ids) => ids
                .iter()
                .filter(|id| {
                    inner.records.get(*id).is_some_and(|stored| {
                        filter.is_none_or(|f| f.matches(&stored.record.metadata))
                    })
                })
                .cloned()
                .collect(),
            None => inner
                .records
                .values()
                .filter(|stored| {
                    filter.is_none_or(|f| f.matches(&stored.record.metadata))
                })
                .map(|stored| stored.record.id.clone())
                .collect(),
        };

        for id in &victims {
            inner.records.remove(id);
        }
        Ok(victims.len())
    }

    fn count(&self) -> Result<usize> {
        self.ensure_open()?;
        Ok(self.inner.read().records.len())
    }

    fn health(&self) -> BackendHealth {
        if self.closed.load(Ordering::Acquire) {
            return BackendHealth {
                status: HealthStatus::Unhealthy,
                collection: self.name.clone(),
                documents: None,
                details: "embedded store closed".to_string(),
            };
        }
        BackendHealth {
            status: HealthStatus::Healthy,
            collection: self.name.clone(),
            documents: Some(self.inner.read().records.len()),
            details: "embedded store".to_string(),
        }
    }
}

/// In-process store managing named collections.
pub struct EmbeddedStore {
    collections: RwLock<HashMap<String, Arc<EmbeddedCollection>>>,
    closed: Arc<AtomicBool>,
}

impl EmbeddedStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::NotInitialized("embedded store is closed".to_string()));
        }
        Ok(())
    }
}

impl Default for EmbeddedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl super::VectorStore for EmbeddedStore {
    fn create_collection(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        let mut collections = self.collections.write();
        if collections.contains_key(name) {
            return Err(Error::CollectionExists(name.to_string()));
        }
        collections.insert(
            name.to_string(),
            Arc::new(EmbeddedCollection::new(
                name.to_string(),
                Arc::clone(&self.closed),
            )),
        );
        Ok(())
    }

    fn collection(&self, name: &str) -> Result<Arc<dyn VectorBackend>> {
        self.ensure_open()?;
        self.collections
            .read()
            .get(name)
            .map(|c| Arc::clone(c) as Arc<dyn VectorBackend>)
            .ok_or_else(|| Error::CollectionNotFound(name.to_string()))
    }

    fn get_or_create_collection(&self, name: &str) -> Result<Arc<dyn VectorBackend>> {
        self.ensure_open()?;
        let mut collections = self.collections.write();
        let collection = collections.entry(name.to_string()).or_insert_with(|| {
            Arc::new(EmbeddedCollection::new(
                name.to_string(),
                Arc::clone(&self.closed),
            ))
        });
        Ok(Arc::clone(collection) as Arc<dyn VectorBackend>)
    }

    fn delete_collection(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        if self.collections.write().remove(name).is_none() {
            return Err(Error::CollectionNotFound(name.to_string()));
        }
        Ok(())
    }

    fn list_collections(&self) -> Result<Vec<String>> {
        self.ensure_open()?;
        let mut names: Vec<String> = self.collections.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.collections.write().clear();
    }
}
