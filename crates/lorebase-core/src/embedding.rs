//! Text embedding with LRU memoization.
//!
//! The actual model is an injected capability behind [`EmbeddingModel`]; the
//! built-in realizations are deterministic feature-hashing models (hashed
//! bag-of-words folded into the model dimension). Whatever the model
//! produces, [`Embedder`] L2-normalizes it, so downstream cosine math can
//! assume unit vectors.

use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::cache::LruCache;
use crate::error::{Error, Result};
use crate::similarity::l2_normalize;
use crate::text::{normalize_query, tokenize};

/// Known model identifiers and their embedding dimensions.
const MODEL_REGISTRY: &[(&str, usize)] = &[
    ("all-MiniLM-L6-v2", 384),
    ("all-mpnet-base-v2", 768),
    ("paraphrase-MiniLM-L3-v2", 384),
];

/// Capacity of the per-embedder memoization cache.
const EMBED_CACHE_CAPACITY: usize = 2048;

/// An embedding model: text in, fixed-dimension vector out.
///
/// Implementations must be thread-safe; multiple threads may call
/// `embed_batch` concurrently.
pub trait EmbeddingModel: Send + Sync {
    /// Model identifier (e.g. `all-MiniLM-L6-v2`).
    fn id(&self) -> &str;

    /// Output dimension. Constant for the lifetime of the model.
    fn dimension(&self) -> usize;

    /// Embeds a batch of texts, one vector per input, in input order.
    ///
    /// Outputs need not be normalized; the [`Embedder`] normalizes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Embedding`] on inference failure.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>>;
}

/// Deterministic feature-hashing model.
///
/// Tokens are hashed into `dimension` buckets with a sign bit, which gives a
/// cheap, reproducible bag-of-words embedding. Stands in for transformer
/// models in the default registry; real deployments inject their own
/// [`EmbeddingModel`].
pub struct HashingModel {
    id: String,
    dimension: usize,
}

impl HashingModel {
    /// Creates a hashing model with the given identifier and dimension.
    #[must_use]
    pub fn new(id: impl Into<String>, dimension: usize) -> Self {
        Self {
            id: id.into(),
            dimension,
        }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimension];
        for token in tokenize(text) {
            let mut hasher = rustc_hash::FxHasher::default();
            hasher.write(token.as_bytes());
            let h = hasher.finish();
            let bucket = (h % self.dimension as u64) as usize;
            let sign = if (h >> 32) & 1 == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }
        // Tokens can cancel out; keep the vector usable.
        if v.iter().all(|x| *x == 0.0) {
            v[0] = 1.0;
        }
        v
    }
}

impl EmbeddingModel for HashingModel {
    fn id(&self) -> &str {
        &self.id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

/// Resolves a model name against the built-in registry.
///
/// # Errors
///
/// Returns [`Error::Config`] for unknown model names.
pub fn resolve_model(name: &str) -> Result<Arc<dyn EmbeddingModel>> {
    MODEL_REGISTRY
        .iter()
        .find(|(id, _)| *id == name)
        .map(|(id, dim)| Arc::new(HashingModel::new(*id, *dim)) as Arc<dyn EmbeddingModel>)
        .ok_or_else(|| {
            Error::config(
                "embedding_model",
                format!("unsupported model '{name}'"),
            )
        })
}

/// Embedder statistics.
#[derive(Debug, Clone, Default)]
pub struct EmbedderStats {
    /// Vectors produced by the underlying model.
    pub embeddings_generated: u64,
    /// Memoization cache hits.
    pub cache_hits: u64,
    /// Memoization cache misses.
    pub cache_misses: u64,
    /// Total texts requested (hits + misses).
    pub total_queries: u64,
}

/// Memoizing embedder over an injected [`EmbeddingModel`].
///
/// Thread-safe: the cache is thread-safe and the model contract requires
/// thread-safe inference. No ordering guarantees across concurrent calls.
pub struct Embedder {
    model: Arc<dyn EmbeddingModel>,
    cache: LruCache<String, Arc<Vec<f32>>>,
    embeddings_generated: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    total_queries: AtomicU64,
}

impl std::fmt::Debug for Embedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Embedder")
            .field("model_id", &self.model.id())
            .finish()
    }
}

impl Embedder {
    /// Creates an embedder for a registered model name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the model name is not in the registry.
    pub fn new(model_name: &str) -> Result<Self> {
        Ok(Self::with_model(resolve_model(model_name)?))
    }

    /// Creates an embedder over an injected model.
    #[must_use]
    pub fn with_model(model: Arc<dyn EmbeddingModel>) -> Self {
        Self {
            model,
            cache: LruCache::new(EMBED_CACHE_CAPACITY),
            embeddings_generated: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            total_queries: AtomicU64::new(0),
        }
    }

    /// The embedding dimension of the underlying model.
    #[must_use]
    pub fn dimension(&self) -> usize {
        self.model.dimension()
    }

    /// Identifier of the underlying model.
    #[must_use]
    pub fn model_id(&self) -> &str {
        self.model.id()
    }

    /// Embeds a single text, returning a unit-normalized vector.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidInput`] for empty or whitespace-only text.
    /// - [`Error::Embedding`] if the model fails.
    pub fn embed(&self, text: &str) -> Result<Arc<Vec<f32>>> {
        if text.trim().is_empty() {
            return Err(Error::InvalidInput("cannot embed empty text".to_string()));
        }

        self.total_queries.fetch_add(1, Ordering::Relaxed);
        let key = Self::cache_key(text);

        if let Some(vector) = self.cache.get(&key) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(vector);
        }
        self.cache_misses.fetch_add(1, Ordering::Relaxed);

        let mut vectors = self.model.embed_batch(&[text])?;
        if vectors.len() != 1 {
            return Err(Error::Embedding(format!(
                "model returned {} vectors for 1 input",
                vectors.len()
            )));
        }
        let vector = self.finish_vector(vectors.remove(0))?;
        self.cache.put(key, Arc::clone(&vector));
        Ok(vector)
    }

    /// Embeds a batch, memoizing per text and batching model calls for the
    /// uncached remainder. Outputs are in input order.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidInput`] for an empty text or `batch_size == 0`.
    /// - [`Error::Embedding`] if the model fails.
    pub fn embed_batch(&self, texts: &[String], batch_size: usize) -> Result<Vec<Arc<Vec<f32>>>> {
        if batch_size == 0 {
            return Err(Error::InvalidInput("batch_size must be positive".to_string()));
        }
        for text in texts {
            if text.trim().is_empty() {
                return Err(Error::InvalidInput("cannot embed empty text".to_string()));
            }
        }

        self.total_queries
            .fetch_add(texts.len() as u64, Ordering::Relaxed);

        let mut outputs: Vec<Option<Arc<Vec<f32>>>> = vec![None; texts.len()];
        let mut uncached: Vec<(usize, String)> = Vec::new();

        for (i, text) in texts.iter().enumerate() {
            let key = Self::cache_key(text);
            if let Some(vector) = self.cache.get(&key) {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                outputs[i] = Some(vector);
            } else {
                self.cache_misses.fetch_add(1, Ordering::Relaxed);
                uncached.push((i, key));
            }
        }

        for chunk in uncached.chunks(batch_size) {
            let chunk_texts: Vec<&str> = chunk.iter().map(|(i, _)| texts[*i].as_str()).collect();
            let vectors = self.model.embed_batch(&chunk_texts)?;
            if vectors.len() != chunk.len() {
                return Err(Error::Embedding(format!(
                    "model returned {} vectors for {} inputs",
                    vectors.len(),
                    chunk.len()
                )));
            }
            for ((i, key), raw) in chunk.iter().zip(vectors) {
                let vector = self.finish_vector(raw)?;
                self.cache.put(key.clone(), Arc::clone(&vector));
                outputs[*i] = Some(vector);
            }
        }

        let mut vectors = Vec::with_capacity(outputs.len());
        for slot in outputs {
            match slot {
                Some(vector) => vectors.push(vector),
                None => {
                    return Err(Error::Internal(
                        "embedding batch left an unfilled slot".to_string(),
                    ))
                }
            }
        }
        Ok(vectors)
    }

    /// Embedder statistics.
    #[must_use]
    pub fn stats(&self) -> EmbedderStats {
        EmbedderStats {
            embeddings_generated: self.embeddings_generated.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            total_queries: self.total_queries.load(Ordering::Relaxed),
        }
    }

    /// Drops all memoized vectors.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    fn finish_vector(&self, mut vector: Vec<f32>) -> Result<Arc<Vec<f32>>> {
        if vector.len() != self.model.dimension() {
            return Err(Error::Embedding(format!(
                "model produced dimension {}, expected {}",
                vector.len(),
                self.model.dimension()
            )));
        }
        l2_normalize(&mut vector);
        self.embeddings_generated.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(vector))
    }

    fn cache_key(text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(normalize_query(text).as_bytes());
        hex::encode(hasher.finalize())
    }
}
