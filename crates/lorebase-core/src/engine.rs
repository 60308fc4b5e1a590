//! Hybrid query engine: vector search, keyword search, Reciprocal Rank
//! Fusion, and MMR re-ranking.
//!
//! The query path never holds repository locks while scoring: posting lists
//! are copied out in one snapshot read and all ranking happens on the copy.

use rustc_hash::FxHashMap;
use std::sync::Arc;

use crate::backend::{Metadata, SearchHit, VectorBackend};
use crate::config::SearchMode;
use crate::embedding::Embedder;
use crate::error::{Error, Result};
use crate::repository::DocumentRepository;
use crate::similarity::cosine_similarity;
use crate::text::unique_terms;

/// The RRF smoothing constant (Cormack et al.).
pub const RRF_K: f32 = 60.0;

/// Default vector-vs-keyword weight for hybrid search.
pub const DEFAULT_ALPHA: f32 = 0.7;

/// Minimum candidate-set size used when expanding searches for fusion.
const MIN_CANDIDATES: usize = 20;

/// Hybrid query engine over one project's backend collection and repository.
pub struct HybridQueryEngine {
    embedder: Arc<Embedder>,
    backend: Arc<dyn VectorBackend>,
    repository: Arc<DocumentRepository>,
}

impl HybridQueryEngine {
    /// Wires an engine over its three collaborators.
    #[must_use]
    pub fn new(
        embedder: Arc<Embedder>,
        backend: Arc<dyn VectorBackend>,
        repository: Arc<DocumentRepository>,
    ) -> Self {
        Self {
            embedder,
            backend,
            repository,
        }
    }

    /// Dense-vector search: embed the query once, scan the backend.
    ///
    /// An empty or whitespace-only query returns no results (not an error).
    ///
    /// # Errors
    ///
    /// - [`Error::Embedding`] if query embedding fails.
    /// - Backend errors are propagated.
    pub fn search_vector(&self, text: &str, top_k: usize) -> Result<Vec<SearchHit>> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let query = self.embedder.embed(text)?;
        self.backend.query_vector(&query, top_k, None)
    }

    /// Keyword search. Delegates to the backend's native scoring when
    /// available, otherwise ranks match counts over repository posting
    /// snapshots.
    ///
    /// # Errors
    ///
    /// Backend errors are propagated.
    pub fn search_keyword(&self, text: &str, top_k: usize) -> Result<Vec<SearchHit>> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        if self.backend.supports_keyword_search() {
            self.backend.query_keyword(text, top_k, None)
        } else {
            Ok(self.lexical_search(text, top_k))
        }
    }

    /// Lexical search over the repository's inverted index: tokenize, copy
    /// the relevant posting lists, rank by per-document match count with an
    /// ascending-id tiebreak. Used as the keyword fallback and as the legacy
    /// non-vector query path.
    #[must_use]
    pub fn lexical_search(&self, text: &str, top_k: usize) -> Vec<SearchHit> {
        let terms: Vec<String> = unique_terms(text).into_iter().collect();
        if terms.is_empty() {
            return Vec::new();
        }

        // Brief snapshot read; scoring happens on the copy.
        let postings = self.repository.postings_snapshot(&terms);

        let mut counts: FxHashMap<String, usize> = FxHashMap::default();
        for ids in postings.values() {
            for id in ids {
                *counts.entry(id.clone()).or_insert(0) += 1;
            }
        }

        #[allow(clippy::cast_precision_loss)]
        let mut hits: Vec<SearchHit> = counts
            .into_iter()
            .map(|(id, count)| {
                let metadata = self
                    .repository
                    .get_document(&id)
                    .map(|doc| {
                        let mut metadata = Metadata::new();
                        metadata.insert("name".to_string(), doc.name.into());
                        metadata.insert("path".to_string(), doc.path.into());
                        metadata.insert("kb_dir".to_string(), doc.kb_dir.into());
                        metadata
                    })
                    .unwrap_or_default();
                SearchHit {
                    id,
                    score: count as f32,
                    metadata,
                }
            })
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        hits.truncate(top_k);
        hits
    }

    /// Hybrid search via Reciprocal Rank Fusion.
    ///
    /// Both underlying searches are expanded to `max(20, top_k)` candidates.
    /// `alpha` weights the vector list; `1 - alpha` the keyword list. The
    /// boundary values bypass fusion entirely: `alpha == 1.0` is pure vector
    /// ranking, `alpha == 0.0` pure keyword ranking.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidInput`] if `alpha` is outside `[0, 1]`.
    /// - Embedding and backend errors are propagated.
    pub fn search_hybrid(&self, text: &str, top_k: usize, alpha: f32) -> Result<Vec<SearchHit>> {
        if !(0.0..=1.0).contains(&alpha) {
            return Err(Error::InvalidInput(format!(
                "alpha must be in [0, 1], got {alpha}"
            )));
        }
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        if alpha == 1.0 {
            return self.search_vector(text, top_k);
        }
        if alpha == 0.0 {
            return self.search_keyword(text, top_k);
        }

        let pool = MIN_CANDIDATES.max(top_k);
        let vector_hits = self.search_vector(text, pool)?;
        let keyword_hits = self.search_keyword(text, pool)?;

        let mut fused = fuse_rrf(&vector_hits, &keyword_hits, alpha);
        fused.truncate(top_k);
        Ok(fused)
    }

    /// MMR re-ranking over the candidates of one of the three modes.
    ///
    /// Greedily selects the candidate maximizing
    /// `lambda * rel - (1 - lambda) * max_sim_to_selected`, where `rel` is
    /// the candidate's score min-max normalized to `[0, 1]` and similarity
    /// is cosine over the stored embeddings. Candidates whose embeddings
    /// cannot be resolved contribute zero similarity.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidInput`] if `lambda` is outside `[0, 1]`.
    /// - Embedding and backend errors are propagated.
    pub fn search_with_mmr(
        &self,
        text: &str,
        top_k: usize,
        lambda: f32,
        mode: SearchMode,
    ) -> Result<Vec<SearchHit>> {
        if !(0.0..=1.0).contains(&lambda) {
            return Err(Error::InvalidInput(format!(
                "lambda must be in [0, 1], got {lambda}"
            )));
        }
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let pool = MIN_CANDIDATES.max(top_k.saturating_mul(2));
        let candidates = match mode {
            SearchMode::Vector => self.search_vector(text, pool)?,
            SearchMode::Keyword => self.search_keyword(text, pool)?,
            SearchMode::Hybrid => self.search_hybrid(text, pool, DEFAULT_ALPHA)?,
        };
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = candidates.iter().map(|hit| hit.id.clone()).collect();
        let embeddings: FxHashMap<String, Vec<f32>> = self
            .backend
            .get(&ids)?
            .into_iter()
            .map(|record| (record.id, record.embedding))
            .collect();

        // Relevance normalized to [0, 1] over the candidate pool.
        let (min, max) = candidates.iter().fold((f32::MAX, f32::MIN), |(lo, hi), h| {
            (lo.min(h.score), hi.max(h.score))
        });
        let rel: Vec<f32> = candidates
            .iter()
            .map(|hit| {
                if max > min {
                    (hit.score - min) / (max - min)
                } else {
                    1.0
                }
            })
            .collect();

        let mut selected: Vec<usize> = Vec::with_capacity(top_k.min(candidates.len()));
        let mut remaining: Vec<usize> = (0..candidates.len()).collect();

        while selected.len() < top_k && !remaining.is_empty() {
            let mut best_pos = 0;
            let mut best_score = f32::MIN;
            for (pos, &candidate) in remaining.iter().enumerate() {
                let penalty = if selected.is_empty() {
                    0.0
                } else {
                    selected
                        .iter()
                        .map(|&chosen| {
                            match (
                                embeddings.get(&candidates[candidate].id),
                                embeddings.get(&candidates[chosen].id),
                            ) {
                                (Some(a), Some(b)) => cosine_similarity(a, b),
                                _ => 0.0,
                            }
                        })
                        .fold(f32::MIN, f32::max)
                };
                let mmr = lambda * rel[candidate] - (1.0 - lambda) * penalty;
                if mmr > best_score
                    || (mmr == best_score
                        && candidates[candidate].id < candidates[remaining[best_pos]].id)
                {
                    best_score = mmr;
                    best_pos = pos;
                }
            }
            selected.push(remaining.swap_remove(best_pos));
        }

        Ok(selected.into_iter().map(|i| candidates[i].clone()).collect())
    }
}

/// Reciprocal Rank Fusion of two ranked lists.
///
/// A document absent from one list is assigned the sentinel rank
/// `list_len + 1`, which always exceeds every real rank in that list.
/// Output is sorted by fused score descending with a stable ascending-id
/// tiebreak; the caller truncates.
pub(crate) fn fuse_rrf(
    vector_hits: &[SearchHit],
    keyword_hits: &[SearchHit],
    alpha: f32,
) -> Vec<SearchHit> {
    let sentinel_vector = vector_hits.len() + 1;
    let sentinel_keyword = keyword_hits.len() + 1;

    let mut vector_ranks: FxHashMap<&str, usize> = FxHashMap::default();
    for (rank, hit) in vector_hits.iter().enumerate() {
        vector_ranks.insert(hit.id.as_str(), rank + 1);
    }
    let mut keyword_ranks: FxHashMap<&str, usize> = FxHashMap::default();
    for (rank, hit) in keyword_hits.iter().enumerate() {
        keyword_ranks.insert(hit.id.as_str(), rank + 1);
    }

    // Union of both candidate sets; vector metadata wins when both carry it.
    let mut union: FxHashMap<&str, &Metadata> = FxHashMap::default();
    for hit in keyword_hits {
        union.insert(hit.id.as_str(), &hit.metadata);
    }
    for hit in vector_hits {
        union.insert(hit.id.as_str(), &hit.metadata);
    }

    #[allow(clippy::cast_precision_loss)]
    let mut fused: Vec<SearchHit> = union
        .into_iter()
        .map(|(id, metadata)| {
            let rank_vector = vector_ranks.get(id).copied().unwrap_or(sentinel_vector);
            let rank_keyword = keyword_ranks.get(id).copied().unwrap_or(sentinel_keyword);
            let score = alpha / (RRF_K + rank_vector as f32)
                + (1.0 - alpha) / (RRF_K + rank_keyword as f32);
            SearchHit {
                id: id.to_string(),
                score,
                metadata: metadata.clone(),
            }
        })
        .collect();

    fused.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
    fused
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{EmbeddedStore, VectorStore};
    use proptest::prelude::*;

    fn hit(id: &str, score: f32) -> SearchHit {
        SearchHit {
            id: id.to_string(),
            score,
            metadata: Metadata::new(),
        }
    }

    fn engine_with_docs(docs: &[(&str, &str)]) -> HybridQueryEngine {
        let embedder = Arc::new(Embedder::new("all-MiniLM-L6-v2").unwrap());
        let store = EmbeddedStore::new();
        let backend = store.get_or_create_collection("kb").unwrap();
        let repository = Arc::new(DocumentRepository::new());

        let ids: Vec<String> = docs.iter().map(|(id, _)| (*id).to_string()).collect();
        let contents: Vec<String> = docs.iter().map(|(_, c)| (*c).to_string()).collect();
        let embeddings: Vec<Vec<f32>> = contents
            .iter()
            .map(|c| embedder.embed(c).unwrap().as_ref().clone())
            .collect();
        let metadatas = vec![Metadata::new(); docs.len()];
        backend
            .add(&ids, &embeddings, &contents, &metadatas)
            .unwrap();

        for (id, content) in docs {
            repository.upsert_document(
                id,
                crate::repository::DocumentRecord {
                    path: String::new(),
                    content: (*content).to_string(),
                    name: (*id).to_string(),
                    kb_dir: String::new(),
                },
            );
        }

        HybridQueryEngine::new(embedder, backend, repository)
    }

    const DOCS: &[(&str, &str)] = &[
        ("d1", "python programming language"),
        ("d2", "javascript web"),
        ("d3", "machine learning data"),
    ];

    #[test]
    fn test_empty_query_all_modes() {
        let engine = engine_with_docs(DOCS);
        assert!(engine.search_vector("", 5).unwrap().is_empty());
        assert!(engine.search_keyword("   ", 5).unwrap().is_empty());
        assert!(engine.search_hybrid("", 5, 0.5).unwrap().is_empty());
        assert!(engine
            .search_with_mmr("\t", 5, 0.5, SearchMode::Hybrid)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_alpha_out_of_range_rejected() {
        let engine = engine_with_docs(DOCS);
        assert_eq!(
            engine.search_hybrid("q", 5, 1.5).unwrap_err().kind(),
            "invalid_input"
        );
        assert_eq!(
            engine.search_hybrid("q", 5, -0.1).unwrap_err().kind(),
            "invalid_input"
        );
        assert_eq!(
            engine
                .search_with_mmr("q", 5, 2.0, SearchMode::Vector)
                .unwrap_err()
                .kind(),
            "invalid_input"
        );
    }

    #[test]
    fn test_keyword_exact_match_wins() {
        let engine = engine_with_docs(DOCS);
        let hits = engine.search_keyword("python", 5).unwrap();
        assert_eq!(hits[0].id, "d1");
    }

    #[test]
    fn test_hybrid_surfaces_lexical_match() {
        let engine = engine_with_docs(DOCS);
        let hits = engine.search_hybrid("python", 3, 0.5).unwrap();
        assert_eq!(hits[0].id, "d1");
    }

    #[test]
    fn test_hybrid_machine_learning_scenario() {
        let engine = engine_with_docs(DOCS);
        let hits = engine.search_hybrid("machine learning", 2, DEFAULT_ALPHA).unwrap();
        assert_eq!(hits[0].id, "d3");
        assert!(hits.len() <= 2);
    }

    #[test]
    fn test_alpha_boundaries_match_pure_modes() {
        let engine = engine_with_docs(DOCS);
        let keyword = engine.search_keyword("python programming", 3).unwrap();
        let vector = engine.search_vector("python programming", 3).unwrap();

        let alpha0 = engine.search_hybrid("python programming", 3, 0.0).unwrap();
        let alpha1 = engine.search_hybrid("python programming", 3, 1.0).unwrap();

        let ids = |hits: &[SearchHit]| hits.iter().map(|h| h.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&alpha0), ids(&keyword));
        assert_eq!(ids(&alpha1), ids(&vector));
    }

    #[test]
    fn test_fuse_rrf_matches_direct_formula() {
        let vector = vec![hit("a", 0.9), hit("b", 0.8), hit("c", 0.7)];
        let keyword = vec![hit("b", 3.0), hit("d", 2.0)];
        let alpha = 0.7;

        let fused = fuse_rrf(&vector, &keyword, alpha);

        let expect = |rv: usize, rk: usize| {
            alpha / (60.0 + rv as f32) + (1.0 - alpha) / (60.0 + rk as f32)
        };
        // Sentinels: vector list len 3 -> 4; keyword list len 2 -> 3.
        let expected = [
            ("a", expect(1, 3)),
            ("b", expect(2, 1)),
            ("c", expect(3, 3)),
            ("d", expect(4, 2)),
        ];

        for (id, score) in expected {
            let found = fused.iter().find(|h| h.id == id).unwrap();
            assert!(
                (found.score - score).abs() < 1e-6,
                "{id}: {} vs {score}",
                found.score
            );
        }
        // b leads: rank 2 in vector and rank 1 in keyword.
        assert_eq!(fused[0].id, "b");
    }

    #[test]
    fn test_fuse_rrf_tiebreak_is_id_order() {
        // Two docs with identical ranks in symmetric lists tie on score.
        let vector = vec![hit("b", 0.5), hit("a", 0.5)];
        let keyword = vec![hit("a", 1.0), hit("b", 1.0)];
        let fused = fuse_rrf(&vector, &keyword, 0.5);
        assert_eq!(fused[0].id, "a");
        assert_eq!(fused[1].id, "b");
    }

    #[test]
    fn test_mmr_lambda_one_is_pure_relevance() {
        let engine = engine_with_docs(DOCS);
        let plain = engine.search_vector("machine learning data", 3).unwrap();
        let mmr = engine
            .search_with_mmr("machine learning data", 3, 1.0, SearchMode::Vector)
            .unwrap();
        assert_eq!(mmr[0].id, plain[0].id);
        assert_eq!(mmr.len(), 3);
    }

    #[test]
    fn test_mmr_penalizes_near_duplicates() {
        // Two near-identical docs and one distinct doc. With low lambda the
        // distinct doc must enter the top 2.
        let engine = engine_with_docs(&[
            ("dup1", "rust memory safety borrow checker"),
            ("dup2", "rust memory safety borrow checker"),
            ("other", "gardening tips for spring"),
        ]);
        let mmr = engine
            .search_with_mmr("rust memory safety", 2, 0.3, SearchMode::Vector)
            .unwrap();
        assert_eq!(mmr.len(), 2);
        assert!(
            mmr.iter().any(|h| h.id == "other"),
            "diversity pick missing: {:?}",
            mmr.iter().map(|h| &h.id).collect::<Vec<_>>()
        );
    }

    proptest! {
        /// Every fused score equals the direct RRF formula with k = 60 and
        /// sentinel rank `list_len + 1`, the output stays sorted, and the
        /// result covers exactly the union of both candidate sets.
        #[test]
        #[allow(clippy::cast_precision_loss)]
        fn prop_fused_scores_match_formula(
            v_len in 0usize..8,
            k_len in 0usize..8,
            alpha in 0.01f32..0.99,
        ) {
            let vector: Vec<SearchHit> = (0..v_len)
                .map(|i| hit(&format!("v{i}"), 1.0 - i as f32 * 0.1))
                .collect();
            // Odd keyword entries overlap with the vector list.
            let keyword: Vec<SearchHit> = (0..k_len)
                .map(|i| {
                    let id = if i % 2 == 0 { format!("k{i}") } else { format!("v{i}") };
                    hit(&id, 5.0 - i as f32)
                })
                .collect();

            let fused = fuse_rrf(&vector, &keyword, alpha);

            for hit in &fused {
                let rank_v = vector
                    .iter()
                    .position(|h| h.id == hit.id)
                    .map_or(vector.len() + 1, |p| p + 1);
                let rank_k = keyword
                    .iter()
                    .position(|h| h.id == hit.id)
                    .map_or(keyword.len() + 1, |p| p + 1);
                let expected = alpha / (60.0 + rank_v as f32)
                    + (1.0 - alpha) / (60.0 + rank_k as f32);
                prop_assert!((hit.score - expected).abs() < 1e-6);
            }

            for pair in fused.windows(2) {
                prop_assert!(pair[0].score >= pair[1].score);
            }

            let mut union: Vec<&str> = vector
                .iter()
                .chain(keyword.iter())
                .map(|h| h.id.as_str())
                .collect();
            union.sort_unstable();
            union.dedup();
            prop_assert_eq!(fused.len(), union.len());
        }
    }

    #[test]
    fn test_lexical_search_counts_and_tiebreak() {
        let engine = engine_with_docs(&[
            ("a", "apple banana"),
            ("b", "apple banana"),
            ("c", "apple"),
        ]);
        let hits = engine.lexical_search("apple banana", 10);
        assert_eq!(hits.len(), 3);
        // a and b both match 2 terms; ascending id breaks the tie.
        assert_eq!(hits[0].id, "a");
        assert_eq!(hits[1].id, "b");
        assert_eq!(hits[2].id, "c");
        assert!((hits[0].score - 2.0).abs() < f32::EPSILON);
        assert!((hits[2].score - 1.0).abs() < f32::EPSILON);
    }
}
