//! Tokenization shared by indexing and keyword scoring.
//!
//! Terms are whitespace-separated tokens, lowercased. The same rule is used
//! when building the inverted index and when splitting queries, so postings
//! lookups always line up with indexed terms.

use std::collections::BTreeSet;

/// Splits text into lowercased whitespace-separated tokens.
pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split_whitespace().map(str::to_lowercase)
}

/// Returns the set of distinct terms in `text`, sorted.
#[must_use]
pub fn unique_terms(text: &str) -> BTreeSet<String> {
    tokenize(text).collect()
}

/// Normalizes a query for cache keys and embedding memoization.
#[must_use]
pub fn normalize_query(text: &str) -> String {
    text.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_lowercases_and_splits() {
        let tokens: Vec<String> = tokenize("Hello  World\nFOO").collect();
        assert_eq!(tokens, vec!["hello", "world", "foo"]);
    }

    #[test]
    fn test_unique_terms_dedup() {
        let terms = unique_terms("a b a B c");
        assert_eq!(terms.len(), 3);
        assert!(terms.contains("a"));
        assert!(terms.contains("b"));
        assert!(terms.contains("c"));
    }

    #[test]
    fn test_normalize_query_trims() {
        assert_eq!(normalize_query("  Machine Learning  "), "machine learning");
    }

    #[test]
    fn test_tokenize_empty() {
        assert_eq!(tokenize("   ").count(), 0);
    }
}
