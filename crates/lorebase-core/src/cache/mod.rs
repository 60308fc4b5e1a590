//! Caching layer for Lorebase.
//!
//! One primitive serves both uses in the system: per-project query-result
//! caching and embedding memoization.

mod lru;

pub use lru::{CacheStats, LruCache};
