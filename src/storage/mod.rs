//! Storage Layer - SQLite-backed response cache
//!
//! System of record for every external lookup, so stages can be re-run
//! idempotently:
//! - cache(namespace, key, arguments, result, created_at)

pub mod schema;
pub mod cache;

pub use cache::{SqliteCache, CacheStats};
