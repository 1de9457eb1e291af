//! SQLite response cache

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use rusqlite::{Connection, params, OptionalExtension};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use crate::{Error, Result};
use super::schema;

/// SQLite-backed cache of external lookups, keyed by namespace and arguments.
///
/// The connection sits behind a mutex so one cache can be shared by every
/// concurrent request of a stage.
pub struct SqliteCache {
    conn: Mutex<Connection>,
}

impl SqliteCache {
    /// Open a database file (creates if doesn't exist)
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let cache = Self { conn: Mutex::new(conn) };
        cache.initialize_schema()?;
        Ok(cache)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let cache = Self { conn: Mutex::new(conn) };
        cache.initialize_schema()?;
        Ok(cache)
    }

    fn initialize_schema(&self) -> Result<()> {
        let conn = self.lock();
        for stmt in schema::all_schema_statements() {
            conn.execute(stmt, [])?;
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Look up a cached result. `Ok(None)` is a miss; a cached "nothing"
    /// comes back as `Some(Value::Null)`.
    pub fn get<A: Serialize>(&self, namespace: &str, arguments: &A) -> Result<Option<Value>> {
        validate_namespace(namespace)?;
        let arguments = serde_json::to_string(arguments)?;
        let key = cache_key(&arguments);

        let raw: Option<String> = self
            .lock()
            .query_row(
                "SELECT result FROM cache WHERE namespace = ?1 AND key = ?2",
                params![namespace, key],
                |row| row.get(0),
            )
            .optional()?;

        raw.map(|text| serde_json::from_str::<Value>(&text).map_err(Error::from)).transpose()
    }

    /// Typed variant of [`get`](Self::get).
    pub fn get_as<A: Serialize, T: DeserializeOwned>(&self, namespace: &str, arguments: &A) -> Result<Option<T>> {
        match self.get(namespace, arguments)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Insert or replace a cached result
    pub fn put<A: Serialize, T: Serialize>(&self, namespace: &str, arguments: &A, result: &T) -> Result<()> {
        validate_namespace(namespace)?;
        let arguments = serde_json::to_string(arguments)?;
        let key = cache_key(&arguments);
        let result = serde_json::to_string(result)?;

        self.lock().execute(
            r#"
            INSERT OR REPLACE INTO cache (namespace, key, arguments, result, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![namespace, key, arguments, result, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Count cached entries, optionally restricted to one namespace
    pub fn count(&self, namespace: Option<&str>) -> Result<usize> {
        let conn = self.lock();
        let count: i64 = match namespace {
            Some(ns) => conn.query_row("SELECT COUNT(*) FROM cache WHERE namespace = ?1", [ns], |row| row.get(0))?,
            None => conn.query_row("SELECT COUNT(*) FROM cache", [], |row| row.get(0))?,
        };
        Ok(count as usize)
    }

    /// Delete every entry of a namespace
    pub fn clear_namespace(&self, namespace: &str) -> Result<usize> {
        validate_namespace(namespace)?;
        let removed = self.lock().execute("DELETE FROM cache WHERE namespace = ?1", [namespace])?;
        Ok(removed)
    }

    /// Entry counts per namespace
    pub fn stats(&self) -> Result<CacheStats> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT namespace, COUNT(*) FROM cache GROUP BY namespace ORDER BY namespace"
        )?;

        let namespaces = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize)))?
            .filter_map(|r| r.ok())
            .collect();

        Ok(CacheStats { namespaces })
    }
}

fn cache_key(arguments: &str) -> String {
    blake3::hash(arguments.as_bytes()).to_hex().to_string()
}

fn validate_namespace(namespace: &str) -> Result<()> {
    let valid = !namespace.is_empty()
        && namespace.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!("Invalid cache namespace: {}", namespace)))
    }
}

/// Cache statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub namespaces: Vec<(String, usize)>,
}

impl CacheStats {
    pub fn total(&self) -> usize {
        self.namespaces.iter().map(|(_, n)| n).sum()
    }
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Cache Statistics:")?;
        for (namespace, count) in &self.namespaces {
            writeln!(f, "  {}: {}", namespace, count)?;
        }
        write!(f, "  Total: {}", self.total())
    }
}
