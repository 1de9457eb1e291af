//! Database schema definitions

/// SQL to create the cache table.
///
/// `key` is the blake3 hash of `arguments`; `result` holds JSON text
/// (`null` for lookups that legitimately returned nothing).
pub const CREATE_CACHE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS cache (
    namespace TEXT NOT NULL,
    key TEXT NOT NULL,
    arguments TEXT NOT NULL,
    result TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (namespace, key)
)
"#;

/// SQL to create indexes
pub const CREATE_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_cache_namespace ON cache(namespace)",
];

/// All schema creation statements
pub fn all_schema_statements() -> Vec<&'static str> {
    let mut stmts = vec![CREATE_CACHE_TABLE];
    stmts.extend(CREATE_INDEXES.iter().copied());
    stmts
}
