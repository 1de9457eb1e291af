//! # Datasmith - benchmark dataset builder
//!
//! Assembles a dataset of performance-improving commits for Python projects
//! that publish airspeed velocity (asv) benchmarks.
//!
//! Datasmith provides:
//! - GitHub scraping of repositories and commits, with a SQLite response cache
//! - Dashboard download and normalization into a serialized collection
//! - Containerized benchmark runs pinned to disjoint CPU sets
//! - Collation of per-commit results into publishable dashboards
//! - Breakpoint detection over benchmark time series (PELT/RBF and asv-style steps)
//! - Coverage and pull-request report enrichment of detected breakpoints

pub mod config;
pub mod storage;
pub mod http;
pub mod github;
pub mod codecov;
pub mod artifact;
pub mod repository;
pub mod commit;
pub mod collection;
pub mod dashboard;
pub mod docker;
pub mod collate;
pub mod detect;
pub mod report;
pub mod ui;

// Re-exports for convenient access
pub use collection::BenchmarkCollection;
pub use detect::{Breakpoint, DetectionMethod};
pub use github::GithubClient;
pub use storage::SqliteCache;

/// Result type alias for Datasmith operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Datasmith operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Unexpected status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("Rate limited while fetching {0}")]
    RateLimited(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Docker error: {0}")]
    Docker(String),

    #[error("Detection error: {0}")]
    Detection(String),

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),
}
