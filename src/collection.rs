//! Serialized benchmark collection
//!
//! A [`BenchmarkCollection`] holds everything known about one dashboard:
//! the raw `index.json`, per-machine timings, summary timings and whatever
//! later stages attach (breakpoints, coverage, reports).

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use crate::codecov::CoverageRow;
use crate::detect::Breakpoint;
use crate::report::{EnrichedBreakpoint, ReportRow};
use crate::Result;

pub const COLLECTION_SUFFIX: &str = ".fc.json";

/// Contents of a dashboard's `index.json`. Keys this crate does not use are
/// kept in `extra` so the index survives a save/load cycle intact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DashboardIndex {
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub project_url: Option<String>,
    #[serde(default)]
    pub show_commit_url: Option<String>,
    #[serde(default)]
    pub hash_length: Option<u32>,
    #[serde(default)]
    pub revision_to_hash: BTreeMap<String, String>,
    /// Commit dates in milliseconds since the epoch
    #[serde(default)]
    pub revision_to_date: BTreeMap<String, Value>,
    /// Parameter name → observed values (`machine`, `python`, `branch`, ...)
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
    /// One entry per graph directory
    #[serde(default)]
    pub graph_param_list: Vec<BTreeMap<String, Value>>,
    #[serde(default)]
    pub benchmarks: Value,
    #[serde(default)]
    pub machines: Value,
    #[serde(default)]
    pub tags: Value,
    #[serde(default)]
    pub pages: Value,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl DashboardIndex {
    /// Parameter names in sorted order
    pub fn param_keys(&self) -> Vec<String> {
        self.params.keys().cloned().collect()
    }

    /// Benchmark names, whether `benchmarks` is a map or a list
    pub fn benchmark_names(&self) -> Vec<String> {
        match &self.benchmarks {
            Value::Object(map) => map.keys().cloned().collect(),
            Value::Array(items) => items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect(),
            _ => Vec::new(),
        }
    }

    pub fn hash_for(&self, revision: i64) -> Option<String> {
        self.revision_to_hash.get(&revision.to_string()).cloned()
    }

    pub fn date_for(&self, revision: i64) -> Option<i64> {
        self.revision_to_date.get(&revision.to_string()).and_then(Value::as_i64)
    }

    /// Commit page URL for a hash, if the dashboard links commits at all
    pub fn commit_url(&self, hash: &str) -> Option<String> {
        let base = self.show_commit_url.as_deref()?.trim_end_matches('/');
        if base.is_empty() {
            return None;
        }
        Some(format!("{}/{}", base, hash))
    }
}

/// A single timing of one benchmark on one machine/environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkRow {
    pub revision: i64,
    /// `None` when the run failed or was skipped
    pub time: Option<f64>,
    pub hash: Option<String>,
    pub date: Option<i64>,
    pub benchmark: String,
    pub machine: Option<String>,
    /// Graph directory the row came from, e.g. `branch-main/machine-x/python-3.11`
    pub environment: String,
}

/// Aggregate timing of one benchmark across environments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRow {
    pub revision: i64,
    pub time: Option<f64>,
    pub hash: Option<String>,
    pub date: Option<i64>,
    pub benchmark: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkCollection {
    /// Dashboard root the data was read from (URL or local directory)
    pub base_url: String,
    pub collected_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub param_keys: Vec<String>,
    #[serde(default)]
    pub index: DashboardIndex,
    #[serde(default)]
    pub benchmarks: Vec<BenchmarkRow>,
    #[serde(default)]
    pub summaries: Vec<SummaryRow>,
    #[serde(default)]
    pub breakpoints: Vec<Breakpoint>,
    #[serde(default)]
    pub coverage: Vec<CoverageRow>,
    #[serde(default, alias = "comments")]
    pub reports: Vec<ReportRow>,
    #[serde(default)]
    pub enriched_breakpoints: Vec<EnrichedBreakpoint>,
}

impl BenchmarkCollection {
    pub fn new(base_url: &str, index: DashboardIndex) -> Self {
        let now = Utc::now();
        Self {
            base_url: base_url.to_string(),
            collected_at: now,
            modified_at: now,
            param_keys: index.param_keys(),
            index,
            benchmarks: Vec::new(),
            summaries: Vec::new(),
            breakpoints: Vec::new(),
            coverage: Vec::new(),
            reports: Vec::new(),
            enriched_breakpoints: Vec::new(),
        }
    }

    /// Write the collection, forcing the `.fc.json` suffix.
    /// Returns the path actually written.
    pub fn save(&mut self, path: &Path) -> Result<PathBuf> {
        self.modified_at = Utc::now();
        let path = collection_path(path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut writer = BufWriter::new(File::create(&path)?);
        serde_json::to_writer(&mut writer, self)?;
        writer.flush()?;
        tracing::debug!("Saved collection to {}", path.display());
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }
}

/// `dashboard`, `dashboard.json`, `dashboard.fc.pkl` → `dashboard.fc.json`
pub fn collection_path(path: &Path) -> PathBuf {
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    if name.ends_with(COLLECTION_SUFFIX) {
        return path.to_path_buf();
    }
    let stem = name
        .strip_suffix(".json")
        .or_else(|| name.strip_suffix(".pkl"))
        .unwrap_or(&name);
    let stem = stem.strip_suffix(".fc").unwrap_or(stem);
    path.with_file_name(format!("{}{}", stem, COLLECTION_SUFFIX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn sample_index() -> DashboardIndex {
        serde_json::from_value(json!({
            "project": "demo",
            "show_commit_url": "https://github.com/o/r/commit/",
            "revision_to_hash": {"1": "aaa", "2": "bbb"},
            "revision_to_date": {"1": 1700000000000i64, "2": 1700000100000i64},
            "params": {"python": ["3.11"], "machine": ["m1"]},
            "graph_param_list": [{"machine": "m1", "python": "3.11"}],
            "benchmarks": {"bench.time_a": {"unit": "seconds"}},
            "machines": {"m1": {"cpu": "x"}},
            "tags": {},
            "pages": [],
            "extra_key": [1, 2, 3]
        }))
        .unwrap()
    }

    #[test]
    fn test_index_accessors() {
        let index = sample_index();
        assert_eq!(index.param_keys(), vec!["machine", "python"]);
        assert_eq!(index.benchmark_names(), vec!["bench.time_a"]);
        assert_eq!(index.hash_for(2).as_deref(), Some("bbb"));
        assert_eq!(index.date_for(1), Some(1700000000000));
        assert_eq!(index.hash_for(3), None);
        assert_eq!(index.commit_url("aaa").as_deref(), Some("https://github.com/o/r/commit/aaa"));
        assert_eq!(index.extra["extra_key"], json!([1, 2, 3]));
    }

    #[test]
    fn test_collection_path() {
        assert_eq!(collection_path(Path::new("out/dashboard")), PathBuf::from("out/dashboard.fc.json"));
        assert_eq!(collection_path(Path::new("dashboard.json")), PathBuf::from("dashboard.fc.json"));
        assert_eq!(collection_path(Path::new("dashboard.fc")), PathBuf::from("dashboard.fc.json"));
        assert_eq!(collection_path(Path::new("b.fc.json")), PathBuf::from("b.fc.json"));
        assert_eq!(collection_path(Path::new("old.fc.pkl")), PathBuf::from("old.fc.json"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let mut collection = BenchmarkCollection::new("https://example.org/asv/", sample_index());
        collection.summaries.push(SummaryRow {
            revision: 1,
            time: Some(0.5),
            hash: Some("aaa".into()),
            date: Some(1700000000000),
            benchmark: "bench.time_a".into(),
        });
        let before = collection.modified_at;

        let written = collection.save(&dir.path().join("nested/dashboard")).unwrap();
        assert!(written.to_string_lossy().ends_with("dashboard.fc.json"));
        assert!(collection.modified_at >= before);

        let loaded = BenchmarkCollection::load(&written).unwrap();
        assert_eq!(loaded.base_url, "https://example.org/asv/");
        assert_eq!(loaded.param_keys, vec!["machine", "python"]);
        assert_eq!(loaded.summaries, collection.summaries);
        assert_eq!(loaded.index, collection.index);
        assert!(loaded.breakpoints.is_empty());
    }
}
