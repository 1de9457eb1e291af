//! Reading published asv dashboards into a [`BenchmarkCollection`]
//!
//! A dashboard is either remote (`https://…/`) or a local `html` directory
//! produced by `asv publish`. Remote files are mirrored below a download
//! directory and re-used on later runs unless `force` is set.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;
use crate::collection::{BenchmarkCollection, BenchmarkRow, DashboardIndex, SummaryRow};
use crate::commit::map_concurrent;
use crate::http::{ApiClient, BackoffPolicy, Transport};
use crate::{artifact, Error, Result};

/// Characters `make_graph_dir` leaves unescaped besides alphanumerics
const GRAPH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'_')
    .remove(b'.')
    .remove(b'-')
    .remove(b'~')
    .remove(b'(')
    .remove(b')');

/// Parallel downloads per dashboard
const DOWNLOAD_CONCURRENCY: usize = 8;

pub const COLLECTION_FILE: &str = "dashboard.fc.json";

/// Path of the graph directory for one parameter set:
/// `graphs/<k1>-<v1>/<k2>/…/` (bare key when the value is empty or null).
pub fn make_graph_dir(params: &BTreeMap<String, Value>, keys: &[String], quote: bool) -> String {
    let parts: Vec<String> = keys
        .iter()
        .map(|key| {
            let segment = match params.get(key).and_then(param_string) {
                Some(value) => format!("{}-{}", key, value),
                None => key.clone(),
            };
            if quote {
                utf8_percent_encode(&segment, GRAPH_SEGMENT).to_string()
            } else {
                segment
            }
        })
        .collect();
    format!("graphs/{}/", parts.join("/"))
}

fn param_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Make one URL path component safe as a file name
pub fn clean_component(component: &str) -> String {
    let decoded = percent_decode_str(component).decode_utf8_lossy();
    decoded
        .replace(' ', "_")
        .replace('@', "AT")
        .replace(['(', ')'], "")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '/') { c } else { '_' })
        .collect()
}

/// Where a dashboard lives
#[derive(Debug, Clone, PartialEq)]
pub enum DashboardSource {
    Remote(Url),
    Local(PathBuf),
}

impl DashboardSource {
    /// URLs with a scheme are remote, everything else is a directory.
    /// `file://` URLs are read from disk rather than through the HTTP client.
    pub fn parse(base: &str) -> Result<Self> {
        match Url::parse(base) {
            Ok(url) if url.scheme() == "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|_| Error::InvalidUrl(format!("Bad file URL: {}", base)))?;
                Ok(Self::Local(path))
            }
            Ok(url) if !url.cannot_be_a_base() => {
                let with_slash = if base.ends_with('/') { base.to_string() } else { format!("{}/", base) };
                Ok(Self::Remote(Url::parse(&with_slash).map_err(|e| Error::InvalidUrl(e.to_string()))?))
            }
            _ => Ok(Self::Local(PathBuf::from(base))),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }

    /// Join path parts below the dashboard root
    pub fn join(&self, parts: &[&str]) -> Result<String> {
        match self {
            Self::Remote(base) => {
                let relative = parts
                    .iter()
                    .map(|p| p.trim_matches('/'))
                    .filter(|p| !p.is_empty())
                    .collect::<Vec<_>>()
                    .join("/");
                base.join(&relative)
                    .map(|u| u.to_string())
                    .map_err(|e| Error::InvalidUrl(format!("{}: {}", relative, e)))
            }
            Self::Local(base) => {
                let mut path = base.clone();
                for part in parts {
                    for piece in part.split('/').filter(|p| !p.is_empty()) {
                        path.push(piece);
                    }
                }
                Ok(path.to_string_lossy().into_owned())
            }
        }
    }
}

/// Local mirror path of `url` below `dl_dir`
pub fn local_path_for(url: &str, dl_dir: &Path, base: Option<&str>) -> PathBuf {
    let relative = match base {
        Some(base) if url.starts_with(base) => url[base.len()..].trim_start_matches('/').to_string(),
        _ => Url::parse(url)
            .map(|u| u.path().trim_start_matches('/').to_string())
            .unwrap_or_else(|_| url.trim_start_matches('/').to_string()),
    };

    let mut path = dl_dir.to_path_buf();
    for component in relative.split('/').filter(|c| !c.is_empty()) {
        path.push(clean_component(component));
    }
    path
}

/// Downloads dashboard files, one GET per file
#[derive(Clone)]
pub struct DashboardFetcher {
    api: ApiClient,
}

impl DashboardFetcher {
    pub fn new(transport: Arc<dyn Transport>, policy: BackoffPolicy) -> Self {
        Self { api: ApiClient::new(transport, policy) }
    }

    /// Mirror `url` to disk. `None` when the file does not exist upstream or
    /// could not be fetched.
    pub async fn download_to(&self, url: &str, dl_dir: &Path, base: Option<&str>, force: bool) -> Result<Option<PathBuf>> {
        let local = local_path_for(url, dl_dir, base);
        if local.exists() && !force {
            return Ok(Some(local));
        }

        let response = match self.api.get(url).await {
            Ok(response) if response.is_missing() => return Ok(None),
            Ok(response) => response,
            Err(e) => {
                tracing::debug!("Download of {} failed: {}", url, e);
                return Ok(None);
            }
        };

        if let Some(parent) = local.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&local, &response.body)?;
        Ok(Some(local))
    }

    /// Fetch a remote file or locate a local one
    async fn resolve(&self, source: &DashboardSource, url: &str, html_dir: &Path, base: &str, force: bool) -> Result<Option<PathBuf>> {
        match source {
            DashboardSource::Remote(_) => self.download_to(url, html_dir, Some(base), force).await,
            DashboardSource::Local(_) => {
                let path = PathBuf::from(url);
                Ok(path.exists().then_some(path))
            }
        }
    }
}

/// `[[revision, time], …]` pairs of a graph file.
///
/// Parameterized benchmarks store a list of times per revision; those are
/// reduced to their geometric mean like asv's own summary graphs.
pub fn parse_points(value: &Value) -> Vec<(i64, Option<f64>)> {
    let Some(points) = value.as_array() else {
        return Vec::new();
    };
    points
        .iter()
        .filter_map(|point| {
            let pair = point.as_array()?;
            let revision = pair.first()?.as_i64()?;
            let time = pair.get(1).and_then(point_time);
            Some((revision, time))
        })
        .collect()
}

fn point_time(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Array(values) => {
            let logs: Vec<f64> = values
                .iter()
                .filter_map(Value::as_f64)
                .filter(|v| v.is_finite() && *v > 0.0)
                .map(f64::ln)
                .collect();
            if logs.is_empty() {
                None
            } else {
                Some((logs.iter().sum::<f64>() / logs.len() as f64).exp())
            }
        }
        _ => None,
    }
}

fn read_json(path: &Path) -> Option<Value> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!("Failed to read {}: {}", path.display(), e);
            return None;
        }
    };
    match serde_json::from_str(&text) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!("Failed to decode {}: {}", path.display(), e);
            None
        }
    }
}

struct GraphFile {
    url: String,
    benchmark: String,
    machine: Option<String>,
    environment: String,
}

/// Read a dashboard (remote or local) into a collection.
///
/// Returns `Ok(None)` when the dashboard has no readable `index.json`.
pub async fn make_benchmark_from_html(
    fetcher: &DashboardFetcher,
    base_url: &str,
    html_dir: &Path,
    force: bool,
) -> Result<Option<BenchmarkCollection>> {
    let source = DashboardSource::parse(base_url)?;
    std::fs::create_dir_all(html_dir)?;

    let index_url = source.join(&["index.json"])?;
    let Some(index_path) = fetcher.resolve(&source, &index_url, html_dir, base_url, force).await? else {
        tracing::warn!("Failed to read index.json from {}", base_url);
        return Ok(None);
    };
    let index: DashboardIndex = serde_json::from_str(&std::fs::read_to_string(&index_path)?)?;

    let keys = index.param_keys();
    let names = index.benchmark_names();

    let mut graphs = Vec::new();
    for params in &index.graph_param_list {
        let graph_dir = make_graph_dir(params, &keys, source.is_remote());
        let environment = make_graph_dir(params, &keys, false)
            .trim_start_matches("graphs/")
            .trim_end_matches('/')
            .to_string();
        let machine = params.get("machine").and_then(param_string);
        for name in &names {
            graphs.push(GraphFile {
                url: source.join(&[&graph_dir, &format!("{}.json", name)])?,
                benchmark: name.clone(),
                machine: machine.clone(),
                environment: environment.clone(),
            });
        }
    }

    let summaries: Vec<(String, String)> = names
        .iter()
        .map(|name| Ok((name.clone(), source.join(&["graphs", "summary", &format!("{}.json", name)])?)))
        .collect::<Result<_>>()?;

    let graph_paths = fetch_all(fetcher, &source, graphs.iter().map(|g| g.url.clone()).collect(), html_dir, base_url, force, "benchmarks").await?;
    let summary_paths = fetch_all(fetcher, &source, summaries.iter().map(|(_, url)| url.clone()).collect(), html_dir, base_url, force, "summaries").await?;

    let mut collection = BenchmarkCollection::new(base_url, index);

    let mut files_read = 0;
    for (graph, path) in graphs.iter().zip(graph_paths) {
        let Some(value) = path.as_deref().and_then(read_json) else {
            continue;
        };
        files_read += 1;
        for (revision, time) in parse_points(&value) {
            collection.benchmarks.push(BenchmarkRow {
                revision,
                time,
                hash: collection.index.hash_for(revision),
                date: collection.index.date_for(revision),
                benchmark: graph.benchmark.clone(),
                machine: graph.machine.clone(),
                environment: graph.environment.clone(),
            });
        }
    }
    tracing::info!(
        "Collected {} rows from {} benchmark files",
        collection.benchmarks.len(),
        files_read
    );

    for ((name, _), path) in summaries.iter().zip(summary_paths) {
        let Some(value) = path.as_deref().and_then(read_json) else {
            continue;
        };
        for (revision, time) in parse_points(&value) {
            collection.summaries.push(SummaryRow {
                revision,
                time,
                hash: collection.index.hash_for(revision),
                date: collection.index.date_for(revision),
                benchmark: name.clone(),
            });
        }
    }

    Ok(Some(collection))
}

async fn fetch_all(
    fetcher: &DashboardFetcher,
    source: &DashboardSource,
    urls: Vec<String>,
    html_dir: &Path,
    base_url: &str,
    force: bool,
    label: &str,
) -> Result<Vec<Option<PathBuf>>> {
    let fetcher = fetcher.clone();
    let source = source.clone();
    let html_dir = html_dir.to_path_buf();
    let base_url = base_url.to_string();

    let results = map_concurrent(urls, DOWNLOAD_CONCURRENCY, label, move |url| {
        let fetcher = fetcher.clone();
        let source = source.clone();
        let html_dir = html_dir.clone();
        let base_url = base_url.clone();
        async move { fetcher.resolve(&source, &url, &html_dir, &base_url, force).await }
    })
    .await?;

    results.into_iter().collect()
}

/// One line of the `download-dashboards` input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardTarget {
    pub url: String,
    pub output_dir: PathBuf,
}

/// Download every listed dashboard and save `<output_dir>/dashboard.fc.json`.
/// Returns the written collection paths.
pub async fn download_dashboards(fetcher: &DashboardFetcher, targets_file: &Path, force: bool) -> Result<Vec<PathBuf>> {
    let targets: Vec<DashboardTarget> = artifact::read_jsonl(targets_file)?;
    let mut written = Vec::new();

    for target in &targets {
        match make_benchmark_from_html(fetcher, &target.url, &target.output_dir, force).await? {
            Some(mut collection) => {
                let path = collection.save(&target.output_dir.join(COLLECTION_FILE))?;
                tracing::info!("Data downloaded to {}", target.output_dir.display());
                written.push(path);
            }
            None => tracing::warn!("Skipping {}: no dashboard found", target.url),
        }
    }
    Ok(written)
}
