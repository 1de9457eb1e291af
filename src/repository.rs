//! Repository discovery, enrichment and filtering

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use crate::github::{extract_repo_full_name, GithubClient};
use crate::ui::StageProgress;
use crate::{artifact, Error, Result};

/// The benchmarking tool's own repository ships an `asv.conf.json` too.
pub const EXCLUDED_REPOS: &[&str] = &["airspeed-velocity/asv"];

/// Knobs for paging through code search
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub query: String,
    pub max_pages: u32,
    pub per_page: u32,
    /// Pause between successful pages
    pub base_delay: Duration,
    /// Upper bound of the random extra pause
    pub jitter: Duration,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            query: "filename:asv.conf.json".to_string(),
            max_pages: 10,
            per_page: 100,
            base_delay: Duration::from_secs_f64(1.1),
            jitter: Duration::from_secs_f64(0.3),
        }
    }
}

/// Unique `owner/repo` names matching a code search, in first-seen order
pub async fn search_repositories(github: &GithubClient, options: &SearchOptions) -> Result<Vec<String>> {
    let mut seen = HashSet::new();
    let mut repos = Vec::new();

    for page in 1..=options.max_pages {
        let Some(results) = github.search_code(&options.query, options.per_page, page).await? else {
            break;
        };
        if results.items.is_empty() {
            break;
        }

        for name in results.repo_names() {
            if seen.insert(name.clone()) {
                repos.push(name);
            }
        }
        tracing::debug!("Search page {}: {} repositories so far", page, repos.len());

        let pause = options.base_delay + random_upto(options.jitter);
        if !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }

        if !results.incomplete_results && results.items.len() < options.per_page as usize {
            break;
        }
    }

    Ok(repos)
}

fn random_upto(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..max.as_secs_f64()))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RepoName {
    repo_name: String,
}

/// Write the raw search result list (`repo_name` column)
pub fn write_repo_list(path: &Path, repos: &[String]) -> Result<usize> {
    let rows: Vec<RepoName> = repos.iter().map(|r| RepoName { repo_name: r.clone() }).collect();
    artifact::write_csv(path, &rows)
}

/// Read a repo list; headerless single-column files are accepted too.
pub fn read_repo_list(path: &Path) -> Result<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new().has_headers(false).from_path(path)?;
    let mut repos = Vec::new();
    for (i, record) in reader.records().enumerate() {
        let record = record?;
        let Some(name) = record.get(0).map(str::trim) else {
            continue;
        };
        if name.is_empty() || (i == 0 && name == "repo_name") {
            continue;
        }
        repos.push(name.to_string());
    }
    Ok(repos)
}

/// Repository status as reported by the GitHub API.
///
/// Every field but `is_accessible` is unknown (`None`) when the repository
/// could not be fetched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepoSummary {
    pub is_accessible: bool,
    pub is_fork: Option<bool>,
    pub is_archived: Option<bool>,
    pub fork_parent: Option<String>,
    pub forked_at: Option<String>,
    /// Users subscribed to notifications (`subscribers_count`)
    pub watchers: Option<u64>,
    pub stars: Option<u64>,
}

impl RepoSummary {
    pub fn from_metadata(meta: Option<&Value>) -> Self {
        let Some(meta) = meta.filter(|m| m.is_object()) else {
            return Self::default();
        };

        let is_fork = meta["fork"].as_bool().unwrap_or(false);
        let archived = meta["archived"].as_bool().unwrap_or(false) || meta["disabled"].as_bool().unwrap_or(false);
        Self {
            is_accessible: true,
            is_fork: Some(is_fork),
            is_archived: Some(archived),
            fork_parent: if is_fork {
                meta["parent"]["full_name"].as_str().map(str::to_string)
            } else {
                None
            },
            forked_at: if is_fork {
                meta["created_at"].as_str().map(str::to_string)
            } else {
                None
            },
            watchers: meta["subscribers_count"].as_u64(),
            stars: meta["stargazers_count"].as_u64(),
        }
    }
}

/// One row of the filtered repositories CSV
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoRecord {
    pub repo_name: String,
    pub url: String,
    pub is_accessible: bool,
    pub is_fork: Option<bool>,
    pub is_archived: Option<bool>,
    pub fork_parent: Option<String>,
    pub forked_at: Option<String>,
    pub watchers: Option<u64>,
    pub stars: Option<u64>,
}

impl RepoRecord {
    pub fn new(repo_name: &str, summary: RepoSummary) -> Self {
        Self {
            repo_name: repo_name.to_string(),
            url: format!("https://github.com/{}", repo_name),
            is_accessible: summary.is_accessible,
            is_fork: summary.is_fork,
            is_archived: summary.is_archived,
            fork_parent: summary.fork_parent,
            forked_at: summary.forked_at,
            watchers: summary.watchers,
            stars: summary.stars,
        }
    }

    /// Accessible, not a fork, not archived. Unknown values exclude.
    pub fn is_candidate(&self) -> bool {
        self.is_accessible && self.is_fork == Some(false) && self.is_archived == Some(false)
    }
}

/// Fetch the summary of every repository. Nothing is filtered out;
/// lookup failures mark the repository inaccessible.
pub async fn enrich_repos(github: &GithubClient, repos: &[String]) -> Vec<RepoRecord> {
    let progress = StageProgress::new(repos.len(), "Enriching repos");
    let mut records = Vec::with_capacity(repos.len());

    for repo in repos {
        let full_name = extract_repo_full_name(repo).unwrap_or_else(|| repo.clone());
        let meta = match github.repo(&full_name).await {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!("Could not fetch {}: {}", full_name, e);
                None
            }
        };
        records.push(RepoRecord::new(&full_name, RepoSummary::from_metadata(meta.as_ref())));
        progress.inc();
    }

    progress.finish(&format!("Enriched {} repositories", records.len()));
    records
}

/// Keep candidate dashboards; an empty result is an error.
pub fn filter_repos(records: Vec<RepoRecord>) -> Result<Vec<RepoRecord>> {
    let kept: Vec<RepoRecord> = records
        .into_iter()
        .filter(RepoRecord::is_candidate)
        .filter(|r| !EXCLUDED_REPOS.contains(&r.repo_name.as_str()))
        .collect();

    if kept.is_empty() {
        return Err(Error::InvalidInput("No dashboards found in the repositories".to_string()));
    }
    Ok(kept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::API_URL;
    use crate::http::testing::ScriptedTransport;
    use crate::http::BackoffPolicy;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn record(name: &str, fork: Option<bool>, archived: Option<bool>) -> RepoRecord {
        RepoRecord::new(name, RepoSummary {
            is_accessible: fork.is_some(),
            is_fork: fork,
            is_archived: archived,
            ..RepoSummary::default()
        })
    }

    #[test]
    fn test_summary_from_metadata() {
        let meta = json!({
            "fork": true,
            "archived": false,
            "disabled": true,
            "parent": {"full_name": "up/stream"},
            "created_at": "2020-01-01T00:00:00Z",
            "subscribers_count": 4,
            "stargazers_count": 120
        });
        let summary = RepoSummary::from_metadata(Some(&meta));
        assert!(summary.is_accessible);
        assert_eq!(summary.is_fork, Some(true));
        assert_eq!(summary.is_archived, Some(true));
        assert_eq!(summary.fork_parent.as_deref(), Some("up/stream"));
        assert_eq!(summary.forked_at.as_deref(), Some("2020-01-01T00:00:00Z"));
        assert_eq!(summary.watchers, Some(4));
        assert_eq!(summary.stars, Some(120));

        let missing = RepoSummary::from_metadata(None);
        assert!(!missing.is_accessible);
        assert_eq!(missing.is_fork, None);
    }

    #[test]
    fn test_filter_keeps_only_candidates() {
        let records = vec![
            record("good/one", Some(false), Some(false)),
            record("fork/one", Some(true), Some(false)),
            record("old/one", Some(false), Some(true)),
            record("gone/one", None, None),
            record("airspeed-velocity/asv", Some(false), Some(false)),
        ];
        let kept = filter_repos(records).unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].repo_name, "good/one");
        assert_eq!(kept[0].url, "https://github.com/good/one");
    }

    #[test]
    fn test_filter_is_idempotent() {
        let records = vec![
            record("a/a", Some(false), Some(false)),
            record("b/b", Some(false), Some(false)),
            record("c/c", Some(true), Some(false)),
        ];
        let once = filter_repos(records).unwrap();
        let twice = filter_repos(once.clone()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_filter_empty_is_error() {
        assert!(filter_repos(vec![record("x/y", Some(true), Some(false))]).is_err());
        assert!(filter_repos(Vec::new()).is_err());
    }

    #[test]
    fn test_repo_list_with_and_without_header() {
        let dir = TempDir::new().unwrap();
        let with_header = dir.path().join("repos.csv");
        write_repo_list(&with_header, &["a/b".to_string(), "c/d".to_string()]).unwrap();
        assert_eq!(read_repo_list(&with_header).unwrap(), vec!["a/b", "c/d"]);

        let headerless = dir.path().join("raw.csv");
        std::fs::write(&headerless, "e/f\ng/h\n").unwrap();
        assert_eq!(read_repo_list(&headerless).unwrap(), vec!["e/f", "g/h"]);
    }

    #[test]
    fn test_filtered_csv_roundtrip_keeps_unknowns() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("filtered.csv");
        let rows = vec![record("a/b", Some(false), Some(false)), record("c/d", None, None)];
        artifact::write_csv(&path, &rows).unwrap();
        let back: Vec<RepoRecord> = artifact::read_csv(&path).unwrap();
        assert_eq!(back, rows);
    }

    fn search_url(page: u32) -> String {
        format!(
            "{}/search/code?q={}&per_page=2&page={}",
            API_URL,
            crate::github::encode("filename:asv.conf.json"),
            page
        )
    }

    #[tokio::test]
    async fn test_search_dedupes_and_stops_on_short_page() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .route_json(&search_url(1), json!({
                    "incomplete_results": false,
                    "items": [
                        {"repository": {"full_name": "a/b"}},
                        {"repository": {"full_name": "a/b"}}
                    ]
                }))
                .route_json(&search_url(2), json!({
                    "incomplete_results": false,
                    "items": [{"repository": {"full_name": "c/d"}}]
                }))
                .route_json(&search_url(3), json!({
                    "incomplete_results": false,
                    "items": [{"repository": {"full_name": "never/seen"}}]
                })),
        );
        let github = GithubClient::new(transport.clone(), BackoffPolicy::immediate(1), None);
        let options = SearchOptions {
            per_page: 2,
            base_delay: Duration::ZERO,
            jitter: Duration::ZERO,
            ..SearchOptions::default()
        };

        let repos = search_repositories(&github, &options).await.unwrap();
        assert_eq!(repos, vec!["a/b", "c/d"]);
        assert_eq!(transport.hits(&search_url(3)), 0);
    }

    #[tokio::test]
    async fn test_search_stops_on_empty_page() {
        let transport = Arc::new(ScriptedTransport::new().route_json(
            &search_url(1),
            json!({"incomplete_results": true, "items": []}),
        ));
        let github = GithubClient::new(transport.clone(), BackoffPolicy::immediate(1), None);
        let options = SearchOptions { per_page: 2, base_delay: Duration::ZERO, jitter: Duration::ZERO, ..SearchOptions::default() };

        assert!(search_repositories(&github, &options).await.unwrap().is_empty());
        assert_eq!(transport.hits(&search_url(2)), 0);
    }

    #[tokio::test]
    async fn test_enrich_marks_unreachable() {
        let transport = Arc::new(ScriptedTransport::new().route_json(
            &format!("{}/repos/a/b", API_URL),
            json!({"fork": false, "archived": false, "stargazers_count": 3}),
        ));
        let github = GithubClient::new(transport, BackoffPolicy::immediate(1), None);

        let records = enrich_repos(&github, &["https://github.com/a/b".to_string(), "x/y".to_string()]).await;
        assert_eq!(records[0].repo_name, "a/b");
        assert!(records[0].is_candidate());
        assert_eq!(records[0].stars, Some(3));
        assert!(!records[1].is_accessible);
    }
}
