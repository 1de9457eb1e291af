//! GitHub REST client
//!
//! Thin typed layer over [`ApiClient`]: every lookup that names a stable
//! resource (repositories, commits, trees, pull requests) goes through the
//! SQLite cache, paginated searches do not.

pub mod urls;

use std::sync::Arc;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use crate::config::Settings;
use crate::http::{ApiClient, BackoffPolicy, ReqwestTransport, Transport, REQUEST_TIMEOUT};
use crate::storage::SqliteCache;
use crate::{Error, Result};

pub use urls::{extract_links, extract_repo_full_name, CommitRef, GithubLink, LinkKind};

pub const API_URL: &str = "https://api.github.com";

/// Cache namespace for plain metadata lookups
pub const METADATA_NAMESPACE: &str = "github_metadata";

/// One page of `/search/code` results
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchPage {
    #[serde(default)]
    pub total_count: u64,
    #[serde(default)]
    pub incomplete_results: bool,
    #[serde(default)]
    pub items: Vec<Value>,
}

impl SearchPage {
    /// `repository.full_name` of every hit, in page order
    pub fn repo_names(&self) -> Vec<String> {
        self.items
            .iter()
            .filter_map(|item| item["repository"]["full_name"].as_str())
            .map(str::to_string)
            .collect()
    }
}

/// Commit summary used by the filter stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub sha: String,
    pub date: Option<String>,
    pub message: Option<String>,
    pub total_additions: u64,
    pub total_deletions: u64,
    pub total_files_changed: u64,
    /// Changed paths joined with `\n`
    pub files_changed: String,
}

impl CommitInfo {
    /// Placeholder for a commit whose details could not be fetched
    pub fn empty(sha: &str) -> Self {
        Self { sha: sha.to_string(), ..Self::default() }
    }

    pub fn from_api(value: &Value) -> Option<Self> {
        let stats = &value["stats"];
        let files = value["files"]
            .as_array()
            .map(|files| {
                files
                    .iter()
                    .filter_map(|f| f["filename"].as_str())
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();

        Some(Self {
            sha: value["sha"].as_str()?.to_string(),
            date: value["commit"]["committer"]["date"].as_str().map(str::to_string),
            message: value["commit"]["message"].as_str().map(str::to_string),
            total_additions: stats["additions"].as_u64().unwrap_or(0),
            total_deletions: stats["deletions"].as_u64().unwrap_or(0),
            total_files_changed: stats["total"].as_u64().unwrap_or(0),
            files_changed: files,
        })
    }

    /// Date and message are both known
    pub fn is_complete(&self) -> bool {
        !self.sha.is_empty() && self.date.is_some() && self.message.is_some()
    }

    pub fn files(&self) -> impl Iterator<Item = &str> {
        self.files_changed.lines().filter(|l| !l.is_empty())
    }
}

#[derive(Clone)]
pub struct GithubClient {
    api: ApiClient,
    cache: Option<Arc<SqliteCache>>,
    base_url: String,
}

impl GithubClient {
    pub fn new(transport: Arc<dyn Transport>, policy: BackoffPolicy, token: Option<&str>) -> Self {
        let api = ApiClient::new(transport, policy)
            .with_header("Accept", "application/vnd.github+json")
            .with_bearer_token(token);
        Self {
            api,
            cache: None,
            base_url: API_URL.to_string(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let transport = Arc::new(ReqwestTransport::new(REQUEST_TIMEOUT)?);
        Ok(Self::new(
            transport,
            BackoffPolicy::from_settings(settings),
            settings.github_token.as_deref(),
        ))
    }

    pub fn with_policy(mut self, policy: BackoffPolicy) -> Self {
        self.api = self.api.with_policy(policy);
        self
    }

    pub fn with_cache(mut self, cache: Arc<SqliteCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    /// Absolute URL for an endpoint such as `/repos/a/b` or `search/commits?q=x`
    pub fn endpoint_url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
    }

    /// Uncached lookup; `None` when the resource does not exist
    pub async fn get_json(&self, endpoint: &str) -> Result<Option<Value>> {
        self.api.get_json(&self.endpoint_url(endpoint)).await
    }

    /// Cached lookup. Misses are cached too, as `null`.
    pub async fn get_json_cached(&self, namespace: &str, endpoint: &str) -> Result<Option<Value>> {
        let Some(cache) = &self.cache else {
            return self.get_json(endpoint).await;
        };

        if let Some(hit) = cache.get(namespace, &endpoint)? {
            tracing::trace!("Cache hit for {}", endpoint);
            return Ok(non_null(hit));
        }

        let value = self.get_json(endpoint).await?;
        cache.put(namespace, &endpoint, &value)?;
        Ok(value)
    }

    pub async fn metadata(&self, endpoint: &str) -> Result<Option<Value>> {
        self.get_json_cached(METADATA_NAMESPACE, endpoint).await
    }

    /// One page of code search results
    pub async fn search_code(&self, query: &str, per_page: u32, page: u32) -> Result<Option<SearchPage>> {
        let endpoint = format!("search/code?q={}&per_page={}&page={}", encode(query), per_page, page);
        match self.get_json(&endpoint).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Repository metadata. The API occasionally wraps the object in a
    /// one-element list.
    pub async fn repo(&self, full_name: &str) -> Result<Option<Value>> {
        match self.metadata(&format!("/repos/{}", full_name)).await? {
            Some(value) => single_object(value).map(Some),
            None => Ok(None),
        }
    }

    /// One page of pull requests; an empty list past the last page
    pub async fn pulls(&self, repo: &str, state: &str, per_page: u32, page: u32) -> Result<Vec<Value>> {
        let endpoint = format!("/repos/{}/pulls?state={}&per_page={}&page={}", repo, state, per_page, page);
        Ok(as_list(self.metadata(&endpoint).await?))
    }

    pub async fn commit(&self, repo: &str, sha: &str) -> Result<Option<Value>> {
        self.metadata(&format!("/repos/{}/commits/{}", repo, sha)).await
    }

    pub async fn commit_info(&self, repo: &str, sha: &str) -> Result<Option<CommitInfo>> {
        Ok(self.commit(repo, sha).await?.as_ref().and_then(CommitInfo::from_api))
    }

    /// Recover the commit of a merged PR whose `merge_commit_sha` is no longer
    /// reachable by searching for merge and squash-merge messages.
    pub async fn search_merge_commit(&self, repo: &str, pr_number: u64) -> Result<Option<String>> {
        let queries = [
            format!("repo:{} \"Merge pull request #{}\"", repo, pr_number),
            format!("repo:{} \"(#{})\"", repo, pr_number),
        ];

        for query in &queries {
            let Some(result) = self.metadata(&format!("search/commits?q={}", encode(query))).await? else {
                continue;
            };
            if result["total_count"].as_u64().unwrap_or(0) == 0 {
                continue;
            }
            if let Some(sha) = result["items"][0]["sha"].as_str() {
                return Ok(Some(sha.to_string()));
            }
        }
        Ok(None)
    }

    /// Paths of blobs on the default branch ending with `filename`, at most
    /// two directories deep. `None` when nothing matches.
    pub async fn find_file_in_tree(&self, repo: &str, filename: &str) -> Result<Option<Vec<String>>> {
        let Some(info) = self.repo(repo).await? else {
            return Ok(None);
        };
        let branch = info["default_branch"]
            .as_str()
            .filter(|b| !b.is_empty())
            .ok_or_else(|| Error::InvalidInput(format!("No default branch for {}", repo)))?
            .to_string();

        let Some(reference) = self.metadata(&format!("/repos/{}/git/refs/heads/{}", repo, branch)).await? else {
            return Ok(None);
        };
        let reference = single_object(reference)?;
        let Some(sha) = reference["object"]["sha"].as_str() else {
            return Err(Error::InvalidInput(format!("Malformed ref for {}@{}", repo, branch)));
        };

        let Some(tree) = self.metadata(&format!("/repos/{}/git/trees/{}?recursive=1", repo, sha)).await? else {
            return Ok(None);
        };

        let matches: Vec<String> = tree["tree"]
            .as_array()
            .into_iter()
            .flatten()
            .filter(|entry| entry["type"] == "blob")
            .filter_map(|entry| entry["path"].as_str())
            .filter(|path| path.ends_with(filename) && path.matches('/').count() <= 2)
            .map(str::to_string)
            .collect();

        Ok(if matches.is_empty() { None } else { Some(matches) })
    }

    /// Pull requests associated with a commit
    pub async fn commit_pulls(&self, owner: &str, repo: &str, sha: &str) -> Result<Vec<Value>> {
        let endpoint = format!("/repos/{}/{}/commits/{}/pulls?per_page=100", owner, repo, sha);
        Ok(as_list(self.metadata(&endpoint).await?))
    }

    pub async fn pull(&self, owner: &str, repo: &str, number: &str) -> Result<Option<Value>> {
        self.metadata(&format!("/repos/{}/{}/pulls/{}", owner, repo, number)).await
    }

    pub async fn issue(&self, owner: &str, repo: &str, number: &str) -> Result<Option<Value>> {
        self.metadata(&format!("/repos/{}/{}/issues/{}", owner, repo, number)).await
    }

    pub async fn issue_comments(&self, owner: &str, repo: &str, number: u64) -> Result<Vec<Value>> {
        let endpoint = format!("/repos/{}/{}/issues/{}/comments?per_page=100", owner, repo, number);
        Ok(as_list(self.metadata(&endpoint).await?))
    }

    pub async fn review_comments(&self, owner: &str, repo: &str, number: u64) -> Result<Vec<Value>> {
        let endpoint = format!("/repos/{}/{}/pulls/{}/comments?per_page=100", owner, repo, number);
        Ok(as_list(self.metadata(&endpoint).await?))
    }

    pub async fn reviews(&self, owner: &str, repo: &str, number: u64) -> Result<Vec<Value>> {
        let endpoint = format!("/repos/{}/{}/pulls/{}/reviews?per_page=100", owner, repo, number);
        Ok(as_list(self.metadata(&endpoint).await?))
    }
}

pub(crate) fn encode(query: &str) -> String {
    utf8_percent_encode(query, NON_ALPHANUMERIC).to_string()
}

fn non_null(value: Value) -> Option<Value> {
    if value.is_null() { None } else { Some(value) }
}

fn as_list(value: Option<Value>) -> Vec<Value> {
    match value {
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    }
}

fn single_object(value: Value) -> Result<Value> {
    match value {
        Value::Array(mut items) if items.len() == 1 => Ok(items.remove(0)),
        Value::Array(items) => Err(Error::InvalidInput(format!(
            "Expected one object, got a list of {}",
            items.len()
        ))),
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::testing::ScriptedTransport;
    use crate::http::HttpResponse;
    use serde_json::json;

    fn client(transport: Arc<ScriptedTransport>) -> GithubClient {
        GithubClient::new(transport, BackoffPolicy::immediate(2), Some("token"))
    }

    fn url(endpoint: &str) -> String {
        format!("{}/{}", API_URL, endpoint.trim_start_matches('/'))
    }

    #[tokio::test]
    async fn test_cached_lookup_hits_network_once() {
        let transport = Arc::new(
            ScriptedTransport::new().route_json(&url("/repos/a/b"), json!({"full_name": "a/b"})),
        );
        let cache = Arc::new(SqliteCache::open_in_memory().unwrap());
        let gh = client(transport.clone()).with_cache(cache.clone());

        let first = gh.repo("a/b").await.unwrap().unwrap();
        let second = gh.repo("a/b").await.unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(transport.hits(&url("/repos/a/b")), 1);
        assert_eq!(cache.count(Some(METADATA_NAMESPACE)).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_missing_resource_is_cached_as_null() {
        let transport = Arc::new(ScriptedTransport::new());
        let cache = Arc::new(SqliteCache::open_in_memory().unwrap());
        let gh = client(transport.clone()).with_cache(cache);

        assert!(gh.repo("gone/away").await.unwrap().is_none());
        assert!(gh.repo("gone/away").await.unwrap().is_none());
        assert_eq!(transport.hits(&url("/repos/gone/away")), 1);
    }

    #[tokio::test]
    async fn test_sends_github_headers() {
        let transport = Arc::new(ScriptedTransport::new().route_json(&url("/repos/a/b"), json!({})));
        client(transport.clone()).repo("a/b").await.unwrap();

        let requests = transport.requests.lock().unwrap();
        let headers = &requests[0].1;
        assert!(headers.contains(&("Accept".to_string(), "application/vnd.github+json".to_string())));
        assert!(headers.contains(&("Authorization".to_string(), "Bearer token".to_string())));
    }

    #[tokio::test]
    async fn test_search_code_page() {
        let endpoint = format!("search/code?q={}&per_page=2&page=1", encode("filename:asv.conf.json"));
        let transport = Arc::new(ScriptedTransport::new().route_json(
            &url(&endpoint),
            json!({
                "total_count": 3,
                "incomplete_results": false,
                "items": [
                    {"repository": {"full_name": "a/b"}},
                    {"repository": {"full_name": "c/d"}}
                ]
            }),
        ));

        let page = client(transport).search_code("filename:asv.conf.json", 2, 1).await.unwrap().unwrap();
        assert_eq!(page.repo_names(), vec!["a/b", "c/d"]);
        assert!(!page.incomplete_results);
    }

    #[tokio::test]
    async fn test_find_file_in_tree() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .route_json(&url("/repos/a/b"), json!([{"default_branch": "main"}]))
                .route_json(&url("/repos/a/b/git/refs/heads/main"), json!({"object": {"sha": "t1"}}))
                .route_json(
                    &url("/repos/a/b/git/trees/t1?recursive=1"),
                    json!({"tree": [
                        {"type": "blob", "path": "asv.conf.json"},
                        {"type": "blob", "path": "benchmarks/asv.conf.json"},
                        {"type": "blob", "path": "a/very/deep/asv.conf.json"},
                        {"type": "tree", "path": "x/asv.conf.json"},
                        {"type": "blob", "path": "setup.py"}
                    ]}),
                ),
        );

        let found = client(transport).find_file_in_tree("a/b", "asv.conf.json").await.unwrap();
        assert_eq!(found, Some(vec!["asv.conf.json".to_string(), "benchmarks/asv.conf.json".to_string()]));
    }

    #[tokio::test]
    async fn test_find_file_in_tree_without_match() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .route_json(&url("/repos/a/b"), json!({"default_branch": "dev"}))
                .route_json(&url("/repos/a/b/git/refs/heads/dev"), json!({"object": {"sha": "t2"}}))
                .route_json(&url("/repos/a/b/git/trees/t2?recursive=1"), json!({"tree": []})),
        );
        assert_eq!(client(transport).find_file_in_tree("a/b", "asv.conf.json").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_search_merge_commit_falls_back_to_squash_pattern() {
        let merge_q = encode("repo:a/b \"Merge pull request #7\"");
        let squash_q = encode("repo:a/b \"(#7)\"");
        let transport = Arc::new(
            ScriptedTransport::new()
                .route_json(&url(&format!("search/commits?q={}", merge_q)), json!({"total_count": 0, "items": []}))
                .route_json(
                    &url(&format!("search/commits?q={}", squash_q)),
                    json!({"total_count": 1, "items": [{"sha": "feed42"}]}),
                ),
        );

        let sha = client(transport).search_merge_commit("a/b", 7).await.unwrap();
        assert_eq!(sha.as_deref(), Some("feed42"));
    }

    #[tokio::test]
    async fn test_commit_info() {
        let transport = Arc::new(ScriptedTransport::new().route_json(
            &url("/repos/a/b/commits/abc"),
            json!({
                "sha": "abc",
                "commit": {"committer": {"date": "2024-01-02T03:04:05Z"}, "message": "Speed up"},
                "stats": {"additions": 3, "deletions": 1, "total": 4},
                "files": [{"filename": "src/a.py"}, {"filename": "tests/test_a.py"}]
            }),
        ));

        let info = client(transport).commit_info("a/b", "abc").await.unwrap().unwrap();
        assert!(info.is_complete());
        assert_eq!(info.total_files_changed, 4);
        assert_eq!(info.files().collect::<Vec<_>>(), vec!["src/a.py", "tests/test_a.py"]);
    }

    #[tokio::test]
    async fn test_server_error_propagates() {
        let transport = Arc::new(ScriptedTransport::new().route(&url("/repos/a/b"), HttpResponse::new(500, "")));
        assert!(client(transport).repo("a/b").await.is_err());
    }

    #[test]
    fn test_single_object() {
        assert_eq!(single_object(json!([{"a": 1}])).unwrap(), json!({"a": 1}));
        assert_eq!(single_object(json!({"a": 1})).unwrap(), json!({"a": 1}));
        assert!(single_object(json!([1, 2])).is_err());
    }
}
