//! Codecov coverage lookups for changed files of a commit

use std::sync::Arc;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use crate::config::Settings;
use crate::github::{CommitRef, GithubClient};
use crate::http::{ApiClient, BackoffPolicy, ReqwestTransport, Transport, REQUEST_TIMEOUT};
use crate::storage::SqliteCache;
use crate::Result;

pub const API_URL: &str = "https://api.codecov.io/api/v2/github";

const CACHE_NAMESPACE: &str = "codecov_metadata";

/// Query values: everything but unreserved characters is escaped.
const QUERY: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.').remove(b'~');

/// File paths in the URL path keep their `/` separators.
const PATH: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.').remove(b'~').remove(b'/');

/// Coverage of one changed file of one commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageRow {
    /// Which breakpoint column the commit came from (`hash` or `gt_hash`)
    pub typ: String,
    pub url: String,
    pub path: String,
    pub coverage: Option<f64>,
}

#[derive(Clone)]
pub struct CodecovClient {
    api: ApiClient,
    cache: Option<Arc<SqliteCache>>,
    base_url: String,
}

impl CodecovClient {
    pub fn new(transport: Arc<dyn Transport>, policy: BackoffPolicy, token: Option<&str>) -> Self {
        Self {
            api: ApiClient::new(transport, policy)
                .with_header("Accept", "application/json")
                .with_bearer_token(token),
            cache: None,
            base_url: API_URL.to_string(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let transport = Arc::new(ReqwestTransport::new(REQUEST_TIMEOUT)?);
        Ok(Self::new(
            transport,
            BackoffPolicy::from_settings(settings),
            settings.codecov_token.as_deref(),
        ))
    }

    pub fn with_cache(mut self, cache: Arc<SqliteCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    async fn metadata(&self, endpoint: &str, params: &[(&str, &str)]) -> Result<Option<Value>> {
        let query: Vec<String> = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, utf8_percent_encode(v, QUERY)))
            .collect();
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, endpoint)
        } else {
            format!("{}{}?{}", self.base_url, endpoint, query.join("&"))
        };

        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.get(CACHE_NAMESPACE, &url)? {
                return Ok(if hit.is_null() { None } else { Some(hit) });
            }
            let value = self.api.get_json(&url).await?;
            cache.put(CACHE_NAMESPACE, &url, &value)?;
            return Ok(value);
        }
        self.api.get_json(&url).await
    }

    /// Line coverage of `path` at `sha`.
    ///
    /// Tries the commit totals, then totals filtered by path, then the
    /// file report; the first response carrying `totals.coverage` wins.
    pub async fn file_coverage(&self, owner: &str, repo: &str, sha: &str, path: &str) -> Result<Option<f64>> {
        let base = format!("/{}/repos/{}", owner, repo);
        let file_report = format!("{}/file_report/{}", base, utf8_percent_encode(path, PATH));
        let totals = format!("{}/totals", base);

        let attempts: [(&str, Vec<(&str, &str)>); 3] = [
            (totals.as_str(), vec![("sha", sha)]),
            (totals.as_str(), vec![("sha", sha), ("path", path)]),
            (file_report.as_str(), vec![("sha", sha)]),
        ];

        for (endpoint, params) in &attempts {
            match self.metadata(endpoint, params).await {
                Ok(Some(value)) => {
                    if let Some(coverage) = totals_coverage(&value) {
                        return Ok(Some(coverage));
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::debug!("Coverage lookup {} failed: {}", endpoint, e),
            }
        }
        Ok(None)
    }

    /// `(path, coverage)` for every file changed by the commit, optionally
    /// restricted to paths containing one of `only`.
    pub async fn commit_coverage(
        &self,
        github: &GithubClient,
        commit_url: &str,
        only: &[String],
    ) -> Result<Vec<(String, Option<f64>)>> {
        let commit = CommitRef::parse(commit_url)?;
        let files: Vec<String> = match github.commit_info(&commit.full_name(), &commit.sha).await {
            Ok(Some(info)) => info.files().map(str::to_string).collect(),
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::warn!("Could not list files of {}: {}", commit_url, e);
                Vec::new()
            }
        };

        let mut rows = Vec::new();
        for path in files {
            if !only.is_empty() && !only.iter().any(|pat| path.contains(pat.as_str())) {
                continue;
            }
            let coverage = self.file_coverage(&commit.owner, &commit.repo, &commit.sha, &path).await?;
            rows.push((path, coverage));
        }
        Ok(rows)
    }
}

fn totals_coverage(value: &Value) -> Option<f64> {
    let coverage = value.get("totals")?.get("coverage")?;
    match coverage {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::testing::ScriptedTransport;
    use serde_json::json;

    fn codecov(transport: Arc<ScriptedTransport>) -> CodecovClient {
        CodecovClient::new(transport, BackoffPolicy::immediate(1), None)
    }

    #[tokio::test]
    async fn test_commit_totals_win() {
        let transport = Arc::new(ScriptedTransport::new().route_json(
            &format!("{}/o/repos/r/totals?sha=abc", API_URL),
            json!({"totals": {"coverage": 87.5}}),
        ));
        let coverage = codecov(transport.clone()).file_coverage("o", "r", "abc", "pkg/a.py").await.unwrap();
        assert_eq!(coverage, Some(87.5));
        assert_eq!(transport.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_falls_back_to_file_report() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .route_json(&format!("{}/o/repos/r/totals?sha=abc", API_URL), json!({"totals": {"coverage": null}}))
                .route_json(
                    &format!("{}/o/repos/r/file_report/pkg/my%20file.py?sha=abc", API_URL),
                    json!({"totals": {"coverage": "41.0"}}),
                ),
        );
        let coverage = codecov(transport).file_coverage("o", "r", "abc", "pkg/my file.py").await.unwrap();
        assert_eq!(coverage, Some(41.0));
    }

    #[tokio::test]
    async fn test_no_coverage_anywhere() {
        let transport = Arc::new(ScriptedTransport::new());
        let coverage = codecov(transport.clone()).file_coverage("o", "r", "abc", "a.py").await.unwrap();
        assert_eq!(coverage, None);
        assert_eq!(transport.requests.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_commit_coverage_filters_paths() {
        let gh_transport = Arc::new(ScriptedTransport::new().route_json(
            "https://api.github.com/repos/o/r/commits/abcdef1",
            json!({
                "sha": "abcdef1",
                "commit": {"committer": {"date": "2024-01-01T00:00:00Z"}, "message": "m"},
                "stats": {"additions": 1, "deletions": 0, "total": 1},
                "files": [{"filename": "src/core.py"}, {"filename": "docs/index.rst"}]
            }),
        ));
        let github = GithubClient::new(gh_transport, BackoffPolicy::immediate(1), None);

        let cov_transport = Arc::new(ScriptedTransport::new().route_json(
            &format!("{}/o/repos/r/totals?sha=abcdef1", API_URL),
            json!({"totals": {"coverage": 90}}),
        ));
        let rows = codecov(cov_transport)
            .commit_coverage(&github, "https://github.com/o/r/commit/abcdef1", &["src/".to_string()])
            .await
            .unwrap();
        assert_eq!(rows, vec![("src/core.py".to_string(), Some(90.0))]);
    }
}
