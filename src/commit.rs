//! Commit collection from merged pull requests and commit filtering

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, LazyLock};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use crate::github::{CommitInfo, GithubClient};
use crate::repository::RepoRecord;
use crate::ui::StageProgress;
use crate::{Error, Result};

pub const ASV_CONFIG_FILE: &str = "asv.conf.json";

/// Paths that never count as a change to the library itself
static NON_CORE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(^|/)tests?(/|$)",
        r"|(^|/)docs?(/|$)",
        r"|(^|/)examples?(/|$)",
        r"|(^|/)\.github(/|$)",
        r"|(^|/)benchmarks?(/|$)",
        r"|(^|/)dist-info(/|$)",
        r"|(^|/)build(/|$)",
        r"|(^|/)site-packages(/|$)",
        r"|(^|/)__(init|pycache)__",
        r"|(^|/)requirements-docs\.txt$",
        r"|(^|/)pyproject\.toml$",
        r"|(^|/)README\.md$",
        r"|\.rst$",
        r"|\.md$",
    ))
    .expect("valid non-core pattern")
});

/// A merged commit of one repository
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub idx: usize,
    /// `<repo_name>_<n>`, numbered from 1 within the repository
    pub commit_id: String,
    pub repo_name: String,
    pub commit_sha: String,
}

/// Repository columns the commit stages need from a dashboards CSV
#[derive(Debug, Clone, Deserialize)]
pub struct DashboardRepo {
    pub repo_name: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub stars: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct CollectOptions {
    /// Pull request state filter (`closed`, `all`, ...)
    pub state: String,
    pub per_page: u32,
    pub max_pages: u32,
}

impl Default for CollectOptions {
    fn default() -> Self {
        Self { state: "closed".to_string(), per_page: 100, max_pages: 10 }
    }
}

/// Merge commits of every merged pull request, in page order.
///
/// A `merge_commit_sha` that no longer resolves is replaced by the result of
/// a merge-message search; PRs without any reachable commit are skipped.
pub async fn collect_merge_commits(github: &GithubClient, repo: &str, options: &CollectOptions) -> Result<Vec<String>> {
    let mut seen = HashSet::new();
    let mut commits = Vec::new();

    for page in 1..=options.max_pages {
        let pulls = github.pulls(repo, &options.state, options.per_page, page).await?;
        if pulls.is_empty() {
            break;
        }

        for pr in &pulls {
            if pr["merged_at"].is_null() {
                continue;
            }
            let Some(sha) = pr["merge_commit_sha"].as_str() else {
                continue;
            };
            if seen.contains(sha) {
                continue;
            }

            let sha = if github.commit(repo, sha).await?.is_some() {
                sha.to_string()
            } else {
                let number = pr["number"].as_u64().unwrap_or(0);
                match github.search_merge_commit(repo, number).await? {
                    Some(found) => found,
                    None => {
                        tracing::debug!("{}: no reachable commit for PR #{}", repo, number);
                        continue;
                    }
                }
            };

            if seen.insert(sha.clone()) {
                commits.push(sha);
            }
        }

        if pulls.len() < options.per_page as usize {
            break;
        }
    }

    Ok(commits)
}

/// Collect merge commits for each repository and number them globally
pub async fn collect_commits(
    github: &GithubClient,
    repos: &[DashboardRepo],
    options: &CollectOptions,
) -> Result<Vec<CommitRecord>> {
    let mut records = Vec::new();

    for repo in repos {
        tracing::info!(
            "Collecting commits for {} ({})",
            repo.repo_name,
            repo.url.as_deref().unwrap_or("no url")
        );
        let shas = collect_merge_commits(github, &repo.repo_name, options).await?;
        for (i, sha) in shas.into_iter().enumerate() {
            records.push(CommitRecord {
                idx: records.len(),
                commit_id: format!("{}_{}", repo.repo_name, i + 1),
                repo_name: repo.repo_name.clone(),
                commit_sha: sha,
            });
        }
    }

    Ok(records)
}

/// True when at least one changed path is library code
pub fn has_core_file(files_changed: &str) -> bool {
    files_changed
        .lines()
        .map(str::trim)
        .filter(|path| !path.is_empty())
        .any(|path| !NON_CORE.is_match(path))
}

/// A commit that survived filtering, joined with its repository
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilteredCommit {
    pub idx: usize,
    pub commit_id: String,
    pub repo_name: String,
    pub commit_sha: String,
    pub url: String,
    pub stars: Option<u64>,
    pub watchers: Option<u64>,
    /// Locations of the asv config on the default branch
    pub asv_conf_path: Vec<String>,
    #[serde(flatten)]
    pub info: CommitInfo,
}

#[derive(Debug, Clone)]
pub struct FilterOptions {
    pub max_repos: usize,
    /// Concurrent config lookups
    pub threads: usize,
    /// Concurrent commit lookups
    pub procs: usize,
}

impl Default for FilterOptions {
    fn default() -> Self {
        Self { max_repos: 150, threads: 16, procs: 1 }
    }
}

/// Most-starred repositories first, at most `max_repos`
pub fn top_repos(mut repos: Vec<RepoRecord>, max_repos: usize) -> Vec<RepoRecord> {
    repos.sort_by(|a, b| b.stars.unwrap_or(0).cmp(&a.stars.unwrap_or(0)));
    repos.truncate(max_repos);
    repos
}

/// Run `f` over `items` with at most `limit` futures in flight.
/// Results keep the input order.
pub(crate) async fn map_concurrent<T, R, F, Fut>(items: Vec<T>, limit: usize, label: &str, f: F) -> Result<Vec<R>>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let f = Arc::new(f);
    let progress = StageProgress::new(items.len(), label);
    let total = items.len();
    let mut tasks = JoinSet::new();

    for (i, item) in items.into_iter().enumerate() {
        let semaphore = semaphore.clone();
        let f = f.clone();
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            (i, f(item).await)
        });
    }

    let mut results: Vec<Option<R>> = (0..total).map(|_| None).collect();
    while let Some(joined) = tasks.join_next().await {
        let (i, result) = joined.map_err(|e| Error::InvalidInput(format!("{} worker failed: {}", label, e)))?;
        results[i] = Some(result);
        progress.inc();
    }
    progress.finish(&format!("{}: {} done", label, total));

    Ok(results.into_iter().flatten().collect())
}

/// Keep commits of repositories that ship an asv config and that touch at
/// least one core file.
pub async fn filter_commits(
    github: &GithubClient,
    repos: Vec<RepoRecord>,
    commits: Vec<CommitRecord>,
    options: &FilterOptions,
) -> Result<Vec<FilteredCommit>> {
    let repos = top_repos(repos, options.max_repos);

    let lookups = {
        let github = github.clone();
        let names: Vec<String> = repos.iter().map(|r| r.repo_name.clone()).collect();
        map_concurrent(names, options.threads, "Scanning repos", move |name| {
            let github = github.clone();
            async move {
                match github.find_file_in_tree(&name, ASV_CONFIG_FILE).await {
                    Ok(paths) => paths,
                    Err(e) => {
                        tracing::warn!("Could not scan {}: {}", name, e);
                        None
                    }
                }
            }
        })
        .await?
    };

    let with_config: HashMap<String, (RepoRecord, Vec<String>)> = repos
        .into_iter()
        .zip(lookups)
        .filter_map(|(repo, paths)| paths.map(|p| (repo.repo_name.clone(), (repo, p))))
        .collect();

    if with_config.is_empty() {
        tracing::warn!("No repositories with {} found", ASV_CONFIG_FILE);
        return Ok(Vec::new());
    }

    let joined: Vec<(CommitRecord, RepoRecord, Vec<String>)> = commits
        .into_iter()
        .filter_map(|commit| {
            with_config
                .get(&commit.repo_name)
                .map(|(repo, paths)| (commit, repo.clone(), paths.clone()))
        })
        .collect();

    let infos = {
        let github = github.clone();
        let keys: Vec<(String, String)> = joined
            .iter()
            .map(|(c, _, _)| (c.repo_name.clone(), c.commit_sha.clone()))
            .collect();
        map_concurrent(keys, options.procs, "Fetching commit metadata", move |(repo, sha)| {
            let github = github.clone();
            async move {
                match github.commit_info(&repo, &sha).await {
                    Ok(Some(info)) => info,
                    Ok(None) => CommitInfo::empty(&sha),
                    Err(e) => {
                        tracing::warn!("Error fetching commit info for {}@{}: {}", repo, sha, e);
                        CommitInfo::empty(&sha)
                    }
                }
            }
        })
        .await?
    };

    let filtered = joined
        .into_iter()
        .zip(infos)
        .filter(|(_, info)| info.is_complete() && has_core_file(&info.files_changed))
        .map(|((commit, repo, asv_conf_path), info)| FilteredCommit {
            idx: commit.idx,
            commit_id: commit.commit_id,
            repo_name: commit.repo_name,
            commit_sha: commit.commit_sha,
            url: repo.url,
            stars: repo.stars,
            watchers: repo.watchers,
            asv_conf_path,
            info,
        })
        .collect();

    Ok(filtered)
}

/// Re-apply the content filter to already filtered commits
pub fn refilter(commits: Vec<FilteredCommit>) -> Vec<FilteredCommit> {
    commits
        .into_iter()
        .filter(|c| c.info.is_complete() && has_core_file(&c.info.files_changed))
        .collect()
}
