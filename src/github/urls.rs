//! GitHub URL parsing helpers

use std::fmt;
use std::sync::LazyLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use crate::{Error, Result};

static COMMIT_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https://github\.com/([^/]+)/([^/]+)/commit/([0-9a-f]{7,40})").expect("valid commit url regex")
});

static LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https?://[^\s)<>\]]+").expect("valid link regex")
});

/// Turn a repository URL into the canonical `owner/repo` string.
///
/// Accepts `https://github.com/owner/repo`, `git@github.com:owner/repo.git`,
/// `ssh://git@github.com/owner/repo.git` and bare `owner/repo`.
pub fn extract_repo_full_name(url: &str) -> Option<String> {
    let url = url.trim();
    if url.is_empty() {
        return None;
    }

    let path = if let Some(rest) = url.strip_prefix("git@") {
        rest.split_once(':').map(|(_, p)| p.to_string())?
    } else {
        match url::Url::parse(url) {
            Ok(parsed) => parsed.path().to_string(),
            Err(_) => url.to_string(),
        }
    };

    let path = path.trim_matches('/');
    let path = path.strip_suffix(".git").unwrap_or(path);
    let mut parts = path.split('/').filter(|p| !p.is_empty());
    let owner = parts.next()?;
    let repo = parts.next()?;
    let repo = repo.strip_suffix(".git").unwrap_or(repo);
    Some(format!("{}/{}", owner, repo))
}

/// A commit on GitHub identified by owner, repository and SHA
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommitRef {
    pub owner: String,
    pub repo: String,
    pub sha: String,
}

impl CommitRef {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>, sha: impl Into<String>) -> Self {
        Self { owner: owner.into(), repo: repo.into(), sha: sha.into() }
    }

    /// Parse `https://github.com/<owner>/<repo>/commit/<sha>`
    pub fn parse(url: &str) -> Result<Self> {
        let caps = COMMIT_URL
            .captures(url)
            .ok_or_else(|| Error::InvalidUrl(format!("Not a GitHub commit URL: {:?}", url)))?;
        Ok(Self::new(&caps[1], &caps[2], &caps[3]))
    }

    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }

    pub fn url(&self) -> String {
        format!("https://github.com/{}/{}/commit/{}", self.owner, self.repo, self.sha)
    }
}

impl fmt::Display for CommitRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Pull,
    Issue,
    Commit,
}

/// A GitHub pull request, issue or commit referenced from free text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GithubLink {
    pub kind: LinkKind,
    pub owner: String,
    pub repo: String,
    pub id: String,
}

impl GithubLink {
    pub fn classify(url: &str) -> Option<Self> {
        let parsed = url::Url::parse(url).ok()?;
        if parsed.host_str() != Some("github.com") {
            return None;
        }
        let parts: Vec<&str> = parsed.path().trim_matches('/').split('/').collect();
        if parts.len() < 4 {
            return None;
        }
        let is_number = !parts[3].is_empty() && parts[3].chars().all(|c| c.is_ascii_digit());
        let kind = match parts[2] {
            "pull" if is_number => LinkKind::Pull,
            "issues" if is_number => LinkKind::Issue,
            "commit" => LinkKind::Commit,
            _ => return None,
        };
        Some(Self {
            kind,
            owner: parts[0].to_string(),
            repo: parts[1].to_string(),
            id: parts[3].to_string(),
        })
    }
}

/// All http(s) links in a block of text, in order of appearance
pub fn extract_links(text: &str) -> Vec<String> {
    LINK.find_iter(text).map(|m| m.as_str().to_string()).collect()
}
