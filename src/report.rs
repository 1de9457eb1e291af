//! Breakpoint enrichment: per-file coverage and markdown commit reports
//!
//! A report gathers what GitHub knows about the commit credited with a
//! breakpoint: the commit message, every pull request containing it with its
//! discussion, and a one-line summary of GitHub resources linked from that
//! discussion.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;
use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tiktoken_rs::CoreBPE;
use crate::codecov::{CodecovClient, CoverageRow};
use crate::collection::DashboardIndex;
use crate::detect::Breakpoint;
use crate::github::{extract_links, CommitRef, GithubClient, GithubLink, LinkKind};
use crate::storage::SqliteCache;
use crate::ui::StageProgress;
use crate::{Error, Result};

/// Upper bound on second-level links summarised per report
pub const MAX_LINKS_TO_FOLLOW: usize = 60;

const REPORT_NAMESPACE: &str = "build_report";

static ENCODER: OnceLock<CoreBPE> = OnceLock::new();

/// A rendered report for one ground-truth commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRow {
    pub commit_hash: String,
    pub report: String,
    pub gt_url: String,
    pub n_tokens: usize,
}

/// A breakpoint joined with its commit URL, coverage and report size
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedBreakpoint {
    #[serde(flatten)]
    pub breakpoint: Breakpoint,
    pub gt_url: String,
    /// Mean line coverage of the files the ground-truth commit touched
    pub coverage: Option<f64>,
    pub n_tokens: Option<usize>,
}

/// The `o200k_base` BPE used by gpt-4o models, loaded once
pub fn token_encoder() -> Result<&'static CoreBPE> {
    if let Some(bpe) = ENCODER.get() {
        return Ok(bpe);
    }
    let bpe = tiktoken_rs::o200k_base().map_err(|e| Error::Tokenizer(e.to_string()))?;
    Ok(ENCODER.get_or_init(|| bpe))
}

pub fn token_count(encoder: &CoreBPE, text: &str) -> usize {
    encoder.encode_ordinary(text).len()
}

fn commit_url_for(index: &DashboardIndex, hash: &str) -> Result<String> {
    index
        .commit_url(hash)
        .ok_or_else(|| Error::InvalidInput("Dashboard index has no show_commit_url".to_string()))
}

/// Coverage of every file changed by every commit referenced by the
/// breakpoints (both `hash` and `gt_hash`), each commit queried once.
pub async fn generate_coverage(
    codecov: &CodecovClient,
    github: &GithubClient,
    breakpoints: &[Breakpoint],
    index: &DashboardIndex,
    only: &[String],
) -> Result<Vec<CoverageRow>> {
    let mut seen = HashSet::new();
    let mut targets = Vec::new();
    for (typ, pick) in [("hash", 0), ("gt_hash", 1)] {
        for bp in breakpoints {
            let hash = if pick == 0 { &bp.hash } else { &bp.gt_hash };
            let url = commit_url_for(index, hash)?;
            if seen.insert(url.clone()) {
                targets.push((typ, url));
            }
        }
    }

    let progress = StageProgress::new(targets.len(), "Codecov");
    let mut rows = Vec::new();
    for (typ, url) in targets {
        match codecov.commit_coverage(github, &url, only).await {
            Ok(files) => rows.extend(files.into_iter().map(|(path, coverage)| CoverageRow {
                typ: typ.to_string(),
                url: url.clone(),
                path,
                coverage,
            })),
            Err(e) => tracing::warn!("Skipping coverage for {}: {}", url, e),
        }
        progress.inc();
    }
    progress.finish(&format!("Coverage for {} files", rows.len()));
    Ok(rows)
}

/// `2024-03-01T12:30:00Z` → `12:30 01/03/2024`
pub fn format_timestamp(ts: &str) -> String {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(ts) {
        return parsed.format("%H:%M %d/%m/%Y").to_string();
    }
    match NaiveDateTime::parse_from_str(ts.trim_end_matches('Z'), "%Y-%m-%dT%H:%M:%S") {
        Ok(parsed) => parsed.format("%H:%M %d/%m/%Y").to_string(),
        Err(_) => ts.to_string(),
    }
}

fn commit_block(commit: &CommitRef, date: &str, message: &str) -> String {
    format!(
        "Generic Information:\n - Commit id: {sha}\n - Commit: {url}\n - Date of Commit: {date}\n## Commit message\n  {message}",
        sha = commit.sha,
        url = commit.url(),
        date = date,
        message = message.replace('\n', "\n  "),
    )
}

fn pr_header(pr: &Value) -> String {
    if !pr.is_object() || pr.as_object().is_some_and(|o| o.is_empty()) {
        return "_No pull-request metadata available._".to_string();
    }

    let labels: Vec<&str> = pr["labels"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|l| l["name"].as_str())
        .collect();
    let labels = if labels.is_empty() { "—".to_string() } else { labels.join(", ") };
    let milestone = pr["milestone"]["title"].as_str().unwrap_or("—");
    let merged = pr["merged_at"].as_str().unwrap_or("not-merged");
    let merged_by = pr["merged_by"]["login"]
        .as_str()
        .or_else(|| pr["user"]["login"].as_str())
        .unwrap_or("unknown");

    format!(
        "### Link 1: {title} · Pull Request #{number} · {repo}\n\nMerged by **@{merged_by}** on **{merged}**\nLabels: {labels} — Milestone: {milestone}\n\n## GitHub Comments",
        title = pr["title"].as_str().unwrap_or(""),
        number = pr["number"],
        repo = pr["base"]["repo"]["full_name"].as_str().unwrap_or(""),
    )
}

#[derive(Clone, Copy)]
enum CommentKind {
    Issue,
    ReviewComment,
    Review,
}

fn comment_block(item: &Value, kind: CommentKind) -> String {
    let body = item["body"].as_str().unwrap_or("");
    let excerpt = body.trim().replace("\r\n", "\n");
    let ts_field = match kind {
        CommentKind::Review => "submitted_at",
        CommentKind::Issue | CommentKind::ReviewComment => "created_at",
    };
    let ts = item[ts_field].as_str().map(format_timestamp).unwrap_or_default();
    let links = extract_links(body);
    let links = if links.is_empty() { "—".to_string() } else { links.join(", ") };

    format!(
        "**{login}** — {ts}\n\n{excerpt}\n\nLinks mentioned: {links}",
        login = item["user"]["login"].as_str().unwrap_or("unknown"),
    )
}

async fn summarize_link(github: &GithubClient, link: &GithubLink) -> String {
    let base = format!("https://github.com/{}/{}", link.owner, link.repo);
    let lookup = match link.kind {
        LinkKind::Pull => github.pull(&link.owner, &link.repo, &link.id).await,
        LinkKind::Issue => github.issue(&link.owner, &link.repo, &link.id).await,
        LinkKind::Commit => github.commit(&format!("{}/{}", link.owner, link.repo), &link.id).await,
    };
    let Ok(Some(resource)) = lookup else {
        return String::new();
    };

    match link.kind {
        LinkKind::Pull => match resource["title"].as_str() {
            Some(title) => format!("* PR #{}: {}  \n  <{}/pull/{}>", link.id, title, base, link.id),
            None => String::new(),
        },
        LinkKind::Issue => match resource["title"].as_str() {
            Some(title) => format!("* Issue #{}: {}  \n  <{}/issues/{}>", link.id, title, base, link.id),
            None => String::new(),
        },
        LinkKind::Commit => match resource["commit"]["message"].as_str() {
            Some(message) => {
                let first_line = message.lines().next().unwrap_or("");
                let short: String = link.id.chars().take(7).collect();
                format!("* Commit {}: {}  \n  <{}/commit/{}>", short, first_line, base, link.id)
            }
            None => String::new(),
        },
    }
}

/// Render the markdown report for a commit URL. `None` when the commit
/// itself cannot be fetched.
pub async fn build_report(github: &GithubClient, commit_url: &str) -> Result<Option<String>> {
    let commit = CommitRef::parse(commit_url)?;
    let Some(meta) = github.commit(&commit.full_name(), &commit.sha).await? else {
        return Ok(None);
    };

    let date = meta["commit"]["author"]["date"].as_str().unwrap_or("");
    let message = meta["commit"]["message"].as_str().unwrap_or("");
    let mut parts = vec![commit_block(&commit, date, message), String::new()];

    let pulls = github.commit_pulls(&commit.owner, &commit.repo, &commit.sha).await?;
    if pulls.is_empty() {
        parts.push("_No pull-requests reference this commit._".to_string());
        return Ok(Some(parts.join("\n\n")));
    }

    let mut visited: HashSet<String> = HashSet::from([commit_url.to_string()]);

    for pr in &pulls {
        let Some(number) = pr["number"].as_u64() else {
            continue;
        };
        let meta = github
            .pull(&commit.owner, &commit.repo, &number.to_string())
            .await?
            .unwrap_or(Value::Null);
        parts.push(String::new());
        parts.push(pr_header(&meta));

        let mut comment_links: Vec<String> = Vec::new();
        let discussion = [
            (github.issue_comments(&commit.owner, &commit.repo, number).await?, CommentKind::Issue),
            (github.review_comments(&commit.owner, &commit.repo, number).await?, CommentKind::ReviewComment),
            (github.reviews(&commit.owner, &commit.repo, number).await?, CommentKind::Review),
        ];
        for (items, kind) in &discussion {
            for item in items {
                parts.push(comment_block(item, *kind));
                for link in extract_links(item["body"].as_str().unwrap_or("")) {
                    if !comment_links.contains(&link) {
                        comment_links.push(link);
                    }
                }
            }
        }

        let sub_links: Vec<String> = comment_links
            .into_iter()
            .filter(|l| !visited.contains(l))
            .take(MAX_LINKS_TO_FOLLOW)
            .collect();
        if !sub_links.is_empty() {
            parts.push("\n### Links found inside comments (level 2)\n".to_string());
        }
        for link in sub_links {
            match GithubLink::classify(&link) {
                Some(resource) => parts.push(summarize_link(github, &resource).await),
                None => parts.push(format!("* <{}>", link)),
            }
            visited.insert(link);
        }
    }

    Ok(Some(parts.join("\n\n")))
}

/// [`build_report`] through the SQLite cache
pub async fn cached_report(github: &GithubClient, cache: Option<&SqliteCache>, commit_url: &str) -> Result<Option<String>> {
    if let Some(cache) = cache {
        if let Some(hit) = cache.get_as::<_, Option<String>>(REPORT_NAMESPACE, &commit_url)? {
            return Ok(hit);
        }
    }
    let report = build_report(github, commit_url).await?;
    if let Some(cache) = cache {
        cache.put(REPORT_NAMESPACE, &commit_url, &report)?;
    }
    Ok(report)
}

/// Mean coverage per commit URL over ground-truth rows with a value
pub fn mean_gt_coverage(coverage: &[CoverageRow]) -> HashMap<String, f64> {
    let mut sums: HashMap<String, (f64, usize)> = HashMap::new();
    for row in coverage.iter().filter(|r| r.typ == "gt_hash") {
        if let Some(value) = row.coverage {
            let entry = sums.entry(row.url.clone()).or_insert((0.0, 0));
            entry.0 += value;
            entry.1 += 1;
        }
    }
    sums.into_iter().map(|(url, (sum, n))| (url, sum / n as f64)).collect()
}

/// Attach commit URLs, coverage and reports to breakpoints.
///
/// With coverage data only breakpoints whose ground-truth commit has a
/// coverage value are kept.
pub async fn enrich_breakpoints(
    github: &GithubClient,
    cache: Option<&SqliteCache>,
    breakpoints: &[Breakpoint],
    coverage: Option<&[CoverageRow]>,
    index: &DashboardIndex,
) -> Result<(Vec<EnrichedBreakpoint>, Vec<ReportRow>)> {
    let means = coverage.map(mean_gt_coverage);

    let mut enriched = Vec::new();
    for bp in breakpoints {
        let gt_url = commit_url_for(index, &bp.gt_hash)?;
        let coverage = match &means {
            Some(means) => match means.get(&gt_url) {
                Some(mean) => Some(*mean),
                None => continue,
            },
            None => None,
        };
        enriched.push(EnrichedBreakpoint { breakpoint: bp.clone(), gt_url, coverage, n_tokens: None });
    }

    let mut urls: Vec<String> = Vec::new();
    for bp in &enriched {
        if !urls.contains(&bp.gt_url) {
            urls.push(bp.gt_url.clone());
        }
    }

    let encoder = token_encoder()?;
    let progress = StageProgress::new(urls.len(), "Reports");
    let mut reports = Vec::new();
    let mut tokens: HashMap<String, usize> = HashMap::new();
    for url in urls {
        match cached_report(github, cache, &url).await {
            Ok(Some(report)) => {
                let n_tokens = token_count(encoder, &report);
                tokens.insert(url.clone(), n_tokens);
                reports.push(ReportRow {
                    commit_hash: url.rsplit('/').next().unwrap_or("").to_string(),
                    report,
                    gt_url: url,
                    n_tokens,
                });
            }
            Ok(None) => tracing::warn!("No commit metadata for {}", url),
            Err(e) => tracing::warn!("Report for {} failed: {}", url, e),
        }
        progress.inc();
    }
    progress.finish(&format!("Built {} reports", reports.len()));

    for bp in &mut enriched {
        bp.n_tokens = tokens.get(&bp.gt_url).copied();
    }
    Ok((enriched, reports))
}
