//! Collation of per-commit container results into publishable asv trees
//!
//! Containers leave `<results>/<sha>/<python>/results/<machine>/*.json`
//! behind. Runs are regrouped per repository under `<out>/runs/<owner_repo>/`,
//! published with `asv publish` into `<out>/html/<owner_repo>/` and parsed
//! back as a dashboard collection.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::process::Command;
use crate::artifact;
use crate::dashboard::{make_benchmark_from_html, DashboardFetcher, COLLECTION_FILE};
use crate::{Error, Result};

const MACHINE_FILE: &str = "machine.json";
const ASV_CONF_FILE: &str = "asv.conf.json";
const BENCHMARKS_FILE: &str = "benchmarks.json";

/// The two columns of the commit metadata the collation needs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitMetadata {
    pub commit_sha: String,
    pub repo_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunStats {
    pub repo_path: String,
    pub repo_name: String,
    pub commit_sha: String,
    pub n_runids: usize,
}

/// `owner/repo` → `owner_repo`
pub fn repo_dir_name(repo_name: &str) -> String {
    repo_name.replace('/', "_")
}

fn read_object(path: &Path) -> Map<String, Value> {
    let Ok(text) = std::fs::read_to_string(path) else {
        return Map::new();
    };
    match serde_json::from_str::<Value>(&text) {
        Ok(Value::Object(map)) => map,
        _ => {
            tracing::warn!("Ignoring unreadable {}", path.display());
            Map::new()
        }
    }
}

fn write_object(path: &Path, map: Map<String, Value>) -> Result<()> {
    std::fs::write(path, serde_json::to_string_pretty(&Value::Object(map))?)?;
    Ok(())
}

/// Merge the top-level keys of `source` into `target` (keys in `source` win).
/// A missing or corrupt target starts out empty.
pub fn update_json(target: &Path, source: &Path) -> Result<()> {
    let incoming: Value = serde_json::from_str(&std::fs::read_to_string(source)?)?;
    let Value::Object(incoming) = incoming else {
        return Err(Error::InvalidInput(format!("{} is not a JSON object", source.display())));
    };
    let mut merged = read_object(target);
    merged.extend(incoming);
    write_object(target, merged)
}

fn glob_paths(pattern: &str) -> Result<Vec<PathBuf>> {
    let paths = glob::glob(pattern).map_err(|e| Error::InvalidInput(format!("Bad pattern {}: {}", pattern, e)))?;
    let mut found = Vec::new();
    for entry in paths {
        found.push(entry.map_err(|e| Error::Io(e.into_error()))?);
    }
    found.sort();
    Ok(found)
}

/// Every `<sha>/<major>.<minor>/results` directory below `results_dir`
pub fn find_result_dirs(results_dir: &Path) -> Result<Vec<PathBuf>> {
    let base = glob::Pattern::escape(&results_dir.to_string_lossy());
    let dirs = glob_paths(&format!("{}/*/[0-9].[0-9]*/results", base))?;
    Ok(dirs.into_iter().filter(|p| p.is_dir()).collect())
}

fn copy_dir(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Rename the machine of every run in `dir`
fn rewrite_machine(dir: &Path, machine: &str) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let mut map = read_object(&path);
        if path.file_name().and_then(|n| n.to_str()) == Some(MACHINE_FILE) {
            map.insert("machine".to_string(), Value::String(machine.to_string()));
        } else if let Some(Value::Object(params)) = map.get_mut("params") {
            params.insert("machine".to_string(), Value::String(machine.to_string()));
        } else {
            continue;
        }
        write_object(&path, map)?;
    }
    Ok(())
}

/// Regroup container results per repository under `runs_dir`.
///
/// Commits missing from `commits` are skipped. With `default_machine_name`
/// every run-id directory is renamed to it and the machine recorded inside
/// the result files is rewritten to match.
pub fn aggregate_benchmark_runs(
    commits: &[CommitMetadata],
    results_dir: &Path,
    runs_dir: &Path,
    default_machine_name: Option<&str>,
) -> Result<Vec<RunStats>> {
    let repos: HashMap<&str, &str> = commits
        .iter()
        .map(|c| (c.commit_sha.as_str(), c.repo_name.as_str()))
        .collect();

    let mut stats = Vec::new();
    for results in find_result_dirs(results_dir)? {
        let Some(python_dir) = results.parent() else { continue };
        let Some(sha) = python_dir.parent().and_then(|d| d.file_name()).and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(repo_name) = repos.get(sha) else {
            tracing::warn!("No metadata for commit {}, skipping {}", sha, results.display());
            continue;
        };

        let repo_path = repo_dir_name(repo_name);
        let out = runs_dir.join(&repo_path);
        std::fs::create_dir_all(&out)?;

        if results.join(BENCHMARKS_FILE).is_file() {
            update_json(&out.join(BENCHMARKS_FILE), &results.join(BENCHMARKS_FILE))?;
        }
        if python_dir.join(ASV_CONF_FILE).is_file() {
            update_json(&out.join(ASV_CONF_FILE), &python_dir.join(ASV_CONF_FILE))?;
        }

        let mut n_runids = 0;
        for entry in std::fs::read_dir(&results)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let run_name = match default_machine_name {
                Some(name) => name.to_string(),
                None => entry.file_name().to_string_lossy().into_owned(),
            };
            let target = out.join(&run_name);
            // a run id is replaced wholesale; a shared machine name accumulates runs
            if default_machine_name.is_none() && target.exists() {
                std::fs::remove_dir_all(&target)?;
            }
            copy_dir(&entry.path(), &target)?;
            if let Some(name) = default_machine_name {
                rewrite_machine(&target, name)?;
                if target.join(MACHINE_FILE).is_file() {
                    std::fs::copy(target.join(MACHINE_FILE), out.join(MACHINE_FILE))?;
                }
            }
            n_runids += 1;
        }

        tracing::debug!("Collated {} run(s) of {} into {}", n_runids, sha, out.display());
        stats.push(RunStats {
            repo_path,
            repo_name: repo_name.to_string(),
            commit_sha: sha.to_string(),
            n_runids,
        });
    }
    Ok(stats)
}

/// At least one result file besides the machine and config files
pub fn has_results(repo_runs_dir: &Path) -> Result<bool> {
    let base = glob::Pattern::escape(&repo_runs_dir.to_string_lossy());
    let files = glob_paths(&format!("{}/*/*.json", base))?;
    Ok(files.iter().any(|f| {
        let name = f.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        name != MACHINE_FILE && name != ASV_CONF_FILE
    }))
}

/// Clone `url` into `dir`, or open the checkout already there.
pub fn clone_or_open(url: &str, dir: &Path) -> Result<git2::Repository> {
    if dir.join(".git").exists() {
        tracing::info!("Using existing repository at {}", dir.display());
        return Ok(git2::Repository::open(dir)?);
    }
    tracing::info!("Cloning {} into {}", url, dir.display());
    if let Some(parent) = dir.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(git2::build::RepoBuilder::new().clone(url, dir)?)
}

/// Point an asv config at a local checkout and the collated runs.
pub fn patch_asv_conf(conf_path: &Path, repo_dir: &Path, results_dir: &Path, html_dir: &Path) -> Result<()> {
    let mut conf = read_object(conf_path);
    for (key, path) in [("repo", repo_dir), ("results_dir", results_dir), ("html_dir", html_dir)] {
        conf.insert(key.to_string(), Value::String(path.to_string_lossy().into_owned()));
    }
    write_object(conf_path, conf)
}

pub async fn run_asv_publish(conf_path: &Path) -> Result<()> {
    tracing::info!("$ asv publish --config {}", conf_path.display());
    let output = Command::new("asv")
        .arg("publish")
        .arg("--config")
        .arg(conf_path)
        .output()
        .await
        .map_err(|e| Error::Publish(format!("Could not run asv: {}", e)))?;
    if !output.status.success() {
        return Err(Error::Publish(format!(
            "asv publish failed for {}: {}",
            conf_path.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// Clone the repository, patch its config and render the HTML dashboard.
pub async fn publish_repo(repo_url: &str, repo_dir: &Path, conf_path: &Path, runs_dir: &Path, html_dir: &Path) -> Result<()> {
    let url = repo_url.to_string();
    let dir = repo_dir.to_path_buf();
    tokio::task::spawn_blocking(move || clone_or_open(&url, &dir).map(|_| ()))
        .await
        .map_err(|e| Error::Publish(format!("Clone task failed: {}", e)))??;

    patch_asv_conf(conf_path, repo_dir, runs_dir, html_dir)?;
    std::fs::create_dir_all(html_dir)?;
    run_asv_publish(conf_path).await
}

#[derive(Debug, Clone)]
pub struct CollateOptions {
    pub results_dir: PathBuf,
    pub commit_metadata: PathBuf,
    pub output_dir: PathBuf,
    pub default_machine_name: Option<String>,
}

/// Aggregate, publish and parse every repository's runs. Returns the saved
/// dashboard collections.
pub async fn collate(fetcher: &DashboardFetcher, options: &CollateOptions) -> Result<Vec<PathBuf>> {
    let commits: Vec<CommitMetadata> = artifact::read_jsonl(&options.commit_metadata)?;
    let output_dir = std::path::absolute(&options.output_dir)?;
    let runs_root = output_dir.join("runs");

    let stats = aggregate_benchmark_runs(
        &commits,
        &options.results_dir,
        &runs_root,
        options.default_machine_name.as_deref(),
    )?;
    tracing::info!("Collated {} commit result dirs", stats.len());

    let mut seen = HashSet::new();
    let mut saved = Vec::new();
    for stat in stats.iter().filter(|s| seen.insert(s.repo_path.clone())) {
        let runs_dir = runs_root.join(&stat.repo_path);
        if !has_results(&runs_dir)? {
            tracing::warn!("No benchmark results found for {}. Skipping dashboard creation.", stat.repo_path);
            continue;
        }

        let html_dir = output_dir.join("html").join(&stat.repo_path);
        publish_repo(
            &format!("https://github.com/{}.git", stat.repo_name),
            &output_dir.join("repos").join(&stat.repo_path),
            &runs_dir.join(ASV_CONF_FILE),
            &runs_dir,
            &html_dir,
        )
        .await?;

        let base = html_dir.to_string_lossy().into_owned();
        let Some(mut collection) = make_benchmark_from_html(fetcher, &base, &html_dir, false).await? else {
            tracing::warn!("No dashboard collection generated for {}. Skipping.", stat.repo_path);
            continue;
        };
        let path = collection.save(&html_dir.join(COLLECTION_FILE))?;
        tracing::info!(
            "Saved {} benchmark rows and {} summary rows -> {}",
            collection.benchmarks.len(),
            collection.summaries.len(),
            path.display()
        );
        saved.push(path);
    }
    Ok(saved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn write(path: &Path, value: Value) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, value.to_string()).unwrap();
    }

    fn read(path: &Path) -> Value {
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
    }

    /// `<root>/<sha>/3.11/results/<machine>/…` as a container leaves it
    fn container_output(root: &Path, sha: &str, machine: &str, bench: &str) {
        let python = root.join(sha).join("3.11");
        write(&python.join(ASV_CONF_FILE), json!({"version": 1, "project": "demo"}));
        write(&python.join("results").join(BENCHMARKS_FILE), json!({bench: {"unit": "seconds"}}));
        write(&python.join("results").join(machine).join(MACHINE_FILE), json!({"machine": machine, "cpu": "x"}));
        write(
            &python.join("results").join(machine).join(format!("{}-py.json", &sha[..4])),
            json!({"commit_hash": sha, "params": {"machine": machine, "python": "3.11"}, "results": {}}),
        );
    }

    #[test]
    fn test_update_json_merges_and_recovers_corrupt_target() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("t.json");
        let source = dir.path().join("s.json");

        std::fs::write(&target, "{not json").unwrap();
        write(&source, json!({"a": 1}));
        update_json(&target, &source).unwrap();
        assert_eq!(read(&target), json!({"a": 1}));

        write(&source, json!({"a": 2, "b": 3}));
        update_json(&target, &source).unwrap();
        assert_eq!(read(&target), json!({"a": 2, "b": 3}));
    }

    #[test]
    fn test_find_result_dirs() {
        let dir = TempDir::new().unwrap();
        container_output(dir.path(), "aaaa1111", "box", "b1");
        std::fs::create_dir_all(dir.path().join("bbbb2222").join("misc").join("results")).unwrap();

        let found = find_result_dirs(dir.path()).unwrap();
        assert_eq!(found, vec![dir.path().join("aaaa1111").join("3.11").join("results")]);
    }

    #[test]
    fn test_aggregate_groups_by_repo() {
        let dir = TempDir::new().unwrap();
        let results = dir.path().join("results");
        let runs = dir.path().join("runs");
        container_output(&results, "aaaa1111", "box-a", "b1");
        container_output(&results, "bbbb2222", "box-b", "b2");
        container_output(&results, "cccc3333", "box-c", "b3");

        let commits = vec![
            CommitMetadata { commit_sha: "aaaa1111".into(), repo_name: "o/r".into() },
            CommitMetadata { commit_sha: "bbbb2222".into(), repo_name: "o/r".into() },
        ];
        let stats = aggregate_benchmark_runs(&commits, &results, &runs, None).unwrap();

        assert_eq!(stats.len(), 2);
        assert!(stats.iter().all(|s| s.repo_path == "o_r" && s.n_runids == 1));
        let repo = runs.join("o_r");
        assert_eq!(read(&repo.join(BENCHMARKS_FILE)), json!({"b1": {"unit": "seconds"}, "b2": {"unit": "seconds"}}));
        assert!(repo.join("box-a").join(MACHINE_FILE).is_file());
        assert!(repo.join("box-b").join("bbbb-py.json").is_file());
        assert!(!repo.join("box-c").exists());
        assert!(has_results(&repo).unwrap());
    }

    #[test]
    fn test_aggregate_with_default_machine_name() {
        let dir = TempDir::new().unwrap();
        let results = dir.path().join("results");
        let runs = dir.path().join("runs");
        container_output(&results, "aaaa1111", "box-a", "b1");

        let commits = vec![CommitMetadata { commit_sha: "aaaa1111".into(), repo_name: "o/r".into() }];
        aggregate_benchmark_runs(&commits, &results, &runs, Some("bench-host")).unwrap();

        let run = runs.join("o_r").join("bench-host");
        assert_eq!(read(&run.join(MACHINE_FILE))["machine"], "bench-host");
        assert_eq!(read(&run.join("aaaa-py.json"))["params"]["machine"], "bench-host");
        assert_eq!(read(&runs.join("o_r").join(MACHINE_FILE))["machine"], "bench-host");
    }

    #[test]
    fn test_aggregate_replaces_stale_run_dir() {
        let dir = TempDir::new().unwrap();
        let results = dir.path().join("results");
        let runs = dir.path().join("runs");
        container_output(&results, "aaaa1111", "box-a", "b1");
        let stale = runs.join("o_r").join("box-a").join("old-py.json");
        write(&stale, json!({"results": {}}));

        let commits = vec![CommitMetadata { commit_sha: "aaaa1111".into(), repo_name: "o/r".into() }];
        aggregate_benchmark_runs(&commits, &results, &runs, None).unwrap();

        assert!(!stale.exists());
        assert!(runs.join("o_r").join("box-a").join("aaaa-py.json").is_file());
    }

    #[test]
    fn test_default_machine_name_keeps_earlier_runs() {
        let dir = TempDir::new().unwrap();
        let results = dir.path().join("results");
        let runs = dir.path().join("runs");
        container_output(&results, "aaaa1111", "box-a", "b1");
        container_output(&results, "bbbb2222", "box-b", "b2");

        let commits = vec![
            CommitMetadata { commit_sha: "aaaa1111".into(), repo_name: "o/r".into() },
            CommitMetadata { commit_sha: "bbbb2222".into(), repo_name: "o/r".into() },
        ];
        aggregate_benchmark_runs(&commits, &results, &runs, Some("bench-host")).unwrap();

        let run = runs.join("o_r").join("bench-host");
        assert!(run.join("aaaa-py.json").is_file());
        assert!(run.join("bbbb-py.json").is_file());
    }

    #[test]
    fn test_has_results_ignores_machine_and_config() {
        let dir = TempDir::new().unwrap();
        write(&dir.path().join("box").join(MACHINE_FILE), json!({}));
        write(&dir.path().join(ASV_CONF_FILE), json!({}));
        assert!(!has_results(dir.path()).unwrap());
    }

    #[test]
    fn test_patch_asv_conf() {
        let dir = TempDir::new().unwrap();
        let conf = dir.path().join(ASV_CONF_FILE);
        write(&conf, json!({"project": "demo", "repo": ".."}));

        patch_asv_conf(&conf, Path::new("/r"), Path::new("/runs"), Path::new("/html")).unwrap();
        let patched = read(&conf);
        assert_eq!(patched["project"], "demo");
        assert_eq!(patched["repo"], "/r");
        assert_eq!(patched["results_dir"], "/runs");
        assert_eq!(patched["html_dir"], "/html");
    }

    #[test]
    fn test_clone_or_open_reuses_checkout() {
        let dir = TempDir::new().unwrap();
        git2::Repository::init(dir.path()).unwrap();
        let repo = clone_or_open("https://example.invalid/none.git", dir.path()).unwrap();
        assert!(repo.workdir().is_some());
    }
}
