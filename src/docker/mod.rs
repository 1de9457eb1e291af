//! Benchmark execution in Docker containers
//!
//! One image per repository (`asv-<owner>-<repo>`) is built from the
//! `docker/` directory; every commit then runs in its own throwaway container
//! pinned to a dedicated block of CPU cores.

pub mod orchestrator;

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use async_trait::async_trait;
use tokio::process::Command;
use crate::commit::FilteredCommit;
use crate::{Error, Result};

pub use orchestrator::{orchestrate, CoreLease, CorePool, OrchestrateSummary};

/// One commit to benchmark
#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkJob {
    pub idx: usize,
    pub repo_name: String,
    pub commit_sha: String,
    pub asv_conf_path: String,
}

impl BenchmarkJob {
    pub fn from_commit(idx: usize, commit: &FilteredCommit) -> Result<Self> {
        let asv_conf_path = commit.asv_conf_path.first().cloned().ok_or_else(|| {
            Error::InvalidInput(format!("{}@{} has no asv config path", commit.repo_name, commit.commit_sha))
        })?;
        Ok(Self {
            idx,
            repo_name: commit.repo_name.clone(),
            commit_sha: commit.commit_sha.clone(),
            asv_conf_path,
        })
    }

    pub fn image_name(&self) -> String {
        image_name(&self.repo_name)
    }

    pub fn repo_url(&self) -> String {
        repo_url(&self.repo_name)
    }

    /// `asv_<idx>_<sha7>`
    pub fn container_name(&self) -> String {
        let short: String = self.commit_sha.chars().take(7).collect();
        format!("asv_{}_{}", self.idx, short)
    }
}

/// `scikit-learn/scikit-learn` → `asv-scikit-learn-scikit-learn`
pub fn image_name(repo_name: &str) -> String {
    let mut parts = repo_name.rsplit('/');
    let repo = parts.next().unwrap_or_default();
    let owner = parts.next().unwrap_or_default();
    format!("asv-{}-{}", owner, repo)
}

pub fn repo_url(repo_name: &str) -> String {
    format!("https://www.github.com/{}", repo_name)
}

pub fn jobs_from_commits(commits: &[FilteredCommit]) -> Result<Vec<BenchmarkJob>> {
    commits
        .iter()
        .enumerate()
        .map(|(idx, commit)| BenchmarkJob::from_commit(idx, commit))
        .collect()
}

pub fn available_cpus() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

/// Resolve `(num_cores, max_concurrency)` against the machine's CPU count.
///
/// `max_concurrency` defaults to `max(4, cpus / 2)`; `num_cores` is at least 1.
pub fn validate_concurrency(num_cores: usize, max_concurrency: Option<usize>, cpus: usize) -> Result<(usize, usize)> {
    let num_cores = num_cores.max(1);
    let max_concurrency = max_concurrency.unwrap_or_else(|| (cpus / 2).max(4));
    if max_concurrency == 0 {
        return Err(Error::InvalidInput("max_concurrency must be at least 1".to_string()));
    }
    if num_cores * max_concurrency > cpus {
        return Err(Error::InvalidInput(format!(
            "{} containers x {} cores needs {} CPUs, only {} available",
            max_concurrency,
            num_cores,
            num_cores * max_concurrency,
            cpus
        )));
    }
    Ok((num_cores, max_concurrency))
}

/// Comma-separated cpuset (`"4,5,6,7"`)
pub fn cpuset(cores: &[usize]) -> String {
    cores.iter().map(usize::to_string).collect::<Vec<_>>().join(",")
}

/// Value of `ASV_ARGS` inside the container
pub fn container_asv_args(asv_args: &str, cpuset: &str) -> String {
    let n = cpuset.split(',').filter(|c| !c.is_empty()).count();
    format!("{} --cpu-affinity {} --parallel {}", asv_args, cpuset, n).trim_start().to_string()
}

/// Runs one benchmark job on a set of cores and reports its exit code
#[async_trait]
pub trait ContainerRunner: Send + Sync {
    async fn run(&self, job: &BenchmarkJob, cpuset: &str) -> Result<i32>;
}

/// Drives the `docker` command line
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
    output_dir: PathBuf,
    asv_args: String,
}

impl DockerCli {
    pub fn new(output_dir: &Path, asv_args: &str) -> Self {
        Self {
            binary: "docker".to_string(),
            output_dir: output_dir.to_path_buf(),
            asv_args: asv_args.to_string(),
        }
    }

    pub fn with_binary(mut self, binary: &str) -> Self {
        self.binary = binary.to_string();
        self
    }

    pub fn results_dir(&self) -> PathBuf {
        self.output_dir.join("results")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.output_dir.join("logs")
    }

    /// Docker is installed and the daemon answers
    pub async fn check(&self) -> Result<()> {
        let status = Command::new(&self.binary)
            .args(["version", "--format", "{{.Server.Version}}"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| Error::Docker(format!("Could not run {}: {}", self.binary, e)))?;
        if !status.success() {
            return Err(Error::Docker("Could not connect to Docker daemon".to_string()));
        }
        Ok(())
    }

    pub async fn image_exists(&self, image: &str) -> Result<bool> {
        let status = Command::new(&self.binary)
            .args(["image", "inspect", image])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| Error::Docker(format!("Could not run {}: {}", self.binary, e)))?;
        Ok(status.success())
    }

    /// Build `image` from `docker_dir` unless it already exists locally.
    pub async fn ensure_image(&self, image: &str, repo_url: &str, docker_dir: &Path) -> Result<()> {
        if self.image_exists(image).await? {
            tracing::info!("Docker image '{}' found locally", image);
            return Ok(());
        }

        tracing::info!("Docker image '{}' not found locally, building it with REPO_URL={}", image, repo_url);
        let status = Command::new(&self.binary)
            .arg("build")
            .arg("--build-arg")
            .arg(format!("REPO_URL={}", repo_url))
            .arg("-t")
            .arg(image)
            .arg(docker_dir)
            .status()
            .await
            .map_err(|e| Error::Docker(format!("Could not run {}: {}", self.binary, e)))?;
        if !status.success() {
            return Err(Error::Docker(format!("Failed to build image {}", image)));
        }
        Ok(())
    }

    fn run_args(&self, job: &BenchmarkJob, cpuset: &str) -> Vec<String> {
        let volume = format!("{}:/output", self.results_dir().display());
        vec![
            "run".into(),
            "--rm".into(),
            "--name".into(),
            job.container_name(),
            "--cpuset-cpus".into(),
            cpuset.into(),
            "-e".into(),
            format!("COMMIT_SHA={}", job.commit_sha),
            "-e".into(),
            format!("ASV_CONF_PATH={}", job.asv_conf_path),
            "-e".into(),
            format!("ASV_ARGS={}", container_asv_args(&self.asv_args, cpuset)),
            "-v".into(),
            volume,
            job.image_name(),
        ]
    }
}

#[async_trait]
impl ContainerRunner for DockerCli {
    async fn run(&self, job: &BenchmarkJob, cpuset: &str) -> Result<i32> {
        let name = job.container_name();
        let args = self.run_args(job, cpuset);
        tracing::info!("$ {} {}", self.binary, args.join(" "));

        std::fs::create_dir_all(self.logs_dir())?;
        std::fs::create_dir_all(self.results_dir())?;
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.logs_dir().join(format!("{}.log", name)))?;
        let log_err = log.try_clone()?;

        let status = Command::new(&self.binary)
            .args(&args)
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .status()
            .await
            .map_err(|e| Error::Docker(format!("Could not start container {}: {}", name, e)))?;

        tracing::debug!("Container {} exited with {}", name, status);
        Ok(status.code().unwrap_or(1))
    }
}
