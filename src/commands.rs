//! Stage drivers behind each subcommand

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use anyhow::Context;
use clap::Args;
use datasmith::artifact;
use datasmith::codecov::CodecovClient;
use datasmith::collate::{self, CollateOptions};
use datasmith::commit::{self, CollectOptions, CommitRecord, DashboardRepo, FilterOptions, FilteredCommit};
use datasmith::config::{self, Settings, TOKENS_FILE};
use datasmith::dashboard::{self, DashboardFetcher};
use datasmith::detect::detect_all_breakpoints;
use datasmith::docker::{self, CorePool, DockerCli};
use datasmith::http::{BackoffPolicy, ReqwestTransport, REQUEST_TIMEOUT};
use datasmith::report;
use datasmith::repository::{self, RepoRecord, SearchOptions};
use datasmith::ui::{self, Icons};
use datasmith::{BenchmarkCollection, DetectionMethod, GithubClient, SqliteCache};

/// Config file, `tokens.env` and environment merged, with the `--cache`
/// flag on top.
pub fn load_settings(config_path: Option<&Path>, cache: Option<PathBuf>) -> anyhow::Result<Settings> {
    let config = config::load_config(config_path).context("Failed to read config file")?;
    let tokens = config::load_tokens_env(Path::new(TOKENS_FILE))?;
    let mut settings = Settings::resolve(config.as_ref(), &tokens, |key| std::env::var(key).ok());
    if let Some(cache) = cache {
        settings.cache_location = cache;
    }
    Ok(settings)
}

fn open_cache(settings: &Settings) -> anyhow::Result<Arc<SqliteCache>> {
    config::ensure_parent_dir(&settings.cache_location)?;
    let cache = SqliteCache::open(&settings.cache_location)
        .with_context(|| format!("Failed to open cache at {}", settings.cache_location.display()))?;
    tracing::debug!("Using cache {}", settings.cache_location.display());
    Ok(Arc::new(cache))
}

fn github_client(settings: &Settings, cache: &Arc<SqliteCache>) -> anyhow::Result<GithubClient> {
    Ok(GithubClient::from_settings(settings)?.with_cache(Arc::clone(cache)))
}

fn dashboard_fetcher(settings: &Settings) -> anyhow::Result<DashboardFetcher> {
    let transport = Arc::new(ReqwestTransport::new(REQUEST_TIMEOUT)?);
    Ok(DashboardFetcher::new(transport, BackoffPolicy::from_settings(settings)))
}

#[derive(Args, Debug)]
pub struct ScrapeReposArgs {
    /// Raw search results (skips the search when it already exists)
    #[arg(long, default_value = "repos.csv")]
    pub outfile: PathBuf,

    /// Repositories that passed the filter
    #[arg(long, default_value = "repos_filtered.csv")]
    pub filtered_outfile: PathBuf,

    #[arg(long, default_value = "filename:asv.conf.json")]
    pub query: String,

    #[arg(long, default_value = "100")]
    pub per_page: u32,

    #[arg(long, default_value = "10")]
    pub max_pages: u32,

    /// Seconds between search pages
    #[arg(long, default_value = "1.1")]
    pub base_delay: f64,

    #[arg(long, default_value = "60")]
    pub max_backoff: f64,

    #[arg(long, default_value = "6")]
    pub max_retries: u32,

    /// Random extra seconds between search pages
    #[arg(long, default_value = "0.3")]
    pub jitter: f64,
}

pub async fn run_scrape_repos(settings: &Settings, args: ScrapeReposArgs) -> anyhow::Result<()> {
    ui::header("Scraping repositories");
    let cache = open_cache(settings)?;
    let mut policy = BackoffPolicy::from_settings(settings).with_max_retries(args.max_retries);
    policy.max_backoff = Duration::from_secs_f64(args.max_backoff.max(0.0));
    let github = github_client(settings, &cache)?.with_policy(policy);

    let repos = if args.outfile.exists() {
        ui::info("Reusing", &args.outfile.display().to_string());
        repository::read_repo_list(&args.outfile)?
    } else {
        let options = SearchOptions {
            query: args.query,
            max_pages: args.max_pages,
            per_page: args.per_page,
            base_delay: Duration::from_secs_f64(args.base_delay.max(0.0)),
            jitter: Duration::from_secs_f64(args.jitter.max(0.0)),
        };
        let repos = repository::search_repositories(&github, &options).await?;
        repository::write_repo_list(&args.outfile, &repos)?;
        ui::success(&format!("Found {} repositories -> {}", repos.len(), args.outfile.display()));
        repos
    };

    let records = repository::enrich_repos(&github, &repos).await;
    let kept = repository::filter_repos(records)?;
    artifact::write_csv(&args.filtered_outfile, &kept)?;

    println!(
        "{}",
        ui::stats_table(&[
            ("Repositories found", &repos.len().to_string()),
            ("Candidates kept", &kept.len().to_string()),
            ("Written to", &args.filtered_outfile.display().to_string()),
        ])
    );
    Ok(())
}

#[derive(Args, Debug)]
pub struct CollectCommitsArgs {
    /// CSV of dashboards with `repo_name` and `url` columns
    #[arg(long)]
    pub dashboards: PathBuf,

    #[arg(long)]
    pub outfile: PathBuf,

    /// Pull request state to page through
    #[arg(long, default_value = "closed")]
    pub state: String,

    #[arg(long, default_value = "100")]
    pub per_page: u32,

    #[arg(long, default_value = "10")]
    pub max_pages: u32,
}

pub async fn run_collect_commits(settings: &Settings, args: CollectCommitsArgs) -> anyhow::Result<()> {
    ui::header("Collecting merge commits");
    let cache = open_cache(settings)?;
    let github = github_client(settings, &cache)?;

    let repos: Vec<DashboardRepo> = artifact::read_csv(&args.dashboards)
        .with_context(|| format!("Failed to read {}", args.dashboards.display()))?;
    let options = CollectOptions { state: args.state, per_page: args.per_page, max_pages: args.max_pages };

    let records = commit::collect_commits(&github, &repos, &options).await?;
    artifact::write_jsonl(&args.outfile, &records)?;
    ui::success(&format!(
        "{} commits from {} repositories -> {}",
        records.len(),
        repos.len(),
        args.outfile.display()
    ));
    Ok(())
}

#[derive(Args, Debug)]
pub struct FilterCommitsArgs {
    /// Filtered repositories CSV from `scrape-repos`
    #[arg(long)]
    pub filtered_benchmarks_pth: PathBuf,

    /// Commits JSON-lines from `collect-commits`
    #[arg(long)]
    pub merged_commits_pth: PathBuf,

    #[arg(long)]
    pub output_pth: PathBuf,

    #[arg(long, default_value = "150")]
    pub max_repos: usize,

    /// Concurrent commit lookups
    #[arg(long, default_value = "1")]
    pub procs: usize,

    /// Concurrent repository scans
    #[arg(long, default_value = "16")]
    pub threads: usize,
}

pub async fn run_filter_commits(settings: &Settings, args: FilterCommitsArgs) -> anyhow::Result<()> {
    ui::header("Filtering commits");
    let cache = open_cache(settings)?;
    let github = github_client(settings, &cache)?;

    let repos: Vec<RepoRecord> = artifact::read_csv(&args.filtered_benchmarks_pth)?;
    let commits: Vec<CommitRecord> = artifact::read_jsonl(&args.merged_commits_pth)?;
    let total = commits.len();
    let options = FilterOptions { max_repos: args.max_repos, threads: args.threads, procs: args.procs };

    let kept = commit::filter_commits(&github, repos, commits, &options).await?;
    artifact::write_jsonl(&args.output_pth, &kept)?;
    ui::success(&format!("Kept {} of {} commits -> {}", kept.len(), total, args.output_pth.display()));
    Ok(())
}

#[derive(Args, Debug)]
pub struct BenchmarkArgs {
    /// Filtered commits JSON-lines
    #[arg(long)]
    pub filtered_commits: PathBuf,

    #[arg(long)]
    pub output_dir: PathBuf,

    /// Extra arguments for `asv run`
    #[arg(long, default_value = "--quick", allow_hyphen_values = true)]
    pub asv_args: String,

    /// Cores dedicated to each container
    #[arg(long, default_value = "4")]
    pub num_cores: usize,

    /// Containers running at once (default: max(4, cpus / 2))
    #[arg(long)]
    pub max_concurrency: Option<usize>,

    /// Directory with the Dockerfile and entrypoint
    #[arg(long, default_value = "docker")]
    pub docker_dir: PathBuf,
}

pub async fn run_benchmark(args: BenchmarkArgs) -> anyhow::Result<()> {
    ui::header("Benchmarking commits");
    let commits: Vec<FilteredCommit> = artifact::read_jsonl(&args.filtered_commits)?;
    let jobs = docker::jobs_from_commits(&commits)?;
    let (num_cores, max_concurrency) =
        docker::validate_concurrency(args.num_cores, args.max_concurrency, docker::available_cpus())?;

    let output_dir = std::path::absolute(&args.output_dir)?;
    let runner = DockerCli::new(&output_dir, &args.asv_args);
    std::fs::create_dir_all(runner.results_dir())?;
    std::fs::create_dir_all(runner.logs_dir())?;
    runner.check().await?;

    let mut built = std::collections::HashSet::new();
    for job in &jobs {
        let image = job.image_name();
        if built.insert(image.clone()) {
            runner.ensure_image(&image, &job.repo_url(), &args.docker_dir).await?;
        }
    }

    ui::status(
        Icons::CONTAINER,
        "Schedule",
        &format!("{} jobs, {} at a time, {} cores each", jobs.len(), max_concurrency, num_cores),
    );
    let pool = CorePool::new(max_concurrency, num_cores);
    docker::orchestrate(Arc::new(runner), jobs, pool).await?;
    ui::success("All benchmarks finished successfully");
    Ok(())
}

#[derive(Args, Debug)]
pub struct CollateArgs {
    /// `<results-dir>/<commit>/<python>/results/` trees written by the containers
    #[arg(long)]
    pub results_dir: PathBuf,

    /// JSON-lines with `commit_sha` and `repo_name` per commit
    #[arg(long)]
    pub commit_metadata: PathBuf,

    #[arg(long)]
    pub output_dir: PathBuf,

    /// Machine name for every run instead of the one recorded by asv
    #[arg(long)]
    pub default_machine_name: Option<String>,
}

pub async fn run_collate(settings: &Settings, args: CollateArgs) -> anyhow::Result<()> {
    ui::header("Collating benchmark results");
    let fetcher = dashboard_fetcher(settings)?;
    let options = CollateOptions {
        results_dir: args.results_dir,
        commit_metadata: args.commit_metadata,
        output_dir: args.output_dir,
        default_machine_name: args.default_machine_name,
    };
    let saved = collate::collate(&fetcher, &options).await?;
    for path in &saved {
        ui::status(Icons::FILE, "Dashboard", &path.display().to_string());
    }
    ui::success(&format!("Published {} dashboards", saved.len()));
    Ok(())
}

#[derive(Args, Debug)]
pub struct DownloadDashboardsArgs {
    /// JSON-lines of `{url, output_dir}`
    #[arg(long)]
    pub dashboards: PathBuf,

    /// Download again even when files exist locally
    #[arg(long)]
    pub force: bool,
}

pub async fn run_download_dashboards(settings: &Settings, args: DownloadDashboardsArgs) -> anyhow::Result<()> {
    ui::header("Downloading dashboards");
    let fetcher = dashboard_fetcher(settings)?;
    let written = dashboard::download_dashboards(&fetcher, &args.dashboards, args.force).await?;
    ui::success(&format!("Saved {} collections", written.len()));
    Ok(())
}

#[derive(Args, Debug)]
pub struct DetectBreakpointsArgs {
    /// Collection file (`*.fc.json`)
    #[arg(long)]
    pub dataset: PathBuf,

    /// `rbf` or `asv`
    #[arg(long, default_value = "rbf")]
    pub method: String,

    /// Look up per-file coverage of the commits involved
    #[arg(long)]
    pub compute_coverage: bool,

    /// Only query coverage for paths containing one of these (repeatable)
    #[arg(long)]
    pub only: Vec<String>,

    /// Build markdown reports for the commits credited with each breakpoint
    #[arg(long)]
    pub build_reports: bool,
}

pub async fn run_detect_breakpoints(settings: &Settings, args: DetectBreakpointsArgs) -> anyhow::Result<()> {
    ui::header("Detecting breakpoints");
    let method: DetectionMethod = args.method.parse()?;
    let mut collection = BenchmarkCollection::load(&args.dataset)
        .with_context(|| format!("Failed to load {}", args.dataset.display()))?;

    let breakpoints = detect_all_breakpoints(&collection.summaries, method);
    ui::info("Method", &method.to_string());
    ui::info("Breakpoints", &breakpoints.len().to_string());
    collection.breakpoints = breakpoints.clone();

    if args.compute_coverage || args.build_reports {
        let cache = open_cache(settings)?;
        let github = github_client(settings, &cache)?;

        if args.compute_coverage {
            let codecov = CodecovClient::from_settings(settings)?.with_cache(Arc::clone(&cache));
            collection.coverage =
                report::generate_coverage(&codecov, &github, &breakpoints, &collection.index, &args.only).await?;
        }

        if args.build_reports {
            let coverage = args.compute_coverage.then_some(collection.coverage.as_slice());
            let (enriched, reports) =
                report::enrich_breakpoints(&github, Some(cache.as_ref()), &breakpoints, coverage, &collection.index)
                    .await?;
            collection.enriched_breakpoints = enriched;
            collection.reports = reports;
        }
    }

    let out = args.dataset.with_file_name("breakpoints.fc.json");
    let saved = collection.save(&out)?;

    let table = ui::breakpoint_table(&breakpoints, 20);
    if table.is_empty() {
        ui::warn("No performance-improving breakpoints found");
    } else {
        println!("{}", table);
    }
    ui::success(&format!("Saved {} breakpoints -> {}", breakpoints.len(), saved.display()));
    Ok(())
}

pub fn run_cache_stats(settings: &Settings, clear: Option<String>) -> anyhow::Result<()> {
    let cache = open_cache(settings)?;
    if let Some(namespace) = clear {
        let removed = cache.clear_namespace(&namespace)?;
        ui::success(&format!("Removed {} entries from {}", removed, namespace));
    }

    let stats = cache.stats()?;
    ui::section("Cache");
    let mut table = ui::TableBuilder::new();
    for (namespace, count) in &stats.namespaces {
        table.add_row(namespace, &count.to_string());
    }
    table.add_row("Total", &stats.total().to_string());
    println!("{}", table.build());
    Ok(())
}
