//! Datasmith CLI - build a dataset of performance-improving commits

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use commands::{
    BenchmarkArgs, CollateArgs, CollectCommitsArgs, DetectBreakpointsArgs, DownloadDashboardsArgs, FilterCommitsArgs,
    ScrapeReposArgs,
};

#[derive(Parser)]
#[command(name = "datasmith")]
#[command(version)]
#[command(about = "Benchmark dataset builder for projects publishing asv benchmarks")]
#[command(long_about = r#"
Datasmith assembles a dataset of performance-improving commits:
  • Find repositories with asv benchmarks on GitHub
  • Collect and filter their merge commits
  • Benchmark commits in core-pinned Docker containers
  • Collate results into dashboards
  • Detect breakpoints and enrich them with coverage and PR reports

Example usage:
  datasmith scrape-repos --outfile repos.csv
  datasmith download-dashboards --dashboards dashboards.jsonl
  datasmith detect-breakpoints --dataset data/dashboard.fc.json --build-reports
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to datasmith.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite cache location (overrides CACHE_LOCATION)
    #[arg(long, global = true)]
    cache: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Search GitHub for repositories with an asv config and filter them
    ScrapeRepos(ScrapeReposArgs),

    /// Collect merge commits of merged pull requests
    CollectCommits(CollectCommitsArgs),

    /// Keep commits of benchmarked repositories that touch library code
    FilterCommits(FilterCommitsArgs),

    /// Benchmark commits in Docker containers
    Benchmark(BenchmarkArgs),

    /// Merge container results and publish dashboards
    Collate(CollateArgs),

    /// Download published dashboards into collections
    DownloadDashboards(DownloadDashboardsArgs),

    /// Find performance-improving commits in a collection
    DetectBreakpoints(DetectBreakpointsArgs),

    /// Show entry counts of the response cache
    CacheStats {
        /// Delete every entry of this namespace first
        #[arg(long)]
        clear: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let settings = commands::load_settings(cli.config.as_deref(), cli.cache)?;

    match cli.command {
        Commands::ScrapeRepos(args) => commands::run_scrape_repos(&settings, args).await?,
        Commands::CollectCommits(args) => commands::run_collect_commits(&settings, args).await?,
        Commands::FilterCommits(args) => commands::run_filter_commits(&settings, args).await?,
        Commands::Benchmark(args) => commands::run_benchmark(args).await?,
        Commands::Collate(args) => commands::run_collate(&settings, args).await?,
        Commands::DownloadDashboards(args) => commands::run_download_dashboards(&settings, args).await?,
        Commands::DetectBreakpoints(args) => commands::run_detect_breakpoints(&settings, args).await?,
        Commands::CacheStats { clear } => commands::run_cache_stats(&settings, clear)?,
    }

    Ok(())
}
