//! Core-pinned scheduling of benchmark containers

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use crate::ui::StageProgress;
use crate::{Error, Result};
use super::{cpuset, BenchmarkJob, ContainerRunner};

/// Fixed set of disjoint, contiguous core blocks handed out one per
/// running container.
pub struct CorePool {
    free: Mutex<VecDeque<Vec<usize>>>,
    available: Arc<Semaphore>,
}

impl CorePool {
    /// `max_concurrency` blocks of `num_cores` cores: `[0..n)`, `[n..2n)`, …
    pub fn new(max_concurrency: usize, num_cores: usize) -> Arc<Self> {
        let blocks: VecDeque<Vec<usize>> = (0..max_concurrency)
            .map(|i| (i * num_cores..(i + 1) * num_cores).collect())
            .collect();
        Arc::new(Self {
            free: Mutex::new(blocks),
            available: Arc::new(Semaphore::new(max_concurrency)),
        })
    }

    pub fn free_blocks(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Vec<usize>>> {
        self.free.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wait for a free block. The block goes back to the pool when the
    /// lease is dropped.
    pub async fn acquire(self: &Arc<Self>) -> Result<CoreLease> {
        let permit = self
            .available
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Docker("Core pool closed".to_string()))?;
        let cores = self
            .lock()
            .pop_front()
            .ok_or_else(|| Error::Docker("Core pool exhausted".to_string()))?;
        Ok(CoreLease { pool: Arc::clone(self), cores, _permit: permit })
    }
}

pub struct CoreLease {
    pool: Arc<CorePool>,
    cores: Vec<usize>,
    // dropped after the cores are back in the pool
    _permit: OwnedSemaphorePermit,
}

impl CoreLease {
    pub fn cores(&self) -> &[usize] {
        &self.cores
    }

    pub fn cpuset(&self) -> String {
        cpuset(&self.cores)
    }
}

impl Drop for CoreLease {
    fn drop(&mut self) {
        let cores = std::mem::take(&mut self.cores);
        self.pool.lock().push_back(cores);
    }
}

#[derive(Debug, Clone, Default)]
pub struct OrchestrateSummary {
    /// `(container name, exit code)` in job order
    pub exit_codes: Vec<(String, i32)>,
}

/// Run every job, at most one per free core block at a time.
///
/// Fails when any container exits non-zero or cannot be started.
pub async fn orchestrate(
    runner: Arc<dyn ContainerRunner>,
    jobs: Vec<BenchmarkJob>,
    pool: Arc<CorePool>,
) -> Result<OrchestrateSummary> {
    let progress = Arc::new(StageProgress::new(jobs.len(), "Containers"));
    let mut tasks = JoinSet::new();

    for (pos, job) in jobs.into_iter().enumerate() {
        let runner = Arc::clone(&runner);
        let pool = Arc::clone(&pool);
        let progress = Arc::clone(&progress);
        tasks.spawn(async move {
            let lease = pool.acquire().await?;
            let cpuset = lease.cpuset();
            tracing::info!("▶ cores={} sha={}", cpuset, job.commit_sha);

            let rc = match runner.run(&job, &cpuset).await {
                Ok(rc) => rc,
                Err(e) => {
                    tracing::error!("Container {} failed to run: {}", job.container_name(), e);
                    -1
                }
            };
            let status = if rc == 0 { "OK".to_string() } else { format!("FAIL({})", rc) };
            tracing::info!("■ cores={} → {}", cpuset, status);
            progress.inc();
            drop(lease);
            Ok::<_, Error>((pos, job.container_name(), rc))
        });
    }

    let mut results = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        let outcome = joined.map_err(|e| Error::Docker(format!("Container task panicked: {}", e)))?;
        results.push(outcome?);
    }
    results.sort_by_key(|(pos, _, _)| *pos);

    let failures = results.iter().filter(|(_, _, rc)| *rc != 0).count();
    if failures > 0 {
        return Err(Error::Docker(format!("{} container(s) failed", failures)));
    }
    progress.finish(&format!("All {} benchmarks finished", results.len()));

    Ok(OrchestrateSummary {
        exit_codes: results.into_iter().map(|(_, name, rc)| (name, rc)).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::time::Duration;

    /// Records which cores each job held and fails selected commits
    struct FakeRunner {
        active: Mutex<HashSet<usize>>,
        overlaps: Mutex<usize>,
        failing: Vec<String>,
    }

    impl FakeRunner {
        fn new(failing: &[&str]) -> Self {
            Self {
                active: Mutex::new(HashSet::new()),
                overlaps: Mutex::new(0),
                failing: failing.iter().map(|s| s.to_string()).collect(),
            }
        }
    }

    #[async_trait]
    impl ContainerRunner for FakeRunner {
        async fn run(&self, job: &BenchmarkJob, cpuset: &str) -> Result<i32> {
            let cores: Vec<usize> = cpuset.split(',').map(|c| c.parse().unwrap()).collect();
            {
                let mut active = self.active.lock().unwrap();
                for core in &cores {
                    if !active.insert(*core) {
                        *self.overlaps.lock().unwrap() += 1;
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            {
                let mut active = self.active.lock().unwrap();
                for core in &cores {
                    active.remove(core);
                }
            }
            if self.failing.contains(&job.commit_sha) {
                return Ok(2);
            }
            Ok(0)
        }
    }

    fn jobs(n: usize) -> Vec<BenchmarkJob> {
        (0..n)
            .map(|idx| BenchmarkJob {
                idx,
                repo_name: "o/r".into(),
                commit_sha: format!("{:07}", idx),
                asv_conf_path: "asv.conf.json".into(),
            })
            .collect()
    }

    #[test]
    fn test_pool_blocks_are_disjoint_and_contiguous() {
        let pool = CorePool::new(3, 2);
        let blocks: Vec<Vec<usize>> = pool.lock().iter().cloned().collect();
        assert_eq!(blocks, vec![vec![0, 1], vec![2, 3], vec![4, 5]]);
    }

    #[tokio::test]
    async fn test_lease_returns_block_on_drop() {
        let pool = CorePool::new(2, 4);
        let lease = pool.acquire().await.unwrap();
        assert_eq!(lease.cpuset(), "0,1,2,3");
        assert_eq!(pool.free_blocks(), 1);
        drop(lease);
        assert_eq!(pool.free_blocks(), 2);
    }

    #[tokio::test]
    async fn test_orchestrate_never_shares_cores() {
        let runner = Arc::new(FakeRunner::new(&[]));
        let pool = CorePool::new(2, 2);
        let summary = orchestrate(runner.clone(), jobs(8), Arc::clone(&pool)).await.unwrap();

        assert_eq!(summary.exit_codes.len(), 8);
        assert_eq!(summary.exit_codes[0].0, "asv_0_0000000");
        assert_eq!(*runner.overlaps.lock().unwrap(), 0);
        assert_eq!(pool.free_blocks(), 2);
    }

    #[tokio::test]
    async fn test_orchestrate_reports_failures_and_releases_cores() {
        let runner = Arc::new(FakeRunner::new(&["0000001", "0000003"]));
        let pool = CorePool::new(2, 1);
        let err = orchestrate(runner, jobs(4), Arc::clone(&pool)).await.unwrap_err();

        assert!(matches!(err, Error::Docker(ref msg) if msg == "2 container(s) failed"));
        assert_eq!(pool.free_blocks(), 2);
    }
}
