//! Dispatcher: the service entry point, composed of every other component.
//!
//! `Create` generates a job id, constructs the Job, fails fast if no worker
//! of the right kind is registered at all, and submits to the queue. A
//! single queue-owner task then draws jobs and hands them to `JobRunner`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::time::Duration;
use tracing::info;

use crate::balancer::LoadBalancer;
use crate::builder::BuilderRegistry;
use crate::config::Args;
use crate::error::{Error, Result};
use crate::job::{Job, JobHandle, JobState, Priority};
use crate::pool::{Pool, PoolConfig};
use crate::queue::{QueueStatus, TaskQueue};
use crate::registry::WorkerRegistry;
use crate::runner::JobRunner;
use crate::transport::{Kind, WorkerConfig};

pub use crate::job::BuildConfig;

/// The service entry point. One instance per process.
pub struct Dispatcher {
    pub registry: Arc<WorkerRegistry>,
    pub pool: Arc<Pool>,
    pub balancer: Arc<LoadBalancer>,
    queue: Arc<TaskQueue>,
    runner: Arc<JobRunner>,
    jobs: DashMap<String, JobHandle>,
    sequence: AtomicU64,
    args: Arc<Args>,
}

impl Dispatcher {
    pub fn new(args: Args) -> Arc<Self> {
        let args = Arc::new(args);
        let pool = Arc::new(Pool::new(PoolConfig {
            capacity: args.pool_size,
            acquire_timeout: args.pool_acquire_timeout(),
            max_idle_time: args.pool_max_idle_time(),
            health_interval: args.pool_health_interval(),
            max_failed_attempts: args.pool_max_failed_attempts,
        }));
        let registry = Arc::new(WorkerRegistry::new(Arc::clone(&pool)));
        let balancer = Arc::new(LoadBalancer::new(args.balancer_cooldown(), args.balancer_top_n));
        let queue = Arc::new(TaskQueue::new(args.max_concurrent));
        let builders = Arc::new(BuilderRegistry::default());
        let runner = Arc::new(JobRunner::new(
            Arc::clone(&registry),
            Arc::clone(&pool),
            Arc::clone(&balancer),
            builders,
            Arc::clone(&queue),
            Arc::clone(&args),
        ));

        let dispatcher = Arc::new(Self {
            registry,
            pool,
            balancer,
            queue,
            runner,
            jobs: DashMap::new(),
            sequence: AtomicU64::new(0),
            args,
        });

        Arc::clone(&dispatcher).spawn_background_tasks();
        dispatcher
    }

    fn spawn_background_tasks(self: Arc<Self>) {
        let pool_for_idle = Arc::clone(&self.pool);
        tokio::spawn(async move { pool_for_idle.run_idle_eviction().await });

        let pool_for_health = Arc::clone(&self.pool);
        tokio::spawn(async move { pool_for_health.run_health_sweep().await });

        tokio::spawn(async move { self.run_queue_owner().await });
    }

    /// Registers a worker with the registry. Convenience wrapper so callers
    /// (e.g. the binary's config loader) don't need to reach into `registry`
    /// directly for the common case.
    pub async fn register_worker(&self, name: &str, kind: Kind, config: WorkerConfig) -> Result<()> {
        self.registry.add(name, kind, config).await
    }

    /// `Create(platform, entryScript, workspace, config) -> jobId`.
    pub async fn create(
        &self,
        platform: &str,
        entry_script: impl Into<PathBuf>,
        workspace: impl Into<PathBuf>,
        priority: Priority,
        config: BuildConfig,
    ) -> Result<String> {
        let kind =
            Kind::from_platform(platform).ok_or_else(|| Error::UnsupportedPlatform(platform.to_string()))?;
        if self.registry.names_by_kind(kind).is_empty() {
            return Err(Error::NoAvailableWorker {
                kind: kind.as_str().to_string(),
            });
        }

        let entry_script = entry_script.into();
        let basename = entry_script
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "job".to_string());
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let job_id = format!("build_{platform}_{basename}_{seq}");

        let job = Job::new(
            job_id.clone(),
            platform.to_string(),
            priority,
            entry_script,
            workspace.into(),
            config,
        );
        let created_at = job.created_at;
        let handle: JobHandle = Arc::new(tokio::sync::RwLock::new(job));
        self.jobs.insert(job_id.clone(), handle);
        self.queue.submit(&job_id, priority, created_at).await;
        info!(job = %job_id, platform, "job created and queued");
        Ok(job_id)
    }

    /// `Status(jobId)` — a snapshot of the Job, not a live handle.
    pub async fn status(&self, job_id: &str) -> Result<Job> {
        let handle = self
            .jobs
            .get(job_id)
            .map(|e| e.clone())
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;
        Ok(handle.read().await.clone())
    }

    /// `Cancel(jobId)`. Flips state to `Cancelled` if non-terminal.
    pub async fn cancel(&self, job_id: &str) -> Result<bool> {
        let handle = self
            .jobs
            .get(job_id)
            .map(|e| e.clone())
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;
        let cancelled = {
            let mut guard = handle.write().await;
            guard.cancel()
        };
        if cancelled {
            self.queue.note_state(job_id, JobState::Cancelled);
        }
        Ok(cancelled)
    }

    pub async fn queue_status(&self) -> QueueStatus {
        self.queue.status().await
    }

    /// Removes the local artifact directory, releases the worker if still
    /// leased, and removes the Job record. Idempotent for a terminal job:
    /// a second call finds no job and returns `Ok(())`.
    pub async fn cleanup(&self, job_id: &str) -> Result<()> {
        let Some((_, handle)) = self.jobs.remove(job_id) else {
            return Ok(());
        };
        let job = handle.read().await.clone();
        crate::runner::cleanup(&job, &self.pool).await;
        Ok(())
    }

    pub fn args(&self) -> &Args {
        &self.args
    }

    async fn run_queue_owner(self: Arc<Self>) {
        loop {
            match self.queue.next().await {
                Some(job_id) => {
                    let Some(handle) = self.jobs.get(&job_id).map(|e| e.clone()) else {
                        continue;
                    };
                    self.queue.mark_running(&job_id);
                    let runner = Arc::clone(&self.runner);
                    tokio::spawn(async move {
                        runner.run(handle).await;
                    });
                }
                None => {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn test_args() -> Args {
        Args::parse_from(["fleetbuild", "--max-concurrent", "1"])
    }

    #[tokio::test]
    async fn create_without_workers_fails_fast() {
        let dispatcher = Dispatcher::new(test_args());
        let result = dispatcher
            .create(
                "linux",
                "main.py",
                "/workspace",
                Priority::Medium,
                BuildConfig::default(),
            )
            .await;
        assert!(matches!(result, Err(Error::NoAvailableWorker { .. })));
    }

    #[tokio::test]
    async fn status_of_unknown_job_errs() {
        let dispatcher = Dispatcher::new(test_args());
        let result = dispatcher.status("does-not-exist").await;
        assert!(matches!(result, Err(Error::JobNotFound(_))));
    }

    #[tokio::test]
    async fn cancel_before_dispatch_is_observable_without_leasing() {
        let dispatcher = Dispatcher::new(test_args());
        dispatcher
            .registry
            .add(
                "w1",
                Kind::Unix,
                WorkerConfig {
                    host: "localhost".into(),
                    port: 22,
                    user: "u".into(),
                    auth: crate::transport::Auth::Password("p".into()),
                },
            )
            .await
            .unwrap();
        let job_id = dispatcher
            .create(
                "linux",
                "main.py",
                "/workspace",
                Priority::Low,
                BuildConfig::default(),
            )
            .await
            .unwrap();
        assert!(dispatcher.cancel(&job_id).await.unwrap());
        let status = dispatcher.status(&job_id).await.unwrap();
        assert_eq!(status.state, JobState::Cancelled);
    }
}
