//! Job Runner: drives a single job through its phases on a leased worker.
//!
//! States: `Pending -> Uploading -> Building -> Downloading -> Success`, with
//! `Failed`/`Cancelled` reachable from any non-terminal state. Cancellation
//! is cooperative: the runner checks the job's state at each phase boundary
//! and aborts at the next safe point rather than interrupting an in-flight
//! remote `Exec`.

use std::collections::HashSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::balancer::{Candidate, LoadBalancer, Requirements};
use crate::builder::{with_entry_script, BuilderRegistry};
use crate::config::Args;
use crate::error::{Error, Result};
use crate::job::{Job, JobHandle, JobState};
use crate::pool::Pool;
use crate::queue::TaskQueue;
use crate::registry::WorkerRegistry;
use crate::retry::RetryPolicy;
use crate::transport::Kind;

pub struct JobRunner {
    registry: Arc<WorkerRegistry>,
    pool: Arc<Pool>,
    balancer: Arc<LoadBalancer>,
    builders: Arc<BuilderRegistry>,
    queue: Arc<TaskQueue>,
    args: Arc<Args>,
}

impl JobRunner {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        pool: Arc<Pool>,
        balancer: Arc<LoadBalancer>,
        builders: Arc<BuilderRegistry>,
        queue: Arc<TaskQueue>,
        args: Arc<Args>,
    ) -> Self {
        Self {
            registry,
            pool,
            balancer,
            builders,
            queue,
            args,
        }
    }

    /// Drives `job` end to end. Never panics or propagates an error out —
    /// any failure is recorded on the Job itself, matching "the queue owner
    /// never crashes on runner errors".
    pub async fn run(&self, job: JobHandle) {
        let job_id = job.read().await.job_id.clone();
        if let Err(e) = self.run_inner(&job).await {
            let mut guard = job.write().await;
            let phase = guard.current_phase.clone().unwrap_or_default();
            guard.fail(&phase, e.to_string());
        }
        self.queue.mark_done(&job_id);
    }

    async fn is_cancelled(&self, job: &JobHandle) -> bool {
        job.read().await.state == JobState::Cancelled
    }

    async fn set_state(&self, job: &JobHandle, state: JobState, phase: &str) {
        let job_id;
        {
            let mut guard = job.write().await;
            if guard.state.is_terminal() {
                return;
            }
            guard.state = state;
            guard.current_phase = Some(phase.to_string());
            job_id = guard.job_id.clone();
        }
        self.queue.note_state(&job_id, state);
    }

    async fn run_inner(&self, job: &JobHandle) -> Result<()> {
        if self.is_cancelled(job).await {
            return Ok(());
        }

        // --- Prepare ---
        let (kind, job_id, platform) = {
            let guard = job.read().await;
            (
                Kind::from_platform(&guard.platform)
                    .ok_or_else(|| Error::UnsupportedPlatform(guard.platform.clone()))?,
                guard.job_id.clone(),
                guard.platform.clone(),
            )
        };
        let local_tmp = std::env::temp_dir().join(format!("fleetbuild_{job_id}"));
        std::fs::create_dir_all(&local_tmp).map_err(Error::Io)?;

        let worker_name = self.select_worker(kind).await.map_err(|e| {
            warn!(job = %job_id, platform = %platform, "no available worker: {e}");
            e
        })?;
        {
            let mut guard = job.write().await;
            guard.assigned_worker = Some(worker_name.clone());
            guard.started_at = Some(chrono::Utc::now());
        }

        let lease = self
            .pool
            .acquire(kind, self.args.pool_acquire_timeout())
            .await?
            .ok_or_else(|| Error::PoolTimeout {
                kind: kind.as_str().to_string(),
                timeout_ms: self.args.pool_acquire_timeout().as_millis() as u64,
            })?;
        let transport = lease.transport;

        let result = self
            .drive_phases(job, &job_id, kind, transport.clone(), &local_tmp)
            .await;

        self.pool.release(kind, &worker_name).await?;

        result
    }

    async fn drive_phases(
        &self,
        job: &JobHandle,
        job_id: &str,
        kind: Kind,
        transport: Arc<dyn crate::transport::Transport>,
        local_tmp: &Path,
    ) -> Result<()> {
        let remote_tmp = &self.args.remote_tmp_dir;
        let workspace_remote = format!("{remote_tmp}/workspace_{job_id}");
        let output_remote = format!("{remote_tmp}/output_{job_id}");

        if self.is_cancelled(job).await {
            return Ok(());
        }
        self.set_state(job, JobState::Uploading, "uploading").await;
        self.upload_phase(job, kind, &transport, &workspace_remote)
            .await?;

        if self.is_cancelled(job).await {
            return Ok(());
        }
        self.set_state(job, JobState::Building, "building").await;
        self.build_phase(job, &transport, &workspace_remote, &output_remote)
            .await?;

        if self.is_cancelled(job).await {
            return Ok(());
        }
        job.write().await.current_phase = Some("verifying".to_string());
        self.verify_phase(kind, &transport, job_id, &output_remote)
            .await?;

        self.set_state(job, JobState::Downloading, "downloading").await;
        self.download_phase(kind, &transport, &output_remote, local_tmp)
            .await?;

        let mut guard = job.write().await;
        guard.succeed(local_tmp.to_path_buf());
        info!(job = %job_id, "build succeeded");
        Ok(())
    }

    async fn select_worker(&self, kind: Kind) -> Result<String> {
        let names = self.registry.names_by_kind(kind);
        if names.is_empty() {
            return Err(Error::NoAvailableWorker {
                kind: kind.as_str().to_string(),
            });
        }
        let active: HashSet<String> = self.registry.active().into_iter().collect();
        let samples = self.registry.check_all().await;

        let mut candidates = Vec::new();
        for name in &names {
            if !active.contains(name) {
                continue;
            }
            if let Some(sample) = samples.get(name) {
                if sample.is_healthy() {
                    let candidate = Candidate {
                        cpu_percent: sample.cpu_percent,
                        mem_percent: sample.mem_percent,
                        disk_percent: sample.disk_percent,
                        network_percent: 0.0,
                        running_tasks: 0,
                    };
                    self.balancer.record(name, candidate);
                    candidates.push((name.clone(), candidate));
                }
            }
        }

        self.balancer
            .select(&candidates, Requirements::default())
            .ok_or_else(|| Error::NoAvailableWorker {
                kind: kind.as_str().to_string(),
            })
    }

    /// Walks the local workspace; for each file compares SHA-256 against the
    /// remote hash of the same path, skipping transfer on a match.
    async fn upload_phase(
        &self,
        job: &JobHandle,
        kind: Kind,
        transport: &Arc<dyn crate::transport::Transport>,
        workspace_remote: &str,
    ) -> Result<()> {
        transport.mkdir(workspace_remote).await?;

        let workspace = job.read().await.workspace.clone();
        let files = walk_files(&workspace).map_err(Error::Io)?;
        let total_bytes: u64 = files
            .iter()
            .filter_map(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .sum();
        {
            let mut guard = job.write().await;
            guard.total_files = files.len();
        }

        let mut uploaded_bytes: u64 = 0;
        for local_path in &files {
            if self.is_cancelled(job).await {
                return Ok(());
            }
            let rel = local_path
                .strip_prefix(&workspace)
                .unwrap_or(local_path)
                .to_string_lossy()
                .replace('\\', "/");
            let remote_path = format!("{workspace_remote}/{rel}");
            let size = std::fs::metadata(local_path).map(|m| m.len()).unwrap_or(0);

            let local_hash = match hash_file(local_path, self.args.hash_chunk_size) {
                Ok(hash) => hash,
                Err(e) => {
                    let job_id = job.read().await.job_id.clone();
                    warn!(job = %job_id, path = %rel, "failed to hash local file: {e}");
                    job.write().await.fail("uploading", rel.clone());
                    return Err(Error::TransferFailed { job_id, path: rel });
                }
            };

            let remote_hash = remote_sha256(transport, kind, &remote_path).await;
            let unchanged = remote_hash.as_deref() == Some(local_hash.as_str());

            if !unchanged {
                let parent_remote = parent_remote_dir(&remote_path);
                if !parent_remote.is_empty() && parent_remote != workspace_remote {
                    let _ = transport.mkdir(&parent_remote).await;
                }
                if let Err(e) = RetryPolicy::TRANSFER
                    .run("upload", || transport.upload(local_path, &remote_path))
                    .await
                {
                    let job_id = job.read().await.job_id.clone();
                    job.write()
                        .await
                        .fail("uploading", format!("{rel}: {e}"));
                    return Err(Error::TransferFailed { job_id, path: rel });
                }
            }

            uploaded_bytes += size;
            let mut guard = job.write().await;
            guard.uploaded_files.insert(rel.clone());
            guard.progress = if total_bytes > 0 {
                ((uploaded_bytes as f64 / total_bytes as f64) * 100.0) as u8
            } else {
                100
            };
        }
        Ok(())
    }

    async fn build_phase(
        &self,
        job: &JobHandle,
        transport: &Arc<dyn crate::transport::Transport>,
        workspace_remote: &str,
        output_remote: &str,
    ) -> Result<()> {
        let (config, entry_script, job_id) = {
            let guard = job.read().await;
            (
                guard.config.clone(),
                guard.entry_script.to_string_lossy().to_string(),
                guard.job_id.clone(),
            )
        };
        let packager = self.builders.get(&config.builder)?;
        let command = packager.compose(workspace_remote, output_remote, &config);
        let command = with_entry_script(&command, &entry_script);

        let (stdout, stderr) = RetryPolicy::EXEC
            .run("build exec", || transport.exec(&command))
            .await?;
        let _ = stdout;

        if self.is_cancelled(job).await {
            return Ok(());
        }

        if !stderr.trim().is_empty() {
            job.write().await.fail("building", stderr.clone());
            return Err(Error::BuildFailed { job_id, stderr });
        }
        Ok(())
    }

    async fn verify_phase(
        &self,
        kind: Kind,
        transport: &Arc<dyn crate::transport::Transport>,
        job_id: &str,
        output_remote: &str,
    ) -> Result<()> {
        let cmd = kind.list_dir_cmd(output_remote);
        let (stdout, _stderr) = RetryPolicy::EXEC.run("verify", || transport.exec(&cmd)).await?;
        if stdout.trim().is_empty() {
            return Err(Error::BuildFailed {
                job_id: job_id.to_string(),
                stderr: format!("output directory {output_remote} is empty"),
            });
        }
        Ok(())
    }

    async fn download_phase(
        &self,
        kind: Kind,
        transport: &Arc<dyn crate::transport::Transport>,
        output_remote: &str,
        local_tmp: &Path,
    ) -> Result<()> {
        let cmd = kind.list_dir_cmd(output_remote);
        let (stdout, _stderr) = RetryPolicy::EXEC.run("list output", || transport.exec(&cmd)).await?;
        let entries: Vec<&str> = stdout.lines().map(str::trim).filter(|l| !l.is_empty()).collect();

        for entry in entries {
            let remote_path = format!("{output_remote}/{entry}");
            let local_path = local_tmp.join(entry);
            RetryPolicy::TRANSFER
                .run("download", || transport.download(&remote_path, &local_path))
                .await
                .map_err(|_| Error::TransferFailed {
                    job_id: local_tmp.display().to_string(),
                    path: entry.to_string(),
                })?;
        }
        Ok(())
    }
}

fn parent_remote_dir(remote_path: &str) -> String {
    match remote_path.rfind('/') {
        Some(idx) => remote_path[..idx].to_string(),
        None => String::new(),
    }
}

/// Recursively lists regular files under `root` (no external walk crate —
/// job workspaces are small packaging trees, not filesystems to stream).
fn walk_files(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                stack.push(path);
            } else if file_type.is_file() {
                out.push(path);
            }
        }
    }
    out.sort();
    Ok(out)
}

/// Hashes a local file in fixed-size chunks to bound memory for large artifacts.
fn hash_file(path: &Path, chunk_size: usize) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; chunk_size.max(4096)];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Runs the remote hash command for `remote_path`, returning `None` on any
/// failure (missing file, parse error) so the caller treats it as "not equal".
async fn remote_sha256(
    transport: &Arc<dyn crate::transport::Transport>,
    kind: Kind,
    remote_path: &str,
) -> Option<String> {
    let cmd = kind.hash_cmd(remote_path);
    let (stdout, stderr) = RetryPolicy::EXEC.run("remote hash", || transport.exec(&cmd)).await.ok()?;
    if !stderr.trim().is_empty() {
        return None;
    }
    let hash = stdout.trim().to_lowercase();
    if hash.len() == 64 {
        Some(hash)
    } else {
        None
    }
}

/// Removes the local artifact directory, releases the worker if still
/// leased, and is idempotent for a terminal job.
pub async fn cleanup(job: &Job, pool: &Pool) {
    if let Some(path) = &job.artifact_path {
        let _ = std::fs::remove_dir_all(path);
    } else {
        let fallback = std::env::temp_dir().join(format!("fleetbuild_{}", job.job_id));
        let _ = std::fs::remove_dir_all(fallback);
    }
    if let Some(worker) = &job.assigned_worker {
        if let Some(kind) = Kind::from_platform(&job.platform) {
            let _ = pool.release(kind, worker).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walk_files_is_sorted_and_recursive() {
        let dir = std::env::temp_dir().join(format!("fleetbuild_test_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(dir.join("sub")).unwrap();
        std::fs::write(dir.join("a.txt"), b"a").unwrap();
        std::fs::write(dir.join("sub").join("b.txt"), b"b").unwrap();

        let files = walk_files(&dir).unwrap();
        assert_eq!(files.len(), 2);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn hash_file_is_stable() {
        let path = std::env::temp_dir().join(format!("fleetbuild_hash_{}", uuid::Uuid::new_v4()));
        std::fs::write(&path, b"hello world").unwrap();
        let a = hash_file(&path, 4).unwrap();
        let b = hash_file(&path, 1024).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        std::fs::remove_file(&path).ok();
    }
}
