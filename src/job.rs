//! Job data model: a single packaging request and its state machine fields.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Shared handle to one Job: mutated only by its owning Runner, read by
/// anyone polling `Status`.
pub type JobHandle = Arc<RwLock<Job>>;

/// Dispatch priority. `Ord` is derived in declaration order, so `Urgent >
/// High > Medium > Low` — the task queue relies on this for its `(−priority,
/// createdAt)` ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

/// Runner state machine: `Pending -> Uploading -> Building -> Downloading ->
/// Success`, with `Failed`/`Cancelled` reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Uploading,
    Building,
    Downloading,
    Success,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Success | JobState::Failed | JobState::Cancelled)
    }
}

/// A (src, dst) pair copied into the packaged artifact.
pub type ExtraData = (String, String);

/// Build configuration options, all optional unless marked.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildConfig {
    #[serde(default = "default_builder")]
    pub builder: String,
    pub name: Option<String>,
    pub version: Option<String>,
    pub icon: Option<String>,
    #[serde(default)]
    pub console: bool,
    #[serde(default)]
    pub onefile: bool,
    #[serde(default)]
    pub clean: bool,
    pub requirements: Option<String>,
    #[serde(default)]
    pub extra_data: Vec<ExtraData>,
    #[serde(default)]
    pub binaries: Vec<String>,
    #[serde(default)]
    pub hidden_imports: Vec<String>,
    #[serde(default)]
    pub excludes: Vec<String>,
    #[serde(default)]
    pub runtime_hooks: Vec<String>,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_builder() -> String {
    "pyinstaller".to_string()
}

/// A single packaging request with its state and config.
#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: String,
    pub platform: String,
    pub priority: Priority,
    pub entry_script: PathBuf,
    pub workspace: PathBuf,
    pub config: BuildConfig,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub state: JobState,
    pub progress: u8,
    pub current_phase: Option<String>,
    pub error: Option<String>,
    pub assigned_worker: Option<String>,
    pub artifact_path: Option<PathBuf>,
    pub uploaded_files: HashSet<String>,
    pub total_files: usize,
}

impl Job {
    pub fn new(
        job_id: String,
        platform: String,
        priority: Priority,
        entry_script: PathBuf,
        workspace: PathBuf,
        config: BuildConfig,
    ) -> Self {
        Self {
            job_id,
            platform,
            priority,
            entry_script,
            workspace,
            config,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            state: JobState::Pending,
            progress: 0,
            current_phase: None,
            error: None,
            assigned_worker: None,
            artifact_path: None,
            uploaded_files: HashSet::new(),
            total_files: 0,
        }
    }

    /// Sets `state` to `Cancelled` if the job is non-terminal, returning
    /// whether the cancellation took effect (invariant 2: terminal jobs are
    /// never re-entered).
    pub fn cancel(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = JobState::Cancelled;
        self.error = Some("task cancelled".to_string());
        self.ended_at = Some(Utc::now());
        true
    }

    pub fn fail(&mut self, phase: &str, message: impl Into<String>) {
        if self.state.is_terminal() {
            return;
        }
        self.state = JobState::Failed;
        self.current_phase = Some(phase.to_string());
        self.error = Some(message.into());
        self.ended_at = Some(Utc::now());
    }

    pub fn succeed(&mut self, artifact_path: PathBuf) {
        if self.state.is_terminal() {
            return;
        }
        self.state = JobState::Success;
        self.progress = 100;
        self.artifact_path = Some(artifact_path);
        self.ended_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering_matches_urgency() {
        assert!(Priority::Urgent > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
    }

    #[test]
    fn cancel_is_noop_on_terminal_job() {
        let mut job = Job::new(
            "j1".into(),
            "linux".into(),
            Priority::Low,
            "main.py".into(),
            "/w".into(),
            BuildConfig::default(),
        );
        job.succeed("/tmp/out".into());
        assert!(!job.cancel());
        assert_eq!(job.state, JobState::Success);
    }

    #[test]
    fn cancel_transitions_pending_job() {
        let mut job = Job::new(
            "j1".into(),
            "linux".into(),
            Priority::Low,
            "main.py".into(),
            "/w".into(),
            BuildConfig::default(),
        );
        assert!(job.cancel());
        assert_eq!(job.state, JobState::Cancelled);
        assert_eq!(job.error.as_deref(), Some("task cancelled"));
    }
}
