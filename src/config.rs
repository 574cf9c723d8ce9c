//! Configuration for fleetbuild.
//!
//! CLI arguments and environment variable handling using clap: one field per
//! tunable, `env = "..."` fallback, sane `default_value`.

use std::path::Path;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::Error;

/// fleetbuild - distributed build-dispatch control plane
#[derive(Parser, Debug, Clone)]
#[command(name = "fleetbuild")]
#[command(about = "Schedules PyInstaller packaging jobs across remote SSH workers")]
pub struct Args {
    /// Unique node identifier for this control-plane instance
    #[arg(long, env = "NODE_ID", default_value_t = Uuid::new_v4())]
    pub node_id: Uuid,

    /// Enable development mode (continues with zero registered workers)
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Maximum concurrently-running jobs
    #[arg(long, env = "MAX_CONCURRENT", default_value = "3")]
    pub max_concurrent: usize,

    /// Connection pool capacity per worker kind
    #[arg(long, env = "POOL_SIZE", default_value = "10")]
    pub pool_size: usize,

    /// Seconds a leased-but-idle transport may sit before idle eviction
    #[arg(long, env = "POOL_MAX_IDLE_SECS", default_value = "300")]
    pub pool_max_idle_secs: u64,

    /// Seconds between health sweeps of pooled transports
    #[arg(long, env = "POOL_HEALTH_INTERVAL_SECS", default_value = "60")]
    pub pool_health_interval_secs: u64,

    /// Consecutive health failures before a transport is reconnected
    #[arg(long, env = "POOL_MAX_FAILED_ATTEMPTS", default_value = "3")]
    pub pool_max_failed_attempts: u32,

    /// Seconds `Acquire` blocks for an available lease before giving up
    #[arg(long, env = "POOL_ACQUIRE_TIMEOUT_SECS", default_value = "30")]
    pub pool_acquire_timeout_secs: u64,

    /// Seconds within which a just-selected worker is excluded from reselection
    #[arg(long, env = "BALANCER_COOLDOWN_SECS", default_value = "5")]
    pub balancer_cooldown_secs: u64,

    /// Size of the pooled-worker candidate window the balancer samples from
    #[arg(long, env = "BALANCER_TOP_N", default_value = "3")]
    pub balancer_top_n: usize,

    /// Default health-sample cache TTL in seconds
    #[arg(long, env = "HEALTH_SAMPLE_TTL_SECS", default_value = "60")]
    pub health_sample_ttl_secs: u64,

    /// Directory under which remote temp workspaces/output are created
    #[arg(long, env = "REMOTE_TMP_DIR", default_value = "/tmp")]
    pub remote_tmp_dir: String,

    /// Chunk size in bytes used when hashing local files before upload
    #[arg(long, env = "HASH_CHUNK_SIZE", default_value = "1048576")]
    pub hash_chunk_size: usize,

    /// Path to a JSON file listing workers to register at startup
    #[arg(long, env = "WORKERS_FILE")]
    pub workers_file: Option<std::path::PathBuf>,

    /// Entry script for a one-shot job submitted at startup (requires `--workspace`)
    #[arg(long, env = "JOB_ENTRY_SCRIPT")]
    pub job_entry_script: Option<std::path::PathBuf>,

    /// Workspace directory for a one-shot job submitted at startup
    #[arg(long, env = "JOB_WORKSPACE")]
    pub job_workspace: Option<std::path::PathBuf>,

    /// Target platform for a one-shot job: windows, macos, or linux
    #[arg(long, env = "JOB_PLATFORM", default_value = "linux")]
    pub job_platform: String,
}

/// One entry in a `--workers-file` JSON document: `[{ "name", "kind", "host",
/// "port", "user", "password" | "key_path" }, ...]`.
#[derive(Debug, Deserialize)]
pub struct WorkerFileEntry {
    pub name: String,
    pub kind: String,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub key_path: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}

/// Reads and parses a `--workers-file` document. Does not construct
/// transports or touch the registry — that's the caller's job.
pub fn load_workers_file(path: &Path) -> crate::error::Result<Vec<WorkerFileEntry>> {
    let data = std::fs::read_to_string(path).map_err(Error::Io)?;
    serde_json::from_str(&data).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
}

impl Args {
    /// Validates configuration at startup.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrent == 0 {
            return Err("MAX_CONCURRENT must be greater than zero".to_string());
        }
        if self.pool_size == 0 {
            return Err("POOL_SIZE must be greater than zero".to_string());
        }
        if self.pool_max_failed_attempts == 0 {
            return Err("POOL_MAX_FAILED_ATTEMPTS must be greater than zero".to_string());
        }
        if self.balancer_top_n == 0 {
            return Err("BALANCER_TOP_N must be greater than zero".to_string());
        }
        Ok(())
    }

    pub fn pool_acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_acquire_timeout_secs)
    }

    pub fn pool_max_idle_time(&self) -> Duration {
        Duration::from_secs(self.pool_max_idle_secs)
    }

    pub fn pool_health_interval(&self) -> Duration {
        Duration::from_secs(self.pool_health_interval_secs)
    }

    pub fn balancer_cooldown(&self) -> Duration {
        Duration::from_secs(self.balancer_cooldown_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_workers_file_parses_entries() {
        let path = std::env::temp_dir().join(format!("fleetbuild_workers_{}.json", Uuid::new_v4()));
        std::fs::write(
            &path,
            r#"[{"name":"w1","kind":"unix","host":"10.0.0.1","user":"build","password":"secret"}]"#,
        )
        .unwrap();
        let entries = load_workers_file(&path).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].port, 22);
        assert_eq!(entries[0].name, "w1");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn load_workers_file_missing_path_errs() {
        let path = std::env::temp_dir().join(format!("fleetbuild_missing_{}.json", Uuid::new_v4()));
        assert!(load_workers_file(&path).is_err());
    }
}
