//! Remote Transport: connect to a worker, run commands, stream files, report health.
//!
//! One trait, `Transport`, with kind-specific behavior folded into the
//! probe-command table (`Kind::cpu_probe` etc.) rather than three separate
//! trait impls — the factory in [`factory`] dispatches on the `kind` tag and
//! hands back the same underlying SSH-backed type configured differently per
//! kind, instead of one subclass per platform.

pub mod factory;
pub mod ssh;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;

/// Worker kind; selects the probe set and transport dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Windows,
    Unix,
    Macos,
}

impl Kind {
    /// Maps a job's target platform onto the worker kind that can build it.
    pub fn from_platform(platform: &str) -> Option<Kind> {
        match platform {
            "windows" => Some(Kind::Windows),
            "macos" => Some(Kind::Macos),
            "linux" => Some(Kind::Unix),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Windows => "windows",
            Kind::Unix => "unix",
            Kind::Macos => "macos",
        }
    }

    pub(crate) fn cpu_probe(&self) -> &'static str {
        match self {
            Kind::Unix | Kind::Macos => "top -bn1 | grep 'Cpu(s)' | awk '{print $2 + $4}'",
            Kind::Windows => {
                "wmic cpu get loadpercentage /value | findstr LoadPercentage"
            }
        }
    }

    pub(crate) fn mem_probe(&self) -> &'static str {
        match self {
            Kind::Unix | Kind::Macos => "free | grep Mem | awk '{print $3/$2 * 100}'",
            Kind::Windows => {
                "wmic OS get FreePhysicalMemory,TotalVisibleMemorySize /value"
            }
        }
    }

    pub(crate) fn disk_probe(&self) -> &'static str {
        match self {
            Kind::Unix | Kind::Macos => "df -h / | tail -1 | awk '{print $5}' | sed 's/%//'",
            Kind::Windows => {
                "wmic logicaldisk where \"DeviceID='C:'\" get FreeSpace,Size /value"
            }
        }
    }

    pub(crate) fn interpreter_probe(&self) -> &'static str {
        "python --version"
    }

    /// Parses `cpu_probe`'s stdout into a 0-100 percentage. unix/macos
    /// already print a bare number; `wmic .. /value` prints `LoadPercentage=NN`.
    pub(crate) fn parse_cpu_sample(&self, raw: &str) -> Option<f64> {
        match self {
            Kind::Unix | Kind::Macos => parse_percent(raw),
            Kind::Windows => parse_wmic_value(raw, "LoadPercentage"),
        }
    }

    /// Parses `mem_probe`'s stdout. unix/macos already print a used-percent;
    /// `wmic` prints `FreePhysicalMemory`/`TotalVisibleMemorySize` (in KB) as
    /// a `key=value` pair per line, from which used% is derived.
    pub(crate) fn parse_mem_sample(&self, raw: &str) -> Option<f64> {
        match self {
            Kind::Unix | Kind::Macos => parse_percent(raw),
            Kind::Windows => parse_wmic_usage_percent(raw, "FreePhysicalMemory", "TotalVisibleMemorySize"),
        }
    }

    /// Parses `disk_probe`'s stdout. unix/macos already print a used-percent;
    /// `wmic` prints `FreeSpace`/`Size` (in bytes) as a `key=value` pair per line.
    pub(crate) fn parse_disk_sample(&self, raw: &str) -> Option<f64> {
        match self {
            Kind::Unix | Kind::Macos => parse_percent(raw),
            Kind::Windows => parse_wmic_usage_percent(raw, "FreeSpace", "Size"),
        }
    }

    pub(crate) fn remove_dir_cmd(&self, path: &str) -> String {
        match self {
            Kind::Unix | Kind::Macos => format!("rm -rf \"{path}\""),
            Kind::Windows => format!("rmdir /s /q \"{path}\""),
        }
    }

    pub(crate) fn hash_cmd(&self, path: &str) -> String {
        match self {
            Kind::Unix | Kind::Macos => format!("sha256sum \"{path}\" | cut -d' ' -f1"),
            Kind::Windows => format!(
                "certutil -hashfile \"{path}\" SHA256 | findstr /v \"hash CertUtil\""
            ),
        }
    }

    pub(crate) fn list_dir_cmd(&self, path: &str) -> String {
        match self {
            Kind::Unix | Kind::Macos => format!("ls -A \"{path}\""),
            Kind::Windows => format!("dir /b \"{path}\""),
        }
    }
}

/// How a worker authenticates an SSH session.
#[derive(Debug, Clone)]
pub enum Auth {
    Password(String),
    KeyPath(std::path::PathBuf),
}

/// Connection config for a single worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub auth: Auth,
}

/// A single health probe result. Produced only by a live transport; callers
/// are expected to cache it with a TTL (default 60s, see `HEALTH_SAMPLE_TTL_SECS`).
#[derive(Debug, Clone)]
pub struct HealthSample {
    pub cpu_percent: f64,
    pub mem_percent: f64,
    pub disk_percent: f64,
    pub interpreter_version: Option<String>,
    pub errors: Vec<String>,
    pub sampled_at: DateTime<Utc>,
}

impl HealthSample {
    pub fn is_healthy(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Connect to a worker, run commands, stream files, report health.
///
/// `Exec` is command-level — there is no persistent shell between calls.
/// `Upload`/`Download` are atomic with respect to the caller: a partial
/// transfer is visible as an `Err`, never a truncated remote file.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> Kind;
    fn name(&self) -> &str;
    fn is_connected(&self) -> bool;

    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
    async fn exec(&self, cmd: &str) -> Result<(String, String)>;
    async fn upload(&self, local: &Path, remote: &str) -> Result<()>;
    async fn download(&self, remote: &str, local: &Path) -> Result<()>;
    async fn mkdir(&self, path: &str) -> Result<()>;
    async fn rmdir(&self, path: &str) -> Result<()>;
    async fn health(&self) -> Result<HealthSample>;
    async fn interpreter_version(&self) -> Result<String>;
}

/// Parses the leading floating-point percentage out of a unix/macos probe's
/// stdout, tolerant of surrounding whitespace and a trailing `%`.
fn parse_percent(raw: &str) -> Option<f64> {
    raw.trim().trim_end_matches('%').trim().parse::<f64>().ok()
}

/// Reads one `key=value` line out of `wmic .. /value` output, matching `key`
/// case-insensitively. `wmic` pads its `/value` output with blank lines and
/// trailing `\r`, so each line is trimmed before splitting.
fn parse_wmic_value(raw: &str, key: &str) -> Option<f64> {
    raw.lines().find_map(|line| {
        let (k, v) = line.trim().split_once('=')?;
        if k.trim().eq_ignore_ascii_case(key) {
            v.trim().parse::<f64>().ok()
        } else {
            None
        }
    })
}

/// Derives a used-percentage from a `wmic`-style free/total pair (memory in
/// KB, disk in bytes — the unit cancels out of the ratio either way).
fn parse_wmic_usage_percent(raw: &str, free_key: &str, total_key: &str) -> Option<f64> {
    let free = parse_wmic_value(raw, free_key)?;
    let total = parse_wmic_value(raw, total_key)?;
    if total <= 0.0 {
        return None;
    }
    Some(((total - free) / total * 100.0).clamp(0.0, 100.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_percent_plain() {
        assert_eq!(parse_percent("42.5"), Some(42.5));
    }

    #[test]
    fn parse_percent_with_suffix() {
        assert_eq!(parse_percent(" 87%\n"), Some(87.0));
    }

    #[test]
    fn parse_percent_garbage() {
        assert_eq!(parse_percent("not a number"), None);
    }

    #[test]
    fn windows_cpu_sample_reads_load_percentage() {
        let raw = "\r\nLoadPercentage=23\r\n\r\n";
        assert_eq!(Kind::Windows.parse_cpu_sample(raw), Some(23.0));
    }

    #[test]
    fn windows_mem_sample_computes_used_percent() {
        let raw = "FreePhysicalMemory=2000\r\n\r\nTotalVisibleMemorySize=8000\r\n";
        let pct = Kind::Windows.parse_mem_sample(raw).unwrap();
        assert!((pct - 75.0).abs() < 1e-9);
    }

    #[test]
    fn windows_disk_sample_computes_used_percent() {
        let raw = "FreeSpace=100\r\n\r\nSize=400\r\n";
        let pct = Kind::Windows.parse_disk_sample(raw).unwrap();
        assert!((pct - 75.0).abs() < 1e-9);
    }

    #[test]
    fn unix_samples_use_plain_percent() {
        assert_eq!(Kind::Unix.parse_cpu_sample("12.0\n"), Some(12.0));
        assert_eq!(Kind::Macos.parse_disk_sample("60%\n"), Some(60.0));
    }
}
