//! Connection Pool: lease transports per worker class, evict idle/unhealthy ones.
//!
//! Partitioned by `Kind`. Each partition keeps its entries behind one
//! `tokio::sync::Mutex` — maintenance tasks and `acquire`/`release` all
//! serialize through it, one mutex per partition.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use crate::transport::{HealthSample, Kind, Transport};

/// Tunables shared by every partition in a pool.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub capacity: usize,
    pub acquire_timeout: Duration,
    pub max_idle_time: Duration,
    pub health_interval: Duration,
    pub max_failed_attempts: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            acquire_timeout: Duration::from_secs(30),
            max_idle_time: Duration::from_secs(300),
            health_interval: Duration::from_secs(60),
            max_failed_attempts: 3,
        }
    }
}

struct Entry {
    transport: Arc<dyn Transport>,
    in_use: bool,
    last_used: Instant,
    consecutive_failures: u32,
    last_health_at: Option<Instant>,
    last_health: Option<HealthSample>,
}

impl Entry {
    fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            in_use: false,
            last_used: Instant::now(),
            consecutive_failures: 0,
            last_health_at: None,
            last_health: None,
        }
    }
}

struct Partition {
    entries: AsyncMutex<Vec<Entry>>,
    waiters: AsyncMutex<VecDeque<oneshot::Sender<()>>>,
    capacity: usize,
}

impl Partition {
    fn new(capacity: usize) -> Self {
        Self {
            entries: AsyncMutex::new(Vec::new()),
            waiters: AsyncMutex::new(VecDeque::new()),
            capacity,
        }
    }

    async fn wake_one(&self) {
        let mut waiters = self.waiters.lock().await;
        while let Some(tx) = waiters.pop_front() {
            if tx.send(()).is_ok() {
                return;
            }
        }
    }
}

/// Per-kind counts returned by `status()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PartitionStatus {
    pub capacity: usize,
    pub total: usize,
    pub in_use: usize,
    pub idle: usize,
}

/// A leased transport; call `pool.release(kind, name)` when done with it.
pub struct Lease {
    pub transport: Arc<dyn Transport>,
}

/// Lease transports per worker kind, evicting idle or unhealthy ones.
pub struct Pool {
    partitions: DashMap<Kind, Arc<Partition>>,
    config: PoolConfig,
}

impl Pool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            partitions: DashMap::new(),
            config,
        }
    }

    fn partition(&self, kind: Kind) -> Arc<Partition> {
        self.partitions
            .entry(kind)
            .or_insert_with(|| Arc::new(Partition::new(self.config.capacity)))
            .clone()
    }

    /// Adds a transport to its kind's partition. Does not connect it.
    pub async fn add(&self, kind: Kind, transport: Arc<dyn Transport>) -> Result<()> {
        let partition = self.partition(kind);
        let mut entries = partition.entries.lock().await;
        if entries.len() >= partition.capacity {
            return Err(Error::PoolTimeout {
                kind: kind.as_str().to_string(),
                timeout_ms: 0,
            });
        }
        entries.push(Entry::new(transport));
        Ok(())
    }

    /// Removes a transport (by worker name) from its kind's partition.
    pub async fn remove(&self, kind: Kind, name: &str) -> Result<()> {
        let partition = self.partition(kind);
        let mut entries = partition.entries.lock().await;
        entries.retain(|e| e.transport.name() != name);
        Ok(())
    }

    /// Blocks up to `timeout` for a healthy, free transport in `kind`'s partition.
    pub async fn acquire(&self, kind: Kind, timeout: Duration) -> Result<Option<Lease>> {
        let partition = self.partition(kind);
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(lease) = self.try_acquire_once(&partition, kind).await? {
                return Ok(Some(lease));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }

            let (tx, rx) = oneshot::channel();
            partition.waiters.lock().await.push_back(tx);
            let _ = tokio::time::timeout(remaining, rx).await;
        }
    }

    /// One pass over the partition: reconnect stale-failed entries, refresh
    /// health on TTL expiry, and hand back the first entry that clears both.
    ///
    /// Candidates are looked up by name, never by index, each time the lock
    /// is reacquired: the reconnect and health checks below drop the lock
    /// across an I/O call, and in that window another task (idle eviction,
    /// a concurrent `acquire`) can shrink or reorder the entry vector. An
    /// index captured before the drop would then point at the wrong entry
    /// or past the end.
    async fn try_acquire_once(&self, partition: &Partition, kind: Kind) -> Result<Option<Lease>> {
        let names: Vec<String> = {
            let entries = partition.entries.lock().await;
            entries
                .iter()
                .filter(|e| !e.in_use)
                .map(|e| e.transport.name().to_string())
                .collect()
        };

        for name in names {
            let mut entries = partition.entries.lock().await;
            let Some(idx) = entries.iter().position(|e| e.transport.name() == name) else {
                continue;
            };
            if entries[idx].in_use {
                continue;
            }

            if entries[idx].consecutive_failures >= self.config.max_failed_attempts {
                let transport = entries[idx].transport.clone();
                drop(entries);
                let reconnected = RetryPolicy::CONNECT
                    .run("reconnect", || transport.connect())
                    .await
                    .is_ok();
                entries = partition.entries.lock().await;
                let Some(idx) = entries.iter().position(|e| e.transport.name() == name) else {
                    continue;
                };
                if reconnected {
                    entries[idx].consecutive_failures = 0;
                } else {
                    warn!(worker = %name, "dropping transport after repeated failures");
                    entries.remove(idx);
                    continue;
                }
            }

            let Some(idx) = entries.iter().position(|e| e.transport.name() == name) else {
                continue;
            };
            let needs_health = entries[idx]
                .last_health_at
                .map(|t| t.elapsed() > self.config.health_interval)
                .unwrap_or(true);
            if needs_health {
                let transport = entries[idx].transport.clone();
                drop(entries);
                let sample = RetryPolicy::HEALTH.run("health", || transport.health()).await;
                entries = partition.entries.lock().await;
                let Some(idx) = entries.iter().position(|e| e.transport.name() == name) else {
                    continue;
                };
                match sample {
                    Ok(sample) if sample.is_healthy() => {
                        entries[idx].consecutive_failures = 0;
                        entries[idx].last_health_at = Some(Instant::now());
                        entries[idx].last_health = Some(sample);
                    }
                    Ok(sample) => {
                        entries[idx].consecutive_failures += 1;
                        entries[idx].last_health_at = Some(Instant::now());
                        entries[idx].last_health = Some(sample);
                        continue;
                    }
                    Err(_) => {
                        entries[idx].consecutive_failures += 1;
                        continue;
                    }
                }
            }

            let Some(idx) = entries.iter().position(|e| e.transport.name() == name) else {
                continue;
            };
            if entries[idx].in_use {
                continue;
            }
            entries[idx].in_use = true;
            entries[idx].last_used = Instant::now();
            debug!(kind = kind.as_str(), worker = entries[idx].transport.name(), "leased");
            return Ok(Some(Lease {
                transport: entries[idx].transport.clone(),
            }));
        }
        Ok(None)
    }

    /// Returns a lease to its partition, waking the next FIFO waiter.
    pub async fn release(&self, kind: Kind, name: &str) -> Result<()> {
        let partition = self.partition(kind);
        {
            let mut entries = partition.entries.lock().await;
            if let Some(entry) = entries.iter_mut().find(|e| e.transport.name() == name) {
                entry.in_use = false;
                entry.last_used = Instant::now();
            }
        }
        partition.wake_one().await;
        Ok(())
    }

    pub fn status(&self) -> std::collections::HashMap<Kind, PartitionStatus> {
        let mut out = std::collections::HashMap::new();
        for entry in self.partitions.iter() {
            let kind = *entry.key();
            let partition = entry.value().clone();
            // Best-effort snapshot: try_lock so `status()` never blocks on I/O.
            if let Ok(entries) = partition.entries.try_lock() {
                let total = entries.len();
                let in_use = entries.iter().filter(|e| e.in_use).count();
                out.insert(
                    kind,
                    PartitionStatus {
                        capacity: partition.capacity,
                        total,
                        in_use,
                        idle: total - in_use,
                    },
                );
            }
        }
        out
    }

    /// Disconnects every transport across every partition.
    pub async fn close(&self) {
        for entry in self.partitions.iter() {
            let mut entries = entry.value().entries.lock().await;
            for e in entries.iter() {
                let _ = e.transport.disconnect().await;
            }
            entries.clear();
        }
    }

    /// Background task: disconnect and drop transports idle past `max_idle_time`.
    pub async fn run_idle_eviction(self: Arc<Self>) {
        let mut tick = tokio::time::interval(Duration::from_secs(60));
        loop {
            tick.tick().await;
            for entry in self.partitions.iter() {
                let partition = entry.value().clone();
                let mut entries = partition.entries.lock().await;
                let mut keep = Vec::with_capacity(entries.len());
                for e in entries.drain(..) {
                    if !e.in_use && e.last_used.elapsed() > self.config.max_idle_time {
                        info!(worker = e.transport.name(), "evicting idle transport");
                        let _ = e.transport.disconnect().await;
                    } else {
                        keep.push(e);
                    }
                }
                *entries = keep;
            }
        }
    }

    /// Background task: probe every non-leased transport every `health_interval`.
    pub async fn run_health_sweep(self: Arc<Self>) {
        let mut tick = tokio::time::interval(self.config.health_interval);
        loop {
            tick.tick().await;
            for entry in self.partitions.iter() {
                let partition = entry.value().clone();
                let names: Vec<String> = {
                    let entries = partition.entries.lock().await;
                    entries
                        .iter()
                        .filter(|e| !e.in_use)
                        .map(|e| e.transport.name().to_string())
                        .collect()
                };
                for name in names {
                    let transport = {
                        let entries = partition.entries.lock().await;
                        entries
                            .iter()
                            .find(|e| e.transport.name() == name)
                            .map(|e| e.transport.clone())
                    };
                    let Some(transport) = transport else { continue };
                    let sample = transport.health().await;
                    let mut entries = partition.entries.lock().await;
                    let Some(idx) = entries.iter().position(|e| e.transport.name() == name) else {
                        continue;
                    };
                    if entries[idx].in_use {
                        continue;
                    }
                    match sample {
                        Ok(sample) if sample.is_healthy() => {
                            entries[idx].consecutive_failures = 0;
                            entries[idx].last_health_at = Some(Instant::now());
                            entries[idx].last_health = Some(sample);
                        }
                        Ok(sample) => {
                            entries[idx].consecutive_failures += 1;
                            entries[idx].last_health_at = Some(Instant::now());
                            entries[idx].last_health = Some(sample);
                        }
                        Err(e) => {
                            warn!(worker = %name, "health sweep probe failed: {e}");
                            entries[idx].consecutive_failures += 1;
                        }
                    }
                    if entries[idx].consecutive_failures >= self.config.max_failed_attempts {
                        let transport = entries[idx].transport.clone();
                        drop(entries);
                        if RetryPolicy::CONNECT
                            .run("reconnect", || transport.connect())
                            .await
                            .is_ok()
                        {
                            let mut entries = partition.entries.lock().await;
                            if let Some(idx) =
                                entries.iter().position(|e| e.transport.name() == name)
                            {
                                entries[idx].consecutive_failures = 0;
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Auth, HealthSample as HS, Kind, Transport, WorkerConfig};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeTransport {
        name: String,
        connected: AtomicBool,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        fn kind(&self) -> Kind {
            Kind::Unix
        }
        fn name(&self) -> &str {
            &self.name
        }
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
        async fn connect(&self) -> Result<()> {
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn disconnect(&self) -> Result<()> {
            self.connected.store(false, Ordering::SeqCst);
            Ok(())
        }
        async fn exec(&self, _cmd: &str) -> Result<(String, String)> {
            Ok((String::new(), String::new()))
        }
        async fn upload(&self, _local: &Path, _remote: &str) -> Result<()> {
            Ok(())
        }
        async fn download(&self, _remote: &str, _local: &Path) -> Result<()> {
            Ok(())
        }
        async fn mkdir(&self, _path: &str) -> Result<()> {
            Ok(())
        }
        async fn rmdir(&self, _path: &str) -> Result<()> {
            Ok(())
        }
        async fn health(&self) -> Result<HS> {
            Ok(HS {
                cpu_percent: 1.0,
                mem_percent: 1.0,
                disk_percent: 1.0,
                interpreter_version: None,
                errors: Vec::new(),
                sampled_at: Utc::now(),
            })
        }
        async fn interpreter_version(&self) -> Result<String> {
            Ok("3.11".to_string())
        }
    }

    fn fake(name: &str) -> Arc<dyn Transport> {
        Arc::new(FakeTransport {
            name: name.to_string(),
            connected: AtomicBool::new(true),
        })
    }

    #[allow(dead_code)]
    fn dummy_config() -> WorkerConfig {
        WorkerConfig {
            host: "localhost".into(),
            port: 22,
            user: "u".into(),
            auth: Auth::Password("p".into()),
        }
    }

    #[tokio::test]
    async fn acquire_then_release_round_trips() {
        let pool = Pool::new(PoolConfig::default());
        pool.add(Kind::Unix, fake("a")).await.unwrap();
        let lease = pool
            .acquire(Kind::Unix, Duration::from_millis(100))
            .await
            .unwrap()
            .expect("lease");
        assert_eq!(lease.transport.name(), "a");
        pool.release(Kind::Unix, "a").await.unwrap();
        let status = pool.status();
        assert_eq!(status[&Kind::Unix].in_use, 0);
    }

    #[tokio::test]
    async fn acquire_times_out_when_all_leased() {
        let pool = Pool::new(PoolConfig::default());
        pool.add(Kind::Unix, fake("a")).await.unwrap();
        let _lease = pool
            .acquire(Kind::Unix, Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        let second = pool
            .acquire(Kind::Unix, Duration::from_millis(50))
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn add_beyond_capacity_errs() {
        let pool = Pool::new(PoolConfig {
            capacity: 1,
            ..PoolConfig::default()
        });
        pool.add(Kind::Unix, fake("a")).await.unwrap();
        let err = pool.add(Kind::Unix, fake("b")).await;
        assert!(err.is_err());
    }
}
