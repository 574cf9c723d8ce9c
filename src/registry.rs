//! Worker Registry: authoritative map of worker identity → config → live handle.
//!
//! Holds no reference to the Pool's or Balancer's internals beyond calling
//! their public operations — it is the only component allowed to call into
//! both. The Pool and Balancer are leaves with no back-reference to the
//! Registry or to each other, so there is no cyclic ownership to untangle.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::pool::Pool;
use crate::retry::RetryPolicy;
use crate::transport::{factory, HealthSample, Kind, Transport, WorkerConfig};

/// A registered worker's static identity and connection config.
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub name: String,
    pub kind: Kind,
    pub config: WorkerConfig,
}

struct RegistryEntry {
    record: WorkerRecord,
    transport: Arc<dyn Transport>,
    active: bool,
}

/// Maps `name → worker` and `name → liveTransport`.
pub struct WorkerRegistry {
    workers: DashMap<String, RegistryEntry>,
    pool: Arc<Pool>,
}

impl WorkerRegistry {
    pub fn new(pool: Arc<Pool>) -> Self {
        Self {
            workers: DashMap::new(),
            pool,
        }
    }

    /// Constructs a transport via the factory and inserts it into the pool
    /// partition for `kind`, but does not open the connection.
    pub async fn add(&self, name: &str, kind: Kind, config: WorkerConfig) -> Result<()> {
        if self.workers.contains_key(name) {
            return Err(Error::Transport {
                worker: name.to_string(),
                message: "worker already registered".to_string(),
            });
        }
        let transport = factory::create(name, kind, config.clone());
        self.pool.add(kind, transport.clone()).await?;
        self.workers.insert(
            name.to_string(),
            RegistryEntry {
                record: WorkerRecord {
                    name: name.to_string(),
                    kind,
                    config,
                },
                transport,
                active: false,
            },
        );
        info!(worker = name, kind = kind.as_str(), "worker registered");
        Ok(())
    }

    pub async fn remove(&self, name: &str) -> Result<()> {
        let Some((_, entry)) = self.workers.remove(name) else {
            return Err(Error::WorkerNotFound(name.to_string()));
        };
        self.pool.remove(entry.record.kind, name).await?;
        let _ = entry.transport.disconnect().await;
        info!(worker = name, "worker deregistered");
        Ok(())
    }

    pub async fn connect(&self, name: &str) -> Result<()> {
        let transport = {
            let entry = self
                .workers
                .get(name)
                .ok_or_else(|| Error::WorkerNotFound(name.to_string()))?;
            entry.transport.clone()
        };
        RetryPolicy::CONNECT
            .run("connect", || transport.connect())
            .await?;
        if let Some(mut entry) = self.workers.get_mut(name) {
            entry.active = true;
        }
        info!(worker = name, "worker connected");
        Ok(())
    }

    pub async fn disconnect(&self, name: &str) -> Result<()> {
        let transport = {
            let entry = self
                .workers
                .get(name)
                .ok_or_else(|| Error::WorkerNotFound(name.to_string()))?;
            entry.transport.clone()
        };
        transport.disconnect().await?;
        if let Some(mut entry) = self.workers.get_mut(name) {
            entry.active = false;
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<WorkerRecord> {
        self.workers.get(name).map(|e| e.record.clone())
    }

    /// Names of workers currently `active` — true only after a successful `connect`.
    pub fn active(&self) -> Vec<String> {
        self.workers
            .iter()
            .filter(|e| e.active)
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn names_by_kind(&self, kind: Kind) -> Vec<String> {
        self.workers
            .iter()
            .filter(|e| e.record.kind == kind)
            .map(|e| e.key().clone())
            .collect()
    }

    /// Probes every registered worker's health. A worker whose sample carries
    /// errors is given bounded reconnect attempts; if those fail it is marked
    /// inactive rather than removed outright (removal is an explicit `remove`).
    pub async fn check_all(&self) -> HashMap<String, HealthSample> {
        let snapshot: Vec<(String, Arc<dyn Transport>)> = self
            .workers
            .iter()
            .map(|e| (e.key().clone(), e.transport.clone()))
            .collect();

        let mut out = HashMap::new();
        for (name, transport) in snapshot {
            match RetryPolicy::HEALTH.run("health", || transport.health()).await {
                Ok(sample) => {
                    if !sample.is_healthy() {
                        warn!(worker = %name, errors = ?sample.errors, "health check reported errors, reconnecting");
                        if RetryPolicy::CONNECT
                            .run("reconnect", || transport.connect())
                            .await
                            .is_err()
                        {
                            if let Some(mut entry) = self.workers.get_mut(&name) {
                                entry.active = false;
                            }
                        }
                    }
                    out.insert(name, sample);
                }
                Err(e) => {
                    warn!(worker = %name, "health probe failed: {e}");
                    if let Some(mut entry) = self.workers.get_mut(&name) {
                        entry.active = false;
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use crate::transport::Auth;

    fn config() -> WorkerConfig {
        WorkerConfig {
            host: "localhost".into(),
            port: 22,
            user: "u".into(),
            auth: Auth::Password("p".into()),
        }
    }

    #[tokio::test]
    async fn add_then_remove_round_trips() {
        let pool = Arc::new(Pool::new(PoolConfig::default()));
        let registry = WorkerRegistry::new(Arc::clone(&pool));
        registry.add("w1", Kind::Unix, config()).await.unwrap();
        assert!(registry.get("w1").is_some());
        assert!(registry.active().is_empty());

        registry.remove("w1").await.unwrap();
        assert!(registry.get("w1").is_none());
        let status = pool.status();
        assert_eq!(status.get(&Kind::Unix).map(|s| s.total).unwrap_or(0), 0);
    }

    #[tokio::test]
    async fn add_duplicate_name_errs() {
        let pool = Arc::new(Pool::new(PoolConfig::default()));
        let registry = WorkerRegistry::new(pool);
        registry.add("w1", Kind::Unix, config()).await.unwrap();
        let err = registry.add("w1", Kind::Unix, config()).await;
        assert!(err.is_err());
    }
}
