//! Retry Policy: classify transient errors and back off with exponential delay.
//!
//! A table-driven policy applied at the call site in the pool and registry
//! rather than a decorator wrapping a single method: the policy is a plain
//! value picked per operation class, so the same four policies cover every
//! transport call.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::{Error, Result};

/// One operation class's retry behavior: attempt count, initial delay, and
/// multiplicative backoff factor applied between attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
}

impl RetryPolicy {
    /// `Connect`: 3 attempts, 1.0s initial delay, 2x backoff.
    pub const CONNECT: RetryPolicy = RetryPolicy {
        max_attempts: 3,
        initial_delay: Duration::from_millis(1000),
        backoff_factor: 2.0,
    };

    /// `Exec`, `Mkdir`, `Rmdir`: 2 attempts, 0.5s initial delay, no backoff.
    pub const EXEC: RetryPolicy = RetryPolicy {
        max_attempts: 2,
        initial_delay: Duration::from_millis(500),
        backoff_factor: 1.0,
    };

    /// `Upload`, `Download`: 3 attempts, 1.0s initial delay, 2x backoff.
    pub const TRANSFER: RetryPolicy = RetryPolicy {
        max_attempts: 3,
        initial_delay: Duration::from_millis(1000),
        backoff_factor: 2.0,
    };

    /// `Health`: 2 attempts, 0.5s initial delay, no backoff.
    pub const HEALTH: RetryPolicy = RetryPolicy {
        max_attempts: 2,
        initial_delay: Duration::from_millis(500),
        backoff_factor: 1.0,
    };

    /// Runs `f`, retrying on retryable errors up to `max_attempts`, jittering
    /// the computed delay (±up to the full delay, full-jitter style) between
    /// attempts so many simultaneously-failing workers don't retry in lockstep.
    pub async fn run<F, Fut, T>(&self, op_name: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        let mut delay = self.initial_delay;
        loop {
            attempt += 1;
            match f().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let retryable = err.is_retryable();
                    if !retryable || attempt >= self.max_attempts {
                        if attempt > 1 {
                            warn!(
                                op = op_name,
                                attempt, "giving up after retries: {err}"
                            );
                        }
                        return Err(err);
                    }
                    let jittered = jitter(delay);
                    warn!(
                        op = op_name,
                        attempt,
                        delay_ms = jittered.as_millis() as u64,
                        "retrying after transient error: {err}"
                    );
                    tokio::time::sleep(jittered).await;
                    delay = delay.mul_f64(self.backoff_factor);
                }
            }
        }
    }
}

fn jitter(delay: Duration) -> Duration {
    let fraction: f64 = rand::thread_rng().gen_range(0.5..1.0);
    delay.mul_f64(fraction)
}

/// Non-retryable error surfaced immediately without consulting a policy —
/// kept as a free function so call sites that already know their error
/// is permanent (e.g. `TransportPermanent`) don't need to thread a policy.
pub fn is_permanent(err: &Error) -> bool {
    matches!(err, Error::TransportPermanent { .. })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn retries_up_to_max_attempts_then_fails() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            backoff_factor: 1.0,
        };
        let calls_clone = Arc::clone(&calls);
        let result: Result<()> = policy
            .run("test", || {
                let calls = Arc::clone(&calls_clone);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Transport {
                        worker: "w".into(),
                        message: "connection reset".into(),
                    })
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn succeeds_on_second_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            backoff_factor: 1.0,
        };
        let calls_clone = Arc::clone(&calls);
        let result = policy
            .run("test", || {
                let calls = Arc::clone(&calls_clone);
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n == 0 {
                        Err(Error::Transport {
                            worker: "w".into(),
                            message: "connection reset".into(),
                        })
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_retryable_error_surfaces_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::CONNECT;
        let calls_clone = Arc::clone(&calls);
        let result: Result<()> = policy
            .run("test", || {
                let calls = Arc::clone(&calls_clone);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::TransportPermanent {
                        worker: "w".into(),
                        message: "permission denied".into(),
                    })
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
