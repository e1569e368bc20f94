//! Upstream target sets and backend selection.
//!
//! Selection policy: round-robin across the declared targets, skipping any
//! target still inside its `fail_timeout` window. A connect failure marks
//! the target unavailable for that window and moves on to the next
//! eligible one; when every target is out, the request fails with a
//! 502-class error.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::{TargetConfig, UpstreamConfig};
use crate::error::ProxyError;
use crate::pool::{AcquireError, ConnectionPool, PoolOptions, PooledConnection};

/// One backend target: its address, its connection pool, and its
/// availability window.
pub struct Target {
    addr_label: String,
    fail_timeout: Duration,
    unavailable_until: Mutex<Option<Instant>>,
    pool: Arc<ConnectionPool>,
}

impl Target {
    pub fn new(config: &TargetConfig, options: PoolOptions) -> Arc<Self> {
        Arc::new(Self {
            addr_label: config.addr.to_string(),
            fail_timeout: config.fail_timeout,
            unavailable_until: Mutex::new(None),
            pool: ConnectionPool::new(config.addr.clone(), options),
        })
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Takes the target out of rotation for its `fail_timeout`. A zero
    /// window means the target is never marked.
    pub fn mark_failed(&self) {
        if self.fail_timeout.is_zero() {
            return;
        }
        let until = Instant::now() + self.fail_timeout;
        *self
            .unavailable_until
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(until);
        warn!(
            "marking target {} unavailable for {:?}",
            self.addr_label, self.fail_timeout
        );
    }

    pub fn is_available(&self) -> bool {
        let mut guard = self
            .unavailable_until
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        match *guard {
            Some(until) if Instant::now() < until => false,
            Some(_) => {
                *guard = None;
                true
            }
            None => true,
        }
    }
}

pub struct Upstream {
    name: String,
    targets: Vec<Arc<Target>>,
    next: AtomicUsize,
}

impl Upstream {
    pub fn new(config: &UpstreamConfig, options: PoolOptions) -> Self {
        Self {
            name: config.name.clone(),
            targets: config
                .targets
                .iter()
                .map(|t| Target::new(t, options))
                .collect(),
            next: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Obtains a backend connection, walking the rotation at most once.
    ///
    /// Connect and handshake failures mark the target and advance; a pool
    /// slot timeout means the upstream is saturated rather than down and
    /// surfaces as a timeout instead.
    pub async fn acquire(&self) -> Result<PooledConnection, ProxyError> {
        let len = self.targets.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed);

        for i in 0..len {
            let target = &self.targets[(start + i) % len];
            if !target.is_available() {
                debug!(
                    "skipping unavailable target {} of upstream {}",
                    target.addr_label, self.name
                );
                continue;
            }
            match target.pool().acquire().await {
                Ok(conn) => return Ok(conn),
                Err(AcquireError::PoolTimeout) => {
                    return Err(ProxyError::UpstreamTimeout(self.name.clone()));
                }
                Err(err) => {
                    warn!("upstream {}: {err}", self.name);
                    target.mark_failed();
                }
            }
        }
        Err(ProxyError::UpstreamUnavailable(self.name.clone()))
    }

    #[cfg(test)]
    pub(crate) fn targets(&self) -> &[Arc<Target>] {
        &self.targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TargetAddr;
    use std::net::SocketAddr;

    use tokio::net::TcpListener;

    fn target(addr: SocketAddr, fail_timeout: Duration) -> TargetConfig {
        TargetConfig {
            addr: TargetAddr::Tcp(addr),
            fail_timeout,
        }
    }

    async fn dead_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr
    }

    fn fast_options() -> PoolOptions {
        PoolOptions {
            connect_timeout: Duration::from_millis(500),
            acquire_timeout: Duration::from_millis(500),
            ..PoolOptions::default()
        }
    }

    #[test]
    fn failed_target_recovers_after_window() {
        let addr = "127.0.0.1:1".parse().unwrap();
        let t = Target::new(&target(addr, Duration::from_millis(50)), PoolOptions::default());

        assert!(t.is_available());
        t.mark_failed();
        assert!(!t.is_available());
        std::thread::sleep(Duration::from_millis(60));
        assert!(t.is_available());
    }

    #[test]
    fn zero_fail_timeout_never_marks() {
        let addr = "127.0.0.1:1".parse().unwrap();
        let t = Target::new(&target(addr, Duration::ZERO), PoolOptions::default());

        t.mark_failed();
        assert!(t.is_available());
    }

    #[tokio::test]
    async fn all_targets_down_is_unavailable() {
        let a = dead_addr().await;
        let b = dead_addr().await;
        let upstream = Upstream::new(
            &UpstreamConfig {
                name: "dead".to_string(),
                targets: vec![
                    target(a, Duration::from_secs(10)),
                    target(b, Duration::from_secs(10)),
                ],
            },
            fast_options(),
        );

        let err = upstream.acquire().await.unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamUnavailable(_)));

        // Both targets were just marked; the second attempt must skip them
        // without dialing.
        assert!(upstream.targets().iter().all(|t| !t.is_available()));
        let err = upstream.acquire().await.unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamUnavailable(_)));
    }

    #[tokio::test]
    async fn skips_failed_target_and_uses_healthy_one() {
        let dead = dead_addr().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let alive = listener.local_addr().unwrap();
        // Keep the listener open so connects succeed; no requests are sent.
        let _keep = tokio::spawn(async move {
            loop {
                let Ok(_conn) = listener.accept().await else {
                    break;
                };
            }
        });

        let upstream = Upstream::new(
            &UpstreamConfig {
                name: "mixed".to_string(),
                targets: vec![
                    target(dead, Duration::from_secs(10)),
                    target(alive, Duration::from_secs(10)),
                ],
            },
            fast_options(),
        );

        for _ in 0..4 {
            assert!(upstream.acquire().await.is_ok());
        }
    }
}
