//! Immutable runtime model built from a parsed [`Config`].
//!
//! A [`Snapshot`] compiles hostname patterns, builds the upstream pools and
//! loads certificates once; request handling only ever reads it. Reloading
//! builds a fresh snapshot and swaps the shared handle atomically, so
//! readers never observe a half-updated model. In-flight requests keep the
//! old snapshot alive through their `Arc` until they finish.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio_rustls::rustls::sign::CertifiedKey;
use tracing::info;

use crate::config::Config;
use crate::error::StartupError;
use crate::pool::PoolOptions;
use crate::router::{HostPattern, Router};
use crate::tls;
use crate::upstream::Upstream;

pub struct Snapshot {
    pub router: Router,
    upstreams: HashMap<String, Arc<Upstream>>,
    /// SNI pattern and certificate per TLS-enabled server block, in
    /// declared order.
    pub certificates: Vec<(HostPattern, Arc<CertifiedKey>)>,
    /// Served when the client sends no SNI or none of the patterns match:
    /// the first configured certificate, mirroring default-server behavior.
    pub default_certificate: Option<Arc<CertifiedKey>>,
}

impl Snapshot {
    pub fn build(config: &Config) -> Result<Arc<Self>, StartupError> {
        let router = Router::from_config(config)?;

        let mut upstreams = HashMap::new();
        for upstream in &config.upstreams {
            upstreams.insert(
                upstream.name.clone(),
                Arc::new(Upstream::new(upstream, PoolOptions::default())),
            );
        }

        let mut certificates = Vec::new();
        for server in &config.servers {
            if !server.listens.iter().any(|l| l.tls) {
                continue;
            }
            // Presence of both paths was enforced by config validation.
            let (Some(cert), Some(key)) = (&server.ssl_certificate, &server.ssl_certificate_key)
            else {
                continue;
            };
            let certified = tls::load_certified_key(cert, key)?;
            let pattern = HostPattern::parse(&server.server_name)?;
            certificates.push((pattern, certified));
        }
        let default_certificate = certificates.first().map(|(_, cert)| Arc::clone(cert));

        info!(
            upstreams = upstreams.len(),
            certificates = certificates.len(),
            "built runtime snapshot"
        );
        Ok(Arc::new(Self {
            router,
            upstreams,
            certificates,
            default_certificate,
        }))
    }

    pub fn upstream(&self, name: &str) -> Option<&Arc<Upstream>> {
        self.upstreams.get(name)
    }
}

/// Shared handle to the current snapshot.
///
/// Readers take a cheap clone of the inner `Arc`; a reload replaces the
/// whole `Arc` under a short write lock. Nothing holds the lock across
/// I/O, so steady-state forwarding never contends on it.
#[derive(Clone)]
pub struct SharedSnapshot {
    inner: Arc<RwLock<Arc<Snapshot>>>,
}

impl SharedSnapshot {
    pub fn new(snapshot: Arc<Snapshot>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(snapshot)),
        }
    }

    pub fn current(&self) -> Arc<Snapshot> {
        Arc::clone(&self.inner.read().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn store(&self, snapshot: Arc<Snapshot>) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = snapshot;
    }
}
