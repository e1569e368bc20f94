//! Bounded per-target backend connection pool.
//!
//! Each upstream target owns one pool of HTTP/1.1 keep-alive client
//! connections. Acquisition may wait (with a timeout) for a free slot;
//! release never blocks: the connection is handed to a small task that
//! returns it to the idle list once the sender is ready for another
//! request, which hyper only signals after the previous response body
//! has been fully consumed.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use http::{Request, Response};
use hyper::body::Incoming;
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::ProxyBody;
use crate::config::TargetAddr;

#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    /// Upper bound on live connections to one target, pooled or in flight.
    pub max_connections: usize,
    /// Idle connections kept beyond this are closed on release.
    pub max_idle: usize,
    pub connect_timeout: Duration,
    /// How long `acquire` may wait for a free slot.
    pub acquire_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_connections: 32,
            max_idle: 8,
            connect_timeout: Duration::from_secs(5),
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("timed out waiting for a connection slot")]
    PoolTimeout,

    #[error("connect to {addr} timed out")]
    ConnectTimeout { addr: String },

    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("handshake with {addr} failed: {source}")]
    Handshake {
        addr: String,
        #[source]
        source: hyper::Error,
    },
}

struct Idle {
    sender: SendRequest<ProxyBody>,
    permit: OwnedSemaphorePermit,
}

pub struct ConnectionPool {
    addr: TargetAddr,
    idle: Mutex<VecDeque<Idle>>,
    permits: Arc<Semaphore>,
    options: PoolOptions,
}

impl ConnectionPool {
    pub fn new(addr: TargetAddr, options: PoolOptions) -> Arc<Self> {
        Arc::new(Self {
            addr,
            idle: Mutex::new(VecDeque::new()),
            permits: Arc::new(Semaphore::new(options.max_connections)),
            options,
        })
    }

    pub fn addr(&self) -> &TargetAddr {
        &self.addr
    }

    /// Checks out a connection, reusing an idle one when possible.
    ///
    /// Waiting for a slot is bounded by `acquire_timeout`; dialing by
    /// `connect_timeout`. Idle connections the backend has since closed
    /// are discarded on the way.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConnection, AcquireError> {
        while let Some(entry) = self.pop_idle() {
            if entry.sender.is_closed() {
                debug!("discarding closed idle connection to {}", self.addr);
                continue;
            }
            return Ok(PooledConnection {
                pool: Arc::clone(self),
                sender: Some(entry.sender),
                permit: Some(entry.permit),
            });
        }

        let permit = match timeout(
            self.options.acquire_timeout,
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            // The semaphore is never closed; treat both cases as exhaustion.
            Ok(Err(_)) | Err(_) => return Err(AcquireError::PoolTimeout),
        };

        let sender = self.connect().await?;
        Ok(PooledConnection {
            pool: Arc::clone(self),
            sender: Some(sender),
            permit: Some(permit),
        })
    }

    async fn connect(&self) -> Result<SendRequest<ProxyBody>, AcquireError> {
        match &self.addr {
            TargetAddr::Tcp(addr) => {
                let stream = timeout(self.options.connect_timeout, TcpStream::connect(addr))
                    .await
                    .map_err(|_| AcquireError::ConnectTimeout {
                        addr: self.addr.to_string(),
                    })?
                    .map_err(|source| AcquireError::Connect {
                        addr: self.addr.to_string(),
                        source,
                    })?;
                self.handshake(TokioIo::new(stream)).await
            }
            TargetAddr::Unix(path) => {
                let stream = timeout(self.options.connect_timeout, UnixStream::connect(path))
                    .await
                    .map_err(|_| AcquireError::ConnectTimeout {
                        addr: self.addr.to_string(),
                    })?
                    .map_err(|source| AcquireError::Connect {
                        addr: self.addr.to_string(),
                        source,
                    })?;
                self.handshake(TokioIo::new(stream)).await
            }
        }
    }

    async fn handshake<T>(&self, io: T) -> Result<SendRequest<ProxyBody>, AcquireError>
    where
        T: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
    {
        let (sender, conn) = http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .handshake(io)
            .await
            .map_err(|source| AcquireError::Handshake {
                addr: self.addr.to_string(),
                source,
            })?;

        let addr = self.addr.to_string();
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                debug!("backend connection to {addr} ended: {err}");
            }
        });
        debug!("established backend connection to {}", self.addr);
        Ok(sender)
    }

    fn pop_idle(&self) -> Option<Idle> {
        self.idle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    fn push_idle(&self, sender: SendRequest<ProxyBody>, permit: OwnedSemaphorePermit) {
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        if idle.len() < self.options.max_idle {
            idle.push_back(Idle { sender, permit });
        }
        // Over the idle cap both sender and permit drop here, closing the
        // connection and freeing its slot.
    }
}

/// A checked-out backend connection.
///
/// Call [`PooledConnection::release`] after a successful exchange to return
/// it to the pool; dropping it instead closes the connection and frees its
/// slot, which is what error paths want.
pub struct PooledConnection {
    pool: Arc<ConnectionPool>,
    sender: Option<SendRequest<ProxyBody>>,
    permit: Option<OwnedSemaphorePermit>,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection").finish_non_exhaustive()
    }
}

impl PooledConnection {
    pub async fn send_request(
        &mut self,
        request: Request<ProxyBody>,
    ) -> hyper::Result<Response<Incoming>> {
        let sender = self
            .sender
            .as_mut()
            .expect("connection used after release");
        sender.send_request(request).await
    }

    /// Non-blocking release. The connection re-enters the idle list once
    /// hyper reports it ready, i.e. after the response body is drained;
    /// a connection the backend closed mid-response never comes back.
    pub fn release(mut self) {
        let (Some(mut sender), Some(permit)) = (self.sender.take(), self.permit.take()) else {
            return;
        };
        if sender.is_closed() {
            return;
        }
        let pool = Arc::clone(&self.pool);
        tokio::spawn(async move {
            match sender.ready().await {
                Ok(()) if !sender.is_closed() => pool.push_idle(sender, permit),
                Ok(()) => debug!("connection to {} closed before reuse", pool.addr),
                Err(err) => warn!("connection to {} not reusable: {err}", pool.addr),
            }
        });
    }
}
