//! Listener management: bind, accept, hand off.
//!
//! One [`Listener`] exists per declared `{port, tls}` pair. Binding is
//! fatal at startup; once running, per-connection failures (accept errors,
//! TLS handshakes, protocol errors) are logged and never stop the accept
//! loop or touch other connections.

use std::net::SocketAddr;

use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

use crate::error::StartupError;
use crate::proxy::GatewayService;
use crate::snapshot::SharedSnapshot;

pub struct Listener {
    listener: TcpListener,
    addr: SocketAddr,
    tls: Option<TlsAcceptor>,
    snapshot: SharedSnapshot,
}

impl Listener {
    /// Binds the listening socket. `tls` carries the shared acceptor for
    /// `listen ... ssl` entries.
    pub async fn bind(
        addr: SocketAddr,
        tls: Option<TlsAcceptor>,
        snapshot: SharedSnapshot,
    ) -> Result<Self, StartupError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| StartupError::Bind { addr, source })?;
        let addr = listener
            .local_addr()
            .map_err(|source| StartupError::Bind { addr, source })?;
        info!(
            "listening on {addr} ({})",
            if tls.is_some() { "tls" } else { "plaintext" }
        );
        Ok(Self {
            listener,
            addr,
            tls,
            snapshot,
        })
    }

    /// The bound address, useful when binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Accept loop. Runs until the task is dropped; each connection gets
    /// its own task and its own [`GatewayService`] carrying the peer
    /// address for forwarding headers.
    pub async fn run(self) {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(err) => {
                    error!("accept on {} failed: {err}", self.addr);
                    continue;
                }
            };
            debug!("accepted connection from {peer} on {}", self.addr);

            let service = GatewayService::new(self.snapshot.clone(), peer);
            let tls = self.tls.clone();
            tokio::spawn(async move {
                let result = match tls {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls_stream) => serve(TokioIo::new(tls_stream), service).await,
                        Err(err) => {
                            debug!("TLS handshake with {peer} failed: {err}");
                            return;
                        }
                    },
                    None => serve(TokioIo::new(stream), service).await,
                };
                if let Err(err) = result {
                    debug!("connection from {peer} ended with error: {err}");
                }
            });
        }
    }
}

async fn serve<I>(
    io: I,
    service: GatewayService,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    Builder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
}
