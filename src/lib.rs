//! hostgate - a TLS-terminating virtual-host HTTP gateway
//!
//! A minimal reverse proxy: plaintext and TLS listeners, SNI-based
//! certificate selection, Host-header routing to named upstreams, and
//! streaming forwarding to backends over TCP or local domain sockets.
//!
//! The components are organized into the following modules:
//! - `config`: the declarative block-syntax configuration file
//! - `error`: the startup and per-request error taxonomy
//! - `logging`: logging system initialization
//! - `pool`: bounded per-target backend connection pool
//! - `proxy`: the per-request routing and forwarding pipeline
//! - `rewrite`: forwarding-header rewrites
//! - `router`: Host-header virtual-host routing
//! - `server`: listener binding and accept loops
//! - `snapshot`: the immutable, atomically swappable runtime model
//! - `tls`: certificate loading and SNI resolution
//! - `upstream`: target selection and failure marking

pub mod config;
pub mod error;
pub mod logging;
pub mod pool;
pub mod proxy;
pub mod rewrite;
pub mod router;
pub mod server;
pub mod snapshot;
pub mod tls;
pub mod upstream;

/// Body type used on both legs of the proxy: client bodies stream through
/// boxed, error responses are built from empty bodies.
pub type ProxyBody =
    http_body_util::combinators::BoxBody<hyper::body::Bytes, hyper::Error>;
