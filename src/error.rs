use std::net::SocketAddr;
use std::path::PathBuf;

use http::StatusCode;
use thiserror::Error;

/// Errors that abort startup. Anything in this taxonomy means the process
/// exits non-zero; nothing here is recoverable at request time.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("certificate {path}: {reason}")]
    Certificate { path: PathBuf, reason: String },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Config-file parse and validation errors, reported with the offending line
/// where the parser still knows it.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("line {line}: {msg}")]
    Parse { line: usize, msg: String },

    #[error("line {line}: directive `{name}` {msg}")]
    Directive {
        line: usize,
        name: String,
        msg: String,
    },

    #[error("server_name pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("proxy_pass references undeclared upstream {0:?}")]
    UnknownUpstream(String),

    #[error("upstream {0:?} declared more than once")]
    DuplicateUpstream(String),

    #[error("upstream {0:?} has no server targets")]
    EmptyUpstream(String),

    #[error("port {0} is listed both with and without ssl")]
    ListenConflict(u16),

    #[error("server block listens with ssl but has no ssl_certificate/ssl_certificate_key")]
    MissingCertificate,

    #[error("config declares no server blocks")]
    NoServers,
}

/// Per-request failures. Each maps to a response status; none of them may
/// take down the connection task, let alone the process.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("request carries no usable Host header")]
    MissingHost,

    #[error("no server block matches host {0:?}")]
    NoRouteMatch(String),

    #[error("upstream {0:?} has no available target")]
    UpstreamUnavailable(String),

    #[error("upstream {0:?} timed out")]
    UpstreamTimeout(String),

    #[error("upstream {upstream:?} request failed: {source}")]
    Upstream {
        upstream: String,
        #[source]
        source: hyper::Error,
    },
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::MissingHost => StatusCode::BAD_REQUEST,
            ProxyError::NoRouteMatch(_) => StatusCode::NOT_FOUND,
            ProxyError::UpstreamUnavailable(_) | ProxyError::Upstream { .. } => {
                StatusCode::BAD_GATEWAY
            }
            ProxyError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}
