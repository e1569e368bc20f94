//! TLS termination: certificate loading and SNI-based selection.
//!
//! Fallback policy: when the client sends no SNI, or the SNI name matches
//! no server block's pattern, the handshake proceeds with the first
//! configured certificate (default-server behavior) rather than being
//! rejected. Host routing still applies to the decrypted requests, so a
//! mismatched name can at worst see a certificate warning, never someone
//! else's upstream.

use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::rustls::crypto::aws_lc_rs;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::{ClientHello, ResolvesServerCert};
use tokio_rustls::rustls::sign::CertifiedKey;
use tracing::debug;

use crate::error::StartupError;
use crate::router::normalize_host;
use crate::snapshot::{SharedSnapshot, Snapshot};

/// Loads a PEM certificate chain and private key into a rustls
/// [`CertifiedKey`]. Any problem here is fatal at startup.
pub fn load_certified_key(
    cert_path: &Path,
    key_path: &Path,
) -> Result<Arc<CertifiedKey>, StartupError> {
    let cert_file = std::fs::File::open(cert_path).map_err(|source| StartupError::Io {
        path: cert_path.to_path_buf(),
        source,
    })?;
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut BufReader::new(cert_file))
            .collect::<Result<_, _>>()
            .map_err(|e| StartupError::Certificate {
                path: cert_path.to_path_buf(),
                reason: e.to_string(),
            })?;
    if certs.is_empty() {
        return Err(StartupError::Certificate {
            path: cert_path.to_path_buf(),
            reason: "no certificates found in file".to_string(),
        });
    }

    let key_file = std::fs::File::open(key_path).map_err(|source| StartupError::Io {
        path: key_path.to_path_buf(),
        source,
    })?;
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| StartupError::Certificate {
            path: key_path.to_path_buf(),
            reason: e.to_string(),
        })?
        .ok_or_else(|| StartupError::Certificate {
            path: key_path.to_path_buf(),
            reason: "no private key found in file".to_string(),
        })?;

    let signing_key =
        aws_lc_rs::sign::any_supported_type(&key).map_err(|e| StartupError::Certificate {
            path: key_path.to_path_buf(),
            reason: e.to_string(),
        })?;

    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}

/// Selects a certificate from the SNI value by matching it against the
/// server blocks' hostname patterns, in declared order. Reads the current
/// snapshot on every handshake so a config reload takes effect without
/// rebuilding the acceptor.
pub struct SniResolver {
    snapshot: SharedSnapshot,
}

impl SniResolver {
    pub fn new(snapshot: SharedSnapshot) -> Self {
        Self { snapshot }
    }
}

impl std::fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SniResolver")
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let snapshot = self.snapshot.current();
        certificate_for(&snapshot, client_hello.server_name())
    }
}

/// Certificate selection by SNI name. The name goes through the same
/// normalization as request hosts, so mixed-case SNI still matches exact
/// and wildcard patterns.
fn certificate_for(snapshot: &Snapshot, sni: Option<&str>) -> Option<Arc<CertifiedKey>> {
    match sni {
        Some(name) => {
            let name = normalize_host(name);
            snapshot
                .certificates
                .iter()
                .find(|(pattern, _)| pattern.matches(&name))
                .map(|(_, cert)| Arc::clone(cert))
                .or_else(|| {
                    debug!("no certificate pattern matches SNI {name:?}, using default");
                    snapshot.default_certificate.clone()
                })
        }
        None => {
            debug!("client sent no SNI, using default certificate");
            snapshot.default_certificate.clone()
        }
    }
}

/// One acceptor serves every TLS listener; certificate choice is delegated
/// to [`SniResolver`] per handshake.
pub fn build_acceptor(snapshot: SharedSnapshot) -> TlsAcceptor {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(SniResolver::new(snapshot)));
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    TlsAcceptor::from(Arc::new(config))
}
