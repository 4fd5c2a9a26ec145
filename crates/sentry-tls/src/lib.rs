mod classify;
mod client;
mod leaf_store;

pub use classify::{classify_handshake_error, classify_tls_failure_text, TlsFailureClass};
pub use client::{ClientTlsFactory, ClientTlsOptions, DEFAULT_CLIENT_CERT_ALIAS};
pub use leaf_store::{
    load_issuer, IssuedLeaf, LeafCacheStatus, LeafCertStore, LeafStoreMetricsSnapshot, MitmIssuer,
    LEAF_BACKDATE, LEAF_CACHE_CAPACITY, LEAF_REISSUE_TTL, LEAF_VALIDITY,
};

use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TlsMaterialError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse PEM material: {0}")]
    Pem(String),
    #[error("certificate generation failed: {0}")]
    CertificateGeneration(#[from] rcgen::Error),
    #[error("TLS config build failed: {0}")]
    ConfigBuild(#[from] rustls::Error),
    #[error("certificate store lock poisoned")]
    LockPoisoned,
    #[error("invalid TLS material: {0}")]
    Invalid(String),
}

/// Server-side TLS config for a listener, from a PEM chain + key on disk.
pub fn build_listener_server_config(
    cert_file: impl AsRef<Path>,
    key_file: impl AsRef<Path>,
) -> Result<Arc<ServerConfig>, TlsMaterialError> {
    let chain = load_cert_chain(cert_file.as_ref())?;
    let key = load_private_key(key_file.as_ref())?;

    let mut server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)?;
    server_config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(server_config))
}

pub(crate) fn load_cert_chain(
    path: &Path,
) -> Result<Vec<CertificateDer<'static>>, TlsMaterialError> {
    let mut chain = Vec::new();
    for cert in CertificateDer::pem_file_iter(path)
        .map_err(|error| pem_error(path, &error.to_string()))?
    {
        chain.push(cert.map_err(|error| pem_error(path, &error.to_string()))?);
    }
    if chain.is_empty() {
        return Err(TlsMaterialError::Invalid(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(chain)
}

pub(crate) fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsMaterialError> {
    PrivateKeyDer::from_pem_file(path).map_err(|error| pem_error(path, &error.to_string()))
}

fn pem_error(path: &Path, detail: &str) -> TlsMaterialError {
    TlsMaterialError::Pem(format!("{}: {detail}", path.display()))
}
