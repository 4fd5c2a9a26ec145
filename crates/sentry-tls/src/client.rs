use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use sentry_core::CertKeyPaths;

use crate::{load_cert_chain, load_private_key, TlsMaterialError};

/// Alias used when the caller supplies no client-certificate selection.
pub const DEFAULT_CLIENT_CERT_ALIAS: &str = "default";

#[derive(Debug, Clone, Default)]
pub struct ClientTlsOptions {
    pub root_ca_bundle_file: Option<PathBuf>,
    pub insecure_skip_verify: bool,
    pub client_certs: HashMap<String, CertKeyPaths>,
}

/// Outbound TLS configuration, fixed at startup. rustls binds the client
/// certificate at config-build time, so one `ClientConfig` is prebuilt per
/// configured alias plus one with no client auth.
pub struct ClientTlsFactory {
    base: Arc<ClientConfig>,
    by_alias: HashMap<String, Arc<ClientConfig>>,
}

impl ClientTlsFactory {
    pub fn new(options: &ClientTlsOptions) -> Result<Self, TlsMaterialError> {
        let roots = build_root_store(options.root_ca_bundle_file.as_deref())?;

        let base = Arc::new(finish_config(new_builder(
            options.insecure_skip_verify,
            &roots,
        )));

        let mut by_alias = HashMap::with_capacity(options.client_certs.len());
        for (alias, paths) in &options.client_certs {
            let chain = load_cert_chain(&paths.cert_file)?;
            let key = load_private_key(&paths.key_file)?;
            let config = new_builder(options.insecure_skip_verify, &roots)
                .with_client_auth_cert(chain, key)?;
            by_alias.insert(alias.clone(), Arc::new(finish_alpn(config)));
        }

        Ok(Self { base, by_alias })
    }

    pub fn has_alias(&self, alias: &str) -> bool {
        self.by_alias.contains_key(alias)
    }

    /// Config for an explicitly selected alias. The caller is expected to
    /// have verified the alias exists; an unknown alias returns `None`.
    pub fn config_for_alias(&self, alias: &str) -> Option<Arc<ClientConfig>> {
        self.by_alias.get(alias).cloned()
    }

    /// Config used when the caller selected nothing: the `"default"` alias
    /// when configured, otherwise no client auth at all.
    pub fn default_config(&self) -> Arc<ClientConfig> {
        self.by_alias
            .get(DEFAULT_CLIENT_CERT_ALIAS)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.base))
    }
}

fn new_builder(
    insecure_skip_verify: bool,
    roots: &RootCertStore,
) -> rustls::ConfigBuilder<ClientConfig, rustls::client::WantsClientCert> {
    if insecure_skip_verify {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureSkipVerifyServerCertVerifier))
    } else {
        ClientConfig::builder().with_root_certificates(roots.clone())
    }
}

fn finish_config(
    builder: rustls::ConfigBuilder<ClientConfig, rustls::client::WantsClientCert>,
) -> ClientConfig {
    finish_alpn(builder.with_no_client_auth())
}

fn finish_alpn(mut config: ClientConfig) -> ClientConfig {
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    config
}

fn build_root_store(bundle: Option<&Path>) -> Result<RootCertStore, TlsMaterialError> {
    match bundle {
        Some(path) => {
            let mut store = RootCertStore::empty();
            for cert in load_cert_chain(path)? {
                store
                    .add(cert)
                    .map_err(|error| TlsMaterialError::Invalid(error.to_string()))?;
            }
            Ok(store)
        }
        None => Ok(RootCertStore::from_iter(
            webpki_roots::TLS_SERVER_ROOTS.iter().cloned(),
        )),
    }
}

#[derive(Debug)]
struct InsecureSkipVerifyServerCertVerifier;

impl ServerCertVerifier for InsecureSkipVerifyServerCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
        ]
    }
}
