use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SanType,
};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;

use crate::TlsMaterialError;

pub const LEAF_CACHE_CAPACITY: usize = 1024;
/// A cached leaf older than this is reissued with a fresh key.
pub const LEAF_REISSUE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const LEAF_VALIDITY: Duration = Duration::from_secs(7 * 24 * 60 * 60);
/// notBefore backdate, absorbing clock skew between proxy and clients.
pub const LEAF_BACKDATE: Duration = Duration::from_secs(60 * 60);

/// The configured interception issuer: certificate plus signing key.
pub struct MitmIssuer {
    issuer: Issuer<'static, KeyPair>,
    cert_der: CertificateDer<'static>,
}

impl MitmIssuer {
    pub fn certificate_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }
}

pub fn load_issuer(
    cert_file: impl AsRef<Path>,
    key_file: impl AsRef<Path>,
) -> Result<MitmIssuer, TlsMaterialError> {
    let cert_pem = std::fs::read_to_string(cert_file.as_ref())?;
    let key_pem = std::fs::read_to_string(key_file.as_ref())?;

    let cert_der = CertificateDer::from_pem_slice(cert_pem.as_bytes()).map_err(|error| {
        TlsMaterialError::Pem(format!(
            "{}: {error}",
            cert_file.as_ref().display()
        ))
    })?;
    let key = KeyPair::from_pem(&key_pem)?;
    let issuer = Issuer::from_ca_cert_der(&cert_der, key).map_err(|error| {
        TlsMaterialError::Invalid(format!(
            "issuer certificate {} is unusable for signing: {error}",
            cert_file.as_ref().display()
        ))
    })?;

    Ok(MitmIssuer { issuer, cert_der })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafCacheStatus {
    Hit,
    Miss,
}

#[derive(Clone)]
pub struct IssuedLeaf {
    pub server_config: Arc<ServerConfig>,
    pub cache_status: LeafCacheStatus,
    pub leaf_cert_der: CertificateDer<'static>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LeafStoreMetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub leaves_issued: u64,
}

struct CachedLeaf {
    issued_at: SystemTime,
    server_config: Arc<ServerConfig>,
    leaf_cert_der: CertificateDer<'static>,
}

struct LeafStoreState {
    cache: HashMap<String, CachedLeaf>,
    lru: VecDeque<String>,
}

/// Mints and caches per-hostname leaf certificates for the interception
/// path. Single-writer access through the interior mutex; the issuer is
/// read-only after construction.
pub struct LeafCertStore {
    issuer: MitmIssuer,
    cache_capacity: usize,
    reissue_ttl: Duration,
    state: Mutex<LeafStoreState>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    leaves_issued: AtomicU64,
}

impl LeafCertStore {
    pub fn new(issuer: MitmIssuer) -> Self {
        Self::with_cache_policy(issuer, LEAF_CACHE_CAPACITY, LEAF_REISSUE_TTL)
    }

    pub fn with_cache_policy(
        issuer: MitmIssuer,
        cache_capacity: usize,
        reissue_ttl: Duration,
    ) -> Self {
        Self {
            issuer,
            cache_capacity,
            reissue_ttl,
            state: Mutex::new(LeafStoreState {
                cache: HashMap::new(),
                lru: VecDeque::new(),
            }),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            leaves_issued: AtomicU64::new(0),
        }
    }

    pub fn issuer_certificate_der(&self) -> &CertificateDer<'static> {
        self.issuer.certificate_der()
    }

    /// Server config carrying a leaf for `host`, minted on first use and
    /// cached until the reissue TTL or LRU eviction.
    pub fn server_config_for_host(&self, host: &str) -> Result<IssuedLeaf, TlsMaterialError> {
        let normalized_host = normalize_host(host);
        let now = SystemTime::now();
        let mut state = self.state.lock().map_err(|_| TlsMaterialError::LockPoisoned)?;

        if let Some((server_config, leaf_cert_der)) =
            state.cache.get(&normalized_host).and_then(|cached| {
                let age = now
                    .duration_since(cached.issued_at)
                    .unwrap_or(Duration::ZERO);
                (age <= self.reissue_ttl).then(|| {
                    (
                        Arc::clone(&cached.server_config),
                        cached.leaf_cert_der.clone(),
                    )
                })
            })
        {
            touch_lru(&mut state.lru, &normalized_host);
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(IssuedLeaf {
                server_config,
                cache_status: LeafCacheStatus::Hit,
                leaf_cert_der,
            });
        }

        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        let (server_config, leaf_cert_der) =
            issue_leaf_server_config(&self.issuer, &normalized_host)?;
        self.leaves_issued.fetch_add(1, Ordering::Relaxed);

        if self.cache_capacity > 0 {
            if state.cache.len() >= self.cache_capacity
                && !state.cache.contains_key(&normalized_host)
            {
                evict_lru_entry(&mut state);
            }
            state.cache.insert(
                normalized_host.clone(),
                CachedLeaf {
                    issued_at: now,
                    server_config: Arc::clone(&server_config),
                    leaf_cert_der: leaf_cert_der.clone(),
                },
            );
            touch_lru(&mut state.lru, &normalized_host);
        }

        Ok(IssuedLeaf {
            server_config,
            cache_status: LeafCacheStatus::Miss,
            leaf_cert_der,
        })
    }

    pub fn metrics_snapshot(&self) -> LeafStoreMetricsSnapshot {
        LeafStoreMetricsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            leaves_issued: self.leaves_issued.load(Ordering::Relaxed),
        }
    }
}

fn issue_leaf_server_config(
    issuer: &MitmIssuer,
    host: &str,
) -> Result<(Arc<ServerConfig>, CertificateDer<'static>), TlsMaterialError> {
    let leaf_params = build_leaf_params(host)?;
    let leaf_key = KeyPair::generate()?;
    let leaf_key_der = PrivatePkcs8KeyDer::from(leaf_key.serialize_der());
    let leaf_cert = leaf_params.signed_by(&leaf_key, &issuer.issuer)?;
    let leaf_cert_der = leaf_cert.der().clone();

    let chain = vec![leaf_cert_der.clone(), issuer.cert_der.clone()];
    let private_key = PrivateKeyDer::from(leaf_key_der);

    let mut server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, private_key)?;
    server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok((Arc::new(server_config), leaf_cert_der))
}

fn build_leaf_params(host: &str) -> Result<CertificateParams, TlsMaterialError> {
    let mut params = CertificateParams::new(Vec::<String>::new())?;
    params.use_authority_key_identifier_extension = true;
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let now = time::OffsetDateTime::now_utc();
    params.not_before = now - LEAF_BACKDATE;
    params.not_after = now + LEAF_VALIDITY;

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, host.to_string());
    params.distinguished_name = distinguished_name;

    if let Ok(ip) = host.parse::<IpAddr>() {
        params.subject_alt_names.push(SanType::IpAddress(ip));
    } else {
        params
            .subject_alt_names
            .push(SanType::DnsName(host.try_into()?));
    }

    Ok(params)
}

fn normalize_host(host: &str) -> String {
    match host.parse::<IpAddr>() {
        Ok(_) => host.to_string(),
        Err(_) => host.to_ascii_lowercase(),
    }
}

fn touch_lru(lru: &mut VecDeque<String>, key: &str) {
    if let Some(position) = lru.iter().position(|entry| entry == key) {
        lru.remove(position);
    }
    lru.push_back(key.to_string());
}

fn evict_lru_entry(state: &mut LeafStoreState) {
    if let Some(oldest) = state.lru.pop_front() {
        state.cache.remove(&oldest);
    }
}
