#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sentry_core::ProxyConfig;
use sentry_observe::{AccessLog, LineSink, MemorySink, MetricsRegistry, ProxyLog};
use sentry_proxy::ProxyServer;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

pub struct RunningProxy {
    pub addr: String,
    pub metrics: Arc<MetricsRegistry>,
    pub access_lines: MemorySink,
    pub proxy_lines: MemorySink,
}

/// Starts a proxy with in-memory log sinks on the first configured
/// listener (which should be bound to port zero) and returns the bound
/// address.
pub async fn start_proxy(config: ProxyConfig) -> RunningProxy {
    let (access_sink, access_lines) = LineSink::memory();
    let (proxy_sink, proxy_lines) = LineSink::memory();
    let access_log = AccessLog::new(access_sink, config.access_log.format);
    let proxy_log = ProxyLog::new(proxy_sink, config.proxy_log.format);
    let metrics = Arc::new(MetricsRegistry::new());

    let server = Arc::new(
        ProxyServer::with_observability(config, access_log, proxy_log, Arc::clone(&metrics))
            .expect("build proxy server"),
    );
    let (listener, addr) = server.bind_listener(0).await.expect("bind proxy listener");
    let run_server = Arc::clone(&server);
    tokio::spawn(async move { run_server.run_listener(0, listener).await });

    RunningProxy {
        addr,
        metrics,
        access_lines,
        proxy_lines,
    }
}

pub async fn connect(addr: &str) -> TcpStream {
    TcpStream::connect(addr).await.expect("connect to proxy")
}

/// Reads until the header/body boundary and returns the raw head bytes.
pub async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> Vec<u8> {
    let mut data = Vec::new();
    let mut buffer = [0_u8; 1024];
    while !data.windows(4).any(|window| window == b"\r\n\r\n") {
        let read = stream.read(&mut buffer).await.expect("read HTTP head");
        if read == 0 {
            break;
        }
        data.extend_from_slice(&buffer[..read]);
    }
    data
}

pub async fn read_to_end_lossy<S: AsyncRead + Unpin>(stream: &mut S) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0_u8; 1024];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(read) => out.extend_from_slice(&buf[..read]),
            Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(error) if error.kind() == std::io::ErrorKind::ConnectionReset => break,
            Err(error) if error.kind() == std::io::ErrorKind::ConnectionAborted => break,
            Err(error) if error.kind() == std::io::ErrorKind::BrokenPipe => break,
            Err(error) => panic!("read response: {error}"),
        }
    }
    out
}

pub fn status_of(head: &[u8]) -> u16 {
    let text = String::from_utf8_lossy(head);
    let status_line = text.split("\r\n").next().expect("status line");
    status_line
        .split_whitespace()
        .nth(1)
        .expect("status code")
        .parse::<u16>()
        .expect("numeric status")
}

pub fn header_of(head: &[u8], name: &str) -> Option<String> {
    let text = String::from_utf8_lossy(head);
    for line in text.split("\r\n").skip(1) {
        if let Some((line_name, value)) = line.split_once(':') {
            if line_name.trim().eq_ignore_ascii_case(name) {
                return Some(value.trim().to_string());
            }
        }
    }
    None
}

pub async fn write_all<S: AsyncWrite + Unpin>(stream: &mut S, bytes: &[u8]) {
    stream.write_all(bytes).await.expect("write request");
    stream.flush().await.expect("flush request");
}

/// Polls the listener gauge until it returns to zero.
pub async fn wait_for_gauge_zero(metrics: &MetricsRegistry, listener: &str) {
    for _ in 0..200 {
        if metrics.gauge_for_listener(listener).current() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "gauge for {listener} did not return to zero: {}",
        metrics.gauge_for_listener(listener).current()
    );
}

pub fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).expect("clock");
    let dir = std::env::temp_dir().join(format!(
        "{prefix}-{}-{}",
        std::process::id(),
        now.as_nanos()
    ));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

pub struct TestCa {
    pub ca_cert_pem: String,
    pub ca_key_pem: String,
    pub issuer: rcgen::Issuer<'static, rcgen::KeyPair>,
}

/// Self-signed CA usable both as a MITM issuer and as a root for test
/// origin certificates.
pub fn generate_ca(common_name: &str) -> TestCa {
    let key = rcgen::KeyPair::generate().expect("generate ca key");
    let ca_key_pem = key.serialize_pem();
    let mut params = rcgen::CertificateParams::default();
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    params.key_usages = vec![
        rcgen::KeyUsagePurpose::DigitalSignature,
        rcgen::KeyUsagePurpose::KeyCertSign,
    ];
    let mut dn = rcgen::DistinguishedName::new();
    dn.push(rcgen::DnType::CommonName, common_name);
    params.distinguished_name = dn;
    let cert = params.self_signed(&key).expect("self sign ca");
    let ca_cert_pem = cert.pem();
    let issuer = rcgen::Issuer::new(params, key);
    TestCa {
        ca_cert_pem,
        ca_key_pem,
        issuer,
    }
}

pub struct LeafIdentity {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Server-auth leaf for `host`, signed by `ca`.
pub fn issue_server_leaf(ca: &TestCa, host: &str) -> LeafIdentity {
    let key = rcgen::KeyPair::generate().expect("generate leaf key");
    let mut params =
        rcgen::CertificateParams::new(Vec::<String>::new()).expect("leaf params");
    params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        params.subject_alt_names.push(rcgen::SanType::IpAddress(ip));
    } else {
        params.subject_alt_names.push(rcgen::SanType::DnsName(
            host.try_into().expect("dns name"),
        ));
    }
    let mut dn = rcgen::DistinguishedName::new();
    dn.push(rcgen::DnType::CommonName, host);
    params.distinguished_name = dn;
    let cert = params.signed_by(&key, &ca.issuer).expect("sign leaf");
    LeafIdentity {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
    }
}

/// Client-auth leaf signed by `ca`.
pub fn issue_client_leaf(ca: &TestCa, common_name: &str) -> LeafIdentity {
    let key = rcgen::KeyPair::generate().expect("generate client key");
    let mut params =
        rcgen::CertificateParams::new(Vec::<String>::new()).expect("client params");
    params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ClientAuth];
    let mut dn = rcgen::DistinguishedName::new();
    dn.push(rcgen::DnType::CommonName, common_name);
    params.distinguished_name = dn;
    let cert = params.signed_by(&key, &ca.issuer).expect("sign client leaf");
    LeafIdentity {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
    }
}

pub fn rustls_server_config(leaf: &LeafIdentity, chain_ca: &TestCa) -> Arc<rustls::ServerConfig> {
    use rustls::pki_types::pem::PemObject;

    let leaf_der = rustls::pki_types::CertificateDer::from_pem_slice(leaf.cert_pem.as_bytes())
        .expect("leaf der");
    let ca_der = rustls::pki_types::CertificateDer::from_pem_slice(chain_ca.ca_cert_pem.as_bytes())
        .expect("ca der");
    let key = rustls::pki_types::PrivateKeyDer::from_pem_slice(leaf.key_pem.as_bytes())
        .expect("leaf key");
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![leaf_der, ca_der], key)
        .expect("server config");
    Arc::new(config)
}
