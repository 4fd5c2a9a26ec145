mod common;

use std::fs;
use std::sync::Arc;

use common::{
    connect, generate_ca, header_of, issue_client_leaf, issue_server_leaf, read_head,
    read_to_end_lossy, start_proxy, status_of, unique_temp_dir, write_all, TestCa,
};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use sentry_core::{CertKeyPaths, ProxyConfig};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use x509_parser::extensions::GeneralName;
use x509_parser::parse_x509_certificate;

fn listener_on_ephemeral_port() -> sentry_core::ListenerConfig {
    sentry_core::ListenerConfig {
        address: "127.0.0.1:0".to_string(),
        protocol: sentry_core::ListenerProtocol::Http,
        cert_file: None,
        key_file: None,
    }
}

fn client_connector_for(ca: &TestCa) -> TlsConnector {
    let ca_der =
        CertificateDer::from_pem_slice(ca.ca_cert_pem.as_bytes()).expect("issuer ca der");
    let mut roots = rustls::RootCertStore::empty();
    roots.add(ca_der).expect("add issuer root");
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn connect_without_issuer_returns_405() {
    let config = ProxyConfig {
        listeners: vec![listener_on_ephemeral_port()],
        ..ProxyConfig::default()
    };
    let proxy = start_proxy(config).await;

    let mut client = connect(&proxy.addr).await;
    write_all(
        &mut client,
        b"CONNECT api.example.com:443 HTTP/1.1\r\nHost: api.example.com:443\r\n\r\n",
    )
    .await;

    let head = read_head(&mut client).await;
    assert_eq!(status_of(&head), 405);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn intercepted_tunnel_round_trips_and_presents_minted_leaf() {
    let dir = unique_temp_dir("whsentry-mitm");
    let issuer_ca = generate_ca("Webhook Sentry MITM Issuer");
    let issuer_cert_file = dir.join("issuer.crt");
    let issuer_key_file = dir.join("issuer.key");
    fs::write(&issuer_cert_file, &issuer_ca.ca_cert_pem).expect("write issuer cert");
    fs::write(&issuer_key_file, &issuer_ca.ca_key_pem).expect("write issuer key");

    let origin_ca = generate_ca("Webhook Sentry Origin Root");
    let origin_leaf = issue_server_leaf(&origin_ca, "127.0.0.1");
    let roots_file = dir.join("roots.pem");
    fs::write(&roots_file, &origin_ca.ca_cert_pem).expect("write roots");

    let origin = TcpListener::bind("127.0.0.1:0").await.expect("bind origin");
    let origin_port = origin.local_addr().expect("origin addr").port();
    let origin_config = common::rustls_server_config(&origin_leaf, &origin_ca);
    let origin_task = tokio::spawn(async move {
        let acceptor = TlsAcceptor::from(origin_config);
        let (tcp, _) = origin.accept().await.expect("accept origin");
        let mut tls = acceptor.accept(tcp).await.expect("origin TLS accept");
        let head = read_head(&mut tls).await;
        tls.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 11\r\n\r\nintercepted")
            .await
            .expect("origin write");
        tls.shutdown().await.expect("origin shutdown");
        String::from_utf8_lossy(&head).to_string()
    });

    let config = ProxyConfig {
        listeners: vec![listener_on_ephemeral_port()],
        cidr_deny_list: Vec::new(),
        root_ca_bundle_file: Some(roots_file),
        mitm_issuer: Some(CertKeyPaths {
            cert_file: issuer_cert_file,
            key_file: issuer_key_file,
        }),
        ..ProxyConfig::default()
    };
    let proxy = start_proxy(config).await;

    let mut tcp = connect(&proxy.addr).await;
    write_all(
        &mut tcp,
        format!("CONNECT 127.0.0.1:{origin_port} HTTP/1.1\r\nHost: 127.0.0.1:{origin_port}\r\n\r\n")
            .as_bytes(),
    )
    .await;
    let connect_head = read_head(&mut tcp).await;
    assert_eq!(status_of(&connect_head), 200);
    assert!(String::from_utf8_lossy(&connect_head).contains("Connection Established"));

    // Complete TLS with the proxy; the minted leaf must chain to the
    // configured issuer and carry the CONNECT host in its SAN.
    let connector = client_connector_for(&issuer_ca);
    let server_name = ServerName::try_from("127.0.0.1").expect("server name");
    let mut tls = connector.connect(server_name, tcp).await.expect("client TLS");

    let peer_certs = tls
        .get_ref()
        .1
        .peer_certificates()
        .expect("peer certificates")
        .to_vec();
    let (_, leaf) = parse_x509_certificate(peer_certs[0].as_ref()).expect("parse leaf");
    let san = leaf
        .subject_alternative_name()
        .expect("san parse")
        .expect("san present");
    let has_ip_san = san
        .value
        .general_names
        .iter()
        .any(|name| matches!(name, GeneralName::IPAddress(value) if *value == [127, 0, 0, 1]));
    assert!(has_ip_san, "minted leaf must carry the CONNECT host SAN");
    let issuer_cn = leaf
        .issuer()
        .iter_common_name()
        .next()
        .expect("issuer cn")
        .as_str()
        .expect("utf8 issuer cn");
    assert_eq!(issuer_cn, "Webhook Sentry MITM Issuer");

    write_all(
        &mut tls,
        b"GET /x HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: close\r\nAccept: */*\r\n\r\n",
    )
    .await;
    let response_head = read_head(&mut tls).await;
    assert_eq!(status_of(&response_head), 200);
    let body = read_to_end_lossy(&mut tls).await;
    assert!(body.ends_with(b"intercepted"));

    let seen_by_origin = origin_task.await.expect("origin task");
    assert!(seen_by_origin.starts_with("GET /x HTTP/1.1\r\n"));
    assert!(seen_by_origin.contains("User-Agent: Webhook Sentry/0.1"));

    // Tunneled exchanges land in the access log with the https scheme.
    let lines = proxy.access_lines.snapshot();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains(&format!("https://127.0.0.1:{origin_port}/x")));

    let _ = fs::remove_dir_all(&dir);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tunneled_request_selects_client_certificate_by_alias() {
    let dir = unique_temp_dir("whsentry-mitm-mtls");
    let issuer_ca = generate_ca("Webhook Sentry MITM Issuer");
    let issuer_cert_file = dir.join("issuer.crt");
    let issuer_key_file = dir.join("issuer.key");
    fs::write(&issuer_cert_file, &issuer_ca.ca_cert_pem).expect("write issuer cert");
    fs::write(&issuer_key_file, &issuer_ca.ca_key_pem).expect("write issuer key");

    let origin_ca = generate_ca("Webhook Sentry Origin Root");
    let origin_leaf = issue_server_leaf(&origin_ca, "127.0.0.1");
    let roots_file = dir.join("roots.pem");
    fs::write(&roots_file, &origin_ca.ca_cert_pem).expect("write roots");

    let client_ca = generate_ca("Webhook Sentry Client Root");
    let partner_identity = issue_client_leaf(&client_ca, "partner-webhook");
    let partner_cert_file = dir.join("partner.crt");
    let partner_key_file = dir.join("partner.key");
    fs::write(&partner_cert_file, &partner_identity.cert_pem).expect("write partner cert");
    fs::write(&partner_key_file, &partner_identity.key_pem).expect("write partner key");

    // Origin requires mutual TLS against the client root.
    let origin = TcpListener::bind("127.0.0.1:0").await.expect("bind origin");
    let origin_port = origin.local_addr().expect("origin addr").port();
    let origin_config = {
        let client_ca_der =
            CertificateDer::from_pem_slice(client_ca.ca_cert_pem.as_bytes()).expect("client ca");
        let mut roots = rustls::RootCertStore::empty();
        roots.add(client_ca_der).expect("add client root");
        let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .expect("client verifier");
        let leaf_der = CertificateDer::from_pem_slice(origin_leaf.cert_pem.as_bytes())
            .expect("origin leaf der");
        let ca_der = CertificateDer::from_pem_slice(origin_ca.ca_cert_pem.as_bytes())
            .expect("origin ca der");
        let key =
            PrivateKeyDer::from_pem_slice(origin_leaf.key_pem.as_bytes()).expect("origin key");
        Arc::new(
            rustls::ServerConfig::builder()
                .with_client_cert_verifier(verifier)
                .with_single_cert(vec![leaf_der, ca_der], key)
                .expect("origin server config"),
        )
    };
    let origin_task = tokio::spawn(async move {
        let acceptor = TlsAcceptor::from(origin_config);
        let (tcp, _) = origin.accept().await.expect("accept origin");
        let mut tls = acceptor.accept(tcp).await.expect("origin mTLS accept");
        let head = read_head(&mut tls).await;
        tls.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 7\r\n\r\ntrusted")
            .await
            .expect("origin write");
        tls.shutdown().await.expect("origin shutdown");
        String::from_utf8_lossy(&head).to_string()
    });

    let mut client_certs = std::collections::HashMap::new();
    client_certs.insert(
        "partner".to_string(),
        CertKeyPaths {
            cert_file: partner_cert_file,
            key_file: partner_key_file,
        },
    );
    let config = ProxyConfig {
        listeners: vec![listener_on_ephemeral_port()],
        cidr_deny_list: Vec::new(),
        root_ca_bundle_file: Some(roots_file),
        client_certs,
        mitm_issuer: Some(CertKeyPaths {
            cert_file: issuer_cert_file,
            key_file: issuer_key_file,
        }),
        ..ProxyConfig::default()
    };
    let proxy = start_proxy(config).await;

    let mut tcp = connect(&proxy.addr).await;
    write_all(
        &mut tcp,
        format!("CONNECT 127.0.0.1:{origin_port} HTTP/1.1\r\nHost: 127.0.0.1:{origin_port}\r\n\r\n")
            .as_bytes(),
    )
    .await;
    let connect_head = read_head(&mut tcp).await;
    assert_eq!(status_of(&connect_head), 200);

    let connector = client_connector_for(&issuer_ca);
    let server_name = ServerName::try_from("127.0.0.1").expect("server name");
    let mut tls = connector.connect(server_name, tcp).await.expect("client TLS");

    write_all(
        &mut tls,
        b"GET /hook HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: close\r\nX-Whsentry-Clientcert: partner\r\n\r\n",
    )
    .await;
    let response_head = read_head(&mut tls).await;
    assert_eq!(status_of(&response_head), 200);
    let body = read_to_end_lossy(&mut tls).await;
    assert!(body.ends_with(b"trusted"));

    let seen_by_origin = origin_task.await.expect("origin task");
    assert!(!seen_by_origin.to_ascii_lowercase().contains("x-whsentry"));

    let _ = fs::remove_dir_all(&dir);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tunneled_request_with_unknown_alias_gets_1010() {
    let dir = unique_temp_dir("whsentry-mitm-alias");
    let issuer_ca = generate_ca("Webhook Sentry MITM Issuer");
    let issuer_cert_file = dir.join("issuer.crt");
    let issuer_key_file = dir.join("issuer.key");
    fs::write(&issuer_cert_file, &issuer_ca.ca_cert_pem).expect("write issuer cert");
    fs::write(&issuer_key_file, &issuer_ca.ca_key_pem).expect("write issuer key");

    let config = ProxyConfig {
        listeners: vec![listener_on_ephemeral_port()],
        cidr_deny_list: Vec::new(),
        mitm_issuer: Some(CertKeyPaths {
            cert_file: issuer_cert_file,
            key_file: issuer_key_file,
        }),
        ..ProxyConfig::default()
    };
    let proxy = start_proxy(config).await;

    let mut tcp: TcpStream = connect(&proxy.addr).await;
    write_all(
        &mut tcp,
        b"CONNECT 127.0.0.1:9999 HTTP/1.1\r\nHost: 127.0.0.1:9999\r\n\r\n",
    )
    .await;
    let connect_head = read_head(&mut tcp).await;
    assert_eq!(status_of(&connect_head), 200);

    let connector = client_connector_for(&issuer_ca);
    let server_name = ServerName::try_from("127.0.0.1").expect("server name");
    let mut tls = connector.connect(server_name, tcp).await.expect("client TLS");

    write_all(
        &mut tls,
        b"GET /x HTTP/1.1\r\nHost: 127.0.0.1\r\nX-Whsentry-Clientcert: absent-alias\r\n\r\n",
    )
    .await;
    let response_head = read_head(&mut tls).await;
    assert_eq!(status_of(&response_head), 400);
    assert_eq!(
        header_of(&response_head, "X-WhSentry-ReasonCode").as_deref(),
        Some("1010")
    );

    let _ = fs::remove_dir_all(&dir);
}
