use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use sentry_core::{map_io_error, CidrDenyList, ProxyError, ReasonCode};
use sentry_tls::{classify_handshake_error, ClientTlsFactory};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

/// Resolves, screens, and connects outbound sockets. Egress is IPv4-only:
/// the deny-list is defined over v4 prefixes, and admitting v6 without an
/// equivalent v6 list would bypass it.
pub struct SafeDialer {
    connect_timeout: Duration,
    deny_list: CidrDenyList,
    client_tls: Arc<ClientTlsFactory>,
}

impl SafeDialer {
    pub fn new(
        connect_timeout: Duration,
        deny_list: CidrDenyList,
        client_tls: Arc<ClientTlsFactory>,
    ) -> Self {
        Self {
            connect_timeout,
            deny_list,
            client_tls,
        }
    }

    pub fn has_client_cert_alias(&self, alias: &str) -> bool {
        self.client_tls.has_alias(alias)
    }

    /// Resolves `host`, picks the first IPv4 address, screens it against
    /// the deny-list, and dials under the connect timeout.
    pub async fn dial_plain(&self, host: &str, port: u16) -> Result<TcpStream, ProxyError> {
        let target = self.resolve_screened_v4(host, port).await?;
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(SocketAddr::V4(target)))
            .await
        {
            Err(_) => Err(ProxyError::timed_out()),
            Ok(Err(error)) => Err(map_io_error(error)),
            Ok(Ok(stream)) => Ok(stream),
        }
    }

    /// `dial_plain` followed by a TLS handshake with SNI = `host`. The
    /// handshake gets its own deadline equal to the connect timeout. A
    /// caller-selected certificate alias must exist in the store; with no
    /// alias the `"default"` entry is presented when configured.
    pub async fn dial_tls(
        &self,
        host: &str,
        port: u16,
        cert_alias: Option<&str>,
    ) -> Result<TlsStream<TcpStream>, ProxyError> {
        let config = match cert_alias {
            Some(alias) => self
                .client_tls
                .config_for_alias(alias)
                .ok_or_else(|| ProxyError::client_cert_not_found(alias))?,
            None => self.client_tls.default_config(),
        };
        let server_name = ServerName::try_from(host.to_string()).map_err(|_| {
            ProxyError::new(
                ReasonCode::TlsHandshakeError,
                format!("invalid SNI hostname {host}"),
            )
        })?;

        let tcp = self.dial_plain(host, port).await?;

        let connector = TlsConnector::from(config);
        match tokio::time::timeout(self.connect_timeout, connector.connect(server_name, tcp)).await
        {
            Err(_) => Err(ProxyError::timed_out()),
            Ok(Err(error)) => {
                let class = classify_handshake_error(&error);
                Err(
                    ProxyError::new(class.reason_code(), format!("TLS handshake error: {error}"))
                        .with_cause(error),
                )
            }
            Ok(Ok(stream)) => Ok(stream),
        }
    }

    async fn resolve_screened_v4(&self, host: &str, port: u16) -> Result<SocketAddrV4, ProxyError> {
        let target = format!("{host}:{port}");
        let resolved =
            match tokio::time::timeout(self.connect_timeout, tokio::net::lookup_host((host, port)))
                .await
            {
                Err(_) => return Err(ProxyError::timed_out()),
                Ok(Err(error)) => return Err(ProxyError::dns_failure(&target, error)),
                Ok(Ok(addrs)) => addrs,
            };

        let chosen =
            first_ipv4(resolved).ok_or_else(|| ProxyError::no_ipv4_address(&target))?;

        if self.deny_list.is_blocked(*chosen.ip()) {
            return Err(ProxyError::blocked_ip(*chosen.ip()));
        }
        Ok(chosen)
    }
}

/// First IPv4 in resolver order; no happy-eyeballs, no retries.
fn first_ipv4(addrs: impl IntoIterator<Item = SocketAddr>) -> Option<SocketAddrV4> {
    addrs.into_iter().find_map(|addr| match addr {
        SocketAddr::V4(v4) => Some(v4),
        SocketAddr::V6(_) => None,
    })
}
