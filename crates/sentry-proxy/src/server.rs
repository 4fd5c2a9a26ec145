use std::io;
use std::sync::Arc;

use sentry_core::{
    ConfigError, ListenerConfig, ListenerProtocol, ProxyConfig,
};
use sentry_observe::{AccessLog, InboundConnectionGauge, MetricsRegistry, ProxyLog};
use sentry_tls::{
    build_listener_server_config, load_issuer, ClientTlsFactory, ClientTlsOptions, LeafCertStore,
    TlsMaterialError,
};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use crate::dialer::SafeDialer;
use crate::handler::{serve_connection, ProxyEngine};
use crate::transport::OutboundTransport;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Tls(#[from] TlsMaterialError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// One frontend per configured listener, all sharing a single engine.
pub struct ProxyServer {
    config: ProxyConfig,
    engine: Arc<ProxyEngine>,
    metrics: Arc<MetricsRegistry>,
}

impl ProxyServer {
    pub fn new(config: ProxyConfig) -> Result<Self, ServerError> {
        config.validate()?;

        let metrics = Arc::new(MetricsRegistry::new());
        let access_log = AccessLog::from_config(&config.access_log)?;
        let proxy_log = ProxyLog::from_config(&config.proxy_log)?;
        Self::with_observability(config, access_log, proxy_log, metrics)
    }

    /// Wiring entry used by tests to capture logs and metrics in memory.
    pub fn with_observability(
        config: ProxyConfig,
        access_log: AccessLog,
        proxy_log: ProxyLog,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self, ServerError> {
        config.validate()?;

        let client_tls = Arc::new(ClientTlsFactory::new(&ClientTlsOptions {
            root_ca_bundle_file: config.root_ca_bundle_file.clone(),
            insecure_skip_verify: config.insecure_skip_cert_verification,
            client_certs: config.client_certs.clone(),
        })?);
        let dialer = SafeDialer::new(config.connect_timeout(), config.deny_list()?, client_tls);

        let leaf_store = match &config.mitm_issuer {
            Some(issuer) => Some(Arc::new(LeafCertStore::new(load_issuer(
                &issuer.cert_file,
                &issuer.key_file,
            )?))),
            None => None,
        };

        let engine = Arc::new(ProxyEngine::new(
            config.connection_lifetime(),
            config.idle_read_timeout(),
            config.max_response_body_bytes,
            OutboundTransport::new(dialer),
            access_log,
            proxy_log,
            Arc::clone(&metrics),
            leaf_store,
        ));

        Ok(Self {
            config,
            engine,
            metrics,
        })
    }

    pub fn metrics(&self) -> Arc<MetricsRegistry> {
        Arc::clone(&self.metrics)
    }

    /// Binds every configured listener and serves until the process stops.
    pub async fn run(self) -> Result<(), ServerError> {
        let mut frontends = Vec::with_capacity(self.config.listeners.len());
        for listener_config in &self.config.listeners {
            let tcp_listener = TcpListener::bind(&listener_config.address).await?;
            frontends.push(self.frontend(listener_config.clone(), tcp_listener)?);
        }

        let mut tasks = Vec::with_capacity(frontends.len());
        for frontend in frontends {
            tasks.push(tokio::spawn(frontend.run()));
        }
        for task in tasks {
            match task.await {
                Ok(result) => result?,
                Err(join_error) => {
                    return Err(ServerError::Io(io::Error::other(format!(
                        "listener task failed: {join_error}"
                    ))))
                }
            }
        }
        Ok(())
    }

    /// Binds a single listener on its configured address and returns the
    /// bound socket, letting tests bind port zero and read the address.
    pub async fn bind_listener(&self, index: usize) -> Result<(TcpListener, String), ServerError> {
        let listener_config = &self.config.listeners[index];
        let tcp_listener = TcpListener::bind(&listener_config.address).await?;
        let bound = tcp_listener.local_addr()?.to_string();
        Ok((tcp_listener, bound))
    }

    /// Serves one already-bound listener.
    pub async fn run_listener(&self, index: usize, tcp_listener: TcpListener) -> Result<(), ServerError> {
        let frontend = self.frontend(self.config.listeners[index].clone(), tcp_listener)?;
        frontend.run().await
    }

    fn frontend(
        &self,
        listener_config: ListenerConfig,
        tcp_listener: TcpListener,
    ) -> Result<ListenerFrontend, ServerError> {
        let acceptor = match listener_config.protocol {
            ListenerProtocol::Http => None,
            ListenerProtocol::Https => {
                let cert_file = listener_config
                    .cert_file
                    .as_ref()
                    .expect("validated https listener has cert_file");
                let key_file = listener_config
                    .key_file
                    .as_ref()
                    .expect("validated https listener has key_file");
                Some(TlsAcceptor::from(build_listener_server_config(
                    cert_file, key_file,
                )?))
            }
        };
        let label = tcp_listener
            .local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| listener_config.address.clone());
        Ok(ListenerFrontend {
            engine: Arc::clone(&self.engine),
            gauge: self.metrics.gauge_for_listener(&label),
            acceptor,
            tcp_listener,
        })
    }
}

struct ListenerFrontend {
    engine: Arc<ProxyEngine>,
    gauge: Arc<InboundConnectionGauge>,
    acceptor: Option<TlsAcceptor>,
    tcp_listener: TcpListener,
}

impl ListenerFrontend {
    async fn run(self) -> Result<(), ServerError> {
        loop {
            let (stream, peer) = self.tcp_listener.accept().await?;
            let engine = Arc::clone(&self.engine);
            let gauge = Arc::clone(&self.gauge);
            let acceptor = self.acceptor.clone();
            let client_addr = peer.to_string();

            gauge.increment();
            tokio::spawn(async move {
                let _ = match acceptor {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls_stream) => serve_connection(engine, tls_stream, client_addr).await,
                        Err(_) => Ok(()),
                    },
                    None => serve_connection(engine, stream, client_addr).await,
                };
                // Hijacked tunnels run inside serve_connection, so this
                // decrement also covers their teardown.
                gauge.decrement();
            });
        }
    }
}
