use std::io;
use std::sync::Arc;

use sentry_core::ProxyConfig;
use sentry_observe::MetricsRegistry;
use sentry_proxy::{ProxyServer, ServerError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("whsentry: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ServerError> {
    let config = match std::env::args().nth(1) {
        Some(path) => ProxyConfig::load_from_file(path)?,
        None => ProxyConfig::default(),
    };
    let metrics_address = config.metrics_address.clone();

    let server = ProxyServer::new(config)?;
    tokio::spawn(serve_metrics(metrics_address, server.metrics()));
    server.run().await
}

/// Minimal exposition endpoint: `GET /metrics` in Prometheus text format.
async fn serve_metrics(address: String, registry: Arc<MetricsRegistry>) -> io::Result<()> {
    let listener = TcpListener::bind(&address).await?;
    loop {
        let (mut stream, _) = listener.accept().await?;
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            let mut buf = [0_u8; 4096];
            let read = match stream.read(&mut buf).await {
                Ok(read) => read,
                Err(_) => return,
            };
            let head = String::from_utf8_lossy(&buf[..read]);
            let response = if head.starts_with("GET /metrics ") {
                let body = registry.render_prometheus();
                format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len(),
                )
            } else {
                "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                    .to_string()
            };
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        });
    }
}
