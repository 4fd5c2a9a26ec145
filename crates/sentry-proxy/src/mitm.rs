use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_rustls::TlsAcceptor;

use crate::handler::{handle_forward_request, write_simple_response, ProxyEngine};
use crate::http1::{read_request_head, HeadReadError, PrebufferedStream, RequestHead, WireStream};
use crate::MAX_REQUEST_HEAD_BYTES;

/// Authority named by a CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ConnectTarget {
    pub host: String,
    pub port: u16,
}

impl ConnectTarget {
    /// CONNECT targets are `host:port`; a missing port means 443.
    pub(crate) fn parse(authority: &str) -> Option<Self> {
        if authority.is_empty() {
            return None;
        }
        match authority.rsplit_once(':') {
            Some((host, port_text)) => {
                if host.is_empty() || host.contains(':') {
                    return None;
                }
                let port = port_text.parse::<u16>().ok()?;
                Some(Self {
                    host: host.to_string(),
                    port,
                })
            }
            None => Some(Self {
                host: authority.to_string(),
                port: 443,
            }),
        }
    }
}

/// CONNECT path: acknowledge the tunnel, take exclusive ownership of the
/// inbound socket, terminate TLS with a leaf minted for the target host,
/// then feed each decrypted request back through the forward path with
/// the outbound leg forced to TLS toward the original target.
pub(crate) async fn handle_connect<S>(
    engine: Arc<ProxyEngine>,
    mut inbound: WireStream<S>,
    head: RequestHead,
    client_addr: &str,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let Some(leaf_store) = engine.leaf_store.clone() else {
        // Interception is opt-in through the issuer configuration.
        return write_simple_response(
            &mut inbound.stream,
            405,
            "Method Not Allowed",
            "CONNECT method not allowed",
        )
        .await;
    };

    let Some(target) = ConnectTarget::parse(&head.target) else {
        return write_simple_response(
            &mut inbound.stream,
            400,
            "Bad Request",
            "invalid CONNECT target",
        )
        .await;
    };

    let request_id = uuid::Uuid::new_v4().to_string();

    let issued = match leaf_store.server_config_for_host(&target.host) {
        Ok(issued) => issued,
        Err(error) => {
            engine.proxy_log.error(
                &request_id,
                "Failed to issue interception certificate",
                Some(&error.to_string()),
            );
            return write_simple_response(
                &mut inbound.stream,
                500,
                "Internal Server Error",
                "certificate issuance failed",
            )
            .await;
        }
    };

    inbound
        .stream
        .write_all(b"HTTP/1.1 200 Connection Established\r\nConnection: Close\r\n\r\n")
        .await?;
    inbound.stream.flush().await?;

    // Hijack: anything the client sent past the CONNECT head belongs to
    // the TLS handshake.
    let hijacked = PrebufferedStream::new(std::mem::take(&mut inbound.pending), inbound.stream);
    let acceptor = TlsAcceptor::from(issued.server_config);
    let tls_stream = match acceptor.accept(hijacked).await {
        Ok(tls_stream) => tls_stream,
        Err(error) => {
            engine.proxy_log.warn(
                &request_id,
                "Inbound TLS handshake failed on intercepted tunnel",
                Some(&error.to_string()),
            );
            return Ok(());
        }
    };

    let mut tunnel = WireStream::wrap(tls_stream);
    loop {
        let request_head = match read_request_head(&mut tunnel, MAX_REQUEST_HEAD_BYTES).await {
            Ok(Some(request_head)) => request_head,
            // Caller disconnect tears the tunnel down.
            Ok(None) => return Ok(()),
            Err(HeadReadError::Malformed(_)) => {
                let _ = write_simple_response(
                    &mut tunnel.stream,
                    400,
                    "Bad Request",
                    "invalid HTTP request",
                )
                .await;
                return Ok(());
            }
            Err(HeadReadError::TooLarge) => {
                let _ = write_simple_response(
                    &mut tunnel.stream,
                    431,
                    "Request Header Fields Too Large",
                    "request head exceeded limit",
                )
                .await;
                return Ok(());
            }
            Err(HeadReadError::Io(_)) => return Ok(()),
        };
        if request_head.method == "CONNECT" {
            write_simple_response(
                &mut tunnel.stream,
                405,
                "Method Not Allowed",
                "nested CONNECT is not supported",
            )
            .await?;
            return Ok(());
        }

        let keep_alive =
            handle_forward_request(&engine, &mut tunnel, &request_head, client_addr, Some(&target))
                .await?;
        if !keep_alive {
            return Ok(());
        }
    }
}
