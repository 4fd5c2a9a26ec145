use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use sentry_core::{map_io_error, ProxyError};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

use crate::dialer::SafeDialer;
use crate::http1::{
    read_response_head, relay_body, BodyFraming, Headers, RelayBounds, RelayError, ResponseHead,
    WireStream,
};

/// A fully prepared outbound request: target, filtered headers, and the
/// inbound body framing to relay.
pub(crate) struct OutboundRequest {
    pub method: String,
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub path_and_query: String,
    pub headers: Headers,
    pub framing: BodyFraming,
    pub cert_alias: Option<String>,
}

impl OutboundRequest {
    fn host_header(&self) -> String {
        let default_port = if self.tls { 443 } else { 80 };
        if self.port == default_port {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Request line + headers. Keepalive is disabled on the outbound leg;
    /// every request gets a fresh connection.
    pub(crate) fn serialize_head(&self) -> Vec<u8> {
        let mut head = format!(
            "{} {} HTTP/1.1\r\nHost: {}\r\n",
            self.method,
            self.path_and_query,
            self.host_header()
        );
        for (name, value) in self.headers.iter() {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        head.push_str("Connection: close\r\n\r\n");
        head.into_bytes()
    }
}

pub(crate) enum OutboundStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for OutboundStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for OutboundStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Pool-less HTTP/1.1 client: each round trip dials a fresh connection
/// through the safe dialer, writes the request, relays the request body,
/// and reads the response head. The caller streams the body.
pub(crate) struct OutboundTransport {
    dialer: SafeDialer,
}

impl OutboundTransport {
    pub(crate) fn new(dialer: SafeDialer) -> Self {
        Self { dialer }
    }

    pub(crate) async fn round_trip<S>(
        &self,
        request: &OutboundRequest,
        inbound: &mut WireStream<S>,
    ) -> Result<(WireStream<OutboundStream>, ResponseHead), ProxyError>
    where
        S: AsyncRead + Unpin,
    {
        let stream = if request.tls {
            OutboundStream::Tls(Box::new(
                self.dialer
                    .dial_tls(&request.host, request.port, request.cert_alias.as_deref())
                    .await?,
            ))
        } else {
            OutboundStream::Plain(self.dialer.dial_plain(&request.host, request.port).await?)
        };

        let mut outbound = WireStream::wrap(stream);
        outbound
            .stream
            .write_all(&request.serialize_head())
            .await
            .map_err(map_io_error)?;

        // The request leg runs without its own bounds; the caller holds
        // the whole round trip under the exchange deadline.
        relay_body(
            inbound,
            &mut outbound.stream,
            request.framing,
            &RelayBounds::unbounded(),
        )
        .await
        .map_err(request_relay_error)?;
        outbound.stream.flush().await.map_err(map_io_error)?;

        let head = read_response_head(&mut outbound, &request.method).await?;
        Ok((outbound, head))
    }
}

fn request_relay_error(error: RelayError) -> ProxyError {
    match error {
        RelayError::Source(error) | RelayError::Sink(error) => map_io_error(error),
        RelayError::Framing(reason) => {
            ProxyError::internal(io::Error::new(io::ErrorKind::InvalidData, reason))
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::http1::{BodyFraming, Headers};

    use super::OutboundRequest;

    fn request(tls: bool, port: u16) -> OutboundRequest {
        let mut headers = Headers::default();
        headers.push("Accept", "application/json");
        headers.push("User-Agent", "Webhook Sentry/0.1");
        OutboundRequest {
            method: "POST".to_string(),
            host: "api.example.com".to_string(),
            port,
            tls,
            path_and_query: "/hook?x=1".to_string(),
            headers,
            framing: BodyFraming::Empty,
            cert_alias: None,
        }
    }

    #[test]
    fn serializes_origin_form_request_with_connection_close() {
        let head = String::from_utf8(request(false, 80).serialize_head()).expect("utf8");
        assert!(head.starts_with("POST /hook?x=1 HTTP/1.1\r\nHost: api.example.com\r\n"));
        assert!(head.contains("Accept: application/json\r\n"));
        assert!(head.contains("User-Agent: Webhook Sentry/0.1\r\n"));
        assert!(head.ends_with("Connection: close\r\n\r\n"));
    }

    #[test]
    fn host_header_keeps_non_default_ports() {
        let head = String::from_utf8(request(true, 8443).serialize_head()).expect("utf8");
        assert!(head.contains("Host: api.example.com:8443\r\n"));

        let default_port = String::from_utf8(request(true, 443).serialize_head()).expect("utf8");
        assert!(default_port.contains("Host: api.example.com\r\n"));
    }
}
