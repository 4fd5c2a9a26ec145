use std::io;
use std::sync::Arc;
use std::time::Duration;

use http::Uri;
use sentry_core::{
    ProxyError, ReasonCode, CLIENT_CERT_HEADER, PRIVATE_HEADER_PREFIX, PRODUCT_USER_AGENT,
    REASON_CODE_HEADER, REASON_HEADER, TLS_UPGRADE_HEADER,
};
use sentry_observe::{now_rfc3339, AccessLog, AccessLogRecord, MetricsRegistry, ProxyLog};
use sentry_tls::LeafCertStore;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::http1::{
    read_request_head, relay_body, HeadReadError, Headers, RelayBounds, RelayError, RelayOutcome,
    RequestHead, WireStream,
};
use crate::mitm::{handle_connect, ConnectTarget};
use crate::transport::{OutboundRequest, OutboundTransport};
use crate::MAX_REQUEST_HEAD_BYTES;

/// Shared mediation state: one engine serves every listener.
pub(crate) struct ProxyEngine {
    pub(crate) connection_lifetime: Duration,
    pub(crate) idle_read_timeout: Duration,
    pub(crate) max_response_body_bytes: u32,
    pub(crate) transport: OutboundTransport,
    pub(crate) access_log: AccessLog,
    pub(crate) proxy_log: ProxyLog,
    pub(crate) metrics: Arc<MetricsRegistry>,
    pub(crate) leaf_store: Option<Arc<LeafCertStore>>,
}

impl ProxyEngine {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        connection_lifetime: Duration,
        idle_read_timeout: Duration,
        max_response_body_bytes: u32,
        transport: OutboundTransport,
        access_log: AccessLog,
        proxy_log: ProxyLog,
        metrics: Arc<MetricsRegistry>,
        leaf_store: Option<Arc<LeafCertStore>>,
    ) -> Self {
        Self {
            connection_lifetime,
            idle_read_timeout,
            max_response_body_bytes,
            transport,
            access_log,
            proxy_log,
            metrics,
            leaf_store,
        }
    }
}

/// Whole-exchange deadline; one per request.
pub(crate) struct Deadline {
    at: tokio::time::Instant,
}

pub(crate) struct DeadlineElapsed;

impl Deadline {
    pub(crate) fn after(lifetime: Duration) -> Self {
        Self {
            at: tokio::time::Instant::now() + lifetime,
        }
    }

    pub(crate) fn expires_at(&self) -> tokio::time::Instant {
        self.at
    }

    pub(crate) async fn bound<T>(
        &self,
        future: impl std::future::Future<Output = T>,
    ) -> Result<T, DeadlineElapsed> {
        tokio::time::timeout_at(self.at, future)
            .await
            .map_err(|_| DeadlineElapsed)
    }
}

/// Serves one accepted connection: requests are handled serially, CONNECT
/// hands the whole connection to the interception engine.
pub(crate) async fn serve_connection<S>(
    engine: Arc<ProxyEngine>,
    stream: S,
    client_addr: String,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut conn = WireStream::wrap(stream);
    loop {
        let head = match read_request_head(&mut conn, MAX_REQUEST_HEAD_BYTES).await {
            Ok(Some(head)) => head,
            Ok(None) => return Ok(()),
            Err(HeadReadError::TooLarge) => {
                write_simple_response(
                    &mut conn.stream,
                    431,
                    "Request Header Fields Too Large",
                    "request head exceeded limit",
                )
                .await?;
                return Ok(());
            }
            Err(HeadReadError::Malformed(_)) => {
                write_simple_response(&mut conn.stream, 400, "Bad Request", "invalid HTTP request")
                    .await?;
                return Ok(());
            }
            Err(HeadReadError::Io(_)) => return Ok(()),
        };

        if head.method == "CONNECT" {
            return handle_connect(engine, conn, head, &client_addr).await;
        }

        let keep_alive =
            handle_forward_request(&engine, &mut conn, &head, &client_addr, None).await?;
        if !keep_alive {
            return Ok(());
        }
    }
}

/// Mediates one non-CONNECT request: validate, dial, round-trip, stream
/// the response under the configured bounds, then log and observe.
/// Returns whether the inbound connection may carry another request.
pub(crate) async fn handle_forward_request<S>(
    engine: &ProxyEngine,
    inbound: &mut WireStream<S>,
    head: &RequestHead,
    client_addr: &str,
    tunnel_target: Option<&ConnectTarget>,
) -> io::Result<bool>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request_id = Uuid::new_v4();
    let started = tokio::time::Instant::now();
    let deadline = Deadline::after(engine.connection_lifetime);
    let uuid = request_id.to_string();

    let effective_url = effective_url(head, tunnel_target);
    let outcome = mediate(engine, &deadline, inbound, head, tunnel_target, &uuid).await;

    let (status, error_code, keep_alive) = match outcome {
        MediationOutcome::Completed {
            status,
            response_close,
            clean,
        } => {
            let reusable = clean && !response_close && !head.close_after;
            (status, "", reusable)
        }
        MediationOutcome::Failed(ref error) => {
            let cause = error.cause.as_ref().map(|cause| cause.to_string());
            if error.code == ReasonCode::InternalServerError {
                engine.proxy_log.error(
                    &uuid,
                    "Unexpected error while proxying request",
                    cause.as_deref(),
                );
            } else {
                engine.proxy_log.warn(&uuid, &error.message, cause.as_deref());
            }
            let _ = write_error_response(&mut inbound.stream, error).await;
            (error.status, error.code.wire(), false)
        }
    };

    let elapsed = started.elapsed();
    engine.access_log.log(&AccessLogRecord {
        timestamp: now_rfc3339(),
        uuid,
        client_addr: client_addr.to_string(),
        method: head.method.clone(),
        url: effective_url,
        response_code: status,
        response_time_ms: elapsed.as_millis().min(u128::from(u64::MAX)) as u64,
    });
    engine.metrics.observe_response(error_code, elapsed);

    Ok(keep_alive)
}

enum MediationOutcome {
    /// The response head was written; `clean` means the body completed
    /// within bounds.
    Completed {
        status: u16,
        response_close: bool,
        clean: bool,
    },
    /// Failed before anything was written inbound.
    Failed(ProxyError),
}

async fn mediate<S>(
    engine: &ProxyEngine,
    deadline: &Deadline,
    inbound: &mut WireStream<S>,
    head: &RequestHead,
    tunnel_target: Option<&ConnectTarget>,
    uuid: &str,
) -> MediationOutcome
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let prepared = match prepare_outbound(head, tunnel_target) {
        Ok(prepared) => prepared,
        Err(error) => return MediationOutcome::Failed(error),
    };

    let (mut outbound, response_head) =
        match deadline.bound(engine.transport.round_trip(&prepared, inbound)).await {
            Err(DeadlineElapsed) => return MediationOutcome::Failed(ProxyError::timed_out()),
            Ok(Err(error)) => return MediationOutcome::Failed(error),
            Ok(Ok(pair)) => pair,
        };

    // Declared length beyond the cap fails the request without touching
    // the body.
    if let Ok(Some(length)) = response_head.headers.declared_content_length() {
        if length > u64::from(engine.max_response_body_bytes) {
            return MediationOutcome::Failed(ProxyError::response_too_large());
        }
    }

    // Committed from here on: the origin's head is relayed verbatim, so
    // ordering and multi-valued headers survive untouched.
    if let Err(error) = inbound.stream.write_all(&response_head.raw).await {
        engine
            .proxy_log
            .error(uuid, "Error writing to inbound socket", Some(&error.to_string()));
        return MediationOutcome::Completed {
            status: response_head.status,
            response_close: true,
            clean: false,
        };
    }

    let bounds = RelayBounds {
        max_payload: Some(u64::from(engine.max_response_body_bytes)),
        idle_read: Some(engine.idle_read_timeout),
        deadline: Some(deadline.expires_at()),
    };
    let end = relay_body(
        &mut outbound,
        &mut inbound.stream,
        response_head.framing,
        &bounds,
    )
    .await;
    let _ = inbound.stream.flush().await;

    let clean = match end {
        Ok(RelayOutcome::Done(_)) => true,
        Ok(RelayOutcome::OverCap) => {
            engine
                .proxy_log
                .warn(uuid, "Response body exceeded maximum allowed length", None);
            false
        }
        Ok(RelayOutcome::IdleExpired) => {
            engine
                .proxy_log
                .warn(uuid, "Socket idle read time out reached", None);
            false
        }
        Ok(RelayOutcome::DeadlineExpired) => {
            engine.proxy_log.warn(
                uuid,
                "Connection lifetime exceeded while streaming response",
                None,
            );
            false
        }
        Err(RelayError::Source(error)) => {
            engine.proxy_log.warn(
                uuid,
                "Error reading response from target",
                Some(&error.to_string()),
            );
            false
        }
        Err(RelayError::Framing(reason)) => {
            engine
                .proxy_log
                .warn(uuid, "Error reading response from target", Some(reason));
            false
        }
        Err(RelayError::Sink(error)) => {
            engine.proxy_log.error(
                uuid,
                "Error writing to inbound socket",
                Some(&error.to_string()),
            );
            false
        }
    };

    MediationOutcome::Completed {
        status: response_head.status,
        response_close: response_head.close_after,
        clean,
    }
}

fn prepare_outbound(
    head: &RequestHead,
    tunnel_target: Option<&ConnectTarget>,
) -> Result<OutboundRequest, ProxyError> {
    let (host, port, tls, path_and_query) = match tunnel_target {
        // Inside an interception tunnel the scheme is implicitly https and
        // targets arrive in origin-form.
        Some(target) => (
            target.host.clone(),
            target.port,
            true,
            head.target.clone(),
        ),
        None => {
            let uri = head
                .target
                .parse::<Uri>()
                .map_err(|_| ProxyError::invalid_uri())?;
            let scheme = uri.scheme_str().ok_or_else(ProxyError::invalid_uri)?;
            let authority = uri.authority().ok_or_else(ProxyError::invalid_uri)?;
            if scheme != "http" {
                return Err(ProxyError::invalid_scheme());
            }
            let tls = tls_upgrade_hint(&head.headers);
            let port = authority
                .port_u16()
                .unwrap_or(if tls { 443 } else { 80 });
            let path_and_query = uri
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string());
            (authority.host().to_string(), port, tls, path_and_query)
        }
    };

    let cert_alias = head.headers.first(CLIENT_CERT_HEADER).map(ToString::to_string);

    Ok(OutboundRequest {
        method: head.method.clone(),
        host,
        port,
        tls,
        path_and_query,
        headers: filter_outbound_headers(&head.headers),
        framing: head.framing,
        cert_alias,
    })
}

/// Copies caller headers onto the outbound request, dropping hop-by-hop
/// headers, the private `X-Whsentry` namespace, and the caller's Host and
/// User-Agent (both are proxy-owned outbound).
pub(crate) fn filter_outbound_headers(headers: &Headers) -> Headers {
    let mut out = Headers::default();
    for (name, value) in headers.iter() {
        if is_proxy_owned_header(name) {
            continue;
        }
        out.push(name, value);
    }
    out.push("User-Agent", PRODUCT_USER_AGENT);
    out
}

fn is_proxy_owned_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("proxy-connection")
        || name.eq_ignore_ascii_case("user-agent")
        || name.eq_ignore_ascii_case("host")
        || name
            .get(..PRIVATE_HEADER_PREFIX.len())
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(PRIVATE_HEADER_PREFIX))
}

/// The upgrade hint is on when the header is present and not overridden:
/// only a header whose every value is `0` or `false` switches it off.
pub(crate) fn tls_upgrade_hint(headers: &Headers) -> bool {
    let mut values = headers.all(TLS_UPGRADE_HEADER).peekable();
    if values.peek().is_none() {
        return false;
    }
    !values.all(|value| value == "0" || value.eq_ignore_ascii_case("false"))
}

/// The URL recorded in the access log, with the scheme reflecting the TLS
/// hint rather than what the caller literally sent.
fn effective_url(head: &RequestHead, tunnel_target: Option<&ConnectTarget>) -> String {
    match tunnel_target {
        Some(target) => {
            if target.port == 443 {
                format!("https://{}{}", target.host, head.target)
            } else {
                format!("https://{}:{}{}", target.host, target.port, head.target)
            }
        }
        None => {
            if tls_upgrade_hint(&head.headers) {
                head.target.replacen("http", "https", 1)
            } else {
                head.target.clone()
            }
        }
    }
}

pub(crate) fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        405 => "Method Not Allowed",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        _ => "Error",
    }
}

/// Error response with the distinguishing reason headers. Only reachable
/// before anything of a real response has been written.
pub(crate) async fn write_error_response<W>(sink: &mut W, error: &ProxyError) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = format!("{}\n", error.message);
    let head = format!(
        "HTTP/1.1 {} {}\r\n{REASON_CODE_HEADER}: {}\r\n{REASON_HEADER}: {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        error.status,
        status_text(error.status),
        error.code.wire(),
        error.message,
        body.len(),
    );
    sink.write_all(head.as_bytes()).await?;
    sink.write_all(body.as_bytes()).await?;
    sink.flush().await
}

/// Plain error response for protocol-level failures that never reach the
/// mediation path (unparseable heads, oversized heads, CONNECT without an
/// issuer).
pub(crate) async fn write_simple_response<W>(
    sink: &mut W,
    status: u16,
    reason: &str,
    body: &str,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len(),
    );
    sink.write_all(response.as_bytes()).await?;
    sink.flush().await
}

#[cfg(test)]
mod tests {
    use crate::http1::Headers;

    use super::{filter_outbound_headers, tls_upgrade_hint};

    fn headers(entries: &[(&str, &str)]) -> Headers {
        let mut headers = Headers::default();
        for (name, value) in entries {
            headers.push(*name, *value);
        }
        headers
    }

    #[test]
    fn hint_absent_means_off() {
        assert!(!tls_upgrade_hint(&headers(&[("Host", "api.example.com")])));
    }

    #[test]
    fn hint_present_means_on() {
        assert!(tls_upgrade_hint(&headers(&[("X-Whsentry-Tls", "1")])));
        assert!(tls_upgrade_hint(&headers(&[("x-whsentry-tls", "true")])));
        assert!(tls_upgrade_hint(&headers(&[("X-Whsentry-Tls", "anything")])));
    }

    #[test]
    fn hint_off_only_when_every_value_disables_it() {
        assert!(!tls_upgrade_hint(&headers(&[("X-Whsentry-Tls", "0")])));
        assert!(!tls_upgrade_hint(&headers(&[("X-Whsentry-Tls", "FALSE")])));
        assert!(!tls_upgrade_hint(&headers(&[
            ("X-Whsentry-Tls", "0"),
            ("X-Whsentry-Tls", "false"),
        ])));
        assert!(tls_upgrade_hint(&headers(&[
            ("X-Whsentry-Tls", "0"),
            ("X-Whsentry-Tls", "1"),
        ])));
    }

    #[test]
    fn private_and_hop_by_hop_headers_are_stripped() {
        let filtered = filter_outbound_headers(&headers(&[
            ("Host", "api.example.com"),
            ("Connection", "keep-alive"),
            ("Proxy-Connection", "keep-alive"),
            ("User-Agent", "curl/8.0"),
            ("X-Whsentry-Tls", "1"),
            ("X-Whsentry-Clientcert", "default"),
            ("X-Whsentry-Anything", "x"),
            ("Accept", "application/json"),
            ("Content-Length", "11"),
        ]));

        let names: Vec<&str> = filtered.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["Accept", "Content-Length", "User-Agent"]);
        assert_eq!(
            filtered.first("user-agent"),
            Some("Webhook Sentry/0.1")
        );
    }
}
