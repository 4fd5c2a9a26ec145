use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use sentry_core::{map_io_error, ProxyError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::{IO_CHUNK_SIZE, MAX_RESPONSE_HEAD_BYTES};

const CHUNK_SIZE_LINE_LIMIT: usize = 1024;
const TRAILER_LINE_LIMIT: usize = 8 * 1024;

/// A stream plus whatever was read past the last message boundary.
pub(crate) struct WireStream<S> {
    pub stream: S,
    pub pending: Vec<u8>,
}

impl<S> WireStream<S> {
    pub(crate) fn wrap(stream: S) -> Self {
        Self {
            stream,
            pending: Vec::new(),
        }
    }
}

/// Ordered header collection. Names compare case-insensitively; duplicate
/// names keep their relative order so multi-valued headers survive a round
/// trip untouched.
#[derive(Debug, Clone, Default)]
pub(crate) struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub(crate) fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub(crate) fn first<'s>(&'s self, name: &'s str) -> Option<&'s str> {
        self.all(name).next()
    }

    pub(crate) fn all<'s>(&'s self, name: &'s str) -> impl Iterator<Item = &'s str> + 's {
        self.entries
            .iter()
            .filter(move |(entry_name, _)| entry_name.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// True when any value of `name` carries `token` in its comma list.
    pub(crate) fn has_token(&self, name: &str, token: &str) -> bool {
        self.all(name)
            .flat_map(|value| value.split(','))
            .any(|candidate| candidate.trim().eq_ignore_ascii_case(token))
    }

    /// Declared Content-Length, when any. Repeated declarations are legal
    /// in the wild; the last one wins, but none of them may be garbage.
    pub(crate) fn declared_content_length(&self) -> Result<Option<u64>, &'static str> {
        let mut declared = None;
        for value in self.all("Content-Length") {
            declared = Some(
                value
                    .parse::<u64>()
                    .map_err(|_| "Content-Length is not a number")?,
            );
        }
        Ok(declared)
    }

    fn parse_block(block: &str) -> Result<Self, &'static str> {
        let mut headers = Self::default();
        for line in block.split("\r\n") {
            if line.is_empty() {
                break;
            }
            let colon = line.find(':').ok_or("header line without a colon")?;
            let (name, rest) = line.split_at(colon);
            headers.push(name.trim(), rest[1..].trim());
        }
        Ok(headers)
    }
}

/// How a message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyFraming {
    Empty,
    Sized(u64),
    Chunked,
    UntilClose,
}

impl BodyFraming {
    fn for_request(headers: &Headers) -> Result<Self, &'static str> {
        if headers.has_token("Transfer-Encoding", "chunked") {
            return Ok(Self::Chunked);
        }
        match headers.declared_content_length()? {
            Some(0) | None => Ok(Self::Empty),
            Some(length) => Ok(Self::Sized(length)),
        }
    }

    fn for_response(
        request_method: &str,
        status: u16,
        headers: &Headers,
    ) -> Result<Self, &'static str> {
        let never_has_body = request_method.eq_ignore_ascii_case("HEAD")
            || status / 100 == 1
            || status == 204
            || status == 304;
        if never_has_body {
            return Ok(Self::Empty);
        }
        if headers.has_token("Transfer-Encoding", "chunked") {
            return Ok(Self::Chunked);
        }
        match headers.declared_content_length()? {
            Some(0) => Ok(Self::Empty),
            Some(length) => Ok(Self::Sized(length)),
            None => Ok(Self::UntilClose),
        }
    }
}

fn wants_close(http10: bool, headers: &Headers) -> bool {
    headers.has_token("Connection", "close")
        || (http10 && !headers.has_token("Connection", "keep-alive"))
}

#[derive(Debug, Clone)]
pub(crate) struct RequestHead {
    pub method: String,
    pub target: String,
    pub headers: Headers,
    pub framing: BodyFraming,
    pub close_after: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct ResponseHead {
    pub raw: Vec<u8>,
    pub status: u16,
    pub headers: Headers,
    pub framing: BodyFraming,
    pub close_after: bool,
}

pub(crate) fn parse_request_head(raw: &[u8]) -> Result<RequestHead, &'static str> {
    let (start_line, block) = split_start_line(raw)?;

    let mut fields = start_line.split(' ').filter(|field| !field.is_empty());
    let method = fields.next().ok_or("empty request line")?;
    let target = fields.next().ok_or("request line without a target")?;
    let http10 = match fields.next() {
        Some("HTTP/1.1") => false,
        Some("HTTP/1.0") => true,
        Some(_) => return Err("unsupported HTTP version"),
        None => return Err("request line without a version"),
    };
    if fields.next().is_some() {
        return Err("request line has trailing fields");
    }

    let headers = Headers::parse_block(block)?;
    let framing = BodyFraming::for_request(&headers)?;
    let close_after = wants_close(http10, &headers);

    Ok(RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        headers,
        framing,
        close_after,
    })
}

pub(crate) fn parse_response_head(
    raw: &[u8],
    request_method: &str,
) -> Result<ResponseHead, &'static str> {
    let (start_line, block) = split_start_line(raw)?;

    let mut fields = start_line.splitn(3, ' ');
    let version = fields.next().ok_or("empty status line")?;
    let http10 = match version {
        "HTTP/1.1" => false,
        "HTTP/1.0" => true,
        _ => return Err("unsupported HTTP version in status line"),
    };
    let status = fields
        .next()
        .and_then(|field| field.parse::<u16>().ok())
        .filter(|status| (100..1000).contains(status))
        .ok_or("status line without a numeric status")?;

    let headers = Headers::parse_block(block)?;
    let framing = BodyFraming::for_response(request_method, status, &headers)?;
    let close_after = framing == BodyFraming::UntilClose || wants_close(http10, &headers);

    Ok(ResponseHead {
        raw: raw.to_vec(),
        status,
        headers,
        framing,
        close_after,
    })
}

fn split_start_line(raw: &[u8]) -> Result<(&str, &str), &'static str> {
    let text = std::str::from_utf8(raw).map_err(|_| "head is not valid UTF-8")?;
    text.split_once("\r\n").ok_or("head without a start line")
}

/// Why an inbound head could not be produced.
#[derive(Debug)]
pub(crate) enum HeadReadError {
    TooLarge,
    Malformed(&'static str),
    Io(io::Error),
}

/// Reads and parses the next request head. `Ok(None)` is a clean close
/// between messages.
pub(crate) async fn read_request_head<S>(
    conn: &mut WireStream<S>,
    limit: usize,
) -> Result<Option<RequestHead>, HeadReadError>
where
    S: AsyncRead + Unpin,
{
    match collect_head_bytes(conn, limit).await? {
        Some(raw) => parse_request_head(&raw)
            .map(Some)
            .map_err(HeadReadError::Malformed),
        None => Ok(None),
    }
}

/// Reads and parses the origin's response head, classifying failures into
/// the reason-code taxonomy at the point they surface.
pub(crate) async fn read_response_head<S>(
    conn: &mut WireStream<S>,
    request_method: &str,
) -> Result<ResponseHead, ProxyError>
where
    S: AsyncRead + Unpin,
{
    match collect_head_bytes(conn, MAX_RESPONSE_HEAD_BYTES).await {
        Ok(Some(raw)) => {
            parse_response_head(&raw, request_method).map_err(malformed_response)
        }
        Ok(None) => Err(malformed_response("target closed without responding")),
        Err(HeadReadError::TooLarge) => Err(malformed_response("response head too large")),
        Err(HeadReadError::Malformed(reason)) => Err(malformed_response(reason)),
        Err(HeadReadError::Io(error)) => Err(map_io_error(error)),
    }
}

fn malformed_response(reason: &'static str) -> ProxyError {
    ProxyError::internal(io::Error::new(io::ErrorKind::InvalidData, reason))
}

async fn collect_head_bytes<S>(
    conn: &mut WireStream<S>,
    limit: usize,
) -> Result<Option<Vec<u8>>, HeadReadError>
where
    S: AsyncRead + Unpin,
{
    // Restart the boundary scan a few bytes before the unscanned tail so
    // a boundary split across reads is still found.
    let mut scanned = 0_usize;
    loop {
        if let Some(end) = head_boundary(&conn.pending, scanned) {
            return Ok(Some(conn.pending.drain(..end).collect()));
        }
        scanned = conn.pending.len().saturating_sub(3);

        if conn.pending.len() > limit {
            return Err(HeadReadError::TooLarge);
        }
        let mut scratch = [0_u8; IO_CHUNK_SIZE];
        let got = conn
            .stream
            .read(&mut scratch)
            .await
            .map_err(HeadReadError::Io)?;
        if got == 0 {
            if conn.pending.is_empty() {
                return Ok(None);
            }
            return Err(HeadReadError::Malformed("peer closed mid-head"));
        }
        conn.pending.extend_from_slice(&scratch[..got]);
    }
}

fn head_boundary(buf: &[u8], from: usize) -> Option<usize> {
    let mut at = from;
    while at + 4 <= buf.len() {
        if &buf[at..at + 4] == b"\r\n\r\n" {
            return Some(at + 4);
        }
        at += 1;
    }
    None
}

/// Limits applied while a body crosses the proxy. The response leg caps
/// payload bytes and watches both timers; the request leg runs unbounded
/// here because the whole round trip already sits under the exchange
/// deadline.
pub(crate) struct RelayBounds {
    pub max_payload: Option<u64>,
    pub idle_read: Option<Duration>,
    pub deadline: Option<tokio::time::Instant>,
}

impl RelayBounds {
    pub(crate) fn unbounded() -> Self {
        Self {
            max_payload: None,
            idle_read: None,
            deadline: None,
        }
    }
}

/// How a relay finished when no I/O fault occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RelayOutcome {
    /// Whole body crossed; payload byte count attached.
    Done(u64),
    /// The payload cap was hit; the overrunning read was not forwarded.
    OverCap,
    IdleExpired,
    DeadlineExpired,
}

#[derive(Debug)]
pub(crate) enum RelayError {
    Source(io::Error),
    Sink(io::Error),
    Framing(&'static str),
}

/// Copies one message body from `source` to `sink` under `bounds`. Chunked
/// framing is passed through as-is; the payload counter covers chunk data
/// only, never framing bytes.
pub(crate) async fn relay_body<RS, WS>(
    source: &mut WireStream<RS>,
    sink: &mut WS,
    framing: BodyFraming,
    bounds: &RelayBounds,
) -> Result<RelayOutcome, RelayError>
where
    RS: AsyncRead + Unpin,
    WS: AsyncWrite + Unpin,
{
    let mut relay = Relay {
        source,
        sink,
        bounds,
        payload: 0,
    };
    match framing {
        BodyFraming::Empty => Ok(RelayOutcome::Done(0)),
        BodyFraming::Sized(length) => relay.run_sized(length).await,
        BodyFraming::Chunked => relay.run_chunked().await,
        BodyFraming::UntilClose => relay.run_until_close().await,
    }
}

enum Pulled {
    Bytes(usize),
    Eof,
    IdleExpired,
    DeadlineExpired,
}

struct Relay<'r, RS, WS> {
    source: &'r mut WireStream<RS>,
    sink: &'r mut WS,
    bounds: &'r RelayBounds,
    payload: u64,
}

impl<RS, WS> Relay<'_, RS, WS>
where
    RS: AsyncRead + Unpin,
    WS: AsyncWrite + Unpin,
{
    async fn run_sized(&mut self, length: u64) -> Result<RelayOutcome, RelayError> {
        let mut scratch = [0_u8; IO_CHUNK_SIZE];
        let mut left = length;
        while left > 0 {
            let want = std::cmp::min(left, scratch.len() as u64) as usize;
            match self.pull(&mut scratch[..want]).await? {
                Pulled::Bytes(got) => {
                    if self.over_cap_after(got) {
                        return Ok(RelayOutcome::OverCap);
                    }
                    self.forward(&scratch[..got]).await?;
                    left -= got as u64;
                }
                Pulled::Eof => return Err(RelayError::Framing("body ended early")),
                Pulled::IdleExpired => return Ok(RelayOutcome::IdleExpired),
                Pulled::DeadlineExpired => return Ok(RelayOutcome::DeadlineExpired),
            }
        }
        Ok(RelayOutcome::Done(self.payload))
    }

    async fn run_until_close(&mut self) -> Result<RelayOutcome, RelayError> {
        let mut scratch = [0_u8; IO_CHUNK_SIZE];
        loop {
            match self.pull(&mut scratch).await? {
                Pulled::Bytes(got) => {
                    if self.over_cap_after(got) {
                        return Ok(RelayOutcome::OverCap);
                    }
                    self.forward(&scratch[..got]).await?;
                }
                Pulled::Eof => return Ok(RelayOutcome::Done(self.payload)),
                Pulled::IdleExpired => return Ok(RelayOutcome::IdleExpired),
                Pulled::DeadlineExpired => return Ok(RelayOutcome::DeadlineExpired),
            }
        }
    }

    async fn run_chunked(&mut self) -> Result<RelayOutcome, RelayError> {
        loop {
            let size_line = match self.take_line(CHUNK_SIZE_LINE_LIMIT).await? {
                Taken::Line(line) => line,
                Taken::Eof => return Err(RelayError::Framing("chunk stream ended early")),
                Taken::IdleExpired => return Ok(RelayOutcome::IdleExpired),
                Taken::DeadlineExpired => return Ok(RelayOutcome::DeadlineExpired),
            };
            let size = chunk_size(&size_line)?;
            self.forward(&size_line).await?;

            if size == 0 {
                return self.drain_trailers().await;
            }

            match self.run_sized(size).await? {
                RelayOutcome::Done(_) => {}
                stopped => return Ok(stopped),
            }

            match self.take_line(4).await? {
                Taken::Line(separator) if separator == b"\r\n" => {
                    self.forward(b"\r\n").await?;
                }
                Taken::Line(_) => {
                    return Err(RelayError::Framing("chunk data not followed by CRLF"))
                }
                Taken::Eof => return Err(RelayError::Framing("chunk stream ended early")),
                Taken::IdleExpired => return Ok(RelayOutcome::IdleExpired),
                Taken::DeadlineExpired => return Ok(RelayOutcome::DeadlineExpired),
            }
        }
    }

    /// Trailer section after the terminal chunk: header lines, possibly
    /// none, then a blank line.
    async fn drain_trailers(&mut self) -> Result<RelayOutcome, RelayError> {
        loop {
            let line = match self.take_line(TRAILER_LINE_LIMIT).await? {
                Taken::Line(line) => line,
                Taken::Eof => return Err(RelayError::Framing("chunk stream ended early")),
                Taken::IdleExpired => return Ok(RelayOutcome::IdleExpired),
                Taken::DeadlineExpired => return Ok(RelayOutcome::DeadlineExpired),
            };
            self.forward(&line).await?;
            if line == b"\r\n" {
                return Ok(RelayOutcome::Done(self.payload));
            }
        }
    }

    /// Serves buffered leftovers first, then reads under the timers.
    async fn pull(&mut self, scratch: &mut [u8]) -> Result<Pulled, RelayError> {
        if !self.source.pending.is_empty() {
            let take = std::cmp::min(self.source.pending.len(), scratch.len());
            scratch[..take].copy_from_slice(&self.source.pending[..take]);
            self.source.pending.drain(..take);
            return Ok(Pulled::Bytes(take));
        }
        self.bounded_stream_read(scratch).await
    }

    async fn take_line(&mut self, limit: usize) -> Result<Taken, RelayError> {
        loop {
            if let Some(end) = crlf_end(&self.source.pending) {
                return Ok(Taken::Line(self.source.pending.drain(..end).collect()));
            }
            if self.source.pending.len() > limit {
                return Err(RelayError::Framing("chunk framing line too long"));
            }
            let mut scratch = [0_u8; 512];
            match self.bounded_stream_read(&mut scratch).await? {
                Pulled::Bytes(got) => {
                    self.source.pending.extend_from_slice(&scratch[..got]);
                }
                Pulled::Eof => return Ok(Taken::Eof),
                Pulled::IdleExpired => return Ok(Taken::IdleExpired),
                Pulled::DeadlineExpired => return Ok(Taken::DeadlineExpired),
            }
        }
    }

    async fn bounded_stream_read(&mut self, scratch: &mut [u8]) -> Result<Pulled, RelayError> {
        let deadline_left = self
            .bounds
            .deadline
            .map(|at| at.saturating_duration_since(tokio::time::Instant::now()));
        if deadline_left.is_some_and(|left| left.is_zero()) {
            return Ok(Pulled::DeadlineExpired);
        }

        let idle_fires_first = match (self.bounds.idle_read, deadline_left) {
            (Some(idle), Some(left)) => idle <= left,
            (Some(_), None) => true,
            (None, _) => false,
        };
        let window = match (self.bounds.idle_read, deadline_left) {
            (Some(idle), Some(left)) => Some(std::cmp::min(idle, left)),
            (Some(idle), None) => Some(idle),
            (None, Some(left)) => Some(left),
            (None, None) => None,
        };

        let result = match window {
            Some(window) => {
                match tokio::time::timeout(window, self.source.stream.read(scratch)).await {
                    Ok(result) => result,
                    Err(_) if idle_fires_first => return Ok(Pulled::IdleExpired),
                    Err(_) => return Ok(Pulled::DeadlineExpired),
                }
            }
            None => self.source.stream.read(scratch).await,
        };
        match result {
            Err(error) => Err(RelayError::Source(error)),
            Ok(0) => Ok(Pulled::Eof),
            Ok(got) => Ok(Pulled::Bytes(got)),
        }
    }

    async fn forward(&mut self, bytes: &[u8]) -> Result<(), RelayError> {
        self.sink.write_all(bytes).await.map_err(RelayError::Sink)
    }

    /// Records payload bytes; true once the cap is exceeded. Checked
    /// before the write so the overrunning read never reaches the sink.
    fn over_cap_after(&mut self, got: usize) -> bool {
        self.payload += got as u64;
        self.bounds
            .max_payload
            .is_some_and(|cap| self.payload > cap)
    }
}

enum Taken {
    Line(Vec<u8>),
    Eof,
    IdleExpired,
    DeadlineExpired,
}

fn crlf_end(buf: &[u8]) -> Option<usize> {
    let mut at = 0_usize;
    while at + 2 <= buf.len() {
        if buf[at] == b'\r' && buf[at + 1] == b'\n' {
            return Some(at + 2);
        }
        at += 1;
    }
    None
}

fn chunk_size(line: &[u8]) -> Result<u64, RelayError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| RelayError::Framing("chunk size line is not ASCII"))?;
    let digits = text
        .trim_end_matches(['\r', '\n'])
        .split(';')
        .next()
        .unwrap_or_default()
        .trim();
    u64::from_str_radix(digits, 16).map_err(|_| RelayError::Framing("chunk size is not hex"))
}

/// Replays bytes already read from a hijacked connection before falling
/// through to the underlying stream. Writes pass straight through.
pub(crate) struct PrebufferedStream<S> {
    buffer: Vec<u8>,
    pos: usize,
    inner: S,
}

impl<S> PrebufferedStream<S> {
    pub(crate) fn new(buffer: Vec<u8>, inner: S) -> Self {
        Self {
            buffer,
            pos: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrebufferedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pos < self.buffer.len() {
            let this = &mut *self;
            let take = std::cmp::min(this.buffer.len() - this.pos, out.remaining());
            out.put_slice(&this.buffer[this.pos..this.pos + take]);
            this.pos += take;
            if this.pos == this.buffer.len() {
                this.buffer.clear();
                this.pos = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, out)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrebufferedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
