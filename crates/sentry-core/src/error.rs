use std::io;

use thiserror::Error;

/// Closed taxonomy of failure classes surfaced to callers through the
/// `X-WhSentry-ReasonCode` header. New conditions must map onto one of
/// these codes; the wire values are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReasonCode {
    BlockedIpAddress,
    UnableToResolveIp,
    InvalidRequestUri,
    InvalidUrlScheme,
    RequestTimedOut,
    TlsHandshakeError,
    TcpConnectionError,
    CertificateValidationError,
    ResponseTooLarge,
    InternalServerError,
    ClientCertNotFound,
}

impl ReasonCode {
    pub const ALL: [ReasonCode; 11] = [
        Self::BlockedIpAddress,
        Self::UnableToResolveIp,
        Self::InvalidRequestUri,
        Self::InvalidUrlScheme,
        Self::RequestTimedOut,
        Self::TlsHandshakeError,
        Self::TcpConnectionError,
        Self::CertificateValidationError,
        Self::ResponseTooLarge,
        Self::InternalServerError,
        Self::ClientCertNotFound,
    ];

    pub fn wire(self) -> &'static str {
        match self {
            Self::BlockedIpAddress => "1000",
            Self::UnableToResolveIp => "1001",
            Self::InvalidRequestUri => "1002",
            Self::InvalidUrlScheme => "1003",
            Self::RequestTimedOut => "1004",
            Self::TlsHandshakeError => "1005",
            Self::TcpConnectionError => "1006",
            Self::CertificateValidationError => "1007",
            Self::ResponseTooLarge => "1008",
            Self::InternalServerError => "1009",
            Self::ClientCertNotFound => "1010",
        }
    }

    /// Status used when the error site does not override it. Code 1001
    /// is the one split case: 400 when resolution produced no IPv4
    /// address, 502 when resolution itself failed.
    pub fn default_status(self) -> u16 {
        match self {
            Self::BlockedIpAddress => 403,
            Self::UnableToResolveIp
            | Self::InvalidRequestUri
            | Self::InvalidUrlScheme
            | Self::ClientCertNotFound => 400,
            Self::RequestTimedOut
            | Self::TlsHandshakeError
            | Self::TcpConnectionError
            | Self::CertificateValidationError
            | Self::ResponseTooLarge => 502,
            Self::InternalServerError => 500,
        }
    }
}

/// Structured error value carried outward from the point of failure to the
/// handler root, which renders it as an HTTP error response. Never mutated
/// in flight.
#[derive(Debug, Error)]
#[error("{message}, status code: {status}")]
pub struct ProxyError {
    pub status: u16,
    pub code: ReasonCode,
    pub message: String,
    #[source]
    pub cause: Option<io::Error>,
}

impl ProxyError {
    pub fn new(code: ReasonCode, message: impl Into<String>) -> Self {
        Self {
            status: code.default_status(),
            code,
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn with_cause(mut self, cause: io::Error) -> Self {
        self.cause = Some(cause);
        self
    }

    pub fn blocked_ip(ip: std::net::Ipv4Addr) -> Self {
        Self::new(ReasonCode::BlockedIpAddress, format!("IP {ip} is blocked"))
    }

    pub fn no_ipv4_address(target: &str) -> Self {
        Self::new(
            ReasonCode::UnableToResolveIp,
            format!("Target {target} did not resolve to a valid IPv4 address"),
        )
    }

    pub fn dns_failure(target: &str, cause: io::Error) -> Self {
        Self::new(
            ReasonCode::UnableToResolveIp,
            format!("Failed to resolve target {target}: {cause}"),
        )
        .with_status(502)
        .with_cause(cause)
    }

    pub fn timed_out() -> Self {
        Self::new(ReasonCode::RequestTimedOut, "Request to target timed out")
    }

    pub fn invalid_uri() -> Self {
        Self::new(ReasonCode::InvalidRequestUri, "Request URI must be absolute")
    }

    pub fn invalid_scheme() -> Self {
        Self::new(ReasonCode::InvalidUrlScheme, "URL scheme must be HTTP")
    }

    pub fn response_too_large() -> Self {
        Self::new(
            ReasonCode::ResponseTooLarge,
            "Response exceeds max content length",
        )
    }

    pub fn client_cert_not_found(alias: &str) -> Self {
        Self::new(
            ReasonCode::ClientCertNotFound,
            format!("Cert with alias {alias} not found in certificate store"),
        )
    }

    pub fn internal(cause: io::Error) -> Self {
        Self::new(ReasonCode::InternalServerError, "Internal Server Error").with_cause(cause)
    }
}

/// Folds a network I/O failure from the dial/write/read path into the
/// taxonomy. DNS and TLS failures are classified closer to where they
/// surface (the dialer knows which phase it was in); everything that
/// reaches this function is a plain socket-level failure.
pub fn map_io_error(error: io::Error) -> ProxyError {
    match error.kind() {
        io::ErrorKind::TimedOut => ProxyError::timed_out().with_cause(error),
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::HostUnreachable
        | io::ErrorKind::NetworkUnreachable => ProxyError::new(
            ReasonCode::TcpConnectionError,
            format!("TCP connection error: {error}"),
        )
        .with_cause(error),
        _ => ProxyError::internal(error),
    }
}
