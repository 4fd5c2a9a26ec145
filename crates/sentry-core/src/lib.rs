mod config;
mod denylist;
mod error;

pub use config::{
    CertKeyPaths, ConfigError, ListenerConfig, ListenerProtocol, LogConfig, LogFormat, ProxyConfig,
};
pub use denylist::{CidrDenyList, Ipv4Prefix, PrefixParseError};
pub use error::{map_io_error, ProxyError, ReasonCode};

/// Caller header that requests an outbound TLS upgrade.
pub const TLS_UPGRADE_HEADER: &str = "X-Whsentry-Tls";
/// Caller header that selects a client certificate from the configured store.
pub const CLIENT_CERT_HEADER: &str = "X-Whsentry-Clientcert";
/// Prefix shared by every private caller header; all of them are stripped
/// before forwarding.
pub const PRIVATE_HEADER_PREFIX: &str = "X-Whsentry";

/// Reason-code header on error responses.
pub const REASON_CODE_HEADER: &str = "X-WhSentry-ReasonCode";
/// Human-readable reason header on error responses.
pub const REASON_HEADER: &str = "X-WhSentry-Reason";

/// Outbound User-Agent; always overrides whatever the caller sent.
pub const PRODUCT_USER_AGENT: &str = "Webhook Sentry/0.1";
