use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::denylist::{CidrDenyList, PrefixParseError};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error(transparent)]
    DenyList(#[from] PrefixParseError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerProtocol {
    Http,
    Https,
}

/// One exposed port. Immutable after startup.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    pub address: String,
    #[serde(default = "default_listener_protocol")]
    pub protocol: ListenerProtocol,
    #[serde(default)]
    pub cert_file: Option<PathBuf>,
    #[serde(default)]
    pub key_file: Option<PathBuf>,
}

fn default_listener_protocol() -> ListenerProtocol {
    ListenerProtocol::Http
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Log sink description; absent file means stdout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub format: LogFormat,
}

/// Certificate + private key file pair.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CertKeyPaths {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

/// Whole proxy configuration. Immutable after startup; shared by reference
/// across listeners.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ProxyConfig {
    pub listeners: Vec<ListenerConfig>,
    pub connect_timeout_ms: u64,
    pub connection_lifetime_ms: u64,
    pub idle_read_timeout_ms: u64,
    pub max_response_body_bytes: u32,
    pub cidr_deny_list: Vec<String>,
    pub insecure_skip_cidr_deny_list: bool,
    pub insecure_skip_cert_verification: bool,
    pub root_ca_bundle_file: Option<PathBuf>,
    pub client_certs: HashMap<String, CertKeyPaths>,
    pub mitm_issuer: Option<CertKeyPaths>,
    pub access_log: LogConfig,
    pub proxy_log: LogConfig,
    pub metrics_address: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listeners: vec![ListenerConfig {
                address: "127.0.0.1:9090".to_string(),
                protocol: ListenerProtocol::Http,
                cert_file: None,
                key_file: None,
            }],
            connect_timeout_ms: 10_000,
            connection_lifetime_ms: 60_000,
            idle_read_timeout_ms: 10_000,
            max_response_body_bytes: 1_048_576,
            cidr_deny_list: default_cidr_deny_list(),
            insecure_skip_cidr_deny_list: false,
            insecure_skip_cert_verification: false,
            root_ca_bundle_file: None,
            client_certs: HashMap::new(),
            mitm_issuer: None,
            access_log: LogConfig::default(),
            proxy_log: LogConfig::default(),
            metrics_address: "127.0.0.1:9091".to_string(),
        }
    }
}

fn default_cidr_deny_list() -> Vec<String> {
    [
        "127.0.0.0/8",
        "10.0.0.0/8",
        "172.16.0.0/12",
        "192.168.0.0/16",
        "169.254.0.0/16",
    ]
    .iter()
    .map(|entry| (*entry).to_string())
    .collect()
}

impl ProxyConfig {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn connection_lifetime(&self) -> Duration {
        Duration::from_millis(self.connection_lifetime_ms)
    }

    pub fn idle_read_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_read_timeout_ms)
    }

    /// The parsed deny-list, empty when enforcement is switched off.
    pub fn deny_list(&self) -> Result<CidrDenyList, ConfigError> {
        if self.insecure_skip_cidr_deny_list {
            return Ok(CidrDenyList::default());
        }
        Ok(CidrDenyList::parse(&self.cidr_deny_list)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listeners.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one listener must be configured".to_string(),
            ));
        }
        for listener in &self.listeners {
            match listener.protocol {
                ListenerProtocol::Http => {}
                ListenerProtocol::Https => {
                    if listener.cert_file.is_none() || listener.key_file.is_none() {
                        return Err(ConfigError::Invalid(format!(
                            "https listener {} requires both cert_file and key_file",
                            listener.address
                        )));
                    }
                }
            }
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "connect_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.connection_lifetime_ms == 0 {
            return Err(ConfigError::Invalid(
                "connection_lifetime_ms must be greater than zero".to_string(),
            ));
        }
        if self.idle_read_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "idle_read_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_response_body_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_response_body_bytes must be greater than zero".to_string(),
            ));
        }
        for entry in &self.cidr_deny_list {
            entry.parse::<crate::denylist::Ipv4Prefix>()?;
        }
        Ok(())
    }
}
