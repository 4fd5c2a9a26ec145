use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// A single IPv4 network prefix in `a.b.c.d/len` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Prefix {
    network: u32,
    prefix_len: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixParseError {
    input: String,
    reason: &'static str,
}

impl fmt::Display for PrefixParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid CIDR prefix {:?}: {}", self.input, self.reason)
    }
}

impl std::error::Error for PrefixParseError {}

impl Ipv4Prefix {
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Result<Self, PrefixParseError> {
        if prefix_len > 32 {
            return Err(PrefixParseError {
                input: format!("{address}/{prefix_len}"),
                reason: "prefix length exceeds 32",
            });
        }
        Ok(Self {
            network: u32::from(address) & mask(prefix_len),
            prefix_len,
        })
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & mask(self.prefix_len) == self.network
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }
}

impl FromStr for Ipv4Prefix {
    type Err = PrefixParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let (address_text, len_text) = input.split_once('/').ok_or(PrefixParseError {
            input: input.to_string(),
            reason: "missing '/' separator",
        })?;
        let address = address_text.parse::<Ipv4Addr>().map_err(|_| PrefixParseError {
            input: input.to_string(),
            reason: "network part is not an IPv4 address",
        })?;
        let prefix_len = len_text.parse::<u8>().map_err(|_| PrefixParseError {
            input: input.to_string(),
            reason: "prefix length is not a number",
        })?;
        Self::new(address, prefix_len)
    }
}

impl fmt::Display for Ipv4Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", Ipv4Addr::from(self.network), self.prefix_len)
    }
}

fn mask(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix_len))
    }
}

/// The set of network prefixes the proxy refuses to connect to. Read-only
/// after startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CidrDenyList {
    prefixes: Vec<Ipv4Prefix>,
}

impl CidrDenyList {
    pub fn new(prefixes: Vec<Ipv4Prefix>) -> Self {
        Self { prefixes }
    }

    pub fn parse(entries: &[String]) -> Result<Self, PrefixParseError> {
        let prefixes = entries
            .iter()
            .map(|entry| entry.parse::<Ipv4Prefix>())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { prefixes })
    }

    /// An empty deny-list blocks nothing.
    pub fn is_blocked(&self, ip: Ipv4Addr) -> bool {
        self.prefixes.iter().any(|prefix| prefix.contains(ip))
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.prefixes.len()
    }
}
