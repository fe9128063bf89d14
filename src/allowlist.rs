//! IPv4 allowlist: clients matching any `ip[/prefixlen]` entry skip
//! credential checks entirely.

use crate::error::ConfigError;
use std::net::{IpAddr, Ipv4Addr};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct NetAddr {
    /// Already masked.
    base: u32,
    mask: u32,
}

impl NetAddr {
    fn new(ip: Ipv4Addr, prefix_len: u8) -> Self {
        let mask = prefix_mask(prefix_len);
        NetAddr {
            base: u32::from(ip) & mask,
            mask,
        }
    }

    fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & self.mask == self.base
    }
}

fn prefix_mask(prefix_len: u8) -> u32 {
    match prefix_len {
        0 => 0,
        n => u32::MAX << (32 - u32::from(n.min(32))),
    }
}

#[derive(Debug, Default)]
pub struct Allowlist {
    rules: Vec<NetAddr>,
}

impl Allowlist {
    /// Parse a comma-separated list of `ip` or `ip/prefixlen` entries.
    /// An empty spec yields an empty allowlist.
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        if spec.is_empty() {
            return Ok(Self::default());
        }
        let rules = spec
            .split(',')
            .map(|entry| parse_entry(entry.trim()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Allowlist { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Sequential scan over the configured rules.
    pub fn matches(&self, client_ip: IpAddr) -> bool {
        let ip = match client_ip {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => v4,
                None => return false,
            },
        };
        let allowed = self.rules.iter().any(|rule| rule.contains(ip));
        if allowed {
            debug!(client = %client_ip, "client ip allowed");
        }
        allowed
    }
}

fn parse_entry(entry: &str) -> Result<NetAddr, ConfigError> {
    let parts: Vec<&str> = entry.split('/').collect();
    if parts.len() > 2 {
        return Err(ConfigError::MalformedAllowlist(format!(
            "{entry}: client should be the form ip/nbitmask"
        )));
    }

    let ip: Ipv4Addr = parts[0]
        .parse()
        .map_err(|_| ConfigError::MalformedAllowlist(format!("{entry}: ip address not valid")))?;

    let prefix_len = match parts.get(1) {
        Some(bits) => {
            let n: u8 = bits
                .parse()
                .map_err(|e| ConfigError::MalformedAllowlist(format!("{entry}: {e}")))?;
            if n > 32 {
                return Err(ConfigError::MalformedAllowlist(format!(
                    "{entry}: mask number should <= 32"
                )));
            }
            n
        }
        None => 32,
    };

    Ok(NetAddr::new(ip, prefix_len))
}
