//! Time-windowed set of client addresses that already authenticated.

use dashmap::DashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Shared between all connection threads.
#[derive(Debug)]
pub struct TimeoutSet {
    entries: DashMap<IpAddr, Instant>,
    timeout: Duration,
}

impl TimeoutSet {
    pub fn new(timeout: Duration) -> Self {
        TimeoutSet {
            entries: DashMap::new(),
            timeout,
        }
    }

    /// True if `ip` was added less than `timeout` ago. Expired entries are
    /// dropped on lookup.
    pub fn has(&self, ip: IpAddr) -> bool {
        let ip = normalize_ip(ip);
        let expired = match self.entries.get(&ip) {
            Some(added) => added.elapsed() > self.timeout,
            None => return false,
        };
        if expired {
            self.entries
                .remove_if(&ip, |_, added| added.elapsed() > self.timeout);
            return false;
        }
        true
    }

    pub fn add(&self, ip: IpAddr) {
        self.entries.insert(normalize_ip(ip), Instant::now());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// A dual-stack listener reports IPv4 peers as `::ffff:a.b.c.d`.
pub fn normalize_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        IpAddr::V4(_) => ip,
    }
}
