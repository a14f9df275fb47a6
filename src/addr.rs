//! Network addresses as the gateway sees them: `host:port` strings.
//!
//! Only addresses whose host is a literal IP are allowed into the node store.
//! Peer-supplied hostnames would let an attacker point us at DNS names they
//! control and rotate the records underneath us.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// A `host:port` network address. IPv6 hosts are bracketed (`[::1]:9981`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetAddress(String);

impl NetAddress {
    pub fn new(addr: impl Into<String>) -> Self {
        NetAddress(addr.into())
    }

    /// Build an address from a host and port, bracketing IPv6 hosts.
    pub fn from_parts(host: &str, port: u16) -> Self {
        if host.contains(':') {
            NetAddress(format!("[{host}]:{port}"))
        } else {
            NetAddress(format!("{host}:{port}"))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The host component, with IPv6 brackets stripped.
    pub fn host(&self) -> &str {
        let host = match self.0.rsplit_once(':') {
            Some((host, _)) => host,
            None => &self.0,
        };
        host.strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host)
    }

    /// The port component, if present and parsable.
    pub fn port(&self) -> Option<u16> {
        let (_, port) = self.0.rsplit_once(':')?;
        port.parse().ok()
    }

    /// A well-formed address has a host and a nonzero port.
    pub fn is_valid(&self) -> bool {
        !self.host().is_empty() && self.port().is_some_and(|p| p != 0)
    }

    /// The host parsed as a literal IP, if it is one.
    pub fn host_ip(&self) -> Option<IpAddr> {
        self.host().parse().ok()
    }

    /// Whether the host is a literal IP address rather than a DNS name.
    pub fn is_ip_literal(&self) -> bool {
        self.host_ip().is_some()
    }

    pub fn is_loopback(&self) -> bool {
        self.host_ip().is_some_and(|ip| ip.is_loopback())
    }

    /// Loopback, RFC 1918, link-local, or IPv6 unique-local hosts. Local
    /// peers get preferential treatment in the kick policy and never count
    /// toward being online.
    pub fn is_local(&self) -> bool {
        match self.host_ip() {
            Some(IpAddr::V4(ip)) => ip.is_loopback() || ip.is_private() || ip.is_link_local(),
            Some(IpAddr::V6(ip)) => {
                let seg = ip.segments();
                ip.is_loopback()
                    || (seg[0] & 0xfe00) == 0xfc00 // unique local fc00::/7
                    || (seg[0] & 0xffc0) == 0xfe80 // link local fe80::/10
            }
            None => false,
        }
    }
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_and_port() {
        let a = NetAddress::new("1.2.3.4:9981");
        assert_eq!(a.host(), "1.2.3.4");
        assert_eq!(a.port(), Some(9981));
        assert!(a.is_valid());
        assert!(a.is_ip_literal());
    }

    #[test]
    fn ipv6_brackets() {
        let a = NetAddress::from_parts("::1", 9981);
        assert_eq!(a.as_str(), "[::1]:9981");
        assert_eq!(a.host(), "::1");
        assert_eq!(a.port(), Some(9981));
        assert!(a.is_ip_literal());
        assert!(a.is_loopback());
    }

    #[test]
    fn dns_names_are_not_ip_literals() {
        let a = NetAddress::new("example.com:9981");
        assert!(a.is_valid());
        assert!(!a.is_ip_literal());
        assert!(!a.is_local());
    }

    #[test]
    fn zero_port_is_invalid() {
        assert!(!NetAddress::new("1.2.3.4:0").is_valid());
        assert!(!NetAddress::new("1.2.3.4").is_valid());
        assert!(!NetAddress::new(":9981").is_valid());
    }

    #[test]
    fn local_classification() {
        assert!(NetAddress::new("127.0.0.1:1").is_local());
        assert!(NetAddress::new("10.0.0.5:1").is_local());
        assert!(NetAddress::new("192.168.1.9:1").is_local());
        assert!(NetAddress::new("172.16.0.1:1").is_local());
        assert!(NetAddress::new("169.254.0.2:1").is_local());
        assert!(NetAddress::from_parts("fe80::1", 1).is_local());
        assert!(NetAddress::from_parts("fd00::1", 1).is_local());
        assert!(!NetAddress::new("8.8.8.8:1").is_local());
        assert!(!NetAddress::from_parts("2001:db8::1", 1).is_local());
    }
}
