//! Destination address model.
//!
//! Protocol boundaries deal in either a DNS name plus port or a socket
//! address; UNIX sockets are never valid here.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use ipnet::IpNet;

use crate::error::{ProxyError, Result};

/// A connection target as carried through negotiation and routing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// DNS name and port. The name is kept as sent; IDNA conversion is the
    /// caller's responsibility.
    Domain(String, u16),
    /// Literal IPv4 or IPv6 socket address.
    Ip(SocketAddr),
}

impl Address {
    /// Create an address from a host string and port, classifying IP
    /// literals as `Ip`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        match host.parse::<IpAddr>() {
            Ok(ip) => Address::Ip(SocketAddr::new(ip, port)),
            Err(_) => Address::Domain(host, port),
        }
    }

    /// Parse a `host:port` or `[v6]:port` string, with `default_port` used
    /// when no port is present.
    pub fn parse_authority(authority: &str, default_port: u16) -> Result<Self> {
        let authority = authority.trim();
        if authority.is_empty() {
            return Err(ProxyError::InvalidUrl("empty authority".to_string()));
        }

        if let Ok(sa) = authority.parse::<SocketAddr>() {
            return Ok(Address::Ip(sa));
        }

        // Bracketed IPv6 without a port
        if let Some(v6) = authority.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
            let ip: IpAddr = v6
                .parse()
                .map_err(|_| ProxyError::InvalidUrl(authority.to_string()))?;
            return Ok(Address::Ip(SocketAddr::new(ip, default_port)));
        }

        match authority.rsplit_once(':') {
            Some((host, port)) => {
                // A second colon means an unbracketed IPv6 literal
                if host.contains(':') {
                    let ip: IpAddr = authority
                        .parse()
                        .map_err(|_| ProxyError::InvalidUrl(authority.to_string()))?;
                    return Ok(Address::Ip(SocketAddr::new(ip, default_port)));
                }
                let port: u16 = port
                    .parse()
                    .map_err(|_| ProxyError::InvalidUrl(authority.to_string()))?;
                Ok(Address::new(host, port))
            }
            None => Ok(Address::new(authority, default_port)),
        }
    }

    /// Hostname for SNI, routing and certificate lookup.
    pub fn host(&self) -> String {
        match self {
            Address::Domain(host, _) => host.clone(),
            Address::Ip(sa) => sa.ip().to_string(),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Address::Domain(_, port) => *port,
            Address::Ip(sa) => sa.port(),
        }
    }

    /// The literal IP, when this address carries one.
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Address::Domain(..) => None,
            Address::Ip(sa) => Some(sa.ip()),
        }
    }

    /// Validate this address as an outbound connect target.
    pub fn ensure_connectable(&self) -> Result<()> {
        if self.port() == 0 {
            return Err(ProxyError::InvalidAddress(format!(
                "port 0 is not connectable: {}",
                self
            )));
        }
        if let Address::Domain(host, _) = self {
            if host.is_empty() {
                return Err(ProxyError::InvalidAddress("empty host".to_string()));
            }
        }
        Ok(())
    }
}

impl From<SocketAddr> for Address {
    fn from(sa: SocketAddr) -> Self {
        Address::Ip(sa)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Domain(host, port) => write!(f, "{}:{}", host, port),
            Address::Ip(sa) => sa.fmt(f),
        }
    }
}

/// An inclusive IP range built from `addr/prefix` notation.
///
/// Containment is a byte comparison within the address family; an address
/// of the other family is never contained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CidrRange {
    network: IpNet,
}

impl CidrRange {
    /// Parse `a.b.c.d/n` or IPv6 `addr/n`. The prefix must not exceed the
    /// family's bit width.
    pub fn parse(expr: &str) -> Result<Self> {
        let network: IpNet = expr
            .trim()
            .parse()
            .map_err(|_| ProxyError::InvalidRule(format!("invalid CIDR: {}", expr)))?;
        Ok(Self { network })
    }

    /// Lowest address of the range.
    pub fn lower(&self) -> IpAddr {
        self.network.network()
    }

    /// Highest address of the range.
    pub fn upper(&self) -> IpAddr {
        self.network.broadcast()
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip) {
            (IpNet::V4(_), IpAddr::V4(_)) | (IpNet::V6(_), IpAddr::V6(_)) => {
                self.network.contains(&ip)
            }
            _ => false,
        }
    }
}

impl fmt::Display for CidrRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.network.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_new_classifies_ip() {
        assert!(matches!(Address::new("192.168.1.1", 80), Address::Ip(_)));
        assert!(matches!(Address::new("::1", 443), Address::Ip(_)));
        assert!(matches!(
            Address::new("example.com", 80),
            Address::Domain(..)
        ));
    }

    #[test]
    fn test_parse_authority_with_port() {
        let addr = Address::parse_authority("example.com:8080", 80).unwrap();
        assert_eq!(addr, Address::Domain("example.com".to_string(), 8080));
    }

    #[test]
    fn test_parse_authority_default_port() {
        let addr = Address::parse_authority("example.com", 80).unwrap();
        assert_eq!(addr.port(), 80);
    }

    #[test]
    fn test_parse_authority_ipv6() {
        let addr = Address::parse_authority("[2001:db8::1]:443", 80).unwrap();
        assert_eq!(addr.port(), 443);
        assert_eq!(addr.host(), "2001:db8::1");

        let addr = Address::parse_authority("[2001:db8::1]", 80).unwrap();
        assert_eq!(addr.port(), 80);
    }

    #[test]
    fn test_parse_authority_empty() {
        assert!(Address::parse_authority("", 80).is_err());
        assert!(Address::parse_authority("   ", 80).is_err());
    }

    #[test]
    fn test_ensure_connectable_rejects_port_zero() {
        assert!(Address::new("example.com", 0).ensure_connectable().is_err());
        assert!(Address::new("example.com", 80).ensure_connectable().is_ok());
    }

    #[test]
    fn test_display() {
        assert_eq!(Address::new("example.com", 80).to_string(), "example.com:80");
        assert_eq!(Address::new("10.0.0.1", 1080).to_string(), "10.0.0.1:1080");
    }

    #[test]
    fn test_cidr_contains_bounds() {
        let cidr = CidrRange::parse("10.0.0.0/8").unwrap();
        assert_eq!(cidr.lower(), "10.0.0.0".parse::<IpAddr>().unwrap());
        assert_eq!(cidr.upper(), "10.255.255.255".parse::<IpAddr>().unwrap());
        assert!(cidr.contains("10.0.0.0".parse().unwrap()));
        assert!(cidr.contains("10.255.255.255".parse().unwrap()));
        assert!(!cidr.contains("11.0.0.0".parse().unwrap()));
        assert!(!cidr.contains("9.255.255.255".parse().unwrap()));
    }

    #[test]
    fn test_cidr_lexicographic_equivalence() {
        // contains(x) must equal lower <= x <= upper within the family
        let cidr = CidrRange::parse("172.16.0.0/12").unwrap();
        for ip_str in ["172.15.255.255", "172.16.0.0", "172.24.1.1", "172.31.255.255", "172.32.0.0"] {
            let ip: IpAddr = ip_str.parse().unwrap();
            let in_bounds = cidr.lower() <= ip && ip <= cidr.upper();
            assert_eq!(cidr.contains(ip), in_bounds, "mismatch for {}", ip_str);
        }
    }

    #[test]
    fn test_cidr_family_mismatch() {
        let v4 = CidrRange::parse("0.0.0.0/0").unwrap();
        assert!(!v4.contains("2001:db8::1".parse().unwrap()));

        let v6 = CidrRange::parse("::/0").unwrap();
        assert!(!v6.contains("1.2.3.4".parse().unwrap()));
    }

    #[test]
    fn test_cidr_v6() {
        let cidr = CidrRange::parse("2001:db8::/32").unwrap();
        assert!(cidr.contains("2001:db8::1".parse().unwrap()));
        assert!(!cidr.contains("2001:db9::1".parse().unwrap()));
    }

    #[test]
    fn test_cidr_invalid() {
        assert!(CidrRange::parse("10.0.0.0/33").is_err());
        assert!(CidrRange::parse("not-a-cidr").is_err());
    }
}
