//! SOCKS5 wire codec (RFC 1928, RFC 1929).
//!
//! Decoders are incremental: given a growing buffer they return the parsed
//! value plus the number of bytes consumed, or `None` when more bytes are
//! needed. Callers keep accumulating and retry.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::address::Address;
use crate::error::{ProxyError, Result};

pub const SOCKS_VERSION: u8 = 0x05;
pub const AUTH_VERSION: u8 = 0x01;

// Authentication methods
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_USER_PASS: u8 = 0x02;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

// Commands
pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_BIND: u8 = 0x02;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

// Address types
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

// Reply codes
pub const REP_SUCCEEDED: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
pub const REP_NOT_ALLOWED: u8 = 0x02;
pub const REP_NETWORK_UNREACHABLE: u8 = 0x03;
pub const REP_HOST_UNREACHABLE: u8 = 0x04;
pub const REP_CONNECTION_REFUSED: u8 = 0x05;
pub const REP_TTL_EXPIRED: u8 = 0x06;
pub const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// Human-readable text for an RFC 1928 reply code.
pub fn reply_reason(rep: u8) -> &'static str {
    match rep {
        REP_SUCCEEDED => "succeeded",
        REP_GENERAL_FAILURE => "general SOCKS server failure",
        REP_NOT_ALLOWED => "connection not allowed by ruleset",
        REP_NETWORK_UNREACHABLE => "network unreachable",
        REP_HOST_UNREACHABLE => "host unreachable",
        REP_CONNECTION_REFUSED => "connection refused",
        REP_TTL_EXPIRED => "TTL expired",
        REP_COMMAND_NOT_SUPPORTED => "command not supported",
        REP_ADDRESS_TYPE_NOT_SUPPORTED => "address type not supported",
        _ => "undefined",
    }
}

/// Append a big-endian port.
fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_be_bytes());
}

/// Encode an address in RFC 1928 form: ATYP + ADDR + PORT.
pub fn encode_address(addr: &Address, buf: &mut Vec<u8>) -> Result<()> {
    match addr {
        Address::Ip(SocketAddr::V4(sa)) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&sa.ip().octets());
            put_u16(buf, sa.port());
        }
        Address::Ip(SocketAddr::V6(sa)) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&sa.ip().octets());
            put_u16(buf, sa.port());
        }
        Address::Domain(host, port) => {
            let host = host.as_bytes();
            if host.len() > 255 {
                return Err(ProxyError::InvalidAddress(format!(
                    "domain too long for SOCKS5: {} bytes (max 255)",
                    host.len()
                )));
            }
            buf.push(ATYP_DOMAIN);
            buf.push(host.len() as u8);
            buf.extend_from_slice(host);
            put_u16(buf, *port);
        }
    }
    Ok(())
}

/// Decode an RFC 1928 address starting at `buf[0]` (the ATYP byte).
///
/// Returns the address and the bytes consumed, or `None` when the buffer
/// does not yet hold a complete address.
pub fn decode_address(buf: &[u8]) -> Result<Option<(Address, usize)>> {
    let Some(&atyp) = buf.first() else {
        return Ok(None);
    };
    match atyp {
        ATYP_IPV4 => {
            if buf.len() < 1 + 4 + 2 {
                return Ok(None);
            }
            let ip = Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4]);
            let port = u16::from_be_bytes([buf[5], buf[6]]);
            Ok(Some((
                Address::Ip(SocketAddr::new(IpAddr::V4(ip), port)),
                7,
            )))
        }
        ATYP_IPV6 => {
            if buf.len() < 1 + 16 + 2 {
                return Ok(None);
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[1..17]);
            let port = u16::from_be_bytes([buf[17], buf[18]]);
            Ok(Some((
                Address::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)),
                19,
            )))
        }
        ATYP_DOMAIN => {
            if buf.len() < 2 {
                return Ok(None);
            }
            let len = buf[1] as usize;
            if buf.len() < 2 + len + 2 {
                return Ok(None);
            }
            let host = String::from_utf8_lossy(&buf[2..2 + len]).into_owned();
            let port = u16::from_be_bytes([buf[2 + len], buf[3 + len]]);
            Ok(Some((Address::Domain(host, port), 2 + len + 2)))
        }
        other => Err(ProxyError::InvalidAddressType(other)),
    }
}

/// Version/method-selection greeting sent by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    pub methods: Vec<u8>,
}

impl Greeting {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(SOCKS_VERSION);
        buf.push(self.methods.len() as u8);
        buf.extend_from_slice(&self.methods);
    }

    pub fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        if buf.len() < 2 {
            return Ok(None);
        }
        if buf[0] != SOCKS_VERSION {
            return Err(ProxyError::InvalidProtocolVersion(buf[0]));
        }
        let n = buf[1] as usize;
        if buf.len() < 2 + n {
            return Ok(None);
        }
        Ok(Some((
            Greeting {
                methods: buf[2..2 + n].to_vec(),
            },
            2 + n,
        )))
    }

    pub fn offers(&self, method: u8) -> bool {
        self.methods.contains(&method)
    }
}

/// The server's method selection reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodSelection {
    pub method: u8,
}

impl MethodSelection {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(SOCKS_VERSION);
        buf.push(self.method);
    }

    pub fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        if buf.len() < 2 {
            return Ok(None);
        }
        if buf[0] != SOCKS_VERSION {
            return Err(ProxyError::InvalidProtocolVersion(buf[0]));
        }
        Ok(Some((MethodSelection { method: buf[1] }, 2)))
    }
}

/// RFC 1929 username/password sub-negotiation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPass {
    pub username: String,
    pub password: String,
}

impl UserPass {
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<()> {
        if self.username.len() > 255 || self.password.len() > 255 {
            return Err(ProxyError::InvalidAddress(
                "credentials exceed 255 bytes".to_string(),
            ));
        }
        buf.push(AUTH_VERSION);
        buf.push(self.username.len() as u8);
        buf.extend_from_slice(self.username.as_bytes());
        buf.push(self.password.len() as u8);
        buf.extend_from_slice(self.password.as_bytes());
        Ok(())
    }

    pub fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        if buf.len() < 2 {
            return Ok(None);
        }
        if buf[0] != AUTH_VERSION {
            return Err(ProxyError::InvalidProtocolVersion(buf[0]));
        }
        let ulen = buf[1] as usize;
        if buf.len() < 2 + ulen + 1 {
            return Ok(None);
        }
        let plen = buf[2 + ulen] as usize;
        if buf.len() < 2 + ulen + 1 + plen {
            return Ok(None);
        }
        let username = String::from_utf8_lossy(&buf[2..2 + ulen]).into_owned();
        let password = String::from_utf8_lossy(&buf[3 + ulen..3 + ulen + plen]).into_owned();
        Ok(Some((UserPass { username, password }, 3 + ulen + plen)))
    }
}

/// RFC 1929 auth status: 0x00 success, anything else failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthStatus {
    pub status: u8,
}

impl AuthStatus {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(AUTH_VERSION);
        buf.push(self.status);
    }

    pub fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        if buf.len() < 2 {
            return Ok(None);
        }
        if buf[0] != AUTH_VERSION {
            return Err(ProxyError::InvalidProtocolVersion(buf[0]));
        }
        Ok(Some((AuthStatus { status: buf[1] }, 2)))
    }
}

/// A SOCKS5 request: VER + CMD + RSV + ATYP + DST.ADDR + DST.PORT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: u8,
    pub address: Address,
}

impl Request {
    pub fn connect(address: Address) -> Self {
        Self {
            command: CMD_CONNECT,
            address,
        }
    }

    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.push(SOCKS_VERSION);
        buf.push(self.command);
        buf.push(0x00);
        encode_address(&self.address, buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        if buf.len() < 3 {
            return Ok(None);
        }
        if buf[0] != SOCKS_VERSION {
            return Err(ProxyError::InvalidProtocolVersion(buf[0]));
        }
        if buf[2] != 0x00 {
            return Err(ProxyError::InvalidReservedByte(buf[2]));
        }
        match decode_address(&buf[3..])? {
            Some((address, n)) => Ok(Some((
                Request {
                    command: buf[1],
                    address,
                },
                3 + n,
            ))),
            None => Ok(None),
        }
    }
}

/// A SOCKS5 reply: VER + REP + RSV + ATYP + BND.ADDR + BND.PORT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u8,
    pub bound: Address,
}

impl Reply {
    pub fn succeeded(bound: Address) -> Self {
        Self {
            code: REP_SUCCEEDED,
            bound,
        }
    }

    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.push(SOCKS_VERSION);
        buf.push(self.code);
        buf.push(0x00);
        encode_address(&self.bound, buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        if buf.len() < 3 {
            return Ok(None);
        }
        if buf[0] != SOCKS_VERSION {
            return Err(ProxyError::InvalidProtocolVersion(buf[0]));
        }
        if buf[2] != 0x00 {
            return Err(ProxyError::InvalidReservedByte(buf[2]));
        }
        match decode_address(&buf[3..])? {
            Some((bound, n)) => Ok(Some((
                Reply {
                    code: buf[1],
                    bound,
                },
                3 + n,
            ))),
            None => Ok(None),
        }
    }
}
