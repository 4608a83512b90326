//! SOCKS5 front end
//!
//! Provides:
//! - Inbound SOCKS5 negotiation (RFC 1928, CONNECT only)
//! - The target address type shared with the pipe handshake

mod socks5;

pub use socks5::handshake;

use std::net::Ipv6Addr;

use thiserror::Error;

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid SOCKS version: {0}")]
    InvalidVersion(u8),

    #[error("no acceptable authentication method")]
    NoAcceptableAuth,

    #[error("unsupported command: {0}")]
    UnsupportedCommand(u8),

    #[error("unsupported address type: {0}")]
    UnsupportedAddressType(u8),

    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

/// Address type markers used on the wire
pub(crate) const ATYP_IPV4: u8 = 0x01;
pub(crate) const ATYP_DOMAIN: u8 = 0x03;
pub(crate) const ATYP_IPV6: u8 = 0x04;

/// Proxy target address
///
/// The byte encoding is the SOCKS5 layout (address type, address, port,
/// big endian), which is also what the pipe handshake carries across the
/// tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// IPv4 address and port
    Ipv4([u8; 4], u16),
    /// IPv6 address and port
    Ipv6([u8; 16], u16),
    /// Domain name and port
    Domain(String, u16),
}

impl Address {
    /// Get the port
    pub fn port(&self) -> u16 {
        match self {
            Address::Ipv4(_, port) => *port,
            Address::Ipv6(_, port) => *port,
            Address::Domain(_, port) => *port,
        }
    }

    /// Serialize to the SOCKS5 wire layout.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Address::Ipv4(ip, port) => {
                let mut buf = Vec::with_capacity(1 + 4 + 2);
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(ip);
                buf.extend_from_slice(&port.to_be_bytes());
                buf
            }
            Address::Ipv6(ip, port) => {
                let mut buf = Vec::with_capacity(1 + 16 + 2);
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(ip);
                buf.extend_from_slice(&port.to_be_bytes());
                buf
            }
            Address::Domain(domain, port) => {
                let mut buf = Vec::with_capacity(2 + domain.len() + 2);
                buf.push(ATYP_DOMAIN);
                buf.push(domain.len() as u8);
                buf.extend_from_slice(domain.as_bytes());
                buf.extend_from_slice(&port.to_be_bytes());
                buf
            }
        }
    }

    /// Parse the SOCKS5 wire layout. The slice must contain exactly one
    /// address.
    pub fn decode(buf: &[u8]) -> Result<Self, ProxyError> {
        let bad = || ProxyError::InvalidAddress(format!("{buf:02x?}"));
        match buf.first() {
            Some(&ATYP_IPV4) if buf.len() == 1 + 4 + 2 => {
                let mut ip = [0u8; 4];
                ip.copy_from_slice(&buf[1..5]);
                let port = u16::from_be_bytes([buf[5], buf[6]]);
                Ok(Address::Ipv4(ip, port))
            }
            Some(&ATYP_IPV6) if buf.len() == 1 + 16 + 2 => {
                let mut ip = [0u8; 16];
                ip.copy_from_slice(&buf[1..17]);
                let port = u16::from_be_bytes([buf[17], buf[18]]);
                Ok(Address::Ipv6(ip, port))
            }
            Some(&ATYP_DOMAIN) if buf.len() >= 2 => {
                let len = buf[1] as usize;
                if buf.len() != 2 + len + 2 {
                    return Err(bad());
                }
                let domain = std::str::from_utf8(&buf[2..2 + len])
                    .map_err(|_| bad())?
                    .to_string();
                let port = u16::from_be_bytes([buf[2 + len], buf[3 + len]]);
                Ok(Address::Domain(domain, port))
            }
            _ => Err(bad()),
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Ipv4(ip, port) => {
                write!(f, "{}.{}.{}.{}:{}", ip[0], ip[1], ip[2], ip[3], port)
            }
            Address::Ipv6(ip, port) => {
                write!(f, "[{}]:{}", Ipv6Addr::from(*ip), port)
            }
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let addrs = [
            Address::Ipv4([192, 168, 1, 20], 8080),
            Address::Ipv6([0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1], 443),
            Address::Domain("example.com".to_string(), 80),
        ];
        for addr in addrs {
            let encoded = addr.encode();
            assert_eq!(Address::decode(&encoded).unwrap(), addr);
        }
    }

    #[test]
    fn decode_rejects_truncated_input() {
        let mut encoded = Address::Domain("example.org".to_string(), 80).encode();
        encoded.truncate(encoded.len() - 1);
        assert!(Address::decode(&encoded).is_err());
        assert!(Address::decode(&[]).is_err());
        assert!(Address::decode(&[0x02, 1, 2, 3]).is_err());
    }

    #[test]
    fn display_formats() {
        assert_eq!(
            Address::Ipv4([10, 0, 0, 1], 80).to_string(),
            "10.0.0.1:80"
        );
        assert_eq!(
            Address::Domain("example.com".to_string(), 443).to_string(),
            "example.com:443"
        );
        let v6 = Address::Ipv6([0; 16], 53);
        assert_eq!(v6.to_string(), "[::]:53");
    }
}
