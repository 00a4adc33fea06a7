//! A proxy destination: either a resolved IP or a domain name plus port.
//!
//! This mirrors the three address kinds SOCKS5 puts on the wire (IPv4,
//! domain, IPv6) and the `host[:port]` forms HTTPS CONNECT and SOCKS4a use,
//! so a single type flows from any of the three handshakes into `Tunnel`.

use anyhow::{bail, Context};
use std::fmt::{Display, Formatter};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Address {
    Ip(SocketAddr),
    Domain { host: String, port: u16 },
}

impl Address {
    pub fn host(&self) -> String {
        match self {
            Self::Ip(addr) => addr.ip().to_string(),
            Self::Domain { host, .. } => host.clone(),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Self::Ip(addr) => addr.port(),
            Self::Domain { port, .. } => *port,
        }
    }

    /// SOCKS5 address type byte (RFC 1928 §5): 0x01 IPv4, 0x03 domain, 0x04 IPv6.
    ///
    /// Returns `None` when `len` bytes aren't available yet so callers can
    /// keep accumulating (mirrors the incremental-parse convention used
    /// throughout this crate's handshake parsers).
    pub fn parse_socks5(buf: &[u8]) -> anyhow::Result<Option<(usize, Self)>> {
        if buf.is_empty() {
            return Ok(None);
        }

        match buf[0] {
            0x01 => {
                if buf.len() < 1 + 4 + 2 {
                    return Ok(None);
                }
                let ip = Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4]);
                let port = u16::from_be_bytes([buf[5], buf[6]]);
                Ok(Some((7, Self::Ip(SocketAddr::new(IpAddr::V4(ip), port)))))
            }

            0x03 => {
                if buf.len() < 2 {
                    return Ok(None);
                }
                let name_len = buf[1] as usize;
                if buf.len() < 2 + name_len + 2 {
                    return Ok(None);
                }
                let host = String::from_utf8(buf[2..2 + name_len].to_vec())
                    .context("Domain name is not valid UTF-8")?;
                let port_off = 2 + name_len;
                let port = u16::from_be_bytes([buf[port_off], buf[port_off + 1]]);
                Ok(Some((port_off + 2, Self::Domain { host, port })))
            }

            0x04 => {
                if buf.len() < 1 + 16 + 2 {
                    return Ok(None);
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[1..17]);
                let port = u16::from_be_bytes([buf[17], buf[18]]);
                Ok(Some((
                    19,
                    Self::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)),
                )))
            }

            other => bail!("Unsupported SOCKS5 address type {other:#x}"),
        }
    }

    /// Encodes this address the way RFC 1928 §5 expects it in a reply.
    pub fn write_socks5(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Ip(SocketAddr::V4(addr)) => {
                buf.push(0x01);
                buf.extend_from_slice(&addr.ip().octets());
                buf.extend_from_slice(&addr.port().to_be_bytes());
            }
            Self::Ip(SocketAddr::V6(addr)) => {
                buf.push(0x04);
                buf.extend_from_slice(&addr.ip().octets());
                buf.extend_from_slice(&addr.port().to_be_bytes());
            }
            Self::Domain { host, port } => {
                buf.push(0x03);
                buf.push(host.len() as u8);
                buf.extend_from_slice(host.as_bytes());
                buf.extend_from_slice(&port.to_be_bytes());
            }
        }
    }

    /// Parses the `CONNECT host:port` authority, honoring bracketed IPv6
    /// literals (`[::1]:443`) the way RFC 7231 / RFC 3986 require.
    pub fn parse_authority(authority: &str) -> anyhow::Result<Self> {
        if let Some(rest) = authority.strip_prefix('[') {
            let (host, rest) = rest
                .split_once(']')
                .context("Unterminated IPv6 literal in authority")?;
            // No `:port` after the bracket falls back to the same
            // default-443 rule the unbracketed branch below uses.
            let port: u16 = match rest.strip_prefix(':') {
                Some(port) => port.parse().context("Invalid port in authority")?,
                None => 443,
            };
            let ip: Ipv6Addr = host.parse().context("Invalid IPv6 literal")?;
            return Ok(Self::Ip(SocketAddr::new(IpAddr::V6(ip), port)));
        }

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => (host, port.parse().context("Invalid port in authority")?),
            None => (authority, 443),
        };

        if host.is_empty() {
            bail!("Empty host in authority");
        }

        Ok(match IpAddr::from_str(host) {
            Ok(ip) => Self::Ip(SocketAddr::new(ip, port)),
            Err(_) => Self::Domain {
                host: host.to_string(),
                port,
            },
        })
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self::Ip(addr)
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ip(addr) => Display::fmt(addr, f),
            Self::Domain { host, port } => write!(f, "{host}:{port}"),
        }
    }
}
