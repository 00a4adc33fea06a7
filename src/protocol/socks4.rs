//! SOCKS4 / SOCKS4a (Ying-Da Lee's memo). Only the `CONNECT` command is
//! accepted; `BIND` gets an error reply and the connection is closed,
//! matching `twunnel3.local_proxy_server.SOCKS4InputProtocol`.

use super::{ProtocolAcceptedState, ProtocolAcceptor, ProxyRequest};
use crate::addr::Address;
use crate::buffer::FramedBuffer;
use anyhow::{bail, Context};
use async_trait::async_trait;
use bytes::Bytes;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const CMD_CONNECT: u8 = 0x01;
const REPLY_GRANTED: u8 = 0x5a;
const REPLY_REJECTED: u8 = 0x5b;

#[derive(Default, Clone, Copy)]
pub struct Socks4Acceptor;

pub struct Socks4AcceptedState {
    stream: TcpStream,
}

#[async_trait]
impl ProtocolAcceptor for Socks4Acceptor {
    type AcceptedState = Socks4AcceptedState;

    async fn accept(
        &self,
        mut stream: TcpStream,
    ) -> anyhow::Result<(Self::AcceptedState, ProxyRequest)> {
        let mut framed = FramedBuffer::new();
        let mut chunk = [0u8; 4096];

        // Fixed 8-byte header: VN, CD, DSTPORT(2), DSTIP(4).
        while framed.len() < 8 {
            let n = stream.read(&mut chunk).await.context("Reading header")?;
            if n == 0 {
                bail!("Connection closed before SOCKS4 header completed");
            }
            framed.append(&chunk[..n]);
        }

        let header = framed.peek(8).to_vec();
        let version = header[0];
        let command = header[1];
        let port = u16::from_be_bytes([header[2], header[3]]);
        let ip_bytes = [header[4], header[5], header[6], header[7]];

        if version != 0x04 {
            reply(&mut stream, REPLY_REJECTED).await?;
            bail!("Unsupported SOCKS version {version}, expected 4");
        }

        if command != CMD_CONNECT {
            reply(&mut stream, REPLY_REJECTED).await?;
            bail!("Unsupported SOCKS4 command {command:#x}");
        }

        framed.consume(8);

        // NUL-terminated USERID, scanned incrementally since it may not
        // have arrived yet or may straddle reads.
        let userid_end = loop {
            if let Some(pos) = framed.find(b"\0") {
                break pos;
            }
            let n = stream.read(&mut chunk).await.context("Reading userid")?;
            if n == 0 {
                bail!("Connection closed before USERID terminator");
            }
            framed.append(&chunk[..n]);
        };
        framed.consume(userid_end + 1);

        // SOCKS4a: DSTIP is 0.0.0.x with x != 0 signals "domain name
        // follows", matching the broader `1 <= address <= 255` predicate
        // the original implementation uses rather than the strict
        // `0.0.0.x` reading of the memo.
        let addr_as_u32 = u32::from_be_bytes(ip_bytes);
        let dst = if (1..=255).contains(&addr_as_u32) {
            let domain_end = loop {
                if let Some(pos) = framed.find(b"\0") {
                    break pos;
                }
                let n = stream.read(&mut chunk).await.context("Reading hostname")?;
                if n == 0 {
                    bail!("Connection closed before hostname terminator");
                }
                framed.append(&chunk[..n]);
            };

            let host = String::from_utf8(framed.split_at(domain_end).to_vec())
                .context("Hostname is not valid UTF-8")?;
            framed.consume(1);
            Address::Domain { host, port }
        } else {
            Address::Ip(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(ip_bytes),
                port,
            )))
        };

        let initial_data = framed.take_remaining();
        let initial_data = if initial_data.is_empty() {
            None
        } else {
            Some(Bytes::from(initial_data))
        };

        Ok((
            Socks4AcceptedState { stream },
            ProxyRequest { dst, initial_data },
        ))
    }
}

#[async_trait]
impl ProtocolAcceptedState for Socks4AcceptedState {
    type ServerStream = TcpStream;

    async fn reply_success(
        mut self,
        initial_data: Option<Bytes>,
    ) -> anyhow::Result<Self::ServerStream> {
        reply(&mut self.stream, REPLY_GRANTED).await?;

        if let Some(data) = initial_data {
            self.stream
                .write_all(&data)
                .await
                .context("Writing buffered outbound data")?;
        }

        Ok(self.stream)
    }

    async fn reply_error(
        mut self,
        _error: Option<impl AsRef<str> + Send + Sync>,
    ) -> anyhow::Result<()> {
        reply(&mut self.stream, REPLY_REJECTED).await
    }
}

async fn reply(stream: &mut TcpStream, code: u8) -> anyhow::Result<()> {
    // VN=0 (reply version), CD, DSTPORT/DSTIP are unused by clients for CONNECT.
    stream
        .write_all(&[0x00, code, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00])
        .await
        .context("Writing SOCKS4 reply")
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connect_with_ip_destination() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut client = TcpStream::connect(addr).await.unwrap();
            let mut req = vec![0x04, 0x01];
            req.extend_from_slice(&80u16.to_be_bytes());
            req.extend_from_slice(&[93, 184, 216, 34]);
            req.push(0); // empty userid
            client.write_all(&req).await.unwrap();
        });

        let (stream, _) = listener.accept().await.unwrap();
        let (_, req) = Socks4Acceptor.accept(stream).await.unwrap();
        client.await.unwrap();

        assert_eq!(req.dst, Address::Ip("93.184.216.34:80".parse().unwrap()));
    }

    #[tokio::test]
    async fn socks4a_domain_sentinel_selects_domain_mode() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut client = TcpStream::connect(addr).await.unwrap();
            let mut req = vec![0x04, 0x01];
            req.extend_from_slice(&443u16.to_be_bytes());
            req.extend_from_slice(&[0, 0, 0, 1]); // sentinel: domain follows
            req.push(0); // empty userid
            req.extend_from_slice(b"example.com\0");
            client.write_all(&req).await.unwrap();
        });

        let (stream, _) = listener.accept().await.unwrap();
        let (_, req) = Socks4Acceptor.accept(stream).await.unwrap();
        client.await.unwrap();

        assert_eq!(
            req.dst,
            Address::Domain {
                host: "example.com".into(),
                port: 443
            }
        );
    }

    #[tokio::test]
    async fn bind_command_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut client = TcpStream::connect(addr).await.unwrap();
            let mut req = vec![0x04, 0x02]; // BIND
            req.extend_from_slice(&80u16.to_be_bytes());
            req.extend_from_slice(&[1, 2, 3, 4]);
            req.push(0);
            client.write_all(&req).await.unwrap();
        });

        let (stream, _) = listener.accept().await.unwrap();
        assert!(Socks4Acceptor.accept(stream).await.is_err());
        client.await.unwrap();
    }
}
