//! SOCKS5 (RFC 1928) with RFC 1929 username/password authentication.
//!
//! Method negotiation offers exactly one acceptable method: username/
//! password if any accounts are configured, no-auth otherwise — there is no
//! scenario where both are simultaneously acceptable, matching
//! `twunnel3.local_proxy_server`'s single `supported_methods` entry.

use super::{ProtocolAcceptedState, ProtocolAcceptor, ProxyRequest};
use crate::addr::Address;
use crate::buffer::FramedBuffer;
use crate::config::Account;
use anyhow::{bail, Context};
use async_trait::async_trait;
use bytes::Bytes;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_NO_ACCEPTABLE: u8 = 0xff;

const CMD_CONNECT: u8 = 0x01;

const REPLY_SUCCEEDED: u8 = 0x00;
const REPLY_GENERAL_FAILURE: u8 = 0x01;
const REPLY_CONNECTION_REFUSED: u8 = 0x05;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;

#[derive(Clone)]
pub struct Socks5Acceptor {
    accounts: Arc<Vec<Account>>,
}

impl Default for Socks5Acceptor {
    fn default() -> Self {
        Self {
            accounts: Arc::new(Vec::new()),
        }
    }
}

impl Socks5Acceptor {
    pub fn new(accounts: Arc<Vec<Account>>) -> Self {
        Self { accounts }
    }

    fn requires_auth(&self) -> bool {
        !self.accounts.is_empty()
    }

    fn check_credentials(&self, name: &str, password: &str) -> bool {
        self.accounts
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.password == password)
            .unwrap_or(false)
    }
}

pub struct Socks5AcceptedState {
    stream: TcpStream,
}

#[async_trait]
impl ProtocolAcceptor for Socks5Acceptor {
    type AcceptedState = Socks5AcceptedState;

    async fn accept(
        &self,
        mut stream: TcpStream,
    ) -> anyhow::Result<(Self::AcceptedState, ProxyRequest)> {
        let mut framed = FramedBuffer::new();
        let mut chunk = [0u8; 4096];

        // AWAIT_METHODS: VER(5) NMETHODS METHODS[NMETHODS]
        let methods = loop {
            if framed.len() >= 2 {
                let nmethods = framed.peek(2)[1] as usize;
                if framed.len() >= 2 + nmethods {
                    let version = framed.peek(1)[0];
                    if version != 0x05 {
                        bail!("Unsupported SOCKS version {version}, expected 5");
                    }
                    let methods = framed.peek(2 + nmethods)[2..].to_vec();
                    framed.consume(2 + nmethods);
                    break methods;
                }
            }

            let n = stream.read(&mut chunk).await.context("Reading methods")?;
            if n == 0 {
                bail!("Connection closed during method negotiation");
            }
            framed.append(&chunk[..n]);
        };

        let selected = if self.requires_auth() {
            methods
                .contains(&METHOD_USER_PASS)
                .then_some(METHOD_USER_PASS)
        } else {
            methods.contains(&METHOD_NO_AUTH).then_some(METHOD_NO_AUTH)
        };

        let selected = match selected {
            Some(m) => m,
            None => {
                stream
                    .write_all(&[0x05, METHOD_NO_ACCEPTABLE])
                    .await
                    .context("Writing method rejection")?;
                bail!("No acceptable authentication method offered");
            }
        };

        stream
            .write_all(&[0x05, selected])
            .await
            .context("Writing method selection")?;

        // AWAIT_AUTH, only when username/password was selected.
        if selected == METHOD_USER_PASS {
            let (name, password) = loop {
                if framed.len() >= 2 {
                    let ulen = framed.peek(2)[1] as usize;
                    if framed.len() >= 2 + ulen + 1 {
                        let plen = framed.peek(2 + ulen + 1)[2 + ulen] as usize;
                        if framed.len() >= 2 + ulen + 1 + plen {
                            let version = framed.peek(1)[0];
                            if version != 0x01 {
                                bail!("Unsupported auth subnegotiation version {version}");
                            }
                            let body = framed.split_at(2 + ulen + 1 + plen);
                            let name = String::from_utf8(body[2..2 + ulen].to_vec())
                                .context("Username is not valid UTF-8")?;
                            let password =
                                String::from_utf8(body[2 + ulen + 1..].to_vec())
                                    .context("Password is not valid UTF-8")?;
                            break (name, password);
                        }
                    }
                }

                let n = stream.read(&mut chunk).await.context("Reading auth")?;
                if n == 0 {
                    bail!("Connection closed during auth subnegotiation");
                }
                framed.append(&chunk[..n]);
            };

            if self.check_credentials(&name, &password) {
                stream
                    .write_all(&[0x01, 0x00])
                    .await
                    .context("Writing auth success")?;
            } else {
                stream
                    .write_all(&[0x01, 0x01])
                    .await
                    .context("Writing auth failure")?;
                bail!("Invalid credentials for user {name:?}");
            }
        }

        // AWAIT_REQUEST: VER(5) CMD RSV ATYP DST.ADDR DST.PORT
        let dst = loop {
            if framed.len() >= 4 {
                let version = framed.peek(1)[0];
                let command = framed.peek(2)[1];
                if version != 0x05 {
                    bail!("Unsupported SOCKS version {version}, expected 5");
                }

                match Address::parse_socks5(&framed.peek(framed.len())[3..]) {
                    Ok(Some((consumed, addr))) => {
                        framed.consume(3 + consumed);

                        if command != CMD_CONNECT {
                            reply(&mut stream, REPLY_COMMAND_NOT_SUPPORTED, &Address::unspecified())
                                .await?;
                            bail!("Unsupported SOCKS5 command {command:#x}");
                        }

                        break addr;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        reply(&mut stream, REPLY_GENERAL_FAILURE, &Address::unspecified()).await?;
                        return Err(e.context("Parsing SOCKS5 request address"));
                    }
                }
            }

            let n = stream.read(&mut chunk).await.context("Reading request")?;
            if n == 0 {
                bail!("Connection closed before SOCKS5 request completed");
            }
            framed.append(&chunk[..n]);
        };

        let initial_data = framed.take_remaining();
        let initial_data = if initial_data.is_empty() {
            None
        } else {
            Some(Bytes::from(initial_data))
        };

        Ok((
            Socks5AcceptedState { stream },
            ProxyRequest { dst, initial_data },
        ))
    }
}

#[async_trait]
impl ProtocolAcceptedState for Socks5AcceptedState {
    type ServerStream = TcpStream;

    async fn reply_success(
        mut self,
        initial_data: Option<Bytes>,
    ) -> anyhow::Result<Self::ServerStream> {
        // spec.md §4.5/§8 scenario 4 requires the bound address/port to be
        // reported as literal zero, not the server's actual local address.
        reply(&mut self.stream, REPLY_SUCCEEDED, &Address::unspecified()).await?;

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
        // Outbound connect failed before splice mode: connection refused,
        // distinct from the general-failure reply used for a malformed
        // request during `accept`.
        reply(&mut self.stream, REPLY_CONNECTION_REFUSED, &Address::unspecified()).await
    }
}

impl Address {
    fn unspecified() -> Self {
        Self::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
    }
}

async fn reply(stream: &mut TcpStream, code: u8, addr: &Address) -> anyhow::Result<()> {
    let mut buf = vec![0x05, code, 0x00];
    addr.write_socks5(&mut buf);
    stream.write_all(&buf).await.context("Writing SOCKS5 reply")
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn no_auth_required_when_no_accounts_configured() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut client = TcpStream::connect(addr).await.unwrap();
            client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();

            let mut resp = [0u8; 2];
            client.read_exact(&mut resp).await.unwrap();
            assert_eq!(resp, [0x05, METHOD_NO_AUTH]);

            let mut req = vec![0x05, 0x01, 0x00];
            Address::Domain {
                host: "example.com".into(),
                port: 443,
            }
            .write_socks5(&mut req);
            client.write_all(&req).await.unwrap();
        });

        let (stream, _) = listener.accept().await.unwrap();
        let acceptor = Socks5Acceptor::default();
        let (_, req) = acceptor.accept(stream).await.unwrap();
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
    async fn success_reply_reports_bound_address_as_zero() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut client = TcpStream::connect(addr).await.unwrap();
            client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
            let mut resp = [0u8; 2];
            client.read_exact(&mut resp).await.unwrap();
            assert_eq!(resp, [0x05, METHOD_NO_AUTH]);

            let mut req = vec![0x05, 0x01, 0x00];
            Address::Ip("127.0.0.1:80".parse().unwrap()).write_socks5(&mut req);
            client.write_all(&req).await.unwrap();

            let mut resp = [0u8; 10];
            client.read_exact(&mut resp).await.unwrap();
            assert_eq!(
                resp,
                [0x05, REPLY_SUCCEEDED, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
            );
        });

        let (stream, _) = listener.accept().await.unwrap();
        let (state, _) = Socks5Acceptor::default().accept(stream).await.unwrap();
        state.reply_success(None).await.unwrap();
        client.await.unwrap();
    }

    #[tokio::test]
    async fn username_password_auth_required_when_accounts_configured() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accounts = Arc::new(vec![Account {
            name: "alice".into(),
            password: "s3cr3t".into(),
        }]);
        let acceptor = Socks5Acceptor::new(accounts);
        let acceptor_for_server = acceptor.clone();

        let client = tokio::spawn(async move {
            let mut client = TcpStream::connect(addr).await.unwrap();
            client
                .write_all(&[0x05, 0x02, METHOD_NO_AUTH, METHOD_USER_PASS])
                .await
                .unwrap();

            let mut resp = [0u8; 2];
            client.read_exact(&mut resp).await.unwrap();
            assert_eq!(resp, [0x05, METHOD_USER_PASS]);

            let mut auth = vec![0x01, 5];
            auth.extend_from_slice(b"alice");
            auth.push(6);
            auth.extend_from_slice(b"s3cr3t");
            client.write_all(&auth).await.unwrap();

            client.read_exact(&mut resp).await.unwrap();
            assert_eq!(resp, [0x01, 0x00]);

            let mut req = vec![0x05, 0x01, 0x00];
            Address::Ip("93.184.216.34:443".parse().unwrap()).write_socks5(&mut req);
            client.write_all(&req).await.unwrap();
        });

        let (stream, _) = listener.accept().await.unwrap();
        let (_, req) = acceptor_for_server.accept(stream).await.unwrap();
        client.await.unwrap();

        assert_eq!(req.dst, Address::Ip("93.184.216.34:443".parse().unwrap()));
    }

    #[tokio::test]
    async fn zero_methods_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut client = TcpStream::connect(addr).await.unwrap();
            client.write_all(&[0x05, 0x00]).await.unwrap();

            let mut resp = [0u8; 2];
            client.read_exact(&mut resp).await.unwrap();
            assert_eq!(resp, [0x05, METHOD_NO_ACCEPTABLE]);
        });

        let (stream, _) = listener.accept().await.unwrap();
        assert!(Socks5Acceptor::default().accept(stream).await.is_err());
        client.await.unwrap();
    }

    #[tokio::test]
    async fn outbound_connect_failure_replies_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut client = TcpStream::connect(addr).await.unwrap();
            client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
            let mut resp = [0u8; 2];
            client.read_exact(&mut resp).await.unwrap();
            assert_eq!(resp, [0x05, METHOD_NO_AUTH]);

            let mut req = vec![0x05, 0x01, 0x00];
            Address::Ip("127.0.0.1:1".parse().unwrap()).write_socks5(&mut req);
            client.write_all(&req).await.unwrap();

            let mut resp = [0u8; 10];
            client.read_exact(&mut resp).await.unwrap();
            assert_eq!(resp[..2], [0x05, REPLY_CONNECTION_REFUSED]);
        });

        let (stream, _) = listener.accept().await.unwrap();
        let (state, _) = Socks5Acceptor::default().accept(stream).await.unwrap();
        state.reply_error(Some("connection refused")).await.unwrap();
        client.await.unwrap();
    }

    #[test]
    fn check_credentials_matches_first_entry_by_name() {
        let acceptor = Socks5Acceptor::new(Arc::new(vec![
            Account {
                name: "alice".into(),
                password: "1".into(),
            },
            Account {
                name: "alice".into(),
                password: "2".into(),
            },
        ]));

        assert!(acceptor.check_credentials("alice", "1"));
        assert!(!acceptor.check_credentials("alice", "2"));
        assert!(!acceptor.check_credentials("bob", "1"));
    }
}
