//! HTTPS CONNECT handshake (RFC 7231 §4.3.6): `CONNECT host:port HTTP/1.1`
//! followed by headers terminated by a blank line, then either `200 OK`
//! and splice, or a 4xx reply and close.

use super::{ProtocolAcceptedState, ProtocolAcceptor, ProxyRequest};
use crate::addr::Address;
use crate::buffer::FramedBuffer;
use anyhow::{bail, Context};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[derive(Default, Clone, Copy)]
pub struct HttpsAcceptor;

pub struct HttpsAcceptedState {
    stream: TcpStream,
}

#[async_trait]
impl ProtocolAcceptor for HttpsAcceptor {
    type AcceptedState = HttpsAcceptedState;

    async fn accept(
        &self,
        mut stream: TcpStream,
    ) -> anyhow::Result<(Self::AcceptedState, ProxyRequest)> {
        let mut framed = FramedBuffer::new();
        let mut chunk = [0u8; 4096];

        let header_end = loop {
            if let Some(pos) = framed.find(b"\r\n\r\n") {
                break pos + 4;
            }

            let n = stream.read(&mut chunk).await.context("Reading request")?;
            if n == 0 {
                bail!("Connection closed before a complete request was received");
            }
            framed.append(&chunk[..n]);
        };

        let header_bytes = framed.split_at(header_end);
        let request_line_end = header_bytes
            .windows(2)
            .position(|w| w == b"\r\n")
            .context("Missing request line terminator")?;

        let request_line = std::str::from_utf8(&header_bytes[..request_line_end])
            .context("Request line is not valid UTF-8")?;

        let mut tokens = request_line.split(' ');
        let (method, uri, version) = match (tokens.next(), tokens.next(), tokens.next()) {
            (Some(method), Some(uri), Some(version)) => (method, uri, version),
            _ => {
                reply_error(&mut stream, 400, "Bad Request", None).await?;
                bail!("Malformed request line: {request_line:?}");
            }
        };

        if !method.eq_ignore_ascii_case("CONNECT") {
            reply_error(&mut stream, 405, "Method Not Allowed", Some("Allow: CONNECT")).await?;
            bail!("Unsupported method {method}");
        }

        let dst = match Address::parse_authority(uri) {
            Ok(addr) => addr,
            Err(e) => {
                reply_error(&mut stream, 400, "Bad Request", None).await?;
                return Err(e.context(format!("Invalid CONNECT authority {uri:?}")));
            }
        };

        let _ = version;

        let initial_data = framed.take_remaining();
        let initial_data = if initial_data.is_empty() {
            None
        } else {
            Some(Bytes::from(initial_data))
        };

        Ok((
            HttpsAcceptedState { stream },
            ProxyRequest { dst, initial_data },
        ))
    }
}

#[async_trait]
impl ProtocolAcceptedState for HttpsAcceptedState {
    type ServerStream = TcpStream;

    async fn reply_success(
        mut self,
        initial_data: Option<Bytes>,
    ) -> anyhow::Result<Self::ServerStream> {
        self.stream
            .write_all(b"HTTP/1.1 200 OK\r\n\r\n")
            .await
            .context("Writing CONNECT success reply")?;

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
        // Outbound connect failed before splice mode.
        reply_error(&mut self.stream, 404, "Not Found", None).await
    }
}

async fn reply_error(
    stream: &mut TcpStream,
    code: u16,
    reason: &str,
    extra_header: Option<&str>,
) -> anyhow::Result<()> {
    let mut body = format!("HTTP/1.1 {code} {reason}\r\n");
    if let Some(header) = extra_header {
        body.push_str(header);
        body.push_str("\r\n");
    }
    body.push_str("\r\n");
    stream
        .write_all(body.as_bytes())
        .await
        .context("Writing error reply")
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio::io::AsyncWriteExt as _;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connect_request_split_across_reads_resolves_destination() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut client = TcpStream::connect(addr).await.unwrap();
            client.write_all(b"CONNECT example.com").await.unwrap();
            client.write_all(b":443 HTTP/1.1\r\n").await.unwrap();
            client.write_all(b"Host: example.com\r\n\r\n").await.unwrap();
        });

        let (stream, _) = listener.accept().await.unwrap();
        let (_, req) = HttpsAcceptor.accept(stream).await.unwrap();
        client.await.unwrap();

        assert_eq!(req.dst.host(), "example.com");
        assert_eq!(req.dst.port(), 443);
        assert!(req.initial_data.is_none());
    }

    #[tokio::test]
    async fn non_connect_method_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut client = TcpStream::connect(addr).await.unwrap();
            client
                .write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n")
                .await
                .unwrap();

            let mut resp = Vec::new();
            client.read_to_end(&mut resp).await.unwrap();
            assert_eq!(
                resp,
                b"HTTP/1.1 405 Method Not Allowed\r\nAllow: CONNECT\r\n\r\n"
            );
        });

        let (stream, _) = listener.accept().await.unwrap();
        assert!(HttpsAcceptor.accept(stream).await.is_err());
        client.await.unwrap();
    }

    #[tokio::test]
    async fn success_reply_is_bare_200_ok() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut client = TcpStream::connect(addr).await.unwrap();
            client
                .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
                .await
                .unwrap();

            let mut resp = [0u8; 19];
            client.read_exact(&mut resp).await.unwrap();
            assert_eq!(&resp, b"HTTP/1.1 200 OK\r\n\r\n");
        });

        let (stream, _) = listener.accept().await.unwrap();
        let (state, req) = HttpsAcceptor.accept(stream).await.unwrap();
        state.reply_success(req.initial_data).await.unwrap();
        client.await.unwrap();
    }

    #[tokio::test]
    async fn outbound_connect_failure_replies_404() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut client = TcpStream::connect(addr).await.unwrap();
            client
                .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
                .await
                .unwrap();

            let mut resp = Vec::new();
            client.read_to_end(&mut resp).await.unwrap();
            assert_eq!(resp, b"HTTP/1.1 404 Not Found\r\n\r\n");
        });

        let (stream, _) = listener.accept().await.unwrap();
        let (state, _) = HttpsAcceptor.accept(stream).await.unwrap();
        state.reply_error(Some("connect refused")).await.unwrap();
        client.await.unwrap();
    }
}
