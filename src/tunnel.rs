//! The upstream-tunnel construction collaborator.
//!
//! This is the extension point spec.md calls "PROXY_SERVERS" out of scope
//! for: given a destination, asynchronously establish *some* transport to
//! it. `DirectTunnel` is the only implementation this crate ships — a plain
//! TCP dial — so the crate is runnable standalone. Chaining through an
//! upstream proxy is left to whoever wires in their own `Tunnel`.

use crate::addr::Address;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

#[async_trait]
pub trait Tunnel: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    async fn connect(&self, host: &str, port: u16) -> anyhow::Result<Self::Stream>;

    /// Convenience wrapper around `connect` for callers that already hold a
    /// resolved `Address` (the common case: a handshake resolves to one).
    async fn connect_addr(&self, addr: &Address) -> anyhow::Result<Self::Stream> {
        self.connect(&addr.host(), addr.port()).await
    }
}

#[derive(Default, Clone, Copy)]
pub struct DirectTunnel;

#[async_trait]
impl Tunnel for DirectTunnel {
    type Stream = TcpStream;

    async fn connect(&self, host: &str, port: u16) -> anyhow::Result<Self::Stream> {
        Ok(TcpStream::connect((host, port)).await?)
    }
}
