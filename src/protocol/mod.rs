//! Handshake acceptors: one per supported proxy protocol.
//!
//! An acceptor consumes the client's opening bytes off a `FramedBuffer`-fed
//! socket and resolves to a destination plus a `ProtocolAcceptedState` that
//! can later be told to reply success (and start splicing) or reply error
//! (and close). This is the "Factory & listener" / "Outbound handler" split
//! from spec.md §4.2/§4.7, reframed as two small async traits instead of a
//! callback-object pair (see the design note in SPEC_FULL.md §4.2).

pub mod https;
pub mod socks4;
pub mod socks5;

use crate::addr::Address;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// The destination a handshake resolved to, plus any bytes the client
/// already pipelined ahead of the reply (e.g. a TLS ClientHello right after
/// `CONNECT`).
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub dst: Address,
    pub initial_data: Option<Bytes>,
}

impl From<Address> for ProxyRequest {
    fn from(dst: Address) -> Self {
        Self {
            dst,
            initial_data: None,
        }
    }
}

#[async_trait]
pub trait ProtocolAcceptor: Sized {
    type AcceptedState: ProtocolAcceptedState + Send + Sync + 'static;

    async fn accept(
        &self,
        stream: TcpStream,
    ) -> anyhow::Result<(Self::AcceptedState, ProxyRequest)>;
}

#[async_trait]
pub trait ProtocolAcceptedState: Sized {
    type ServerStream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Writes whatever wire-level "connected" reply the protocol uses and
    /// returns the stream to splice against the outbound connection.
    async fn reply_success(
        self,
        initial_data: Option<Bytes>,
    ) -> anyhow::Result<Self::ServerStream>;

    /// Writes whatever wire-level "failed" reply the protocol uses. The
    /// connection is closed afterwards regardless of the outcome here.
    async fn reply_error(self, error: Option<impl AsRef<str> + Send + Sync>) -> anyhow::Result<()>;
}

pub use https::{HttpsAcceptedState, HttpsAcceptor};
pub use socks4::{Socks4AcceptedState, Socks4Acceptor};
pub use socks5::{Socks5AcceptedState, Socks5Acceptor};

use crate::config::{Config, ProxyKind};
use std::sync::Arc;

/// Handler factory (spec.md §4.7): picks the inbound acceptor matching
/// `LOCAL_PROXY_SERVER.TYPE`. An unrecognized or unset `kind` yields `None`
/// so the caller can refuse to start a listener rather than guess.
pub fn factory(config: &Config) -> Option<AnyAcceptor> {
    match config.local_proxy_server.kind? {
        ProxyKind::Https => Some(AnyAcceptor::Https(HttpsAcceptor)),
        ProxyKind::Socks4 => Some(AnyAcceptor::Socks4(Socks4Acceptor)),
        ProxyKind::Socks5 => Some(AnyAcceptor::Socks5(Socks5Acceptor::new(Arc::new(
            config.local_proxy_server.accounts.clone(),
        )))),
    }
}

/// One acceptor instance picked by [`factory`], erased behind a single type
/// so a config-driven binary can hold "whichever protocol was configured"
/// without matching on `ProxyKind` at every call site.
#[derive(Clone)]
pub enum AnyAcceptor {
    Https(HttpsAcceptor),
    Socks4(Socks4Acceptor),
    Socks5(Socks5Acceptor),
}

pub enum AnyAcceptedState {
    Https(HttpsAcceptedState),
    Socks4(Socks4AcceptedState),
    Socks5(Socks5AcceptedState),
}

#[async_trait]
impl ProtocolAcceptor for AnyAcceptor {
    type AcceptedState = AnyAcceptedState;

    async fn accept(
        &self,
        stream: TcpStream,
    ) -> anyhow::Result<(Self::AcceptedState, ProxyRequest)> {
        match self {
            Self::Https(a) => {
                let (state, req) = a.accept(stream).await?;
                Ok((AnyAcceptedState::Https(state), req))
            }
            Self::Socks4(a) => {
                let (state, req) = a.accept(stream).await?;
                Ok((AnyAcceptedState::Socks4(state), req))
            }
            Self::Socks5(a) => {
                let (state, req) = a.accept(stream).await?;
                Ok((AnyAcceptedState::Socks5(state), req))
            }
        }
    }
}

#[async_trait]
impl ProtocolAcceptedState for AnyAcceptedState {
    type ServerStream = TcpStream;

    async fn reply_success(
        self,
        initial_data: Option<Bytes>,
    ) -> anyhow::Result<Self::ServerStream> {
        match self {
            Self::Https(s) => s.reply_success(initial_data).await,
            Self::Socks4(s) => s.reply_success(initial_data).await,
            Self::Socks5(s) => s.reply_success(initial_data).await,
        }
    }

    async fn reply_error(self, error: Option<impl AsRef<str> + Send + Sync>) -> anyhow::Result<()> {
        let error = error.as_ref().map(|e| e.as_ref().to_string());
        match self {
            Self::Https(s) => s.reply_error(error).await,
            Self::Socks4(s) => s.reply_error(error).await,
            Self::Socks5(s) => s.reply_error(error).await,
        }
    }
}
