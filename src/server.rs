//! Listener loop: accept, run a protocol acceptor, dial out through a
//! `Tunnel`, then splice. One `run_server` call serves exactly one
//! configured protocol on one listening socket, matching spec.md §4.7's
//! "factory picks one protocol per listener" design.

use crate::protocol::{ProtocolAcceptedState, ProtocolAcceptor};
use crate::splice::splice;
use crate::tunnel::Tunnel;
use anyhow::Context;
use async_shutdown::Shutdown;
use tokio::net::{TcpListener, TcpStream};
use tokio::spawn;

pub async fn run_server(
    shutdown: Shutdown,
    name: &'static str,
    listener: TcpListener,
    acceptor: impl ProtocolAcceptor + Clone + Send + Sync + 'static,
    tunnel: impl Tunnel + Clone,
) -> anyhow::Result<()> {
    while let Some(r) = shutdown.wrap_cancel(listener.accept()).await {
        let (conn, peer) = r.context("Accepting connection")?;
        log::info!("{name}: new connection from {peer}");

        let shutdown = shutdown.clone();
        let acceptor = acceptor.clone();
        let tunnel = tunnel.clone();

        spawn(async move {
            if let Some(Err(e)) = shutdown
                .wrap_cancel(serve_conn(name, conn, acceptor, tunnel))
                .await
            {
                log::warn!("{name}: connection from {peer} failed: {e:?}");
            }
            log::info!("{name}: connection from {peer} closed");
        });
    }

    Ok(())
}

async fn serve_conn(
    name: &'static str,
    conn: TcpStream,
    acceptor: impl ProtocolAcceptor,
    tunnel: impl Tunnel,
) -> anyhow::Result<()> {
    let (state, req) = acceptor.accept(conn).await.context("Accepting handshake")?;
    log::debug!("{name}: handshake resolved to {}", req.dst);

    match tunnel
        .connect_addr(&req.dst)
        .await
        .context("Connecting to destination")
    {
        Ok(mut upstream) => {
            let mut client = state
                .reply_success(req.initial_data)
                .await
                .context("Replying success")?;

            splice(&mut client, &mut upstream).await
        }

        Err(err) => {
            state.reply_error(Some(err.to_string())).await?;
            Err(err)
        }
    }
}
