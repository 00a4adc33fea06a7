use anyhow::Context;
use async_shutdown::Shutdown;
use clap::{Parser, Subcommand};
use localproxy::config::{Account, Config};
use localproxy::protocol::{self, ProtocolAcceptor};
use localproxy::server::run_server;
use localproxy::tunnel::DirectTunnel;
use std::net::IpAddr;
use std::num::NonZeroU16;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal::ctrl_c;
use tokio::spawn;
use tokio::time::timeout;

#[derive(Parser)]
struct Cli {
    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve an HTTPS CONNECT proxy.
    ServeHttps {
        #[clap(default_value = "0.0.0.0", long)]
        host: IpAddr,

        #[clap(default_value = "8080", long)]
        port: NonZeroU16,
    },

    /// Serve a SOCKS4/4a proxy.
    ServeSocks4 {
        #[clap(default_value = "0.0.0.0", long)]
        host: IpAddr,

        #[clap(default_value = "1080", long)]
        port: NonZeroU16,
    },

    /// Serve a SOCKS5 proxy. Repeat --account to allow multiple users;
    /// omit it entirely to accept unauthenticated connections.
    ServeSocks5 {
        #[clap(default_value = "0.0.0.0", long)]
        host: IpAddr,

        #[clap(default_value = "1080", long)]
        port: NonZeroU16,

        /// user:pass, may be repeated
        #[clap(long = "account", value_parser = parse_account)]
        accounts: Vec<Account>,
    },

    /// Serve whichever protocol a JSON configuration document selects
    /// (`LOCAL_PROXY_SERVER.TYPE`/`ADDRESS`/`PORT`/`ACCOUNTS`, see `Config`).
    ServeConfig {
        #[clap(long)]
        config: PathBuf,
    },
}

fn parse_account(s: &str) -> anyhow::Result<Account> {
    let (name, password) = s
        .split_once(':')
        .context("Expected ACCOUNT in the form user:pass")?;
    Ok(Account {
        name: name.to_string(),
        password: password.to_string(),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    let Cli { cmd } = Cli::parse();

    match cmd {
        Command::ServeHttps { host, port } => {
            serve("https_connect", host, port, protocol::HttpsAcceptor::default()).await
        }

        Command::ServeSocks4 { host, port } => {
            serve("socks4_proxy", host, port, protocol::Socks4Acceptor::default()).await
        }

        Command::ServeSocks5 {
            host,
            port,
            accounts,
        } => {
            let acceptor = protocol::Socks5Acceptor::new(Arc::new(accounts));
            serve("socks5_proxy", host, port, acceptor).await
        }

        Command::ServeConfig { config } => serve_from_config(&config).await,
    }
}

async fn serve_from_config(path: &std::path::Path) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Reading config file {}", path.display()))?;
    let mut config: Config =
        serde_json::from_str(&text).with_context(|| format!("Parsing config file {}", path.display()))?;
    config.normalize();

    let acceptor = protocol::factory(&config).with_context(|| {
        format!(
            "Unrecognized LOCAL_PROXY_SERVER.TYPE {:?}; refusing to start a listener",
            config.local_proxy_server.kind
        )
    })?;

    let host: IpAddr = config
        .local_proxy_server
        .address
        .parse()
        .with_context(|| format!("Invalid ADDRESS {:?}", config.local_proxy_server.address))?;

    let name: &'static str = match config.local_proxy_server.kind {
        Some(localproxy::config::ProxyKind::Https) => "https_connect",
        Some(localproxy::config::ProxyKind::Socks4) => "socks4_proxy",
        Some(localproxy::config::ProxyKind::Socks5) => "socks5_proxy",
        None => unreachable!("factory() already refused an unset/unrecognized TYPE"),
    };

    serve(
        name,
        host,
        NonZeroU16::new(config.local_proxy_server.port)
            .context("LOCAL_PROXY_SERVER.PORT must be nonzero")?,
        acceptor,
    )
    .await
}

async fn serve(
    name: &'static str,
    host: IpAddr,
    port: NonZeroU16,
    acceptor: impl ProtocolAcceptor + Clone + Send + Sync + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind((host, port.get()))
        .await
        .with_context(|| format!("Binding tcp on {host}:{port}"))?;

    let shutdown = Shutdown::new();
    log::info!("{name} started on {host}:{port}");

    let task = spawn(run_server(
        shutdown.clone(),
        name,
        listener,
        acceptor,
        DirectTunnel,
    ));

    let _ = ctrl_c().await;
    log::info!("{name} shutting down...");
    shutdown.shutdown();
    shutdown.wait_shutdown_complete().await;

    timeout(Duration::from_secs(10), task)
        .await
        .context("Timed out waiting for shutdown")?
        .context("Server task panicked")?
}
