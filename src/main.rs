//! proxylink: relay connections between two transport addresses.
//!
//! ```text
//!   peer ──▶ listen address ──▶ proxylink ──▶ dial target ──▶ service
//!            (tls/wss/tcp/udp)               (tcp/tls/udp)
//! ```
//!
//! `server` accepts overlay traffic and forwards it to a local endpoint;
//! `client` accepts local traffic and forwards it into the overlay. Both run
//! until SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use overlay_transport::config::load_config;
use overlay_transport::lifecycle::signals::wait_for_termination;
use overlay_transport::observability::logging::{init_logging, level_for};
use overlay_transport::{accept_fn, Address, Configuration, Connection, Identity, TransportContext};

#[derive(Parser)]
#[command(name = "proxylink")]
#[command(about = "Relay connections between overlay transport addresses", long_about = None)]
struct Cli {
    /// TOML file with per-protocol sections ([tls], [dtls], [wss], ...)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// PEM certificate chain
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,

    /// PEM private key
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,

    /// PEM CA bundle; enables client certificates in both directions
    #[arg(long, requires = "cert")]
    ca: Option<PathBuf>,

    /// Interface name or IP to dial from
    #[arg(long, default_value = "")]
    bind: String,

    /// Dial timeout in seconds (0 waits indefinitely)
    #[arg(long, default_value_t = 10)]
    dial_timeout: u64,

    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept on LISTEN and relay each connection to ENDPOINT
    Server { listen: String, endpoint: String },
    /// Accept on LOCAL and relay each connection to REMOTE
    Client { local: String, remote: String },
}

#[derive(Clone)]
struct Relay {
    name: &'static str,
    target: Arc<dyn Address>,
    identity: Option<Identity>,
    config: Arc<Configuration>,
    bind: String,
    timeout: Duration,
}

impl Relay {
    async fn run(self, mut inbound: Box<dyn Connection>) {
        let inbound_detail = inbound.detail().to_string();
        let dialed = self
            .target
            .dial_with_local_binding(self.name, &self.bind, self.identity.as_ref(), self.timeout, &self.config)
            .await;

        let mut outbound = match dialed {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(inbound = %inbound_detail, target = %self.target, error = %e, "dial failed, dropping connection");
                return;
            }
        };

        tracing::debug!(inbound = %inbound_detail, outbound = %outbound.detail(), "relaying");
        match tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await {
            Ok((sent, received)) => {
                tracing::debug!(inbound = %inbound_detail, sent, received, "relay finished");
            }
            Err(e) => {
                tracing::debug!(inbound = %inbound_detail, error = %e, "relay ended with error");
            }
        }
    }
}

fn load_identity(cli: &Cli) -> overlay_transport::Result<Option<Identity>> {
    match (&cli.cert, &cli.key) {
        (Some(cert), Some(key)) => Identity::from_pem_files(cert, key, cli.ca.as_deref()).map(Some),
        _ => Ok(None),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(level_for(cli.verbose));

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => Configuration::new(),
    };
    let identity = load_identity(&cli)?;
    let context = TransportContext::with_default_parsers();

    let (name, listen, target) = match &cli.command {
        Commands::Server { listen, endpoint } => ("server", listen.as_str(), endpoint.as_str()),
        Commands::Client { local, remote } => ("client", local.as_str(), remote.as_str()),
    };
    let listen = context.parse_address(listen)?;
    let relay = Relay {
        name,
        target: Arc::from(context.parse_address(target)?),
        identity: identity.clone(),
        config: Arc::new(config.clone()),
        bind: cli.bind.clone(),
        timeout: Duration::from_secs(cli.dial_timeout),
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<Box<dyn Connection>>();
    let closer = listen
        .must_listen(
            name,
            identity.as_ref(),
            accept_fn(move |conn| {
                let _ = tx.send(conn);
            }),
            &config,
        )
        .await;

    tracing::info!(mode = name, listen = %listen, target = %relay.target, "proxylink started");

    let terminate = wait_for_termination();
    tokio::pin!(terminate);
    loop {
        tokio::select! {
            res = &mut terminate => {
                res?;
                break;
            }
            Some(conn) = rx.recv() => {
                tokio::spawn(relay.clone().run(conn));
            }
        }
    }

    closer.close()?;
    tracing::info!("proxylink stopped");
    Ok(())
}
