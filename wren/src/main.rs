#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

mod channel;
mod config;
mod delivery;
mod retry;
mod server;
mod slot;
mod user;

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "wren")]
#[command(about = "WREN - clustered instant-messaging router")]
#[command(version)]
struct Args {
    #[arg(short, long, default_value = "1")]
    node_id: u64,

    /// Client-facing listener.
    #[arg(short, long, default_value = "0.0.0.0:5100")]
    listen: SocketAddr,

    /// Node-to-node RPC listener.
    #[arg(long, default_value = "0.0.0.0:5101")]
    cluster_listen: SocketAddr,

    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Peer declarations, `id@host:port` or `id@host:port@proxy`.
    #[arg(long, value_delimiter = ',')]
    peers: Vec<String>,

    /// Node role: `replica` or `proxy`.
    #[arg(long, default_value = "replica")]
    role: String,

    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write a default config file and exit.
    #[arg(long, value_name = "PATH")]
    gen_config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Some(path) = &args.gen_config {
        if let Err(e) = generate_config(path) {
            eprintln!("failed to generate config: {e}");
            std::process::exit(1);
        }
        println!("generated default config at: {}", path.display());
        return;
    }

    init_tracing();

    let mut config = match &args.config {
        Some(path) => match config::Config::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                error!(target: "wren", error = %e, "config load failed");
                std::process::exit(1);
            },
        },
        None => config::Config::default(),
    };

    // CLI flags override the file for the identity fields.
    config.node_id = args.node_id;
    config.listen_addr = args.listen;
    config.cluster_addr = args.cluster_listen;
    config.data_dir = args.data_dir;
    config.role = args.role;
    if !args.peers.is_empty() {
        config.peers = args.peers;
    }

    info!(
        target: "wren",
        node_id = config.node_id,
        listen = %config.listen_addr,
        cluster = %config.cluster_addr,
        data_dir = %config.data_dir.display(),
        role = %config.role,
        peers = config.peers.len(),
        "starting wren"
    );

    let server = match server::Server::start(config).await {
        Ok(server) => server,
        Err(e) => {
            error!(target: "wren", error = %e, "startup failed");
            std::process::exit(1);
        },
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(target: "wren", error = %e, "signal handler failed");
    }
    info!(target: "wren", "shutting down");
    server.shutdown();
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();
}

fn generate_config(path: &std::path::Path) -> wrn_core::Result<()> {
    let config = config::Config::default();
    let rendered = toml::to_string_pretty(&config)
        .map_err(|e| wrn_core::WrenError::Config(format!("render failed: {e}")))?;
    std::fs::write(path, rendered)?;
    Ok(())
}
