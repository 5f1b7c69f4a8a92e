use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use blockshare::config::{expand_tilde, ConfigWrapper};
use blockshare::connection::event_channel;
use blockshare::index::MemoryIndex;
use blockshare::storage::FsStorage;
use blockshare::{server, Model};

#[derive(Parser, Debug)]
#[command(name = "blockshare")]
#[command(about = "Share file blocks between peers, including blocks of files still being pulled", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(short, long, env = "BLOCKSHARE_CONFIG", default_value = "~/.config/blockshare/config.toml")]
    config: PathBuf,

    /// Listen address (overrides the configuration)
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Peers to dial in addition to configured device addresses
    #[arg(long = "connect", value_name = "ADDR")]
    connect: Vec<SocketAddr>,

    /// Verbose output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "blockshare=info",
        1 => "blockshare=debug",
        _ => "blockshare=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_path = expand_tilde(&cli.config);
    let config = Arc::new(
        ConfigWrapper::load(&config_path)
            .with_context(|| format!("Failed to load {}", config_path.display()))?,
    );
    let cfg = config.get();
    info!(device = %cfg.device_id, folders = cfg.folders.len(), devices = cfg.devices.len(), "starting");

    let model = Arc::new(Model::new(
        cfg.device_id,
        config.clone(),
        Arc::new(MemoryIndex::new()),
        Arc::new(FsStorage::new(cfg.folder_roots())),
    ));

    let (events, rx) = event_channel();
    let runner = tokio::spawn(model.clone().run(rx));

    if let Some(addr) = cli.listen.or(cfg.listen) {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        let (model, config, events) = (model.clone(), config.clone(), events.clone());
        tokio::spawn(async move {
            if let Err(e) = server::accept_loop(listener, model, config, events).await {
                warn!("listener stopped: {:#}", e);
            }
        });
    }

    let targets: Vec<SocketAddr> = cfg
        .devices
        .iter()
        .filter_map(|d| d.address)
        .chain(cli.connect)
        .collect();
    let dials = targets.into_iter().map(|addr| {
        let (model, config, events) = (model.clone(), config.clone(), events.clone());
        async move {
            if let Err(e) = server::dial(addr, &model, &config, events).await {
                warn!(%addr, "dial failed: {:#}", e);
            }
        }
    });
    futures::future::join_all(dials).await;
    drop(events);

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    model.close_all("shutting down");
    runner.abort();
    Ok(())
}
