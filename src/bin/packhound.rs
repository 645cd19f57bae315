use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::Parser;
use tracing::info;

use packhound::{LocalNode, NodeConfig, StopSignal, SyncServer, SyncSettings, SyncWorker};

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[clap(short = 'c', long, default_value = "./config.ini")]
    configfile: String,
}

fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if let Err(e) = run(&cli) {
        eprintln!("ERROR: {e:#}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = NodeConfig::load(&cli.configfile)?;

    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .init();

    let node = Arc::new(LocalNode::open(&config)?);

    let server = SyncServer::start(node.clone(), "0.0.0.0", config.peer_to_peer_port)?;
    let worker = SyncWorker::start(
        node,
        SyncSettings {
            frequency: Duration::from_secs(config.peer_sync_frequency),
            fanout: config.max_sync_fanout,
            self_peer: config.self_peer.clone(),
            discoverable: config.node_discoverable,
        },
    )?;

    info!(
        "Web UI collaborator expected at http://{}:{}",
        config.web_service_http_host, config.web_service_http_port
    );
    info!("Packhound node started, press CTRL+C to stop...");

    let stop = Arc::new(StopSignal::new());
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || handler_stop.signal())
        .map_err(|e| anyhow!("Failed to install signal handler: {}", e))?;
    stop.wait();

    info!("Awaiting packhound node to stop...");
    worker.stop();
    server.stop();
    Ok(())
}
