use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use taskmesh::config::NodeConfig;
use taskmesh::node::Dispatcher;
use taskmesh::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "taskmesh")]
#[command(about = "Distributed job dispatcher for a peer-to-peer compute network")]
struct Args {
    /// Port serving HTTP, worker and peer websockets
    #[arg(long, default_value = "9995")]
    port: u16,

    /// Externally reachable IP advertised to the directory
    #[arg(long, default_value = "127.0.0.1")]
    advertise_ip: String,

    /// Directory service base URL
    #[arg(long, default_value = "http://127.0.0.1:9990")]
    directory_url: String,

    /// Data directory for the node store
    #[arg(long, default_value = ".taskmesh")]
    data_dir: PathBuf,

    /// Maximum number of connected workers
    #[arg(long, default_value = "128")]
    max_workers: usize,

    /// Maximum number of jobs batched into one block
    #[arg(long, default_value = "24")]
    max_tree_jobs: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = NodeConfig {
        port: args.port,
        advertise_ip: args.advertise_ip,
        directory_url: args.directory_url,
        data_dir: args.data_dir,
        max_workers: args.max_workers,
        max_tree_jobs: args.max_tree_jobs,
        ..Default::default()
    };

    tracing::info!(
        port = config.port,
        directory = %config.directory_url,
        max_workers = config.max_workers,
        "Starting taskmesh dispatcher"
    );

    let dispatcher = Dispatcher::new(config)?;
    let shutdown = install_shutdown_handler();
    dispatcher.run(shutdown).await?;

    Ok(())
}
