//! Community Product Server
//!
//! Watches the chain for `OperatorChanged` events and runs an off-chain
//! operator for every community that names this node as its operator.

mod api;
mod channel;
mod check;
mod config;
mod process;
mod server;
mod shutdown;
mod state;
mod store;

use channel::StreamChannelFactory;
use check::CheckArgs;
use clap::{Parser, Subcommand};
use config::ConfigLoader;
use cps_core::chain::ChainReader;
use cps_core::chain::rpc::RpcChain;
use cps_core::operator::Collaborators;
use cps_core::processors::{LifecycleManager, OperatorEventFeed};
use process::ProcessOperatorFactory;
use server::{build_router, run_server};
use shutdown::{spawn_signal_handler, wait_for_shutdown};
use state::AppState;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use store::FileStoreFactory;
use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;

/// Community Product Server - runs operators for the communities assigned to it
#[derive(Parser, Debug)]
#[command(name = "cps-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "./cps-config.toml")]
    config: PathBuf,

    /// Override the listen address (e.g., 0.0.0.0:3000)
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Override the Ethereum JSON-RPC endpoint
    #[arg(long, env = "ETHEREUM_SERVER")]
    rpc_url: Option<Url>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Inspect a community contract, its token and its members
    Check(CheckArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    init_tracing();

    // Parse command line arguments
    let args = Args::parse();

    if let Some(Command::Check(check_args)) = &args.command {
        return if check_args.quiet {
            check::run(check_args, &mut std::io::sink()).await
        } else {
            check::run(check_args, &mut std::io::stdout()).await
        };
    }

    tracing::info!("Starting cps-server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config_loader = ConfigLoader::new(&args.config, args.listen, args.rpc_url.clone());
    let loaded_config = config_loader.load().map_err(|e| {
        tracing::error!("Failed to load configuration: {}", e);
        e
    })?;
    tracing::info!("Configuration loaded from {:?}", args.config);

    let listen_addr = loaded_config.server.listen;
    let operator_address = loaded_config.manager.operator_address;
    let operator_defaults = loaded_config.manager.operator_defaults.clone();

    // Chain access and operator collaborators
    let chain = RpcChain::new(
        loaded_config.ethereum.rpc_url.clone(),
        loaded_config.ethereum.poll_interval,
    );
    let chain_id = chain.chain_id().await.map_err(|e| {
        tracing::error!("Failed to reach Ethereum node at {}: {}", chain.url(), e);
        e
    })?;
    tracing::info!(chain_id, url = %chain.url(), "Connected to Ethereum node");

    let chain_reader: Arc<dyn ChainReader> = Arc::new(chain.clone());
    let runtime = loaded_config.operator;
    let collaborators = Collaborators {
        channels: Arc::new(StreamChannelFactory::new(
            chain_reader.clone(),
            runtime.streamr_http_url,
        )),
        stores: Arc::new(FileStoreFactory::new(runtime.store_dir)),
        operators: Arc::new(ProcessOperatorFactory::new(
            runtime.command,
            runtime.args,
            runtime.streamr_ws_url,
        )),
    };

    // Shutdown broadcast shared by every background task
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    spawn_signal_handler(shutdown_tx.clone());

    let (manager, handle) =
        LifecycleManager::new(loaded_config.manager, chain_reader, collaborators);
    let manager_task = tokio::spawn(manager.run(shutdown_rx.clone()));

    // Replay history before serving; a failed replay is fatal
    tracing::info!(operator = %operator_address, "Catching up with OperatorChanged events");
    let feed = OperatorEventFeed::new(Arc::new(chain), handle.clone());
    let feed_task = match feed.start(shutdown_rx.clone()).await {
        Ok(task) => task,
        Err(e) => {
            tracing::error!("Failed to replay OperatorChanged events: {}", e);
            shutdown_tx.send_replace(true);
            if let Err(join_error) = manager_task.await {
                tracing::error!("LifecycleManager task failed: {}", join_error);
            }
            return Err(e.into());
        }
    };

    // Build the router
    let state = AppState::new(Arc::new(handle), operator_defaults);
    let router = build_router(state);

    // Run the server
    tracing::info!("Starting HTTP server on {}", listen_addr);
    let result = run_server(router, listen_addr, wait_for_shutdown(shutdown_rx)).await;

    // Stop background tasks, also when the server itself failed
    shutdown_tx.send_replace(true);
    if let Err(e) = feed_task.await {
        tracing::error!("OperatorEventFeed task failed: {}", e);
    }
    if let Err(e) = manager_task.await {
        tracing::error!("LifecycleManager task failed: {}", e);
    }
    tracing::info!("Server shutdown complete");

    result.map_err(Into::into)
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,cps_core=info,reqwest=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
