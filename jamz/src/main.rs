mod server;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::info;

use jamz_api::{SignalingContext, SignalingGateway};
use jamz_core::{
    bootstrap::{load_config_from, log_summary},
    logging,
    service::SessionStateStore,
};
use jamz_sfu::{fatal_channel, MediaWorkerPool};

use server::JamzServer;

#[derive(Parser, Debug)]
#[command(name = "jamz")]
#[command(about = "Group listening session coordinator", long_about = None)]
struct Args {
    /// Path to a YAML config file
    #[arg(long, env = "JAMZ_CONFIG_PATH")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load and validate configuration
    let config = load_config_from(args.config.as_deref())?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Jamz server starting...");
    log_summary(&config);

    // 3. Start media workers. Any startup failure aborts the process.
    let pool_config = config
        .media
        .to_pool_config()
        .map_err(|e| anyhow::anyhow!("Invalid media configuration: {e}"))?;
    let (fatal_tx, fatal_rx) = fatal_channel();
    let pool = MediaWorkerPool::create_workers(pool_config, fatal_tx)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start media workers: {e}"))?;
    info!(workers = pool.workers().len(), "Media worker pool ready");

    // 4. Session services and signaling
    let store = Arc::new(SessionStateStore::new());
    let context = Arc::new(SignalingContext::from_config(&config));
    let gateway = SignalingGateway::new(&config, pool.clone(), store, context)
        .map_err(|e| anyhow::anyhow!("Invalid rate limit configuration: {e}"))?;

    // 5. Serve until a shutdown signal or a worker death
    JamzServer::new(config, pool, Arc::new(gateway), fatal_rx)
        .start()
        .await
}
