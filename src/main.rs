use std::sync::Arc;
use std::time::Duration;

use bridge_relayer::api::{self, ApiState};
use bridge_relayer::config::Config;
use bridge_relayer::engine::FulfillmentEngine;
use bridge_relayer::ledger::{EvmDestinationLedger, EvmSourceLedger};
use bridge_relayer::orchestrator::Orchestrator;
use bridge_relayer::store::{DepositStore, FileStore, PgStore, RecordStore};

fn main() -> eyre::Result<()> {
    // Install color-eyre for better error reporting
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    init_logging();

    tracing::info!("Starting bridge relayer");

    let config = Config::load()?;
    tracing::info!(
        src_bridge = %config.source.bridge_address,
        dst_bridge = %config.destination.bridge_address,
        dst_chain_tag = ?config.destination.chain_tag,
        "Configuration loaded"
    );

    let backend: Arc<dyn DepositStore> = match &config.store.database_url {
        Some(url) => {
            let store = PgStore::connect(url).await?;
            tracing::info!("Database connected, migrations complete");
            Arc::new(store)
        }
        None => {
            let store = FileStore::open(&config.store.state_path).await?;
            tracing::info!(path = %config.store.state_path.display(), "Using file store");
            Arc::new(store)
        }
    };
    let store = RecordStore::new(backend);

    let source = EvmSourceLedger::new(
        &config.source.rpc_url,
        &config.source.bridge_address,
        config.source.finality_blocks,
    )?;
    let destination = EvmDestinationLedger::new(
        &config.destination.rpc_url,
        &config.destination.bridge_address,
        &config.destination.relayer_key,
        config.destination.confirmations,
        Duration::from_millis(config.source.poll_interval_ms),
    )?;
    tracing::info!(relayer = %destination.relayer_address(), "Ledgers initialized");

    let engine = FulfillmentEngine::new(Arc::new(destination), config.submission_timeout());
    let orchestrator = Orchestrator::new(
        store.clone(),
        Arc::new(source),
        engine,
        config.orchestrator_config(),
    );

    let api_addr = config.relayer.api_bind_addr;
    let api_state = ApiState::new(store);
    tokio::spawn(async move {
        if let Err(e) = api::start_api_server(api_addr, api_state).await {
            tracing::error!(error = %e, "API server error");
        }
    });

    orchestrator.run(wait_for_shutdown_signal()).await?;

    tracing::info!("Bridge relayer stopped");
    Ok(())
}

/// Initialize tracing/logging with structured output
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,bridge_relayer=debug"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(true))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .with(filter)
            .init();
    }
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
