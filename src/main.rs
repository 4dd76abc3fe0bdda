use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use aegis_execution_rs::broker::adapter::BrokerPort;
use aegis_execution_rs::broker::live::LiveBroker;
use aegis_execution_rs::broker::paper::PaperBroker;
use aegis_execution_rs::broker::resilient::ResilientBroker;
use aegis_execution_rs::broker::BrokerRegistry;
use aegis_execution_rs::config::Settings;
use aegis_execution_rs::context::ServiceContext;
use aegis_execution_rs::exit_queue::ExitRetryQueue;
use aegis_execution_rs::guard_state::SystemGuard;
use aegis_execution_rs::persistence::redb_store::RedbStore;
use aegis_execution_rs::persistence::store::PersistenceStore;
use aegis_execution_rs::persistence::wal::WalManager;
use aegis_execution_rs::reconciler::ReconciliationEngine;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    dotenv::dotenv().ok();

    info!("╔═══════════════════════════════════════════════════════════════╗");
    info!("║                  AEGIS EXECUTION CORE                         ║");
    info!("║        Trading safety & order consistency service             ║");
    info!("╚═══════════════════════════════════════════════════════════════╝");

    let settings = Settings::new()?;
    let ctx = Arc::new(ServiceContext::new_system());

    // --- Ledger ---
    std::fs::create_dir_all(&settings.service.data_dir)?;
    let db_path = format!("{}/aegis.redb", settings.service.data_dir);
    let redb = Arc::new(RedbStore::new(&db_path)?);
    let wal = Arc::new(WalManager::new(redb.clone()));
    let store = Arc::new(PersistenceStore::new(redb, wal)?);

    // --- Broker backends behind the call-safety envelope ---
    let paper: Arc<dyn BrokerPort> = Arc::new(ResilientBroker::new(
        Arc::new(PaperBroker::new()),
        &settings.broker,
        ctx.time.clone(),
    ));
    let live: Arc<dyn BrokerPort> = match (&settings.broker.live_base_url, &settings.broker.api_token)
    {
        (Some(base_url), Some(token)) => Arc::new(ResilientBroker::new(
            Arc::new(LiveBroker::new(
                base_url.clone(),
                token.clone(),
                settings.broker.request_timeout_ms,
            )?),
            &settings.broker,
            ctx.time.clone(),
        )),
        _ => {
            info!("No live broker configured — live users route to paper");
            paper.clone()
        }
    };
    let registry = Arc::new(BrokerRegistry::new(paper, live));

    // --- Guards and background safety loops ---
    let guard = Arc::new(SystemGuard::new(store.clone(), ctx.clone())?);

    let reconciler = Arc::new(ReconciliationEngine::new(
        settings.reconcile.clone(),
        store.clone(),
        registry.clone(),
        guard.clone(),
        ctx.clone(),
    ));
    let exit_queue = Arc::new(ExitRetryQueue::new(
        settings.exits.clone(),
        store.clone(),
        registry.clone(),
        ctx.clone(),
    ));

    info!("✅ Core components initialized");

    let reconcile_handle = tokio::spawn(reconciler.clone().run());
    let exit_handle = tokio::spawn(exit_queue.clone().run());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    reconcile_handle.abort();
    exit_handle.abort();

    if guard.is_panic_mode() {
        error!("Shutting down while panic mode is active — review broker state before restart");
    }
    Ok(())
}
