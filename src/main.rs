use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use tunedrop_notifier::channel_layer::{ChannelLayer, InProcessLayer, RedisLayer};
use tunedrop_notifier::config::{Config, LayerBackend};
use tunedrop_notifier::digest::{run_digest_scheduler, DigestScheduler};
use tunedrop_notifier::directory::PgDirectory;
use tunedrop_notifier::dispatch::{run_dispatcher, Dispatcher};
use tunedrop_notifier::email::EmailAdapter;
use tunedrop_notifier::hub::{self, HubState};
use tunedrop_notifier::ingress::{
    run_event_ingress, EventIngress, PgReferralLedger, TypeRegistry,
};
use tunedrop_notifier::prefs::PgPreferenceStore;
use tunedrop_notifier::retry::{run_retry_worker, RetryWorker};
use tunedrop_notifier::store::PgNotificationStore;
use tunedrop_notifier::templates::TemplateRegistry;
use tunedrop_notifier::{db, logging};

/// Drain deadline for in-flight work after the shutdown signal.
const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(30);

fn main() -> Result<()> {
    // Build custom runtime with explicit thread configuration
    let worker_threads = std::env::var("TOKIO_WORKER_THREADS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or_else(num_cpus::get);

    println!("Starting with {} Tokio worker threads", worker_threads);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    runtime.block_on(async {
        // Initialize logging first thing
        logging::setup_logging();

        // Load environment variables from .env file if present
        dotenv::dotenv().ok();

        info!("Starting TuneDrop Notification Service");

        let config = Config::from_env()?;

        let db_pool = db::init_db_pool(&config.database_url).await?;

        let store = Arc::new(PgNotificationStore::new(db_pool.clone()));
        let prefs = Arc::new(PgPreferenceStore::new(db_pool.clone()));
        let directory = Arc::new(PgDirectory::new(db_pool.clone()));
        let ledger = Arc::new(PgReferralLedger::new(db_pool.clone()));
        let templates = Arc::new(TemplateRegistry::with_builtins());
        let types = Arc::new(TypeRegistry::with_builtins());

        let layer: Arc<dyn ChannelLayer> = match config.channel_layer.backend {
            LayerBackend::InProcess => Arc::new(InProcessLayer::new()),
            LayerBackend::Redis => {
                let url = config.channel_layer.redis_url();
                info!("Using redis channel layer at {}", url);
                Arc::new(RedisLayer::connect(&url).await?)
            }
        };

        let email = Arc::new(EmailAdapter::from_config(&config.email)?);

        // Pipeline channels: events in, notifications to dispatch
        let (event_tx, event_rx) = mpsc::channel(1000);
        let (dispatch_tx, dispatch_rx) = mpsc::channel(1000);

        let (shutdown_tx, _) = broadcast::channel(8);

        let ingress = Arc::new(EventIngress::new(
            store.clone(),
            templates.clone(),
            types.clone(),
            directory.clone(),
            ledger,
            dispatch_tx.clone(),
        ));
        let ingress_handle = tokio::spawn(run_event_ingress(event_rx, ingress));

        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            prefs.clone(),
            types,
            layer.clone(),
            email.clone(),
            directory.clone(),
        ));
        let dispatcher_handle = tokio::spawn(run_dispatcher(dispatch_rx, dispatcher));

        let scheduler = Arc::new(DigestScheduler::new(
            store.clone(),
            prefs.clone(),
            templates,
            directory,
            email,
            config.digest.clone(),
        ));
        let digest_handle = tokio::spawn(run_digest_scheduler(scheduler, shutdown_tx.clone()));

        let retry_worker = Arc::new(RetryWorker::new(
            store.clone(),
            config.retry.clone(),
            dispatch_tx,
        ));
        let retry_handle = tokio::spawn(run_retry_worker(retry_worker, shutdown_tx.clone()));

        let hub_state = HubState {
            store,
            prefs,
            layer,
            ws_config: config.websocket.clone(),
            event_tx,
            shutdown: shutdown_tx.clone(),
        };
        let bind_address = config.bind_address.clone();
        let hub_handle = tokio::spawn(async move {
            if let Err(e) = hub::serve(hub_state, &bind_address).await {
                tracing::error!("Websocket hub error: {}", e);
            }
        });

        // Handle graceful shutdown
        signal::ctrl_c().await?;
        info!("Received shutdown signal, shutting down gracefully");

        let _ = shutdown_tx.send(());

        // Wait for the pipeline to drain; abandon after the grace
        // period, the retry worker rescues pending work on next start
        let drained = tokio::time::timeout(
            SHUTDOWN_GRACE,
            async {
                let _ = tokio::join!(
                    hub_handle,
                    ingress_handle,
                    dispatcher_handle,
                    digest_handle,
                    retry_handle
                );
            },
        )
        .await;
        if drained.is_err() {
            warn!("Shutdown grace period elapsed with work in flight");
        }

        info!("Shutdown complete");
        Ok(())
    })
}
