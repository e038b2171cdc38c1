mod args;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use shoal_meta::{EtcdMetaStore, MemoryMetaStore, MetaStore};
use shoal_scheduler::dispatch::HttpWorkerClient;
use shoal_scheduler::http::{self, AppState};
use shoal_scheduler::metrics::SharedMetrics;
use shoal_scheduler::reconcile::Reconciler;
use shoal_scheduler::store::EntityStore;

use crate::args::{Args, StoreBackend};

/// How long shutdown waits for outstanding worker commands.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let otel_provider = shoal_common::telemetry::init_tracing(
        "shoal-scheduler",
        args.otlp_endpoint.as_deref(),
        args.otlp_token.as_deref(),
        args.log_format,
    );

    let meta: Arc<dyn MetaStore> = match args.store {
        StoreBackend::Etcd => {
            let store = EtcdMetaStore::connect(std::slice::from_ref(&args.etcd_endpoint)).await?;
            info!(endpoint=%args.etcd_endpoint, "connected to etcd");
            Arc::new(store)
        }
        StoreBackend::Memory => {
            warn!("using in-memory store; fleet state is lost on restart");
            Arc::new(MemoryMetaStore::new())
        }
    };

    let config = args.scheduler_config();
    let client = Arc::new(HttpWorkerClient::new(config.command_timeout));
    let metrics = Arc::new(SharedMetrics::default());
    let (reconciler, liveness_events) = Reconciler::new(EntityStore::new(meta), client, config, metrics);
    let reconciler = Arc::new(reconciler);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconcile_task = tokio::spawn(reconciler.clone().run(liveness_events, shutdown_rx));

    let app = http::router(AppState::new(reconciler.clone()));
    let listener = tokio::net::TcpListener::bind(&args.listen_addr).await?;
    info!(addr=%args.listen_addr, "shoal-scheduler listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error=%e, "failed to listen for ctrl-c");
            }
            info!("shutdown requested");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    if let Err(e) = reconcile_task.await {
        warn!(error=%e, "reconcile task panicked");
    }
    if tokio::time::timeout(DRAIN_TIMEOUT, reconciler.dispatcher().wait_idle())
        .await
        .is_err()
    {
        warn!(
            outstanding = reconciler.dispatcher().outstanding(),
            "worker commands still outstanding at exit"
        );
    }

    if let Some(provider) = otel_provider {
        if let Err(e) = provider.shutdown() {
            eprintln!("failed to flush traces: {e}");
        }
    }
    Ok(())
}
