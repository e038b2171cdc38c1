mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use shoal_meta::MemoryMetaStore;
use shoal_scheduler::admin::AdminService;
use shoal_scheduler::metrics::SharedMetrics;
use shoal_scheduler::reconcile::Reconciler;
use shoal_scheduler::store::EntityStore;

use common::{gpu_deployment, test_config, MockWorkerClient};

#[tokio::test]
async fn test_run_loop_reacts_to_deployment_watch_and_stops() {
    let mut config = test_config();
    // Long enough that only the watch can trigger the second pass.
    config.reconcile_interval = Duration::from_secs(3600);

    let store = EntityStore::new(Arc::new(MemoryMetaStore::new()));
    let (reconciler, events) = Reconciler::new(
        store.clone(),
        Arc::new(MockWorkerClient::new()),
        config,
        Arc::new(SharedMetrics::default()),
    );
    let reconciler = Arc::new(reconciler);
    let admin = AdminService::new(reconciler.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(reconciler.clone().run(events, shutdown_rx));

    // Let the immediate first tick pass before declaring anything.
    tokio::time::sleep(Duration::from_millis(100)).await;
    admin.create_deployment(gpu_deployment("qwen", 2, 8192)).await.unwrap();

    let created = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let n = store.list_instances().await.unwrap().len();
            if n == 2 {
                return n;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("instances created after the deployment watch fired");
    assert_eq!(created, 2);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("loop exits on shutdown")
        .unwrap();
}
