mod common;

use serde_json::{json, Value};

use shoal_scheduler::http::{router, AppState};

use common::{inventory, test_config, Harness};

async fn serve(h: &Harness) -> String {
    let app = router(AppState::new(h.reconciler.clone()));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn test_deployment_crud() {
    let h = Harness::new(test_config());
    let base = serve(&h).await;
    let http = reqwest::Client::new();

    let body = json!({
        "deployment_id": "qwen",
        "model_name": "Qwen/Qwen2.5-7B-Instruct",
        "model_source": "hugging_face",
        "replicas": 2,
        "resources": {"gpu_count": 1, "gpu_memory_mb": 8192}
    });
    let resp = http.post(format!("{base}/v1/deployments")).json(&body).send().await.unwrap();
    assert_eq!(resp.status(), 201);
    let created: Value = resp.json().await.unwrap();
    assert_eq!(created["spec_generation"], 1);
    assert_eq!(created["desired_state"], "running");

    let resp = http.post(format!("{base}/v1/deployments")).json(&body).send().await.unwrap();
    assert_eq!(resp.status(), 409);
    let err: Value = resp.json().await.unwrap();
    assert_eq!(err["error"]["code"], "already_exists");

    let resp = http
        .patch(format!("{base}/v1/deployments/qwen"))
        .json(&json!({"replicas": 4}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let updated: Value = resp.json().await.unwrap();
    assert_eq!(updated["replicas"], 4);
    assert_eq!(updated["spec_generation"], 1);

    let list: Vec<Value> = http
        .get(format!("{base}/v1/deployments"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list.len(), 1);

    let resp = http.delete(format!("{base}/v1/deployments/qwen")).send().await.unwrap();
    assert_eq!(resp.status(), 204);
    let resp = http.get(format!("{base}/v1/deployments/qwen")).send().await.unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_invalid_deployment_is_bad_request() {
    let h = Harness::new(test_config());
    let base = serve(&h).await;

    let resp = reqwest::Client::new()
        .post(format!("{base}/v1/deployments"))
        .json(&json!({
            "deployment_id": "Bad_Name",
            "model_name": "m",
            "model_source": "local"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let err: Value = resp.json().await.unwrap();
    assert_eq!(err["error"]["code"], "invalid_request");
}

#[tokio::test]
async fn test_heartbeat_and_read_accessors() {
    let h = Harness::new(test_config());
    let base = serve(&h).await;
    let http = reqwest::Client::new();

    let report = json!({
        "worker_id": "gpu-a",
        "address": "http://gpu-a.test:10150",
        "inventory": inventory(&[16384]),
        "labels": {"zone": "a"}
    });
    let resp = http.post(format!("{base}/v1/heartbeats")).json(&report).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let ack: Value = resp.json().await.unwrap();
    assert_eq!(ack["liveness"], "online");

    let workers: Vec<Value> = http
        .get(format!("{base}/v1/workers"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0]["labels"]["zone"], "a");

    h.admin
        .create_deployment(common::gpu_deployment("qwen", 1, 8192))
        .await
        .unwrap();
    h.pass(h.t0).await;

    let instances: Vec<Value> = http
        .get(format!("{base}/v1/instances?deployment_id=qwen&state=starting"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0]["worker_id"], "gpu-a");
    assert_eq!(instances[0]["name"], "qwen-0");

    let none: Vec<Value> = http
        .get(format!("{base}/v1/instances?worker_id=gpu-b"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(none.is_empty());

    let resp = http.get(format!("{base}/v1/workers/gpu-z")).send().await.unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_worker_registration() {
    let h = Harness::new(test_config());
    let base = serve(&h).await;
    let http = reqwest::Client::new();

    let body = json!({"worker_id": "gpu-a", "address": "http://gpu-a.test:10150"});
    let resp = http.post(format!("{base}/v1/workers")).json(&body).send().await.unwrap();
    assert_eq!(resp.status(), 201);
    let worker: Value = resp.json().await.unwrap();
    assert_eq!(worker["liveness"], "unknown");

    let resp = http.post(format!("{base}/v1/workers")).json(&body).send().await.unwrap();
    assert_eq!(resp.status(), 409);
}

#[tokio::test]
async fn test_health_and_metrics() {
    let h = Harness::new(test_config());
    let base = serve(&h).await;
    let http = reqwest::Client::new();

    let resp = http.get(format!("{base}/healthz")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "ok");

    h.pass(h.t0).await;
    let text = http
        .get(format!("{base}/metrics"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(text.contains("# TYPE shoal_scheduler_placements_total counter"));
    assert!(text.contains("shoal_scheduler_heartbeats_total 0"));
}
