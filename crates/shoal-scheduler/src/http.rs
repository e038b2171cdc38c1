use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use shoal_common::HeartbeatReport;

use crate::admin::{AdminService, DeploymentUpdate, InstanceFilter, NewDeployment};
use crate::error::SchedulerError;
use crate::reconcile::Reconciler;
use crate::util::now_ms;

#[derive(Clone)]
pub struct AppState {
    pub admin: AdminService,
    pub reconciler: Arc<Reconciler>,
}

impl AppState {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self {
            admin: AdminService::new(reconciler.clone()),
            reconciler,
        }
    }
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

/// `SchedulerError` rendered as a JSON error body.
pub struct ApiError(SchedulerError);

impl From<SchedulerError> for ApiError {
    fn from(e: SchedulerError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            SchedulerError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            SchedulerError::AlreadyExists { .. } => (StatusCode::CONFLICT, "already_exists"),
            SchedulerError::InvalidDeployment(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            SchedulerError::Contended(_) => (StatusCode::CONFLICT, "contended"),
            SchedulerError::Transition(_) => (StatusCode::CONFLICT, "illegal_transition"),
            SchedulerError::Store(_) => (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable"),
        };
        if status.is_server_error() {
            warn!(error=%self.0, "request failed");
        }
        let body = ErrorResponse {
            error: ErrorDetail {
                code,
                message: self.0.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/heartbeats", post(ingest_heartbeat))
        .route("/workers", get(list_workers).post(register_worker))
        .route("/workers/:id", get(get_worker))
        .route("/instances", get(list_instances))
        .route("/instances/:id", get(get_instance))
        .route("/deployments", get(list_deployments).post(create_deployment))
        .route(
            "/deployments/:id",
            get(get_deployment)
                .patch(update_deployment)
                .delete(delete_deployment),
        );

    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .nest("/v1", api)
        .with_state(state)
}

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

pub async fn metrics(State(st): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        st.reconciler.metrics().render(),
    )
}

#[derive(Serialize)]
struct HeartbeatAck {
    worker_id: String,
    liveness: shoal_common::WorkerLiveness,
}

async fn ingest_heartbeat(
    State(st): State<AppState>,
    Json(report): Json<HeartbeatReport>,
) -> ApiResult<HeartbeatAck> {
    let worker = st.reconciler.ingest_heartbeat(&report, now_ms()).await?;
    Ok(Json(HeartbeatAck {
        worker_id: worker.worker_id,
        liveness: worker.liveness,
    }))
}

async fn list_workers(State(st): State<AppState>) -> ApiResult<Vec<shoal_common::Worker>> {
    Ok(Json(st.admin.list_workers().await?))
}

async fn get_worker(State(st): State<AppState>, Path(id): Path<String>) -> ApiResult<shoal_common::Worker> {
    Ok(Json(st.admin.get_worker(&id).await?))
}

#[derive(Deserialize)]
struct RegisterWorker {
    worker_id: String,
    address: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

async fn register_worker(
    State(st): State<AppState>,
    Json(req): Json<RegisterWorker>,
) -> Result<(StatusCode, Json<shoal_common::Worker>), ApiError> {
    let worker = st
        .admin
        .register_worker(&req.worker_id, &req.address, req.labels)
        .await?;
    Ok((StatusCode::CREATED, Json(worker)))
}

async fn list_instances(
    State(st): State<AppState>,
    Query(filter): Query<InstanceFilter>,
) -> ApiResult<Vec<shoal_common::Instance>> {
    Ok(Json(st.admin.list_instances(&filter).await?))
}

async fn get_instance(State(st): State<AppState>, Path(id): Path<String>) -> ApiResult<shoal_common::Instance> {
    Ok(Json(st.admin.get_instance(&id).await?))
}

async fn list_deployments(State(st): State<AppState>) -> ApiResult<Vec<shoal_common::Deployment>> {
    Ok(Json(st.admin.list_deployments().await?))
}

async fn create_deployment(
    State(st): State<AppState>,
    Json(req): Json<NewDeployment>,
) -> Result<(StatusCode, Json<shoal_common::Deployment>), ApiError> {
    let dep = st.admin.create_deployment(req).await?;
    Ok((StatusCode::CREATED, Json(dep)))
}

async fn get_deployment(State(st): State<AppState>, Path(id): Path<String>) -> ApiResult<shoal_common::Deployment> {
    Ok(Json(st.admin.get_deployment(&id).await?))
}

async fn update_deployment(
    State(st): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<DeploymentUpdate>,
) -> ApiResult<shoal_common::Deployment> {
    Ok(Json(st.admin.update_deployment(&id, update).await?))
}

async fn delete_deployment(State(st): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    st.admin.delete_deployment(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}
