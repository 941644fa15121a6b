//! HTTP API of the sharding sidecar
//!
//! # Endpoints
//!
//! - `POST /sharding/tables` - Create a sharded table (waits up to `options.timeout`)
//! - `GET /sharding/tables/:name` - Progress record of a table
//! - `DELETE /sharding/tables/:name` - Drop a table sharded without a cluster
//! - `DELETE /sharding/tables/:cluster/:name` - Drop a clustered sharded table
//! - `GET /sharding/health` - Health report (503 when unhealthy)
//! - `POST /sharding/recover` - Reset stuck rebalances and run cleanup
//! - `POST /sharding/cleanup` - Run cleanup only
//! - `POST /sharding/rollback/:group` - Roll back an operation group
//! - `GET /metrics` - Prometheus metrics

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use shardline::{
    CleanupManager, CleanupReport, DropRequest, HealthMonitor, HealthReport, Operator,
    RecoveryReport, RollbackReport, ShardRequest, ShardingError, TableRecord,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub operator: Arc<Operator>,
    pub health: Arc<HealthMonitor>,
    pub cleanup: Arc<CleanupManager>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// Build the diagnostics services around an operator
    pub fn new(operator: Arc<Operator>, metrics: Option<PrometheusHandle>) -> Self {
        let config = operator.config();
        let health = HealthMonitor::new(
            operator.client().clone(),
            operator.state().clone(),
            operator.queue().clone(),
            config.health.clone(),
        );
        let cleanup = CleanupManager::new(
            operator.client().clone(),
            operator.state().clone(),
            operator.queue().clone(),
            config.cleanup.clone(),
            config.health.orphan_cluster_age_secs,
        );

        Self {
            health: Arc::new(health),
            cleanup: Arc::new(cleanup),
            operator,
            metrics,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        // Table lifecycle
        .route("/sharding/tables", post(create_table))
        .route("/sharding/tables/:name", get(table_status).delete(drop_local_table))
        .route("/sharding/tables/:cluster/:name", axum::routing::delete(drop_table))
        // Diagnostics
        .route("/sharding/health", get(health))
        .route("/sharding/recover", post(recover))
        .route("/sharding/cleanup", post(cleanup))
        .route("/sharding/rollback/:group", post(rollback))
        .route("/metrics", get(render_metrics))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorDetail,
    status: u16,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    #[serde(rename = "type")]
    error_type: &'static str,
    reason: String,
}

/// Library error rendered as a JSON response
pub struct ApiError(ShardingError);

impl From<ShardingError> for ApiError {
    fn from(err: ShardingError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match &self.0 {
            ShardingError::TableNotFound(_) => StatusCode::NOT_FOUND,
            ShardingError::TableExists(_)
            | ShardingError::ClusterMismatch { .. }
            | ShardingError::AlreadyInitialized(_) => StatusCode::CONFLICT,
            ShardingError::InvalidIdentifier(_)
            | ShardingError::InvalidOptions(_)
            | ShardingError::InsufficientNodes { .. } => StatusCode::BAD_REQUEST,
            ShardingError::WaitTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ShardingError::Query(_) | ShardingError::Transport(_) => StatusCode::BAD_GATEWAY,
            ShardingError::StateNotActive => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorBody {
            error: ErrorDetail {
                error_type: self.0.error_type(),
                reason: self.0.to_string(),
            },
            status: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

async fn create_table(
    State(state): State<AppState>,
    Json(request): Json<ShardRequest>,
) -> Result<(StatusCode, Json<TableRecord>), ApiError> {
    let record = state.operator.create_table(&request).await?;
    let status = if record.is_done() {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(record)))
}

async fn table_status(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<TableRecord>, ApiError> {
    state
        .operator
        .check_table_status(&name)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError(ShardingError::TableNotFound(name)))
}

async fn drop_local_table(
    state: State<AppState>,
    Path(name): Path<String>,
) -> Result<(StatusCode, Json<TableRecord>), ApiError> {
    drop_table(state, Path((String::new(), name))).await
}

async fn drop_table(
    State(state): State<AppState>,
    Path((cluster, name)): Path<(String, String)>,
) -> Result<(StatusCode, Json<TableRecord>), ApiError> {
    let record = state
        .operator
        .drop_table(&DropRequest { cluster, name })
        .await?;
    Ok((StatusCode::ACCEPTED, Json(record)))
}

async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let report = state.health.perform_health_check().await;
    let status = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

async fn recover(State(state): State<AppState>) -> Json<RecoveryReport> {
    Json(state.health.perform_auto_recovery(&state.cleanup).await)
}

async fn cleanup(State(state): State<AppState>) -> Json<CleanupReport> {
    Json(state.cleanup.perform_cleanup().await)
}

async fn rollback(
    State(state): State<AppState>,
    Path(group): Path<String>,
) -> Result<Json<RollbackReport>, ApiError> {
    Ok(Json(state.operator.rollback_operation_group(&group).await?))
}

async fn render_metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
