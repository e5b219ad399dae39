//! HTTP boundary.
//!
//! - `POST /api/route`: submit a route request, returns the job id
//! - `POST /api/evaluate`: price a supplied route on the newest covering mesh
//! - `GET /api/route/:id`: poll a job
//! - `GET /api/routes/recent`: jobs submitted today (UTC)
//! - `GET /api/meshes`: known meshes and whether they are resident
//! - `GET /health`: liveness and cache counters

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::error::{Result, RouteError};
use crate::evaluation::EvaluationService;
use crate::geo::{BoundingBox, Coordinate};
use crate::mesh::MeshRegistry;
use crate::scheduler::{Disposition, Dispatcher, JobId, MeshHints, RouteRequest};
use crate::status::{JobStatusView, StatusService};
use crate::worker::Route;

#[derive(Clone)]
pub struct ApiState {
    pub dispatcher: Arc<Dispatcher>,
    pub status: StatusService,
    pub evaluator: EvaluationService,
    pub registry: MeshRegistry,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitRouteRequest {
    start: Coordinate,
    end: Coordinate,
    #[serde(default)]
    departure_time: Option<DateTime<Utc>>,
    #[serde(default)]
    start_name: Option<String>,
    #[serde(default)]
    end_name: Option<String>,
    #[serde(default)]
    mesh_id: Option<String>,
    #[serde(default)]
    generated_after: Option<DateTime<Utc>>,
    #[serde(default)]
    force_recalculate: bool,
}

impl From<SubmitRouteRequest> for RouteRequest {
    fn from(body: SubmitRouteRequest) -> Self {
        RouteRequest {
            start: body.start,
            end: body.end,
            departure_time: body.departure_time,
            start_name: body.start_name,
            end_name: body.end_name,
            hints: MeshHints {
                mesh_id: body.mesh_id,
                generated_after: body.generated_after,
            },
            force_recalculate: body.force_recalculate,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EvaluateRouteRequest {
    waypoints: Vec<Coordinate>,
    #[serde(default)]
    departure_time: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitRouteResponse {
    job_id: JobId,
    disposition: Disposition,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MeshResponse {
    id: String,
    created: DateTime<Utc>,
    valid_from: DateTime<Utc>,
    valid_until: DateTime<Utc>,
    bounds: BoundingBox,
    cached: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    meshes: usize,
    cached_meshes: usize,
    cached_bytes: usize,
    mesh_loads: u64,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

/// [`RouteError`] rendered as an HTTP response.
pub struct ApiError(RouteError);

impl From<RouteError> for ApiError {
    fn from(e: RouteError) -> Self {
        Self(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(RouteError::InvalidRequest(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self.0 {
            RouteError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "InvalidRequest"),
            RouteError::JobNotFound(_) | RouteError::MeshNotFound(_) => {
                (StatusCode::NOT_FOUND, "NotFound")
            }
            e if e.is_retryable() => (StatusCode::SERVICE_UNAVAILABLE, "Unavailable"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "Internal"),
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }
        let body = ErrorResponse {
            error: kind.to_string(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/route", post(submit_route_handler))
        .route("/api/route/:id", get(route_status_handler))
        .route("/api/evaluate", post(evaluate_route_handler))
        .route("/api/routes/recent", get(recent_routes_handler))
        .route("/api/meshes", get(list_meshes_handler))
        .layer(cors)
        .with_state(state)
}

/// Serve the API until `shutdown` is cancelled.
pub async fn run_api(addr: SocketAddr, state: ApiState, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| RouteError::Config(format!("failed to bind {addr}: {e}")))?;
    tracing::info!(addr = %addr, "Starting HTTP API");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| RouteError::Internal(format!("HTTP server failed: {e}")))
}

async fn health_handler(State(state): State<ApiState>) -> impl IntoResponse {
    let stats = state.registry.stats().await;
    Json(HealthResponse {
        status: "ok",
        meshes: state.registry.catalog().len().await,
        cached_meshes: stats.cached_meshes,
        cached_bytes: stats.cached_bytes,
        mesh_loads: stats.loads,
    })
}

async fn submit_route_handler(
    State(state): State<ApiState>,
    payload: std::result::Result<Json<SubmitRouteRequest>, JsonRejection>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let Json(body) = payload?;
    let submission = state
        .dispatcher
        .submit_with_disposition(RouteRequest::from(body))
        .await?;
    let code = match submission.disposition {
        Disposition::Reused | Disposition::Nearby => StatusCode::OK,
        Disposition::Created | Disposition::InFlight => StatusCode::ACCEPTED,
    };
    Ok((
        code,
        Json(SubmitRouteResponse {
            job_id: submission.job_id,
            disposition: submission.disposition,
        }),
    ))
}

async fn evaluate_route_handler(
    State(state): State<ApiState>,
    payload: std::result::Result<Json<EvaluateRouteRequest>, JsonRejection>,
) -> std::result::Result<Json<Route>, ApiError> {
    let Json(body) = payload?;
    Ok(Json(state.evaluator.evaluate(body.waypoints, body.departure_time).await?))
}

async fn route_status_handler(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> std::result::Result<Json<JobStatusView>, ApiError> {
    let job_id = JobId::parse(&id).ok_or_else(|| RouteError::JobNotFound(id.clone()))?;
    Ok(Json(state.status.get_status(&job_id).await?))
}

async fn recent_routes_handler(
    State(state): State<ApiState>,
) -> std::result::Result<Json<Vec<JobStatusView>>, ApiError> {
    let midnight = Utc::now()
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|t| t.and_utc())
        .unwrap_or_else(Utc::now);
    Ok(Json(state.status.recent(midnight).await?))
}

async fn list_meshes_handler(State(state): State<ApiState>) -> impl IntoResponse {
    let mut meshes = Vec::new();
    for meta in state.registry.catalog().list().await {
        let cached = state.registry.is_cached(&meta.id).await;
        meshes.push(MeshResponse {
            id: meta.id,
            created: meta.created,
            valid_from: meta.valid_from,
            valid_until: meta.valid_until,
            bounds: meta.bounds,
            cached,
        });
    }
    Json(meshes)
}
