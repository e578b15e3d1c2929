//! HTTP dispatch layer: maps requests onto orchestrator operations and typed results
//! onto status codes.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Path, State},
    http::{HeaderMap, HeaderName, Method, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::CorsLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::warn;

use kibutsu_common::{
    OperationResult, ProjectDescriptor, ProjectSummary, ProjectView, ServiceSpec, ServiceSummary,
};
use kibutsu_orchestrator::{OperationContext, Orchestrator};

pub mod config;
pub mod error;
pub mod events;
pub mod logs;

pub use config::ServerConfig;
pub use error::ApiError;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Extra time the transport timeout allows beyond the operation deadline, so the
/// operation's own 504 is what clients see.
const TIMEOUT_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub config: Arc<ServerConfig>,
    /// Cancelled on server shutdown; every request context is a child of it.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator, config: ServerConfig) -> Self {
        Self {
            orchestrator,
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
        }
    }

    /// Context carrying the request id assigned by the request-id layer.
    pub fn context(&self, headers: &HeaderMap) -> OperationContext {
        let ctx = match headers.get(REQUEST_ID_HEADER).and_then(|v| v.to_str().ok()) {
            Some(id) => OperationContext::with_request_id(id),
            None => OperationContext::new(),
        };
        ctx.with_cancellation(self.shutdown.child_token())
    }

    /// Context for a bounded request: its id plus the configured deadline.
    pub fn bounded_context(&self, headers: &HeaderMap) -> OperationContext {
        self.context(headers).with_timeout(self.config.request_timeout)
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct UpRequest {
    pub services: Vec<ServiceSpec>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct DownRequest {
    #[serde(default)]
    pub keep_volumes: bool,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ScaleRequest {
    pub replicas: u32,
}

pub fn create_app(state: AppState) -> Router {
    let request_timeout = state.config.request_timeout + TIMEOUT_GRACE;
    let cors = CorsLayer::new()
        .allow_origin(state.config.cors_origin.clone())
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            HeaderName::from_static(REQUEST_ID_HEADER),
        ])
        .expose_headers([HeaderName::from_static(REQUEST_ID_HEADER)]);

    let bounded = Router::new()
        .route("/health", get(health_handler))
        .route("/api/compose/projects", get(list_projects_handler))
        .route("/api/compose/projects/:project", get(get_project_handler))
        .route(
            "/api/compose/projects/:project/services",
            get(list_services_handler),
        )
        .route("/api/compose/projects/:project/up", post(up_handler))
        .route("/api/compose/projects/:project/down", post(down_handler))
        .route(
            "/api/compose/projects/:project/services/:service/scale",
            post(scale_handler),
        )
        .layer(TimeoutLayer::new(request_timeout));

    // Long-lived; these end when the client goes away
    let streaming = Router::new()
        .route("/api/compose/projects/:project/logs", get(logs::logs_handler))
        .route("/api/events", get(events::events_handler));

    let request_id = HeaderName::from_static(REQUEST_ID_HEADER);
    bounded
        .merge(streaming)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::new(request_id.clone(), MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::new(request_id))
                .layer(CatchPanicLayer::new())
                .layer(cors),
        )
        .with_state(state)
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let timestamp = chrono::Utc::now().to_rfc3339();
    match state.orchestrator.engine().ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "healthy",
                "timestamp": timestamp,
            })),
        ),
        Err(e) => {
            warn!("Health check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "status": "unhealthy",
                    "error": e.to_string(),
                    "timestamp": timestamp,
                })),
            )
        }
    }
}

async fn list_projects_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<ProjectSummary>>, ApiError> {
    let ctx = state.bounded_context(&headers);
    let projects = ctx.run(state.orchestrator.list()).await?;
    Ok(Json(projects))
}

async fn get_project_handler(
    State(state): State<AppState>,
    Path(project): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ProjectView>, ApiError> {
    let ctx = state.bounded_context(&headers);
    let view = ctx.run(state.orchestrator.get(&project)).await?;
    Ok(Json(view))
}

async fn list_services_handler(
    State(state): State<AppState>,
    Path(project): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Vec<ServiceSummary>>, ApiError> {
    let ctx = state.bounded_context(&headers);
    let services = ctx.run(state.orchestrator.list_services(&project)).await?;
    Ok(Json(services))
}

async fn up_handler(
    State(state): State<AppState>,
    Path(project): Path<String>,
    headers: HeaderMap,
    body: Result<Json<UpRequest>, JsonRejection>,
) -> Result<Json<OperationResult>, ApiError> {
    let Json(request) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let descriptor = ProjectDescriptor {
        name: project,
        services: request.services,
    };
    let ctx = state.bounded_context(&headers);
    let result = state.orchestrator.up(&ctx, &descriptor).await?;
    Ok(Json(result.into_result()?))
}

async fn down_handler(
    State(state): State<AppState>,
    Path(project): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<OperationResult>, ApiError> {
    // The body is optional; an empty one removes volumes too
    let request: DownRequest = if body.iter().all(u8::is_ascii_whitespace) {
        DownRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?
    };
    let ctx = state.bounded_context(&headers);
    let result = state
        .orchestrator
        .down(&ctx, &project, request.keep_volumes)
        .await?;
    Ok(Json(result.into_result()?))
}

async fn scale_handler(
    State(state): State<AppState>,
    Path((project, service)): Path<(String, String)>,
    headers: HeaderMap,
    body: Result<Json<ScaleRequest>, JsonRejection>,
) -> Result<Json<OperationResult>, ApiError> {
    let Json(request) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let ctx = state.bounded_context(&headers);
    let result = state
        .orchestrator
        .scale(&ctx, &project, &service, request.replicas)
        .await?;
    Ok(Json(result.into_result()?))
}
