use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::Utc;
use ebb_core::protocol::{PullRequest, PullResponse, PushRequest, PushResponse};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::{extract_bearer_token, AuthenticatedIdentity, StaticTokenAuth};
use crate::authority::Authority;
use crate::config::AppConfig;
use crate::error::AppError;
use crate::rate_limit::{
    identity_fingerprint, EndpointRateLimiter, RateLimitMetricsSnapshot, SyncOperation,
};

/// Largest push batch accepted in one request
const MAX_PUSH_OPS: usize = 1_000;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub authority: Arc<Authority>,
    auth: Arc<StaticTokenAuth>,
    endpoint_rate_limiter: Arc<EndpointRateLimiter>,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, authority: Arc<Authority>) -> Self {
        Self {
            auth: Arc::new(StaticTokenAuth::new(config.api_tokens.clone())),
            endpoint_rate_limiter: Arc::new(EndpointRateLimiter::from_config(config.as_ref())),
            authority,
            config,
        }
    }
}

pub fn app_router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/sync/push", post(push))
        .route("/sync/pull", post(pull))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/v1", protected_routes)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
    rate_limit: RateLimitMetricsSnapshot,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
        rate_limit: state.endpoint_rate_limiter.metrics_snapshot().await,
    })
}

async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = extract_bearer_token(request.headers())?;
    let identity = state.auth.verify(token)?;
    request.extensions_mut().insert(identity);
    Ok(next.run(request).await)
}

async fn push(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedIdentity>,
    Json(request): Json<PushRequest>,
) -> Result<Json<PushResponse>, AppError> {
    state
        .endpoint_rate_limiter
        .check(SyncOperation::Push, &caller.identity)
        .await?;
    validate_scope(&request.scope, &request.device_id)?;
    if request.ops.len() > MAX_PUSH_OPS {
        return Err(AppError::bad_request(format!(
            "push batch exceeds {MAX_PUSH_OPS} operations"
        )));
    }

    let identity_hash = identity_fingerprint(&caller.identity);
    let op_count = request.ops.len();
    let authority = state.authority.clone();
    let response = tokio::task::spawn_blocking(move || authority.push(&caller.identity, &request))
        .await
        .map_err(|error| AppError::internal(format!("push task failed: {error}")))??;

    let rejected = response
        .results
        .iter()
        .filter(|result| !result.accepted)
        .count();
    tracing::info!(
        endpoint = "sync_push",
        identity = identity_hash,
        ops = op_count,
        rejected,
        "Applied push batch"
    );
    Ok(Json(response))
}

async fn pull(
    State(state): State<AppState>,
    Extension(caller): Extension<AuthenticatedIdentity>,
    Json(request): Json<PullRequest>,
) -> Result<Json<PullResponse>, AppError> {
    state
        .endpoint_rate_limiter
        .check(SyncOperation::Pull, &caller.identity)
        .await?;
    validate_scope(&request.scope, &request.device_id)?;

    let identity_hash = identity_fingerprint(&caller.identity);
    let max_limit = state.config.pull_max_limit;
    let authority = state.authority.clone();
    let response =
        tokio::task::spawn_blocking(move || authority.pull(&caller.identity, &request, max_limit))
            .await
            .map_err(|error| AppError::internal(format!("pull task failed: {error}")))??;

    tracing::debug!(
        endpoint = "sync_pull",
        identity = identity_hash,
        changes = response.changes.len(),
        next_cursor = response.next_cursor,
        has_more = response.has_more,
        "Served pull page"
    );
    Ok(Json(response))
}

fn validate_scope(scope: &str, device_id: &str) -> Result<(), AppError> {
    if scope.trim().is_empty() || scope.len() > 128 {
        return Err(AppError::bad_request("scope must be 1-128 characters"));
    }
    if device_id.trim().is_empty() || device_id.len() > 128 {
        return Err(AppError::bad_request("device_id must be 1-128 characters"));
    }
    Ok(())
}
