//! HTTP/WebSocket surface: the axum router wiring every external endpoint to
//! the service layer underneath it. Mirrors the internal API's router/state
//! split, just with the admission gateway standing in for the worker auth
//! middleware.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::{ConnectInfo, Path, Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowOrigin, CorsLayer};
use uuid::Uuid;

use crate::admission::AdmissionGateway;
use crate::broker::Broker;
use crate::domain::{CodeSubmission, ExecutionResult, JobStatus};
use crate::error::AppError;
use crate::result_service::{CacheStats, ResultService};
use crate::stream::StreamService;
use crate::submission::SubmissionService;
use crate::token::TokenService;

/// Everything a request handler needs, grouped the way the original
/// service's gateway groups its own service handles.
#[derive(Clone)]
pub struct ApiState {
    pub submission: Arc<SubmissionService>,
    pub results: Arc<ResultService>,
    pub tokens: Arc<TokenService>,
    pub stream: Arc<StreamService>,
    pub admission: Arc<AdmissionGateway>,
    pub broker: Arc<dyn Broker>,
}

pub fn router(state: ApiState, allowed_origins: Vec<String>) -> Router {
    let cors = build_cors_layer(allowed_origins);

    Router::new()
        .route("/submit_code", post(submit_code))
        .route("/get_result/{job_id}", get(get_result))
        .route("/ws-token", post(issue_ws_token))
        .route("/health", get(health))
        .route("/cache/stats", get(cache_stats))
        .route("/cache/{job_id}", delete(evict_cache_entry))
        .route("/ws/jobs/{job_id}", get(stream_job))
        .layer(cors)
        .with_state(state)
}

fn build_cors_layer(allowed_origins: Vec<String>) -> CorsLayer {
    if allowed_origins.iter().any(|o| o == "*") {
        return CorsLayer::permissive();
    }
    let origins: Vec<_> = allowed_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    CorsLayer::new().allow_origin(AllowOrigin::list(origins))
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn client_ip(headers: &HeaderMap, peer: std::net::SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| peer.ip().to_string())
}

fn presented_api_key(headers: &HeaderMap) -> Option<&str> {
    headers.get("x-api-key").and_then(|v| v.to_str().ok())
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    job_id: Uuid,
    message: &'static str,
}

async fn submit_code(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<std::net::SocketAddr>,
    headers: HeaderMap,
    Json(submission): Json<CodeSubmission>,
) -> Result<Json<SubmitResponse>, AppError> {
    let ip = client_ip(&headers, addr);
    let api_key = presented_api_key(&headers);
    let job_id = state
        .submission
        .submit(&ip, api_key, submission, now_unix())
        .await?;
    Ok(Json(SubmitResponse {
        job_id,
        message: "Job queued",
    }))
}

#[derive(Debug, Serialize)]
struct ResultResponse {
    job_id: Uuid,
    status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<ExecutionResult>,
    /// The stored `result` text verbatim, present only when it couldn't be
    /// decoded into the structured form (spec §4.5: "on decode failure,
    /// pass through the string").
    #[serde(skip_serializing_if = "Option::is_none")]
    result_raw: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    created_at: Option<i64>,
    completed_at: Option<i64>,
}

/// Always answers 200, including for an absent/expired record — an unknown
/// job id is the documented `unknown` status, not an error (spec §6).
async fn get_result(
    State(state): State<ApiState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<ResultResponse>, AppError> {
    match state.results.get_result(job_id).await? {
        Some(job) => Ok(Json(ResultResponse {
            job_id: job.id,
            status: job.status,
            result: job.result,
            result_raw: job.raw_result,
            error: job.error,
            created_at: Some(job.created_at),
            completed_at: job.completed_at,
        })),
        None => Ok(Json(ResultResponse {
            job_id,
            status: JobStatus::Unknown,
            result: None,
            result_raw: None,
            error: None,
            created_at: None,
            completed_at: None,
        })),
    }
}

#[derive(Debug, Deserialize)]
struct WsTokenRequest {
    job_id: Uuid,
}

#[derive(Debug, Serialize)]
struct WsTokenResponse {
    token: String,
    expires_in: u64,
}

/// Issues a stream token for a job. The caller must present the same API
/// key that the admission gateway accepts for submissions — a stream token
/// is only ever handed to someone who could have submitted the job in the
/// first place.
async fn issue_ws_token(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<WsTokenRequest>,
) -> Result<Json<WsTokenResponse>, AppError> {
    state.admission.check_api_key(presented_api_key(&headers))?;
    let token = state.tokens.issue(req.job_id)?;
    Ok(Json(WsTokenResponse {
        token,
        expires_in: crate::token::TOKEN_TTL_SECS,
    }))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    broker: &'static str,
}

async fn health(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<HealthResponse>, AppError> {
    state.admission.check_api_key(presented_api_key(&headers))?;
    let broker = if state.broker.ping().await.is_ok() {
        "ok"
    } else {
        "unreachable"
    };
    Ok(Json(HealthResponse {
        status: "ok",
        broker,
    }))
}

/// Admin observability on the result cache; gated behind the same API key
/// check as everything else, there being no separate admin credential in
/// the configured environment (spec §6 lists only `API_KEY`).
async fn cache_stats(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Json<CacheStats>, AppError> {
    state.admission.check_api_key(presented_api_key(&headers))?;
    Ok(Json(state.results.cache_stats().await))
}

async fn evict_cache_entry(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(job_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.admission.check_api_key(presented_api_key(&headers))?;
    state.results.invalidate(job_id).await;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct StreamQuery {
    token: Option<String>,
}

/// Upgrades to a WebSocket and hands the connection to the Stream Service.
/// The token can arrive as a query parameter since browsers can't attach
/// custom headers to a WebSocket handshake.
async fn stream_job(
    State(state): State<ApiState>,
    Path(job_id): Path<Uuid>,
    Query(query): Query<StreamQuery>,
    ConnectInfo(addr): ConnectInfo<std::net::SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let ip = client_ip(&headers, addr);
    let token = query.token;

    ws.on_upgrade(move |socket| async move {
        state
            .stream
            .handle_socket(socket, job_id, ip, token, now_unix)
            .await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ip_prefers_x_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "9.9.9.9, 1.1.1.1".parse().unwrap());
        let addr: std::net::SocketAddr = "127.0.0.1:1234".parse().unwrap();
        assert_eq!(client_ip(&headers, addr), "9.9.9.9");
    }

    #[test]
    fn client_ip_falls_back_to_the_peer_address() {
        let headers = HeaderMap::new();
        let addr: std::net::SocketAddr = "5.5.5.5:1234".parse().unwrap();
        assert_eq!(client_ip(&headers, addr), "5.5.5.5");
    }

    #[test]
    fn presented_api_key_reads_the_x_api_key_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "abc123".parse().unwrap());
        assert_eq!(presented_api_key(&headers), Some("abc123"));
    }
}
