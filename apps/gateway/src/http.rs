use crate::config::JwtSettings;
use axum::Json;
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use dispatch::controller::{
    ApiKeyIssueRequest, ApiKeyIssueResponse, Controller, CreateJobRequest, CreateJobResponse,
    CreditAdjustRequest, CreditsResponse, EstimateRequest, EstimateResponse, JobHistoryEntry,
    JobResultResponse, JobStatusResponse, UploadTicketRequest, UploadTicketResponse,
};
use dispatch::store::UserRow;
use dispatch::{Error, auth};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

pub struct AppState {
    pub controller: Controller,
    pub jwt: JwtSettings,
}

/// Error-kind to HTTP status translation; the body carries the message the
/// way clients expect it.
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match &self.0 {
            Error::Auth(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            Error::Forbidden(msg) => (StatusCode::FORBIDDEN, msg.clone()),
            Error::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            Error::Validation(msg) | Error::Policy(msg) | Error::State(msg) => {
                (StatusCode::BAD_REQUEST, msg.clone())
            }
            Error::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            Error::Internal(err) => {
                tracing::error!(err = %err, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(serde_json::json!({ "detail": detail }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Resolves the caller from `X-API-Key` or a bearer token.
async fn current_user(state: &AppState, headers: &HeaderMap) -> Result<UserRow, Error> {
    if let Some(api_key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return auth::authenticate_api_key(state.controller.db(), api_key)
            .await?
            .ok_or_else(|| Error::auth("Invalid API key"));
    }

    if let Some(bearer) = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        let user_id = auth::decode_access_token(bearer, &state.jwt.secret)?;
        if let Some(user) = state.controller.db().user_by_id(user_id).await? {
            return Ok(user);
        }
    }

    Err(Error::auth("Not authenticated"))
}

pub fn router(state: Arc<AppState>) -> axum::Router {
    axum::Router::new()
        .route("/healthz", get(healthz))
        .route("/auth", post(auth_token))
        .route("/estimate", post(estimate))
        .route("/upload", post(upload))
        .route("/jobs/create", post(create_job))
        .route("/jobs/status/{id}", get(job_status))
        .route("/jobs/result/{id}", get(job_result))
        .route("/jobs/cancel/{id}", post(cancel_job))
        .route("/jobs/history", get(job_history))
        .route("/credits", get(credits))
        .route("/admin/credits/adjust", post(admin_adjust))
        .route("/admin/users/api-keys", post(admin_api_keys))
        .route("/webhooks/lemon", post(lemon_webhook))
        .route("/ws/jobs/{id}", get(job_ws))
        .with_state(state)
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthRequest {
    api_key: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AuthResponse {
    access_token: String,
    token_type: &'static str,
}

async fn auth_token(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AuthRequest>,
) -> ApiResult<Json<AuthResponse>> {
    let user = auth::authenticate_api_key(state.controller.db(), &req.api_key)
        .await?
        .ok_or_else(|| Error::auth("Invalid API key"))?;
    let access_token = auth::create_access_token(user.id, &state.jwt.secret, state.jwt.ttl_secs)
        .map_err(Error::from)?;
    Ok(Json(AuthResponse {
        access_token,
        token_type: "bearer",
    }))
}

async fn estimate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<EstimateRequest>,
) -> ApiResult<Json<EstimateResponse>> {
    let user = current_user(&state, &headers).await?;
    Ok(Json(state.controller.estimate(&user, &req).await?))
}

async fn upload(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<UploadTicketRequest>,
) -> ApiResult<Json<UploadTicketResponse>> {
    let user = current_user(&state, &headers).await?;
    Ok(Json(state.controller.upload_ticket(&user, &req).await?))
}

async fn create_job(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateJobRequest>,
) -> ApiResult<Json<CreateJobResponse>> {
    let user = current_user(&state, &headers).await?;
    Ok(Json(state.controller.create(&user, &req).await?))
}

async fn job_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<JobStatusResponse>> {
    let user = current_user(&state, &headers).await?;
    Ok(Json(state.controller.status(&user, id).await?))
}

async fn job_result(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<JobResultResponse>> {
    let user = current_user(&state, &headers).await?;
    Ok(Json(state.controller.result(&user, id).await?))
}

async fn cancel_job(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let user = current_user(&state, &headers).await?;
    state.controller.cancel(&user, id).await?;
    Ok(Json(serde_json::json!({ "status": "cancel_requested" })))
}

#[derive(Debug, Serialize)]
struct HistoryResponse {
    jobs: Vec<JobHistoryEntry>,
}

async fn job_history(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<HistoryResponse>> {
    let user = current_user(&state, &headers).await?;
    let jobs = state.controller.history(&user).await?;
    Ok(Json(HistoryResponse { jobs }))
}

async fn credits(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Json<CreditsResponse>> {
    let user = current_user(&state, &headers).await?;
    Ok(Json(state.controller.credits(&user).await?))
}

async fn admin_adjust(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreditAdjustRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let user = current_user(&state, &headers).await?;
    state.controller.admin_adjust_credits(&user, &req).await?;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

async fn admin_api_keys(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ApiKeyIssueRequest>,
) -> ApiResult<Json<ApiKeyIssueResponse>> {
    let user = current_user(&state, &headers).await?;
    Ok(Json(state.controller.admin_issue_api_key(&user, &req).await?))
}

async fn lemon_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<serde_json::Value>> {
    let signature = headers
        .get("x-signature")
        .or_else(|| headers.get("x-lemon-squeezy-signature"))
        .and_then(|v| v.to_str().ok());
    let ack = state
        .controller
        .ingest_payment_webhook(&body, signature)
        .await?;
    Ok(Json(serde_json::json!({ "status": ack })))
}

/// Long-lived progress stream. Events published before the subscription is
/// set up are missed by design; clients reconcile via the status endpoint.
async fn job_ws(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| stream_job_progress(state, id, socket))
}

async fn stream_job_progress(state: Arc<AppState>, job_id: Uuid, mut socket: WebSocket) {
    let mut updates = match state.controller.bus().subscribe_progress(job_id).await {
        Ok(stream) => stream,
        Err(err) => {
            tracing::warn!(err = %err, %job_id, "progress subscription failed");
            let _ = socket.close().await;
            return;
        }
    };

    loop {
        tokio::select! {
            update = updates.next() => {
                match update {
                    Some(payload) => {
                        if socket.send(Message::Text(payload.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = socket.recv() => {
                // Any close/error from the client tears the stream down.
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}
