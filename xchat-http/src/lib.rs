//! HTTP surface of the chat kernel.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;
use xchat_chart::ChartError;
use xchat_core::{ChartRequest, ChatService, Feedback, ServiceError};
use xchat_jobs::JobError;
use xchat_store::{GatewayError, InMemoryDataSource};
use xchat_types::{ChatMessage, ChatRequest, FreshnessToken, JobId, QueryDescriptor, Row};

pub const USER_ID_HEADER: &str = "x-user-id";

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ChatService>,
    /// Writable table store, when the gateway is the in-memory one.
    pub tables: Option<Arc<InMemoryDataSource>>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/data/fetch", post(data_fetch))
        .route("/v1/data/sources/:name", put(replace_source))
        .route("/v1/cache/stats", get(cache_stats))
        .route("/v1/charts/generate", post(generate_chart))
        .route("/v1/chat/submit", post(chat_submit))
        .route("/v1/chat/status/:request_id", get(chat_status))
        .route("/v1/chat/result/:request_id", get(chat_result))
        .route("/v1/feedback", post(feedback))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Error body: `{"error": <Kind>, "message": ...}`.
#[derive(Debug)]
pub enum ApiError {
    Service(ServiceError),
    InvalidDescriptor(String),
    InvalidRequest(String),
    NotFound(String),
    Unsupported(String),
}

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        ApiError::Service(e)
    }
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Service(e) => match e {
                ServiceError::Job(JobError::NotFound(_)) => (StatusCode::NOT_FOUND, "NotFound"),
                ServiceError::Job(JobError::NotReady { .. }) => (StatusCode::ACCEPTED, "NotReady"),
                ServiceError::Job(JobError::InvalidTransition { .. }) => (StatusCode::CONFLICT, "InvalidTransition"),
                ServiceError::Gateway(GatewayError::SourceUnavailable(_)) => {
                    (StatusCode::SERVICE_UNAVAILABLE, "SourceUnavailable")
                }
                ServiceError::Gateway(GatewayError::InvalidDescriptor(_)) => {
                    (StatusCode::BAD_REQUEST, "InvalidDescriptor")
                }
                ServiceError::Chart(ChartError::UnsupportedChartType(_)) => {
                    (StatusCode::BAD_REQUEST, "UnsupportedChartType")
                }
                ServiceError::Chart(ChartError::ConfigMismatch(_)) => (StatusCode::BAD_REQUEST, "ConfigMismatch"),
                ServiceError::InvalidFeedback(_) => (StatusCode::BAD_REQUEST, "InvalidFeedback"),
                ServiceError::WorkerPoolClosed => (StatusCode::SERVICE_UNAVAILABLE, "Unavailable"),
            },
            ApiError::InvalidDescriptor(_) => (StatusCode::BAD_REQUEST, "InvalidDescriptor"),
            ApiError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "InvalidRequest"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NotFound"),
            ApiError::Unsupported(_) => (StatusCode::NOT_IMPLEMENTED, "Unsupported"),
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::Service(e) => e.to_string(),
            ApiError::InvalidDescriptor(m)
            | ApiError::InvalidRequest(m)
            | ApiError::NotFound(m)
            | ApiError::Unsupported(m) => m.clone(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = self.parts();
        let message = self.message();
        if status.is_server_error() {
            tracing::warn!(%status, kind, %message, "request failed");
        } else {
            tracing::debug!(%status, kind, %message, "request rejected");
        }
        (status, Json(json!({ "error": kind, "message": message }))).into_response()
    }
}

fn parse_request_id(raw: &str) -> Result<JobId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::NotFound(format!("job {raw} not found")))
}

fn user_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FetchResponse {
    pub records: Vec<Row>,
    pub from_cache: bool,
}

async fn data_fetch(
    State(state): State<AppState>,
    body: Result<Json<QueryDescriptor>, JsonRejection>,
) -> Result<Json<FetchResponse>, ApiError> {
    let Json(descriptor) = body.map_err(|e| ApiError::InvalidDescriptor(e.body_text()))?;
    let lookup = state.service.fetch_data(&descriptor).await?;
    Ok(Json(FetchResponse {
        records: lookup.rows.as_ref().clone(),
        from_cache: lookup.from_cache,
    }))
}

#[derive(Debug, Deserialize)]
struct ReplaceSource {
    records: Vec<Row>,
    /// Schema for the new contents. Defaults to the record keys, or to the
    /// current schema when `records` is empty.
    #[serde(default)]
    columns: Vec<String>,
}

async fn replace_source(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Result<Json<ReplaceSource>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(body) = body.map_err(|e| ApiError::InvalidRequest(e.body_text()))?;
    let tables = state
        .tables
        .as_ref()
        .ok_or_else(|| ApiError::Unsupported("data source is read-only".into()))?;
    let token: FreshnessToken = tables.define_table(&name, body.columns, body.records).await;
    tracing::info!(source = %name, %token, "source replaced");
    Ok(Json(json!({ "freshness_token": token })))
}

async fn cache_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.service.cache_stats())
}

async fn generate_chart(
    State(state): State<AppState>,
    body: Result<Json<ChartRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body.map_err(|e| ApiError::InvalidRequest(e.body_text()))?;
    let response = state.service.generate_chart(&request).await?;
    Ok(Json(response).into_response())
}

#[derive(Debug, Deserialize)]
struct SubmitBody {
    prompt: String,
    #[serde(default)]
    chat_id: String,
    #[serde(default)]
    history: Vec<ChatMessage>,
}

async fn chat_submit(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<SubmitBody>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Json(body) = body.map_err(|e| ApiError::InvalidRequest(e.body_text()))?;
    let request = ChatRequest {
        prompt: body.prompt,
        chat_id: body.chat_id,
        history: body.history,
        user_id: user_id(&headers),
    };
    let id = state.service.submit(request).await?;
    Ok(Json(json!({ "request_id": id })))
}

async fn chat_status(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_request_id(&request_id)?;
    let status = state.service.status(id).await?;
    Ok(Json(status).into_response())
}

async fn chat_result(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_request_id(&request_id)?;
    let result = state.service.result(id).await?;
    Ok(Json(result.as_ref()).into_response())
}

async fn feedback(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<Feedback>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(mut feedback) = body.map_err(|e| ApiError::InvalidRequest(e.body_text()))?;
    feedback.user_id = user_id(&headers);
    state.service.record_feedback(&feedback)?;
    Ok(StatusCode::NO_CONTENT)
}
