use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use validator::Validate;

use crate::error::Error;
use crate::event::{Entry, EventType};
use crate::middleware::client_ip;
use crate::pipeline::Pipeline;
use crate::validation::KeyValidator;

/// Shared application state
pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub validator: KeyValidator,
    /// Scope admission keys per client address instead of per route only.
    pub per_client_keys: bool,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>) -> SharedState {
        Arc::new(Self {
            pipeline,
            validator: KeyValidator::new(),
            per_client_keys: false,
        })
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct SubmitRequest {
    #[validate(length(min = 1, max = 128))]
    pub group_key: String,
    pub event_type: EventType,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub status: String,
    pub id: uuid::Uuid,
    pub remaining: u32,
}

#[derive(Debug, Deserialize)]
pub struct FlushRequest {
    #[serde(default)]
    pub key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ResetParams {
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// Accept an event for aggregation.
///
/// Admission happens first against the route-derived endpoint key; only
/// accepted events enter the debounce/buffer stages.
pub async fn submit_event(
    State(state): State<SharedState>,
    Path(kind): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<SubmitRequest>,
) -> Result<impl IntoResponse, Error> {
    payload
        .validate()
        .map_err(|e| Error::Validation(e.to_string()))?;
    state.validator.validate_group_key(&payload.group_key)?;

    let endpoint = if state.per_client_keys {
        format!("/events/{kind}:{}", client_ip(&headers))
    } else {
        format!("/events/{kind}")
    };
    state.validator.validate_endpoint_key(&endpoint)?;

    let admission = state.pipeline.admit(&endpoint)?;
    if !admission.allowed {
        let retry_after = admission.retry_after_secs.unwrap_or(1);
        return Err(Error::AdmissionDenied {
            retry_after: std::time::Duration::from_secs(retry_after),
        });
    }

    let entry = Entry::new(payload.group_key, payload.payload, payload.event_type);
    let id = entry.id;
    state.pipeline.ingest(entry)?;

    let mut response = (
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            status: "accepted".to_string(),
            id,
            remaining: admission.remaining,
        }),
    )
        .into_response();

    let limit_headers = response.headers_mut();
    if let Ok(value) = admission.limit.to_string().parse() {
        limit_headers.insert("X-RateLimit-Limit", value);
    }
    if let Ok(value) = admission.remaining.to_string().parse() {
        limit_headers.insert("X-RateLimit-Remaining", value);
    }

    Ok(response)
}

/// Full pipeline statistics for monitoring.
pub async fn get_stats(State(state): State<SharedState>) -> Result<impl IntoResponse, Error> {
    let stats = state.pipeline.stats()?;
    Ok(Json(stats))
}

/// Flush one buffer, or all of them.
pub async fn force_flush(
    State(state): State<SharedState>,
    Json(request): Json<FlushRequest>,
) -> Result<impl IntoResponse, Error> {
    if let Some(key) = &request.key {
        state.validator.validate_group_key(key)?;
    }

    let flushed = state.pipeline.force_flush(request.key.as_deref())?;
    Ok(Json(serde_json::json!({
        "status": "success",
        "flushed_batches": flushed,
    })))
}

/// Reset rate limits for one endpoint, or all of them.
pub async fn reset_rate_limits(
    State(state): State<SharedState>,
    Query(params): Query<ResetParams>,
) -> Result<impl IntoResponse, Error> {
    if let Some(endpoint) = &params.endpoint {
        state.validator.validate_endpoint_key(endpoint)?;
    }

    state
        .pipeline
        .reset_rate_limit(params.endpoint.as_deref())?;

    let message = match &params.endpoint {
        Some(endpoint) => format!("Rate limits reset for {endpoint}"),
        None => "All rate limits reset".to_string(),
    };
    Ok(Json(serde_json::json!({
        "status": "success",
        "message": message,
    })))
}

/// Health check endpoint
pub async fn health_check(State(state): State<SharedState>) -> Result<impl IntoResponse, Error> {
    let stats = state.pipeline.stats()?;
    Ok(Json(serde_json::json!({
        "status": "healthy",
        "buffered_entries": stats.buffers.total_entries,
        "scheduler_backlog": stats.scheduler.backlog,
    })))
}
