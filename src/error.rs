use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("rate limit exceeded, retry after {}s", .retry_after.as_secs())]
    AdmissionDenied { retry_after: Duration },

    #[error("dispatch failed: {0}")]
    DispatchFailure(String),

    #[error("dispatch rejected: {0}")]
    DispatchRejected(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, code: u16) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            code,
        }
    }
}

impl Error {
    fn status(&self) -> StatusCode {
        match self {
            Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::AdmissionDenied { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::DispatchFailure(_) => StatusCode::BAD_GATEWAY,
            Error::DispatchRejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "configuration_error",
            Error::AdmissionDenied { .. } => "rate_limit_exceeded",
            Error::DispatchFailure(_) => "dispatch_failure",
            Error::DispatchRejected(_) => "dispatch_rejected",
            Error::Persistence(_) => "persistence_error",
            Error::Validation(_) => "validation_error",
            Error::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorResponse::new(self.kind(), &self.to_string(), status.as_u16());

        let mut response = (status, Json(body)).into_response();

        if let Error::AdmissionDenied { retry_after } = &self {
            if let Ok(value) = retry_after.as_secs().max(1).to_string().parse() {
                response.headers_mut().insert("Retry-After", value);
            }
        }

        response
    }
}
