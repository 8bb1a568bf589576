//! Crate-wide error taxonomy.
//!
//! Each variant maps to exactly one HTTP status / WebSocket close code, the
//! way [`crate::sandbox::SandboxError`] maps to one failure cause. Components
//! catch and translate at their public boundary; internal helpers return
//! their own narrower error types and convert with `#[from]`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::admission::AdmissionError;
use crate::broker::BrokerError;
use crate::store::StoreError;
use crate::token::TokenError;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("missing API key")]
    AuthMissing,

    #[error("invalid API key")]
    AuthInvalid,

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("code rejected by screening: {0}")]
    ScreeningRejected(String),

    #[error("broker unavailable: {0}")]
    BrokerUnavailable(#[from] BrokerError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<TokenError> for AppError {
    fn from(_: TokenError) -> Self {
        AppError::AuthInvalid
    }
}

impl From<AdmissionError> for AppError {
    fn from(e: AdmissionError) -> Self {
        match e {
            AdmissionError::AuthMissing => AppError::AuthMissing,
            AdmissionError::AuthInvalid => AppError::AuthInvalid,
            AdmissionError::RateLimited => AppError::RateLimited,
            AdmissionError::CodeTooLarge(_)
            | AdmissionError::FilenameTooLong(_)
            | AdmissionError::FilenameInvalid => AppError::InvalidInput(e.to_string()),
            AdmissionError::ScreeningRejected(detail) => AppError::ScreeningRejected(detail),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Broker(broker_err) => AppError::BrokerUnavailable(broker_err),
            StoreError::Corrupt(detail) => AppError::Internal(detail),
        }
    }
}

impl From<crate::submission::SubmissionError> for AppError {
    fn from(e: crate::submission::SubmissionError) -> Self {
        match e {
            crate::submission::SubmissionError::Admission(err) => err.into(),
            crate::submission::SubmissionError::Store(err) => err.into(),
        }
    }
}

impl From<crate::result_service::ResultError> for AppError {
    fn from(e: crate::result_service::ResultError) -> Self {
        match e {
            crate::result_service::ResultError::Store(err) => err.into(),
            crate::result_service::ResultError::CorruptEntry(_, detail) => {
                AppError::Internal(detail)
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    detail: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::ScreeningRejected(_) => StatusCode::BAD_REQUEST,
            AppError::AuthMissing => StatusCode::UNAUTHORIZED,
            AppError::AuthInvalid => StatusCode::FORBIDDEN,
            AppError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AppError::BrokerUnavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = ErrorBody {
            error: status.canonical_reason().unwrap_or("error").to_string(),
            detail: self.to_string(),
        };

        (status, axum::Json(body)).into_response()
    }
}

/// WebSocket close codes used by the Stream Service.
pub mod ws_close {
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const INTERNAL_ERROR: u16 = 1011;
    pub const NORMAL: u16 = 1000;
}
