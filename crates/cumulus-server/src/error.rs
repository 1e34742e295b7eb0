//! Server-specific error types

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use cumulus_common::CumulusError;
use thiserror::Error;

use crate::api::ErrorResponse;
use crate::pipeline::{PipelineError, UNEXPECTED_ERROR_BODY};

/// Errors surfaced by the HTTP features.
///
/// Responses are deliberately terse: 5xx bodies never carry the underlying
/// error, which is only logged.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Domain(#[from] CumulusError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl AppError {
    fn domain(&self) -> Option<&CumulusError> {
        match self {
            AppError::Domain(e) => Some(e),
            AppError::Pipeline(e) => e.domain(),
            AppError::Storage(e) => e.downcast_ref::<CumulusError>(),
            _ => None,
        }
    }

    fn status(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            _ => match self.domain() {
                Some(CumulusError::Unauthorized(_)) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
                Some(CumulusError::Forbidden(_)) => (StatusCode::FORBIDDEN, "FORBIDDEN"),
                Some(CumulusError::PresignFailure(_)) => {
                    (StatusCode::BAD_REQUEST, "PRESIGN_FAILURE")
                }
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status();
        let message = match status {
            StatusCode::NOT_FOUND => "Not found",
            StatusCode::BAD_REQUEST => "Bad request",
            StatusCode::UNAUTHORIZED => "Unauthorized",
            StatusCode::FORBIDDEN => "Forbidden",
            _ => {
                tracing::error!(error = %self, "Request failed");
                UNEXPECTED_ERROR_BODY
            }
        };
        if status.is_client_error() {
            tracing::debug!(error = %self, status = status.as_u16(), "Request rejected");
        }

        (status, Json(ErrorResponse::new(code, message))).into_response()
    }
}

pub type AppResult<T> = std::result::Result<T, AppError>;
