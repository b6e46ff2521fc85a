//! Crate-wide error taxonomy (component N). Every fallible public operation in
//! the orchestrator returns `Result<_, OrchestratorError>`; background tasks
//! that have no caller to report to keep using `anyhow::Result`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;

/// One variant per distinct error kind the control plane can surface.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {code}")]
    Unauthorized { code: &'static str },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("instance unavailable: {0}")]
    Unavailable(String),

    #[error("upstream error: {0}")]
    UpstreamError(String),

    #[error("upstream timeout")]
    UpstreamTimeout,

    #[error("no capacity: all instance slots in use")]
    NoCapacity,

    #[error("startup timeout: child did not become ready")]
    StartupTimeout,

    #[error("dependency install failed: {0}")]
    InstallFailure(String),

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl OrchestratorError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamError(_) => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::NoCapacity => StatusCode::INTERNAL_SERVER_ERROR,
            Self::StartupTimeout => StatusCode::INTERNAL_SERVER_ERROR,
            Self::InstallFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> Option<&'static str> {
        match self {
            Self::Unauthorized { code } => Some(code),
            _ => None,
        }
    }
}

#[derive(Serialize)]
struct ErrorEnvelope {
    success: bool,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
}

impl IntoResponse for OrchestratorError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self, "internal error");
        }
        let body = ErrorEnvelope {
            success: false,
            error: self.to_string(),
            code: self.code(),
        };
        (status, Json(body)).into_response()
    }
}
