//! Error taxonomy for the coordination layer.
//!
//! Recoverable kinds are handled by the component that produces them;
//! only `Fatal` and client-visible errors are expected to cross a
//! component boundary as a [`GatewayError`].

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("session capacity exhausted")]
    CapacityExhausted,

    #[error("failed to spawn agent process: {0}")]
    AgentSpawnFailure(String),

    #[error("agent process crashed: {0}")]
    AgentCrash(String),

    #[error("permission request timed out")]
    PermissionTimeout,

    #[error("persistence failure: {0}")]
    PersistenceFailure(#[from] rusqlite::Error),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("not found")]
    NotFound,

    #[error("unauthorized")]
    Unauthorized,
}

impl GatewayError {
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Validation(_) => "validation",
            GatewayError::CapacityExhausted => "capacity_exhausted",
            GatewayError::AgentSpawnFailure(_) => "agent_spawn_failure",
            GatewayError::AgentCrash(_) => "agent_crash",
            GatewayError::PermissionTimeout => "permission_timeout",
            GatewayError::PersistenceFailure(_) => "persistence_failure",
            GatewayError::Fatal(_) => "fatal",
            GatewayError::NotFound => "not_found",
            GatewayError::Unauthorized => "unauthorized",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::CapacityExhausted => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::AgentSpawnFailure(_) | GatewayError::AgentCrash(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            GatewayError::PermissionTimeout => StatusCode::REQUEST_TIMEOUT,
            GatewayError::PersistenceFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::NotFound => StatusCode::NOT_FOUND,
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    kind: &'static str,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: self.to_string(),
            kind: self.kind(),
        };
        (status, axum::Json(body)).into_response()
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
