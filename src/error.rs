//! The primary error type shared by the Host and the Runner Agent.
//!
//! Each variant family corresponds to one of the error kinds named in the
//! design: client-input, precondition, transient transport, resource
//! exhaustion, invariant-violation and fatal-bootstrap. The HTTP layer maps
//! these to a structured `{ kind, code, message }` body.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("invalid request: {0}")]
    ClientInput(String),

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("transient transport error: {0}")]
    Transient(String),

    #[error("resource exhausted: {0}")]
    ResourceExhaustion(String),

    #[error("internal invariant violated: {0}")]
    InvariantViolation(String),

    #[error("fatal bootstrap error: {0}")]
    FatalBootstrap(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl FleetError {
    /// A short machine-readable code, stable across releases, used in the
    /// JSON error body returned to clients.
    pub fn code(&self) -> &'static str {
        match self {
            FleetError::ClientInput(_) => "client_input",
            FleetError::Precondition(_) => "precondition_failed",
            FleetError::Transient(_) => "transient",
            FleetError::ResourceExhaustion(_) => "resource_exhausted",
            FleetError::InvariantViolation(_) => "invariant_violation",
            FleetError::FatalBootstrap(_) => "fatal_bootstrap",
            FleetError::NotFound(_) => "not_found",
        }
    }

    pub fn http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            FleetError::ClientInput(_) => StatusCode::BAD_REQUEST,
            FleetError::Precondition(_) => StatusCode::CONFLICT,
            FleetError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            FleetError::ResourceExhaustion(_) => StatusCode::CONFLICT,
            FleetError::InvariantViolation(_) => StatusCode::INTERNAL_SERVER_ERROR,
            FleetError::FatalBootstrap(_) => StatusCode::INTERNAL_SERVER_ERROR,
            FleetError::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }
}

impl From<rusqlite::Error> for FleetError {
    fn from(e: rusqlite::Error) -> Self {
        FleetError::InvariantViolation(format!("storage error: {e}"))
    }
}

impl From<reqwest::Error> for FleetError {
    fn from(e: reqwest::Error) -> Self {
        FleetError::Transient(format!("rpc error: {e}"))
    }
}

impl From<std::io::Error> for FleetError {
    fn from(e: std::io::Error) -> Self {
        FleetError::Transient(format!("io error: {e}"))
    }
}

impl From<serde_json::Error> for FleetError {
    fn from(e: serde_json::Error) -> Self {
        FleetError::ClientInput(format!("malformed json: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, FleetError>;

#[derive(serde::Serialize)]
pub struct ErrorBody {
    pub kind: &'static str,
    pub code: &'static str,
    pub message: String,
}

impl axum::response::IntoResponse for FleetError {
    fn into_response(self) -> axum::response::Response {
        let status = self.http_status();
        let kind = match &self {
            FleetError::ClientInput(_) => "client_input",
            FleetError::Precondition(_) => "precondition",
            FleetError::Transient(_) => "transient",
            FleetError::ResourceExhaustion(_) => "resource_exhaustion",
            FleetError::InvariantViolation(_) => "invariant_violation",
            FleetError::FatalBootstrap(_) => "fatal_bootstrap",
            FleetError::NotFound(_) => "not_found",
        };
        let body = ErrorBody {
            kind,
            code: self.code(),
            message: self.to_string(),
        };
        (status, axum::Json(body)).into_response()
    }
}
