//! Error taxonomy for the registry and JSON error responses for the control API

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Errors produced while launching or probing serve instances
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    /// Every port in the configured range is claimed or bound by another process
    #[error("No available ports in range {min}-{max}")]
    NoPortAvailable { min: u16, max: u16 },

    /// The OS could not create the process
    #[error("Failed to spawn serve process for '{key}': {source}")]
    SpawnFailure {
        key: String,
        #[source]
        source: std::io::Error,
    },

    /// The service never answered its readiness endpoint before the deadline
    #[error("Service at port {port} failed to become ready within {timeout_ms}ms")]
    ReadinessTimeout { port: u16, timeout_ms: u64 },

    /// The process exited without being stopped
    #[error("Serve process for '{key}' exited unexpectedly (code: {code:?})")]
    ProcessExitedUnexpectedly { key: String, code: Option<i32> },
}

impl ServeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ServeError::NoPortAvailable { .. } => ErrorCode::NoPortAvailable,
            ServeError::SpawnFailure { .. } => ErrorCode::SpawnFailure,
            ServeError::ReadinessTimeout { .. } => ErrorCode::ReadinessTimeout,
            ServeError::ProcessExitedUnexpectedly { .. } => ErrorCode::ProcessExited,
        }
    }

    /// Render this error as a control API response
    pub fn to_response(&self) -> Response<Full<Bytes>> {
        json_error_response(self.code(), self.to_string())
    }
}

/// Error codes for control API responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Port range exhausted
    NoPortAvailable,
    /// Process could not be created
    SpawnFailure,
    /// Instance did not become ready in time
    ReadinessTimeout,
    /// Process exited on its own
    ProcessExited,
    /// No instance registered for the key
    InstanceNotFound,
    /// Malformed request
    BadRequest,
    /// Missing or wrong token
    Unauthorized,
    /// Unknown route
    NotFound,
}

impl ErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::NoPortAvailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::SpawnFailure => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::ReadinessTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::ProcessExited => StatusCode::BAD_GATEWAY,
            ErrorCode::InstanceNotFound => StatusCode::NOT_FOUND,
            ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
        }
    }

    /// Get the error code as a string for the X-Serveherd-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ErrorCode::NoPortAvailable => "NO_PORT_AVAILABLE",
            ErrorCode::SpawnFailure => "SPAWN_FAILURE",
            ErrorCode::ReadinessTimeout => "READINESS_TIMEOUT",
            ErrorCode::ProcessExited => "PROCESS_EXITED",
            ErrorCode::InstanceNotFound => "INSTANCE_NOT_FOUND",
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::NotFound => "NOT_FOUND",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Serveherd-Error header
pub fn json_error_response(code: ErrorCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    let error = ErrorResponse::new(code, message);
    let body = error.to_json();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Serveherd-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)))
        .expect("valid response with StatusCode enum and static headers")
}
