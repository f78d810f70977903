//! # Error Handling
//!
//! Two families of errors live here:
//!
//! ### HTTP-facing errors
//! `AppError` is what request handlers return. It implements actix's `ResponseError`
//! so every failure becomes a JSON body with an `error` message, which is the shape
//! callers of `/join` rely on.
//!
//! ### Pipeline errors
//! `ProviderError`, `RoomError` and `SessionStartError` describe failures of the
//! external collaborators (recognizer, language model, synthesizer, problem store,
//! room service). None of them ever terminates a running session; they are logged
//! and the affected interaction is abandoned.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Errors returned from HTTP handlers.
///
/// ## Status mapping:
/// - `BadRequest` → 400
/// - `Internal` → 500
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
}

impl AppError {
    fn kind(&self) -> &'static str {
        match self {
            AppError::Internal(_) => "internal_error",
            AppError::BadRequest(_) => "bad_request",
        }
    }

    fn message(&self) -> &str {
        match self {
            AppError::Internal(msg) | AppError::BadRequest(msg) => msg,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
        }
    }
}

/// Renders errors as:
///
/// ```json
/// { "error": "Missing roomName", "kind": "bad_request", "timestamp": "2025-01-01T12:00:00Z" }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;
        match self {
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": self.message(),
            "kind": self.kind(),
            "timestamp": chrono::Utc::now().to_rfc3339()
        }))
    }
}

impl From<SessionStartError> for AppError {
    fn from(err: SessionStartError) -> Self {
        AppError::Internal(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Failure talking to an external provider.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// Could not reach the provider at all.
    Connection(String),
    /// The provider answered with a non-success HTTP status.
    Status { status: u16, body: String },
    /// The provider's payload could not be understood.
    Protocol(String),
    /// The stream was closed before the operation could finish.
    Closed,
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Connection(msg) => write!(f, "provider connection failed: {}", msg),
            ProviderError::Status { status, body } => {
                write!(f, "provider returned status {}: {}", status, body)
            }
            ProviderError::Protocol(msg) => write!(f, "provider protocol error: {}", msg),
            ProviderError::Closed => write!(f, "provider stream closed"),
        }
    }
}

impl std::error::Error for ProviderError {}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => ProviderError::Status {
                status: status.as_u16(),
                body: err.to_string(),
            },
            None if err.is_decode() => ProviderError::Protocol(err.to_string()),
            None => ProviderError::Connection(err.to_string()),
        }
    }
}

/// Failure of the room transport.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomError {
    InvalidUrl(String),
    Token(String),
    Connect(String),
    Closed,
}

impl fmt::Display for RoomError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomError::InvalidUrl(msg) => write!(f, "invalid room url: {}", msg),
            RoomError::Token(msg) => write!(f, "could not sign access token: {}", msg),
            RoomError::Connect(msg) => write!(f, "room connection failed: {}", msg),
            RoomError::Closed => write!(f, "room connection closed"),
        }
    }
}

impl std::error::Error for RoomError {}

/// A room session could not be started; reported to the join caller.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionStartError {
    Connect { room_name: String, source: RoomError },
}

impl fmt::Display for SessionStartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStartError::Connect { room_name, source } => {
                write!(f, "failed to join room {}: {}", room_name, source)
            }
        }
    }
}

impl std::error::Error for SessionStartError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionStartError::Connect { source, .. } => Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;
    use actix_web::http::StatusCode;

    #[actix_web::test]
    async fn test_error_body_carries_message() {
        let response = AppError::BadRequest("Missing roomName".to_string()).error_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = to_bytes(response.into_body()).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"], "Missing roomName");
        assert_eq!(value["kind"], "bad_request");
    }

    #[test]
    fn test_session_start_error_is_internal() {
        let err = SessionStartError::Connect {
            room_name: "room-1".to_string(),
            source: RoomError::Connect("refused".to_string()),
        };
        let app_err: AppError = err.into();
        assert_eq!(app_err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(app_err.to_string().contains("room-1"));
    }
}
