use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Errors surfaced by the thin HTTP surface (`/health` and the upgrade path's
/// pre-upgrade rejection).
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Internal server error")]
    Internal,
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        AppError::Database(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message): (StatusCode, String) = match self {
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                (StatusCode::SERVICE_UNAVAILABLE, "Database error".into())
            }
            AppError::Auth(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::Internal => {
                tracing::error!("Internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".into(),
                )
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Errors surfaced by the gateway core (registry, token verifier, message
/// core, dispatcher). Each variant carries the wire-level `reason` string
/// that ends up in a client-facing `{success:false, error}` envelope.
///
/// Mirrors [`AppError`]'s one-enum-per-surface shape, just mapped to gateway
/// envelopes instead of HTTP status codes.
#[derive(Error, Debug, Clone)]
pub enum CoreError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Auth(String),

    #[error("Maximum connection capacity exceeded")]
    CapacityExceeded,

    #[error("Request timed out")]
    Timeout,

    #[error("{0}")]
    Transport(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("{0}")]
    NotFound(String),

    /// Programming error / invariant violation. The dispatcher logs this at
    /// `error` level and re-raises it to the connection handler, which tears
    /// the socket down instead of keeping it alive — never swallowed like
    /// the rest of this enum.
    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl CoreError {
    /// The wire-level `error` string sent back to the client. Validation and
    /// auth messages are already client-safe; everything else collapses to
    /// a generic reason so internals never leak over the wire.
    pub fn reason(&self) -> String {
        match self {
            CoreError::Validation(msg) => msg.clone(),
            CoreError::Auth(msg) => msg.clone(),
            CoreError::CapacityExceeded => "Maximum connection capacity exceeded".to_string(),
            CoreError::Timeout => "Request timed out".to_string(),
            CoreError::Transport(_) => "Delivery failed".to_string(),
            CoreError::Storage(_) => "Storage error".to_string(),
            CoreError::NotFound(msg) => msg.clone(),
            CoreError::Fatal(_) => "Internal server error".to_string(),
        }
    }

    /// Predictable errors are logged and swallowed by the dispatcher;
    /// everything else is treated as fatal and closes the connection it
    /// came from.
    pub fn is_predictable(&self) -> bool {
        !matches!(self, CoreError::Fatal(_))
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(e: sqlx::Error) -> Self {
        // Unique-constraint races on a message upsert are handled by the
        // caller before this conversion ever runs (see `store_message`);
        // anything that reaches here is a genuine storage failure.
        tracing::error!("Storage error: {:?}", e);
        CoreError::Storage(e.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
