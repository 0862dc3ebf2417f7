//! Error types for the file cache service

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use filecache_fill::{IndexError, KeyError, QueueError, ReadError};
use serde_json::json;
use std::fmt;

/// Startup and wiring failures
#[derive(Debug)]
pub enum ServerError {
    Config(String),
    Database(Box<sqlx::Error>),
    Client(String),
    Metrics(prometheus::Error),
    Io(std::io::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Config(msg) => write!(f, "Configuration error: {}", msg),
            ServerError::Database(err) => write!(f, "Database error: {}", err),
            ServerError::Client(msg) => write!(f, "HTTP client error: {}", msg),
            ServerError::Metrics(err) => write!(f, "Metrics error: {}", err),
            ServerError::Io(err) => write!(f, "IO error: {}", err),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Database(err) => Some(err.as_ref()),
            ServerError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for ServerError {
    fn from(err: sqlx::Error) -> Self {
        ServerError::Database(Box::new(err))
    }
}

impl From<prometheus::Error> for ServerError {
    fn from(err: prometheus::Error) -> Self {
        ServerError::Metrics(err)
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        ServerError::Io(err)
    }
}

impl From<tracing_subscriber::filter::ParseError> for ServerError {
    fn from(err: tracing_subscriber::filter::ParseError) -> Self {
        ServerError::Config(err.to_string())
    }
}

impl From<library_client::LibraryError> for ServerError {
    fn from(err: library_client::LibraryError) -> Self {
        ServerError::Client(err.to_string())
    }
}

impl From<downloader_client::DownloaderError> for ServerError {
    fn from(err: downloader_client::DownloaderError) -> Self {
        ServerError::Client(err.to_string())
    }
}

impl From<files_client::FilesError> for ServerError {
    fn from(err: files_client::FilesError) -> Self {
        ServerError::Client(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;

/// Request failures, rendered as `{"error": ...}`
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound,
    Unavailable(String),
    Unauthorized,
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound => (StatusCode::NOT_FOUND, "Not found".into()),
            AppError::Unavailable(reason) => {
                tracing::warn!(reason = %reason, "Content temporarily unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Temporarily unavailable, try again later".into(),
                )
            }
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "Authentication required".into()),
            AppError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".into(),
                )
            }
        };

        (status, axum::Json(json!({ "error": message }))).into_response()
    }
}

impl From<ReadError> for AppError {
    fn from(err: ReadError) -> Self {
        match err {
            ReadError::NotFound => AppError::NotFound,
            ReadError::Unavailable(reason) => AppError::Unavailable(reason),
        }
    }
}

impl From<KeyError> for AppError {
    fn from(err: KeyError) -> Self {
        AppError::BadRequest(err.to_string())
    }
}

impl From<IndexError> for AppError {
    fn from(err: IndexError) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<QueueError> for AppError {
    fn from(err: QueueError) -> Self {
        AppError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ServerError::Config("API_KEY is required".into());
        assert_eq!(err.to_string(), "Configuration error: API_KEY is required");
    }

    #[test]
    fn test_read_error_status() {
        let not_found = AppError::from(ReadError::NotFound).into_response();
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);

        let busy = AppError::from(ReadError::Unavailable("lock busy".into())).into_response();
        assert_eq!(busy.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_key_error_is_bad_request() {
        let response = AppError::from(KeyError::EmptyVariant).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
