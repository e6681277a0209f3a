//! Request-level error taxonomy and its HTTP mapping.

use axum::http::StatusCode;
use serde::Serialize;
use thiserror::Error;

/// Message returned in place of upstream failures in production.
pub const REDACTED_MESSAGE: &str = "Something went wrong!";

/// Errors that end a request.
#[derive(Debug, Error)]
pub enum AppError {
    /// Bad or missing input from the client.
    #[error("{0}")]
    ClientInput(String),

    /// A collaborator (codec, asset host, database) failed.
    #[error("{0:#}")]
    Upstream(#[from] anyhow::Error),

    #[error("{0}")]
    NotFound(String),

    #[error("Too many requests. Please try again later.")]
    RateLimited,
}

impl AppError {
    pub fn client_input(message: impl Into<String>) -> Self {
        Self::ClientInput(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::ClientInput(_) => StatusCode::BAD_REQUEST,
            Self::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::ClientInput(_) => "INVALID_INPUT",
            Self::Upstream(_) => "PROCESSING_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::RateLimited => "RATE_LIMITED",
        }
    }

    /// Build the response body, hiding upstream details when `redact` is set.
    pub fn to_response(&self, redact: bool) -> ErrorResponse {
        let message = match self {
            Self::Upstream(_) if redact => REDACTED_MESSAGE.to_string(),
            other => other.to_string(),
        };

        ErrorResponse {
            message,
            code: self.code().to_string(),
        }
    }
}

/// Error response
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub message: String,
    pub code: String,
}
