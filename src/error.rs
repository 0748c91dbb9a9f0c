use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::extractor::ExtractError;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

/// Handler-boundary error: a status, a stable summary and the underlying message.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub summary: &'static str,
    pub details: Option<String>,
}

impl ApiError {
    pub fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            summary: "Unauthorized",
            details: None,
        }
    }

    pub fn missing_url() -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            summary: "No URL provided",
            details: None,
        }
    }

    pub fn download_failed(details: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            summary: "Download failed",
            details: Some(details.into()),
        }
    }

    pub fn internal(details: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            summary: "Internal server error",
            details: Some(details.into()),
        }
    }

    pub fn message(&self) -> &str {
        self.details.as_deref().unwrap_or(self.summary)
    }
}

impl From<ExtractError> for ApiError {
    fn from(error: ExtractError) -> Self {
        match error {
            ExtractError::Download(message) => Self::download_failed(message),
            other => Self::internal(other.to_string()),
        }
    }
}

impl From<std::io::Error> for ApiError {
    fn from(error: std::io::Error) -> Self {
        Self::internal(error.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.summary,
            details: self.details,
        });

        (self.status, body).into_response()
    }
}
