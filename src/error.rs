use std::fmt;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

/// Failures produced while handling a download or storage request.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    CredentialsRequired(CredentialFailure),
    #[error("{0}")]
    Extraction(String),
    #[error("file expired or not found")]
    NotFound,
    #[error("storage failure: {0}")]
    Storage(#[from] std::io::Error),
}

/// Why a credential-gated download could not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialFailure {
    /// The engine asked for sign-in and no cookie file is stored.
    Missing,
    /// The stored cookie file was used and the engine still failed.
    Rejected { details: String },
}

impl fmt::Display for CredentialFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => write!(f, "This video requires sign-in verification"),
            Self::Rejected { .. } => write!(f, "Cookies expired or invalid"),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    kind: &'static str,
    needs_cookies: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub kind: &'static str,
    pub needs_cookies: bool,
    pub hint: Option<&'static str>,
    pub details: Option<String>,
}

impl ApiError {
    fn new(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            kind,
            needs_cookies: false,
            hint: None,
            details: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "extraction", message)
    }

    fn credentials_required(failure: CredentialFailure) -> Self {
        let mut error = Self::new(StatusCode::FORBIDDEN, "credentials_required", failure.to_string());
        error.needs_cookies = true;
        match failure {
            CredentialFailure::Missing => {
                error.hint = Some("Upload cookies.txt using /upload-cookies");
            }
            CredentialFailure::Rejected { details } => error.details = Some(details),
        }
        error
    }
}

impl From<DownloadError> for ApiError {
    fn from(error: DownloadError) -> Self {
        match error {
            DownloadError::Validation(message) => Self::bad_request(message),
            DownloadError::CredentialsRequired(failure) => Self::credentials_required(failure),
            DownloadError::Extraction(message) => Self::internal(message),
            DownloadError::NotFound => Self::not_found(DownloadError::NotFound.to_string()),
            DownloadError::Storage(error) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "storage",
                format!("storage failure: {error}"),
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
            kind: self.kind,
            needs_cookies: self.needs_cookies,
            hint: self.hint,
            details: self.details,
        });

        (self.status, body).into_response()
    }
}
