use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use pdiff_shared::{AuthError, CredentialError, UploadError};
use pdiff_store::StoreError;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Already exists")]
    AlreadyExists,

    #[error("Not found")]
    NotFound,

    /// Key or signature mismatch. Which one is never revealed.
    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Couldn't create key: {0}")]
    RandomnessFailure(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Image decode failed: {0}")]
    Decode(String),

    #[error("Image too large: {size} bytes (max {max})")]
    BlobTooLarge { size: usize, max: usize },

    #[error("Request body too large (max {max} bytes)")]
    BodyTooLarge { max: usize },

    #[error("Invalid request: {0}")]
    BadRequest(String),
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => ServiceError::NotFound,
            StoreError::AlreadyExists => ServiceError::AlreadyExists,
            other => ServiceError::Storage(other.to_string()),
        }
    }
}

impl From<CredentialError> for ServiceError {
    fn from(e: CredentialError) -> Self {
        ServiceError::RandomnessFailure(e.to_string())
    }
}

impl From<AuthError> for ServiceError {
    fn from(_: AuthError) -> Self {
        ServiceError::AuthenticationFailed
    }
}

impl From<UploadError> for ServiceError {
    fn from(e: UploadError) -> Self {
        ServiceError::BadRequest(e.to_string())
    }
}

impl From<image::ImageError> for ServiceError {
    fn from(e: image::ImageError) -> Self {
        ServiceError::Decode(e.to_string())
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServiceError::AlreadyExists => (StatusCode::CONFLICT, self.to_string()),
            ServiceError::NotFound => (StatusCode::NOT_FOUND, self.to_string()),
            ServiceError::AuthenticationFailed => (StatusCode::UNAUTHORIZED, self.to_string()),
            ServiceError::Decode(_) | ServiceError::BadRequest(_) => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            ServiceError::BlobTooLarge { .. } | ServiceError::BodyTooLarge { .. } => {
                (StatusCode::PAYLOAD_TOO_LARGE, self.to_string())
            }
            ServiceError::RandomnessFailure(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Couldn't create key".to_string(),
            ),
            ServiceError::Storage(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Storage error".to_string(),
            ),
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}
