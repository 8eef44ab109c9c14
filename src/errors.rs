use crate::services::{
    local_store::StoreError, part_uploader::UploaderError, recorder::RecorderError,
    tracks::CaptureError,
};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// A lightweight wrapper for handler errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ChunkNotFound(_) => AppError::not_found(err.to_string()),
            _ => AppError::internal(err.to_string()),
        }
    }
}

impl From<CaptureError> for AppError {
    fn from(err: CaptureError) -> Self {
        match err {
            CaptureError::NotCapturing(_) | CaptureError::AlreadyCapturing(_) => {
                AppError::conflict(err.to_string())
            }
            _ => AppError::internal(err.to_string()),
        }
    }
}

impl From<UploaderError> for AppError {
    fn from(err: UploaderError) -> Self {
        AppError::new(StatusCode::BAD_GATEWAY, err.to_string())
    }
}

impl From<RecorderError> for AppError {
    fn from(err: RecorderError) -> Self {
        match err {
            RecorderError::UnknownCommand(_) => AppError::not_found(err.to_string()),
            RecorderError::InvalidState { .. } | RecorderError::UploadPending { .. } => {
                AppError::conflict(err.to_string())
            }
            RecorderError::Uploader(inner) => inner.into(),
            RecorderError::Capture(inner) => inner.into(),
            RecorderError::Store(inner) => inner.into(),
        }
    }
}
