use crate::services::backend::{AccessError, BackendError};
use crate::services::link_resolver::LinkError;
use crate::services::metadata_codec::CodecError;
use crate::services::request_pipeline::PipelineError;
use crate::services::storage_service::StorageError;
use crate::services::trigger_registry::RegistryError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
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

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        let status = match &err {
            PipelineError::BadRequest(_) => StatusCode::BAD_REQUEST,
            PipelineError::MalformedHandlerList(_) => StatusCode::INTERNAL_SERVER_ERROR,
            PipelineError::Access(access) => access_status(access),
            PipelineError::Link(link) => link_status(link),
            PipelineError::Registry(registry) => registry_status(registry),
            PipelineError::Backend(backend) => backend_status(backend),
        };
        AppError::new(status, err.to_string())
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        let status = match &err {
            StorageError::ContainerNotFound(_) | StorageError::ObjectNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            StorageError::ContainerAlreadyExists(_) => StatusCode::CONFLICT,
            StorageError::InvalidContainerName { .. } | StorageError::InvalidObjectName => {
                StatusCode::BAD_REQUEST
            }
            StorageError::Sqlx(_) | StorageError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError::new(status, err.to_string())
    }
}

fn access_status(err: &AccessError) -> StatusCode {
    match err {
        AccessError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
        AccessError::NotFound { .. } => StatusCode::NOT_FOUND,
    }
}

fn link_status(err: &LinkError) -> StatusCode {
    match err {
        LinkError::PathConflict => StatusCode::CONFLICT,
        LinkError::BadDestination(_) => StatusCode::BAD_REQUEST,
        LinkError::Access(access) => access_status(access),
        LinkError::Backend(backend) => backend_status(backend),
    }
}

fn registry_status(err: &RegistryError) -> StatusCode {
    match err {
        RegistryError::BindingNotFound { .. } | RegistryError::NoTriggerMap => {
            StatusCode::NOT_FOUND
        }
        RegistryError::MalformedTriggerMap(_) => StatusCode::INTERNAL_SERVER_ERROR,
        RegistryError::Codec(codec) => codec_status(codec),
    }
}

fn codec_status(err: &CodecError) -> StatusCode {
    match err {
        CodecError::ObjectGone { .. } => StatusCode::NOT_FOUND,
        CodecError::SpaceExhausted { .. } => StatusCode::INSUFFICIENT_STORAGE,
        CodecError::Unsupported { .. } | CodecError::Malformed { .. } | CodecError::Io(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn backend_status(err: &BackendError) -> StatusCode {
    match err {
        BackendError::BadPath(_) => StatusCode::BAD_REQUEST,
        BackendError::Registry(registry) => registry_status(registry),
        BackendError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
