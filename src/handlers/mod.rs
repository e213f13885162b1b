//! HTTP edge: health probes plus the object and container surfaces.

pub mod health_handlers;
pub mod object_handlers;

use crate::services::request_pipeline::RequestPipeline;
use crate::services::storage_service::StorageService;
use std::sync::Arc;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<RequestPipeline>,
    pub storage: StorageService,
}
