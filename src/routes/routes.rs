//! Route table for the trigger-augmented object store.
//!
//! ## Structure
//! - **Container-level endpoints**
//!   - `GET    /v1/{account}/{container}` — list object names (supports ?prefix=)
//!   - `PUT    /v1/{account}/{container}` — create container
//!   - `DELETE /v1/{account}/{container}` — delete container
//!
//! - **Object-level endpoint**
//!   - `/v1/{account}/{container}/{*object}` — every verb goes through the
//!     request pipeline, which dispatches GET/PUT/POST/HEAD/DELETE/MOVE and
//!     rejects anything else with 405.
//!
//! The wildcard `*object` allows nested names like `photos/2025/img.jpg`,
//! which is also what makes pseudo-folder trigger requests expressible.

use crate::{
    handlers::{
        AppState,
        health_handlers::{healthz, readyz},
        object_handlers::{create_container, delete_container, dispatch_object, list_container},
    },
};
use axum::{
    Router,
    routing::{any, get},
};

/// Build and return the router for the full API surface.
///
/// The router carries shared state ([`AppState`]) to all handlers.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Object-level route: the pipeline owns verb dispatch
        .route("/v1/{account}/{container}/{*object}", any(dispatch_object))
        // Container-level routes
        .route(
            "/v1/{account}/{container}",
            get(list_container)
                .put(create_container)
                .delete(delete_container),
        )
}
