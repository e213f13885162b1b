//! HTTP handlers for object and container operations.
//!
//! Object requests of any verb are folded into an immutable
//! [`RequestContext`] and handed to the request pipeline; container requests
//! go straight to `StorageService`. Responses come back as buffered
//! [`BackendResponse`] values because the pipeline inspects and rewrites
//! headers and bodies along the way.

use crate::{
    errors::AppError,
    handlers::AppState,
    models::{container::Container, identity::ObjectIdentity},
    services::{
        backend::BackendResponse, context::RequestContext, link_resolver::LinkError,
        request_pipeline::PipelineError,
    },
};
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, RawQuery, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use serde::Deserialize;

/// Query params accepted by the container listing.
#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub prefix: Option<String>,
}

/// Any-verb entry point for `/v1/{account}/{container}/{*object}`.
pub async fn dispatch_object(
    State(state): State<AppState>,
    Path((account, container, object)): Path<(String, String, String)>,
    method: Method,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let identity = ObjectIdentity::new(account, container, object);
    let ctx = RequestContext::new(method, identity.request_path(), query, headers, body);

    match state.pipeline.handle(identity, ctx).await {
        Ok(response) => Ok(into_http(response)),
        Err(PipelineError::Link(LinkError::PathConflict)) => Ok(conflict_marker()),
        Err(err) => Err(err.into()),
    }
}

/// GET `/v1/{account}/{container}` — newline-separated object names,
/// optionally restricted to `?prefix=`.
pub async fn list_container(
    State(state): State<AppState>,
    Path((account, container)): Path<(String, String)>,
    Query(query): Query<ListQuery>,
) -> Result<Response, AppError> {
    let names = state
        .storage
        .list_object_names(&account, &container, query.prefix.as_deref())
        .await?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        names.join("\n"),
    )
        .into_response())
}

/// PUT `/v1/{account}/{container}` — create the container.
pub async fn create_container(
    State(state): State<AppState>,
    Path((account, container)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    let created: Container = state.storage.create_container(&account, &container).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// DELETE `/v1/{account}/{container}` — delete the container.
pub async fn delete_container(
    State(state): State<AppState>,
    Path((account, container)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    state.storage.delete_container(&account, &container).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn into_http(response: BackendResponse) -> Response {
    let mut http = Response::new(Body::from(response.body));
    *http.status_mut() = response.status;
    *http.headers_mut() = response.headers;
    http
}

/// Same-path move: a conflict carrying the empty etag marker clients look
/// for, and no mutation behind it.
fn conflict_marker() -> Response {
    let mut response = (
        StatusCode::CONFLICT,
        "link path and destination path cannot be the same\n",
    )
        .into_response();
    response
        .headers_mut()
        .insert(header::ETAG, HeaderValue::from_static(""));
    response
}
