//! Creation and transparent resolution of placeholder link objects.
//!
//! A link is a zero-length object whose sysmeta records a destination in
//! `container/object` form and whose content type is the link marker. Reads
//! of the link are redirected to the destination; the link never owns
//! content. Resolution performs exactly one hop: a link pointing at another
//! link is not followed further, and no cycle guard exists at this layer.

use crate::models::identity::ObjectIdentity;
use crate::services::backend::{
    AccessError, AccessVerifier, BackendError, BackendResponse, ObjectBackend,
};
use crate::services::cache_gateway::CacheGateway;
use crate::services::context::{RequestContext, copy_method};
use crate::services::trigger_registry::LINK_TO_KEY;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, header};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Content type marking an object as a link placeholder.
pub const LINK_CONTENT_TYPE: &str = "application/x-object-link";

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("link path and destination path cannot be the same")]
    PathConflict,
    #[error("link destination `{0}` is not a container/object path")]
    BadDestination(String),
    #[error(transparent)]
    Access(#[from] AccessError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Creates links and follows them on the read path.
#[derive(Clone)]
pub struct LinkResolver {
    backend: Arc<dyn ObjectBackend>,
    verifier: Arc<dyn AccessVerifier>,
    cache: CacheGateway,
}

impl LinkResolver {
    pub fn new(
        backend: Arc<dyn ObjectBackend>,
        verifier: Arc<dyn AccessVerifier>,
        cache: CacheGateway,
    ) -> Self {
        Self {
            backend,
            verifier,
            cache,
        }
    }

    /// Create a link at `link_rel` pointing to `dest_rel` (both in
    /// `container/object` form within `account`).
    ///
    /// The caller's access to the destination is checked first; the link
    /// itself is a zero-length PUT carrying the marker content type and the
    /// destination sysmeta entry.
    pub async fn create_link(
        &self,
        ctx: &RequestContext,
        account: &str,
        link_rel: &str,
        dest_rel: &str,
    ) -> Result<BackendResponse, LinkError> {
        debug!(link = link_rel, dest = dest_rel, "creating link");
        self.verifier
            .verify(ctx, &format!("/v1/{account}/{dest_rel}"))
            .await?;

        let mut sub = ctx
            .derive(Method::PUT, format!("/v1/{account}/{link_rel}"))
            .with_header(
                header::CONTENT_TYPE,
                HeaderValue::from_static(LINK_CONTENT_TYPE),
            )
            .with_header(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
        match HeaderValue::from_str(dest_rel) {
            Ok(value) => {
                sub = sub.with_header(HeaderName::from_static(LINK_TO_KEY), value);
            }
            Err(_) => return Err(LinkError::BadDestination(dest_rel.to_string())),
        }

        Ok(self.backend.forward(&sub).await?)
    }

    /// Follow the link in `response`, if it is one.
    ///
    /// The destination's cache entry is consulted before the backend, and
    /// the caller's original headers and auth travel with the re-issued
    /// read. Exactly one hop.
    pub async fn resolve_if_link(
        &self,
        ctx: &RequestContext,
        account: &str,
        response: BackendResponse,
    ) -> Result<BackendResponse, LinkError> {
        if response.content_type() != Some(LINK_CONTENT_TYPE) {
            return Ok(response);
        }
        let Some(dest_rel) = response.header(LINK_TO_KEY) else {
            warn!("link object carries no destination; returning it unresolved");
            return Ok(response);
        };
        let Some(dest) = ObjectIdentity::from_relative(account, dest_rel) else {
            return Err(LinkError::BadDestination(dest_rel.to_string()));
        };

        debug!(dest = %dest, "following link");
        if let Some(cached) = self.cache.lookup(&dest).await {
            return Ok(cached);
        }
        let sub = ctx.derive(Method::GET, dest.request_path());
        Ok(self.backend.forward(&sub).await?)
    }

    /// Move `source_rel` behind `dest_rel`: copy content across unless the
    /// source is already a link (or link-carrier), then plant a link at the
    /// source. The visible effect is a move implemented as copy-then-link.
    pub async fn move_or_link(
        &self,
        ctx: &RequestContext,
        account: &str,
        source_rel: &str,
        dest_rel: &str,
    ) -> Result<BackendResponse, LinkError> {
        if source_rel == dest_rel {
            return Err(LinkError::PathConflict);
        }

        let source_path = format!("/v1/{account}/{source_rel}");
        let headers = self.verifier.verify(ctx, &source_path).await?;

        let already_linked = header_str(&headers, LINK_TO_KEY).is_some()
            || header_str(&headers, header::CONTENT_TYPE.as_str()) == Some(LINK_CONTENT_TYPE);
        if !already_linked {
            let value = HeaderValue::from_str(dest_rel)
                .map_err(|_| LinkError::BadDestination(dest_rel.to_string()))?;
            let copy = ctx
                .derive(copy_method(), source_path.as_str())
                .with_header(HeaderName::from_static("destination"), value);
            let response = self.backend.forward(&copy).await?;
            if !response.is_success() {
                return Ok(response);
            }
        }

        self.create_link(ctx, account, source_rel, dest_rel).await
    }
}
