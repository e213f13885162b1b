//! Collaborator ports the pipeline composes, plus the local storage adapter.
//!
//! The pipeline talks to four external collaborators through traits:
//! the storage engine ([`ObjectBackend`]), the access checker
//! ([`AccessVerifier`]), and the handler-execution service
//! ([`HandlerExecutor`]); the cache port lives with the cache gateway.
//! [`LocalStore`] adapts [`StorageService`] into an `ObjectBackend` so a
//! single process can serve requests end to end.

use crate::models::identity::ObjectIdentity;
use crate::models::trigger::Trigger;
use crate::services::context::RequestContext;
use crate::services::metadata_codec::{self, CodecError, METADATA_XATTR_KEY, Mapping};
use crate::services::storage_service::{StorageError, StorageService};
use crate::services::trigger_registry::{
    RegistryError, TRIGGER_MAP_KEY, TriggerRegistry, normalize_trigger_map,
};
use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use bytes::Bytes;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Response header listing handlers that still have to run for this read.
pub const PENDING_HANDLERS_HEADER: &str = "x-trigger-pending-handlers";

/// Prefix of user-supplied metadata headers, persisted under the generic
/// attribute key rather than the reserved one.
pub const USER_META_PREFIX: &str = "x-object-meta-";

/// A buffered response from the storage collaborator.
///
/// The pipeline inspects and rewrites headers and bodies (links, caching,
/// handler execution), so responses are held in memory rather than streamed.
#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl BackendResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Plain-text response, used for listings and error passthrough.
    pub fn with_text(status: StatusCode, text: impl Into<String>) -> Self {
        let mut response = Self::new(status).with_body(Bytes::from(text.into()));
        response.headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header(header::CONTENT_TYPE.as_str())
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("malformed request path `{0}`")]
    BadPath(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Outcome of an access check against a path.
#[derive(Debug, Error)]
pub enum AccessError {
    #[error("unauthorized to access this resource: {path}")]
    Unauthorized { path: String },
    #[error("object `{path}` does not exist")]
    NotFound { path: String },
}

/// Port to the storage engine.
#[async_trait]
pub trait ObjectBackend: Send + Sync {
    /// Forward a (sub)request and return its response. Storage-level
    /// not-found conditions come back as 404 responses, not errors.
    async fn forward(&self, ctx: &RequestContext) -> Result<BackendResponse, BackendError>;

    /// Resolve an object identity to its physical data file.
    fn data_file(&self, identity: &ObjectIdentity) -> Result<PathBuf, BackendError>;
}

/// Port to the auth/access collaborator.
#[async_trait]
pub trait AccessVerifier: Send + Sync {
    /// HEAD-style existence and permission check. Returns the target's
    /// response headers on success.
    async fn verify(&self, ctx: &RequestContext, path: &str) -> Result<HeaderMap, AccessError>;
}

/// Port to the handler-execution collaborator. This core only assembles the
/// ordered handler list and per-handler configuration; running the handlers
/// is someone else's job.
#[async_trait]
pub trait HandlerExecutor: Send + Sync {
    /// Whether handler execution is switched on for this account.
    async fn enabled_for(&self, account: &str) -> bool;

    /// Hand the pending handlers their response; may rewrite it.
    async fn execute(
        &self,
        response: BackendResponse,
        handlers: Vec<String>,
        configs: BTreeMap<String, String>,
    ) -> BackendResponse;
}

/// Executor that only records what would have run.
pub struct LoggingExecutor {
    enabled: bool,
}

impl LoggingExecutor {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

#[async_trait]
impl HandlerExecutor for LoggingExecutor {
    async fn enabled_for(&self, _account: &str) -> bool {
        self.enabled
    }

    async fn execute(
        &self,
        response: BackendResponse,
        handlers: Vec<String>,
        configs: BTreeMap<String, String>,
    ) -> BackendResponse {
        info!(?handlers, configured = configs.len(), "handlers pending execution");
        response
    }
}

/// Access verifier that issues a HEAD sub-request through the backend, the
/// same way any other caller would be checked.
pub struct BackendAccessVerifier {
    backend: Arc<dyn ObjectBackend>,
}

impl BackendAccessVerifier {
    pub fn new(backend: Arc<dyn ObjectBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl AccessVerifier for BackendAccessVerifier {
    async fn verify(&self, ctx: &RequestContext, path: &str) -> Result<HeaderMap, AccessError> {
        debug!(path, "verifying access");
        let sub = ctx.derive(Method::HEAD, path);
        let response = match self.backend.forward(&sub).await {
            Ok(response) => response,
            Err(err) => {
                warn!(path, error = %err, "access check failed against the backend");
                return Err(AccessError::NotFound {
                    path: path.to_string(),
                });
            }
        };

        if response.status == StatusCode::UNAUTHORIZED {
            Err(AccessError::Unauthorized {
                path: path.to_string(),
            })
        } else if !response.is_success() {
            Err(AccessError::NotFound {
                path: path.to_string(),
            })
        } else {
            Ok(response.headers)
        }
    }
}

/// Adapter exposing [`StorageService`] as an [`ObjectBackend`].
///
/// On reads it folds the data file's sysmeta mapping into response headers
/// and announces read-trigger handlers via the pending-handlers header; on
/// writes it persists any `x-object-sysmeta-trigger-*` request headers back
/// into the data file's attributes.
pub struct LocalStore {
    storage: StorageService,
    registry: TriggerRegistry,
}

impl LocalStore {
    pub fn new(storage: StorageService, registry: TriggerRegistry) -> Self {
        Self { storage, registry }
    }

    fn parse_path(path: &str) -> Result<(String, String, Option<String>), BackendError> {
        let trimmed = path.strip_prefix("/v1/").ok_or_else(|| {
            BackendError::BadPath(path.to_string())
        })?;
        let mut parts = trimmed.splitn(3, '/');
        let account = parts.next().filter(|s| !s.is_empty());
        let container = parts.next().filter(|s| !s.is_empty());
        let object = parts.next().filter(|s| !s.is_empty()).map(String::from);
        match (account, container) {
            (Some(account), Some(container)) => {
                Ok((account.to_string(), container.to_string(), object))
            }
            _ => Err(BackendError::BadPath(path.to_string())),
        }
    }

    /// Fold the object's sysmeta entries into response headers.
    fn apply_sysmeta_headers(
        &self,
        headers: &mut HeaderMap,
        identity: &ObjectIdentity,
    ) -> Result<(), BackendError> {
        let data_file = self
            .storage
            .object_path(&identity.account, &identity.container, &identity.object);
        let sysmeta = self.registry.sysmeta(&data_file)?;

        for (key, value) in &sysmeta {
            let text = match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            let Ok(name) = HeaderName::from_bytes(key.as_bytes()) else {
                warn!(key, "sysmeta entry does not form a valid header name");
                continue;
            };
            let Ok(value) = HeaderValue::from_str(&text) else {
                warn!(key, "sysmeta entry does not form a valid header value");
                continue;
            };
            headers.insert(name, value);
        }

        // announce read-trigger handlers so the proxy side can run them
        if let Some(value) = sysmeta.get(TRIGGER_MAP_KEY) {
            let map = normalize_trigger_map(value).map_err(BackendError::Registry)?;
            if let Some(handlers) = map.handlers_for(Trigger::OnRead) {
                let list = serde_json::json!(handlers).to_string();
                if let Ok(value) = HeaderValue::from_str(&list) {
                    headers.insert(
                        HeaderName::from_static(PENDING_HANDLERS_HEADER),
                        value,
                    );
                }
            }
        }

        Ok(())
    }

    /// Fold the object's generic metadata entries into response headers.
    fn apply_user_metadata_headers(
        &self,
        headers: &mut HeaderMap,
        identity: &ObjectIdentity,
    ) -> Result<(), BackendError> {
        let data_file = self
            .storage
            .object_path(&identity.account, &identity.container, &identity.object);
        let Some(mapping) = metadata_codec::read_mapping(&data_file, METADATA_XATTR_KEY)
            .map_err(RegistryError::Codec)?
        else {
            return Ok(());
        };

        for (key, value) in &mapping {
            let text = match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(key.as_bytes()),
                HeaderValue::from_str(&text),
            ) else {
                warn!(key, "metadata entry does not form a valid header");
                continue;
            };
            headers.insert(name, value);
        }
        Ok(())
    }

    /// Persist the request's sysmeta and user-metadata headers onto the
    /// object's data file, each under its own attribute key.
    fn persist_attribute_headers(
        &self,
        identity: &ObjectIdentity,
        ctx: &RequestContext,
    ) -> Result<(), BackendError> {
        let data_file = self
            .storage
            .object_path(&identity.account, &identity.container, &identity.object);

        let sysmeta: Vec<(String, String)> = ctx
            .headers
            .iter()
            .filter(|(name, _)| {
                name.as_str()
                    .starts_with(crate::services::trigger_registry::SYSMETA_PREFIX)
            })
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        if !sysmeta.is_empty() {
            self.registry.set_sysmeta_entries(&data_file, sysmeta)?;
        }

        let user_meta: Mapping = ctx
            .headers
            .iter()
            .filter(|(name, _)| name.as_str().starts_with(USER_META_PREFIX))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), Value::String(v.to_string())))
            })
            .collect();
        if !user_meta.is_empty() {
            metadata_codec::write_mapping(
                &data_file,
                METADATA_XATTR_KEY,
                &user_meta,
                self.registry.max_slot_bytes,
            )
            .map_err(RegistryError::Codec)?;
        }

        Ok(())
    }

    fn object_headers(record: &crate::models::object::ObjectRecord) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let content_type = record
            .content_type
            .clone()
            .unwrap_or_else(|| "application/octet-stream".into());
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_str(&content_type)
                .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
        );
        headers.insert(
            header::CONTENT_LENGTH,
            HeaderValue::from_str(&record.size_bytes.max(0).to_string())
                .unwrap_or_else(|_| HeaderValue::from_static("0")),
        );
        if let Some(etag) = record.etag.as_ref() {
            if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", etag)) {
                headers.insert(header::ETAG, value);
            }
        }
        if let Ok(value) = HeaderValue::from_str(&record.last_modified.to_rfc2822()) {
            headers.insert(header::LAST_MODIFIED, value);
        }
        headers
    }

    async fn get_object(&self, identity: &ObjectIdentity) -> Result<BackendResponse, BackendError> {
        let (record, body) = self
            .storage
            .read_object(&identity.account, &identity.container, &identity.object)
            .await?;
        let mut headers = Self::object_headers(&record);
        self.apply_sysmeta_headers(&mut headers, identity)?;
        self.apply_user_metadata_headers(&mut headers, identity)?;
        Ok(BackendResponse {
            status: StatusCode::OK,
            headers,
            body,
        })
    }

    async fn head_object(
        &self,
        identity: &ObjectIdentity,
    ) -> Result<BackendResponse, BackendError> {
        let record = self
            .storage
            .object_metadata(&identity.account, &identity.container, &identity.object)
            .await?;
        let mut headers = Self::object_headers(&record);
        self.apply_sysmeta_headers(&mut headers, identity)?;
        self.apply_user_metadata_headers(&mut headers, identity)?;
        Ok(BackendResponse {
            status: StatusCode::OK,
            headers,
            body: Bytes::new(),
        })
    }

    async fn put_object(
        &self,
        identity: &ObjectIdentity,
        ctx: &RequestContext,
    ) -> Result<BackendResponse, BackendError> {
        let content_type = ctx.header(header::CONTENT_TYPE.as_str()).map(String::from);
        let record = self
            .storage
            .write_object(
                &identity.account,
                &identity.container,
                &identity.object,
                content_type,
                ctx.body.clone(),
            )
            .await?;

        self.persist_attribute_headers(identity, ctx)?;

        let mut response = BackendResponse::new(StatusCode::CREATED);
        if let Some(etag) = record.etag.as_ref() {
            if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", etag)) {
                response.headers.insert(header::ETAG, value);
            }
        }
        Ok(response)
    }

    async fn copy_object(
        &self,
        identity: &ObjectIdentity,
        ctx: &RequestContext,
    ) -> Result<BackendResponse, BackendError> {
        let destination = ctx
            .header("destination")
            .ok_or_else(|| BackendError::BadPath("missing Destination header".to_string()))?;
        let dest = ObjectIdentity::from_relative(&identity.account, destination)
            .ok_or_else(|| BackendError::BadPath(destination.to_string()))?;

        let (record, body) = self
            .storage
            .read_object(&identity.account, &identity.container, &identity.object)
            .await?;
        self.storage
            .write_object(
                &dest.account,
                &dest.container,
                &dest.object,
                record.content_type.clone(),
                body,
            )
            .await?;

        // attributes travel with the content
        let source_file = self
            .storage
            .object_path(&identity.account, &identity.container, &identity.object);
        let dest_file = self
            .storage
            .object_path(&dest.account, &dest.container, &dest.object);

        let sysmeta = self.registry.sysmeta(&source_file)?;
        if !sysmeta.is_empty() {
            let entries = sysmeta
                .into_iter()
                .map(|(key, value)| {
                    let text = match value {
                        Value::String(text) => text,
                        other => other.to_string(),
                    };
                    (key, text)
                })
                .collect();
            self.registry.set_sysmeta_entries(&dest_file, entries)?;
        }
        if let Some(user_meta) = metadata_codec::read_mapping(&source_file, METADATA_XATTR_KEY)
            .map_err(RegistryError::Codec)?
        {
            metadata_codec::write_mapping(
                &dest_file,
                METADATA_XATTR_KEY,
                &user_meta,
                self.registry.max_slot_bytes,
            )
            .map_err(RegistryError::Codec)?;
        }

        Ok(BackendResponse::new(StatusCode::CREATED))
    }

    /// Metadata-only update: the content stays untouched, only attribute
    /// headers are persisted.
    async fn post_object(
        &self,
        identity: &ObjectIdentity,
        ctx: &RequestContext,
    ) -> Result<BackendResponse, BackendError> {
        self.storage
            .object_metadata(&identity.account, &identity.container, &identity.object)
            .await?;
        self.persist_attribute_headers(identity, ctx)?;
        Ok(BackendResponse::new(StatusCode::ACCEPTED))
    }

    async fn list_container(
        &self,
        account: &str,
        container: &str,
        ctx: &RequestContext,
    ) -> Result<BackendResponse, BackendError> {
        let prefix = ctx
            .query
            .as_deref()
            .and_then(|query| {
                query
                    .split('&')
                    .find_map(|pair| pair.strip_prefix("prefix="))
            })
            .map(String::from);
        let names = self
            .storage
            .list_object_names(account, container, prefix.as_deref())
            .await?;
        Ok(BackendResponse::with_text(StatusCode::OK, names.join("\n")))
    }

    async fn handle(&self, ctx: &RequestContext) -> Result<BackendResponse, BackendError> {
        let (account, container, object) = Self::parse_path(&ctx.path)?;

        let Some(object) = object else {
            return match ctx.method.as_str() {
                "GET" => self.list_container(&account, &container, ctx).await,
                _ => Ok(BackendResponse::new(StatusCode::METHOD_NOT_ALLOWED)),
            };
        };

        let identity = ObjectIdentity::new(account, container, object);
        match ctx.method.as_str() {
            "GET" => self.get_object(&identity).await,
            "HEAD" => self.head_object(&identity).await,
            "PUT" => self.put_object(&identity, ctx).await,
            "POST" => self.post_object(&identity, ctx).await,
            "COPY" => self.copy_object(&identity, ctx).await,
            "DELETE" => {
                self.storage
                    .delete_object(&identity.account, &identity.container, &identity.object)
                    .await?;
                Ok(BackendResponse::new(StatusCode::NO_CONTENT))
            }
            _ => Ok(BackendResponse::new(StatusCode::METHOD_NOT_ALLOWED)),
        }
    }
}

#[async_trait]
impl ObjectBackend for LocalStore {
    async fn forward(&self, ctx: &RequestContext) -> Result<BackendResponse, BackendError> {
        match self.handle(ctx).await {
            Ok(response) => Ok(response),
            Err(err) => downgrade_to_response(err),
        }
    }

    fn data_file(&self, identity: &ObjectIdentity) -> Result<PathBuf, BackendError> {
        Ok(self
            .storage
            .object_path(&identity.account, &identity.container, &identity.object))
    }
}

/// Map expected storage failures onto plain status responses so sub-request
/// callers can branch on status the way they would against a remote engine.
/// Infrastructure faults stay errors.
fn downgrade_to_response(err: BackendError) -> Result<BackendResponse, BackendError> {
    match err {
        BackendError::Storage(StorageError::ContainerNotFound(name)) => Ok(
            BackendResponse::with_text(StatusCode::NOT_FOUND, format!("container `{name}` not found")),
        ),
        BackendError::Storage(StorageError::ObjectNotFound { container, object }) => {
            Ok(BackendResponse::with_text(
                StatusCode::NOT_FOUND,
                format!("object `{object}` not found in container `{container}`"),
            ))
        }
        BackendError::Storage(StorageError::InvalidObjectName) => Ok(
            BackendResponse::with_text(StatusCode::BAD_REQUEST, "invalid object name"),
        ),
        BackendError::Storage(StorageError::InvalidContainerName { name, reason }) => {
            Ok(BackendResponse::with_text(
                StatusCode::BAD_REQUEST,
                format!("container `{name}` invalid: {reason}"),
            ))
        }
        BackendError::Storage(StorageError::ContainerAlreadyExists(name)) => {
            Ok(BackendResponse::with_text(
                StatusCode::CONFLICT,
                format!("container `{name}` already exists"),
            ))
        }
        BackendError::Registry(RegistryError::Codec(CodecError::ObjectGone { path })) => Ok(
            BackendResponse::with_text(StatusCode::NOT_FOUND, format!("data file {path} is gone")),
        ),
        other => Err(other),
    }
}
