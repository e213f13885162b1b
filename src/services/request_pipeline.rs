//! Per-verb request orchestration.
//!
//! One pipeline instance serves every request; each call is an independent
//! synchronous decision flow with no state carried between requests. Verbs
//! are a closed enum dispatched with an explicit match, so an unknown method
//! is a 405 before any collaborator is consulted.
//!
//! Reads go cache, then backend, then one link hop, then handler dispatch.
//! Writes and metadata updates own the trigger assignment/deletion surface,
//! including wildcard expansion over a container listing; moves are
//! copy-then-link. Wildcard bulk mutations run strictly sequentially with no
//! cross-object transaction: a failure on object k leaves earlier objects
//! already mutated.

use crate::models::identity::ObjectIdentity;
use crate::models::trigger::{Trigger, TriggerTarget};
use crate::services::backend::{
    AccessError, AccessVerifier, BackendError, BackendResponse, HandlerExecutor, ObjectBackend,
    PENDING_HANDLERS_HEADER,
};
use crate::services::cache_gateway::CacheGateway;
use crate::services::context::RequestContext;
use crate::services::link_resolver::{LINK_CONTENT_TYPE, LinkError, LinkResolver};
use crate::services::trigger_registry::{
    LINK_TO_KEY, RegistryError, SYSMETA_PREFIX, TRIGGER_MAP_KEY, TriggerRegistry,
    binding_config_key, normalize_trigger_map,
};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Request header binding a handler to one trigger, e.g.
/// `x-trigger-assign-on-read: thumbnailer`.
pub const ASSIGN_HEADER_PREFIX: &str = "x-trigger-assign-";

/// Request header unbinding a handler from one trigger (or, with the
/// `all-triggers` suffix and the `all` value, wiping the whole namespace).
pub const DELETE_HEADER_PREFIX: &str = "x-trigger-delete-";

/// Request header turning a PUT into a move: the value is the new
/// `container/object` home of the content.
pub const MOVE_HEADER: &str = "x-trigger-link-to";

/// Standard move verb destination header.
pub const DESTINATION_HEADER: &str = "destination";

/// Capability token presented by handler-originated recursive reads.
pub const CAPABILITY_TOKEN_HEADER: &str = "x-trigger-token";

/// User agent handlers identify themselves with on re-entrant reads.
pub const HANDLER_USER_AGENT: &str = "trigger-store/handler";

/// Cache-key namespace for issued capability tokens.
pub const TOKEN_CACHE_PREFIX: &str = "trigger-token";

/// The closed set of verbs the pipeline understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Get,
    Put,
    Post,
    Head,
    Delete,
    Move,
}

impl Verb {
    pub fn from_method(method: &Method) -> Option<Self> {
        match method.as_str() {
            "GET" => Some(Verb::Get),
            "PUT" => Some(Verb::Put),
            "POST" => Some(Verb::Post),
            "HEAD" => Some(Verb::Head),
            "DELETE" => Some(Verb::Delete),
            "MOVE" => Some(Verb::Move),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{0}")]
    BadRequest(String),
    #[error("pending-handlers header does not decode: {0}")]
    MalformedHandlerList(#[source] serde_json::Error),
    #[error(transparent)]
    Access(#[from] AccessError),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// One parsed trigger mutation from the request headers.
#[derive(Debug, Clone)]
enum TriggerMutation {
    Assign { trigger: Trigger, handler: String },
    Remove { target: TriggerTarget, handler: String },
}

/// Top-level per-verb orchestration over the engine core and the
/// storage/auth/executor collaborators.
pub struct RequestPipeline {
    backend: Arc<dyn ObjectBackend>,
    verifier: Arc<dyn AccessVerifier>,
    executor: Arc<dyn HandlerExecutor>,
    cache: CacheGateway,
    links: LinkResolver,
    registry: TriggerRegistry,
    /// Container holding handler artifacts; assignment checks access to the
    /// named handler object inside it.
    handler_container: String,
}

impl RequestPipeline {
    pub fn new(
        backend: Arc<dyn ObjectBackend>,
        verifier: Arc<dyn AccessVerifier>,
        executor: Arc<dyn HandlerExecutor>,
        cache: CacheGateway,
        links: LinkResolver,
        registry: TriggerRegistry,
        handler_container: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            verifier,
            executor,
            cache,
            links,
            registry,
            handler_container: handler_container.into(),
        }
    }

    /// Handle one object request. `ctx.path` is the request path of
    /// `identity`.
    pub async fn handle(
        &self,
        identity: ObjectIdentity,
        ctx: RequestContext,
    ) -> Result<BackendResponse, PipelineError> {
        debug!(
            method = %ctx.method,
            path = %ctx.path,
            authed = ctx.auth_token().is_some(),
            "dispatching request"
        );
        let Some(verb) = Verb::from_method(&ctx.method) else {
            debug!(method = %ctx.method, "verb outside the dispatch table");
            return Ok(BackendResponse::new(StatusCode::METHOD_NOT_ALLOWED));
        };

        match verb {
            Verb::Get => self.read(identity, ctx).await,
            Verb::Put | Verb::Post => self.write(identity, ctx, verb).await,
            Verb::Head => self.head(ctx).await,
            Verb::Move => {
                let Some(dest) = ctx.header(DESTINATION_HEADER).map(str::to_string) else {
                    return Err(PipelineError::BadRequest(
                        "MOVE requires a Destination header".to_string(),
                    ));
                };
                Ok(self
                    .links
                    .move_or_link(&ctx, &identity.account, &identity.relative(), &dest)
                    .await?)
            }
            Verb::Delete => Ok(self.backend.forward(&ctx).await?),
        }
    }

    /// Read flow: capability check, cache, backend, one link hop, handler
    /// dispatch, framing normalization.
    async fn read(
        &self,
        identity: ObjectIdentity,
        ctx: RequestContext,
    ) -> Result<BackendResponse, PipelineError> {
        let run_handlers = !self.is_reentrant_handler_read(&ctx, &identity).await;

        let mut response = match self.cache.lookup(&identity).await {
            Some(cached) => cached,
            None => self.backend.forward(&ctx).await?,
        };

        response = self
            .links
            .resolve_if_link(&ctx, &identity.account, response)
            .await?;

        if let Some(raw) = response.header(PENDING_HANDLERS_HEADER).map(str::to_string) {
            response.headers.remove(PENDING_HANDLERS_HEADER);
            if run_handlers && self.executor.enabled_for(&identity.account).await {
                let handlers: Vec<String> =
                    serde_json::from_str(&raw).map_err(PipelineError::MalformedHandlerList)?;
                let configs = read_binding_configs(&response.headers, &handlers);
                info!(object = %identity, ?handlers, "dispatching read handlers");
                response = self.executor.execute(response, handlers, configs).await;
            }
        }

        Ok(normalize_framing(response))
    }

    /// Write flow: the trigger surface first, then moves, then passthrough.
    /// POST shares the trigger branch but never moves content.
    async fn write(
        &self,
        identity: ObjectIdentity,
        ctx: RequestContext,
        verb: Verb,
    ) -> Result<BackendResponse, PipelineError> {
        let mutations = parse_trigger_mutations(&ctx.headers)?;
        if !mutations.is_empty() {
            return self.apply_trigger_request(&identity, &ctx, mutations).await;
        }

        if verb == Verb::Put {
            if let Some(dest) = ctx.header(MOVE_HEADER).map(str::to_string) {
                return Ok(self
                    .links
                    .move_or_link(&ctx, &identity.account, &identity.relative(), &dest)
                    .await?);
            }
        }

        Ok(self.backend.forward(&ctx).await?)
    }

    /// Head flow: passthrough, then rewrite the reserved namespace to its
    /// public header names.
    async fn head(&self, ctx: RequestContext) -> Result<BackendResponse, PipelineError> {
        let mut response = self.backend.forward(&ctx).await?;
        publish_sysmeta_headers(&mut response)?;
        Ok(response)
    }

    /// True when the read comes from a handler presenting a capability token
    /// previously issued for this very object. Such reads must not trigger
    /// again.
    async fn is_reentrant_handler_read(
        &self,
        ctx: &RequestContext,
        identity: &ObjectIdentity,
    ) -> bool {
        if ctx.header(header::USER_AGENT.as_str()) != Some(HANDLER_USER_AGENT) {
            return false;
        }
        let Some(token) = ctx.header(CAPABILITY_TOKEN_HEADER) else {
            return false;
        };
        let prefix = token.split('-').next().unwrap_or(token);
        let key = format!("{TOKEN_CACHE_PREFIX}/{prefix}/{}", identity.cache_key());
        match self.cache.raw_get(&key).await {
            Some(issued) if issued == token.as_bytes() => {
                info!(object = %identity, "re-entrant handler read; trigger execution disabled");
                true
            }
            _ => false,
        }
    }

    /// Apply parsed trigger mutations to one object or a wildcard expansion.
    ///
    /// Each expanded object is handled independently; the caller sees the
    /// response for the last-processed object.
    async fn apply_trigger_request(
        &self,
        identity: &ObjectIdentity,
        ctx: &RequestContext,
        mutations: Vec<TriggerMutation>,
    ) -> Result<BackendResponse, PipelineError> {
        for mutation in &mutations {
            if let TriggerMutation::Assign { handler, .. } = mutation {
                let path = format!(
                    "/v1/{}/{}/{}",
                    identity.account, self.handler_container, handler
                );
                self.verifier.verify(ctx, &path).await?;
            }
        }

        let config = std::str::from_utf8(&ctx.body).map_err(|_| {
            PipelineError::BadRequest("binding configuration must be UTF-8 text".to_string())
        })?;

        let objects = if identity.object.contains('*') {
            self.expand_wildcard(identity, ctx).await?
        } else {
            vec![identity.object.clone()]
        };
        if objects.is_empty() {
            return Err(PipelineError::BadRequest(format!(
                "`{}` matches no objects",
                identity.object
            )));
        }

        let mut response = BackendResponse::new(StatusCode::ACCEPTED);
        for object in objects {
            let target = identity.with_object(object);
            response = self.apply_to_object(&target, ctx, &mutations, config).await?;
        }
        Ok(response)
    }

    /// Mutate one object's bindings, redirecting to the link destination
    /// when the object is a placeholder.
    async fn apply_to_object(
        &self,
        target: &ObjectIdentity,
        ctx: &RequestContext,
        mutations: &[TriggerMutation],
        config: &str,
    ) -> Result<BackendResponse, PipelineError> {
        let headers = self.verifier.verify(ctx, &target.request_path()).await?;

        // a link never carries bindings of its own
        let target = match linked_destination(&headers, &target.account) {
            Some(dest) => {
                self.verifier.verify(ctx, &dest.request_path()).await?;
                dest
            }
            None => target.clone(),
        };

        let data_file = self.backend.data_file(&target)?;
        for mutation in mutations {
            match mutation {
                TriggerMutation::Assign { trigger, handler } => {
                    self.registry
                        .add_binding(&data_file, *trigger, handler, config)?;
                }
                TriggerMutation::Remove { target, handler } => {
                    self.registry.remove_binding(&data_file, *target, handler)?;
                }
            }
        }

        Ok(BackendResponse::with_text(
            StatusCode::ACCEPTED,
            format!("trigger bindings updated for {target}\n"),
        ))
    }

    /// Expand a wildcard object name into concrete names via a container
    /// listing sub-request: `*` covers the whole container, `prefix/*` the
    /// pseudo-folder sharing that slash-delimited prefix.
    async fn expand_wildcard(
        &self,
        identity: &ObjectIdentity,
        ctx: &RequestContext,
    ) -> Result<Vec<String>, PipelineError> {
        let mut sub = ctx.derive(Method::GET, identity.container_path());
        if identity.object != "*" {
            let Some((folder, _)) = identity.object.rsplit_once('/') else {
                return Err(PipelineError::BadRequest(format!(
                    "`{}` is not a container or pseudo-folder wildcard",
                    identity.object
                )));
            };
            sub = sub.with_query(format!("prefix={folder}/"));
        }

        let response = self.backend.forward(&sub).await?;
        if !response.is_success() {
            return Err(PipelineError::BadRequest(format!(
                "cannot list container `{}` for wildcard expansion",
                identity.container
            )));
        }

        let body = String::from_utf8_lossy(&response.body);
        let names: Vec<String> = body
            .lines()
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect();
        debug!(
            wildcard = identity.object,
            count = names.len(),
            "expanded wildcard"
        );
        Ok(names)
    }
}

/// Parse the trigger assignment/deletion headers into mutations.
/// Assignments come first so a request carrying both is deterministic.
fn parse_trigger_mutations(headers: &HeaderMap) -> Result<Vec<TriggerMutation>, PipelineError> {
    let mut assigns = Vec::new();
    let mut removes = Vec::new();

    for (name, value) in headers {
        let name = name.as_str();
        let suffix = if let Some(suffix) = name.strip_prefix(ASSIGN_HEADER_PREFIX) {
            suffix
        } else if let Some(suffix) = name.strip_prefix(DELETE_HEADER_PREFIX) {
            suffix
        } else {
            continue;
        };

        let handler = value
            .to_str()
            .map_err(|_| PipelineError::BadRequest(format!("`{name}` value is not valid text")))?
            .trim();
        if handler.is_empty() {
            return Err(PipelineError::BadRequest(format!(
                "`{name}` names no handler"
            )));
        }

        if name.starts_with(ASSIGN_HEADER_PREFIX) {
            let trigger: Trigger = suffix
                .parse()
                .map_err(|err| PipelineError::BadRequest(format!("{err}")))?;
            assigns.push(TriggerMutation::Assign {
                trigger,
                handler: handler.to_string(),
            });
        } else {
            let target: TriggerTarget = suffix
                .parse()
                .map_err(|err| PipelineError::BadRequest(format!("{err}")))?;
            removes.push(TriggerMutation::Remove {
                target,
                handler: handler.to_string(),
            });
        }
    }

    assigns.extend(removes);
    Ok(assigns)
}

/// Destination identity when the HEAD headers describe a link placeholder.
fn linked_destination(headers: &HeaderMap, account: &str) -> Option<ObjectIdentity> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    if content_type != Some(LINK_CONTENT_TYPE) {
        return None;
    }
    let Some(dest) = headers.get(LINK_TO_KEY).and_then(|v| v.to_str().ok()) else {
        warn!("link object carries no destination; mutating the link itself");
        return None;
    };
    ObjectIdentity::from_relative(account, dest)
}

/// Collect per-handler configuration blobs from the response headers.
fn read_binding_configs(headers: &HeaderMap, handlers: &[String]) -> BTreeMap<String, String> {
    let mut configs = BTreeMap::new();
    for handler in handlers {
        let key = binding_config_key(Trigger::OnRead, handler);
        if let Some(config) = headers.get(&key).and_then(|v| v.to_str().ok()) {
            configs.insert(handler.clone(), config.to_string());
        }
    }
    configs
}

/// Content-Length always reflects the actual body; chunked framing from a
/// sub-response never survives into the final one.
fn normalize_framing(mut response: BackendResponse) -> BackendResponse {
    response.headers.remove(header::TRANSFER_ENCODING);
    if let Ok(value) = HeaderValue::from_str(&response.body.len().to_string()) {
        response.headers.insert(header::CONTENT_LENGTH, value);
    }
    response
}

/// Rewrite every reserved-namespace response header to its public name,
/// dropping the sysmeta form. The aggregate trigger-map header is filtered
/// of null slots on the way out.
fn publish_sysmeta_headers(response: &mut BackendResponse) -> Result<(), PipelineError> {
    let reserved: Vec<HeaderName> = response
        .headers
        .keys()
        .filter(|name| name.as_str().starts_with(SYSMETA_PREFIX))
        .cloned()
        .collect();

    for name in reserved {
        let Some(value) = response.headers.remove(&name) else {
            continue;
        };
        let public = name
            .as_str()
            .strip_prefix("x-object-sysmeta-")
            .unwrap_or(name.as_str());
        let Ok(public_name) = HeaderName::from_bytes(public.as_bytes()) else {
            continue;
        };

        if name.as_str() == TRIGGER_MAP_KEY {
            let Ok(text) = value.to_str() else { continue };
            let map = normalize_trigger_map(&Value::String(text.to_string()))?;
            let filtered = map.to_public_json().to_string();
            if let Ok(filtered) = HeaderValue::from_str(&filtered) {
                response.headers.insert(public_name, filtered);
            }
        } else {
            response.headers.insert(public_name, value);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::trigger::HANDLER_WILDCARD;
    use crate::services::backend::{BackendAccessVerifier, LocalStore};
    use crate::services::cache_gateway::{CachedEntry, InMemoryCache};
    use async_trait::async_trait;
    use bytes::Bytes;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const MIGRATION: &str = include_str!("../../migrations/0001_init.sql");

    /// Executor that records what it was asked to run.
    struct RecordingExecutor {
        enabled: bool,
        runs: Mutex<Vec<(Vec<String>, BTreeMap<String, String>)>>,
    }

    impl RecordingExecutor {
        fn new(enabled: bool) -> Self {
            Self {
                enabled,
                runs: Mutex::new(Vec::new()),
            }
        }

        fn runs(&self) -> Vec<(Vec<String>, BTreeMap<String, String>)> {
            self.runs.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HandlerExecutor for RecordingExecutor {
        async fn enabled_for(&self, _account: &str) -> bool {
            self.enabled
        }

        async fn execute(
            &self,
            response: BackendResponse,
            handlers: Vec<String>,
            configs: BTreeMap<String, String>,
        ) -> BackendResponse {
            self.runs.lock().unwrap().push((handlers, configs));
            response
        }
    }

    struct Fixture {
        _dir: TempDir,
        storage: crate::services::storage_service::StorageService,
        cache: Arc<InMemoryCache>,
        executor: Arc<RecordingExecutor>,
        links: LinkResolver,
        registry: TriggerRegistry,
        pipeline: RequestPipeline,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir_in(env!("CARGO_MANIFEST_DIR")).unwrap();
        let db = Arc::new(
            SqlitePoolOptions::new()
                .max_connections(1)
                .connect("sqlite::memory:")
                .await
                .unwrap(),
        );
        for stmt in MIGRATION.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(stmt).execute(&*db).await.unwrap();
        }

        let storage = crate::services::storage_service::StorageService::new(
            db,
            dir.path().join("objects"),
        );
        storage.create_container("acct", "photos").await.unwrap();
        storage.create_container("acct", "handlers").await.unwrap();
        storage
            .write_object("acct", "handlers", "noop", None, Bytes::from_static(b"artifact"))
            .await
            .unwrap();

        let registry = TriggerRegistry::default();
        let backend: Arc<dyn ObjectBackend> =
            Arc::new(LocalStore::new(storage.clone(), registry.clone()));
        let verifier: Arc<dyn AccessVerifier> =
            Arc::new(BackendAccessVerifier::new(backend.clone()));
        let cache_backend = Arc::new(InMemoryCache::new());
        let cache = CacheGateway::new(cache_backend.clone());
        let links = LinkResolver::new(backend.clone(), verifier.clone(), cache.clone());
        let executor = Arc::new(RecordingExecutor::new(true));

        let pipeline = RequestPipeline::new(
            backend,
            verifier,
            executor.clone(),
            cache,
            links.clone(),
            registry.clone(),
            "handlers",
        );

        Fixture {
            _dir: dir,
            storage,
            cache: cache_backend,
            executor,
            links,
            registry,
            pipeline,
        }
    }

    fn identity(object: &str) -> ObjectIdentity {
        ObjectIdentity::new("acct", "photos", object)
    }

    fn request(method: Method, identity: &ObjectIdentity) -> RequestContext {
        let mut headers = HeaderMap::new();
        headers.insert("x-auth-token", HeaderValue::from_static("tk"));
        RequestContext::new(method, identity.request_path(), None, headers, Bytes::new())
    }

    async fn put_object(fx: &Fixture, name: &str, body: &'static [u8]) {
        fx.storage
            .write_object("acct", "photos", name, Some("text/plain".into()), Bytes::from_static(body))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn get_returns_the_object() {
        let fx = fixture().await;
        put_object(&fx, "cat.jpg", b"meow!").await;

        let id = identity("cat.jpg");
        let response = fx.pipeline.handle(id.clone(), request(Method::GET, &id)).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(&response.body[..], b"meow!");
        assert_eq!(response.header("content-length"), Some("5"));
    }

    #[tokio::test]
    async fn unknown_verb_is_rejected_up_front() {
        let fx = fixture().await;
        let id = identity("whatever");
        let response = fx
            .pipeline
            .handle(id.clone(), request(Method::PATCH, &id))
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn cache_hit_short_circuits_storage() {
        let fx = fixture().await;
        // nothing written to storage for this name
        let id = identity("ghost.txt");
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "text/plain".to_string());
        fx.cache
            .put_entry(id.cache_key(), &CachedEntry::new(headers, b"cached"));

        let response = fx.pipeline.handle(id.clone(), request(Method::GET, &id)).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(&response.body[..], b"cached");
    }

    #[tokio::test]
    async fn read_of_link_returns_destination_body() {
        let fx = fixture().await;
        put_object(&fx, "real", b"the payload").await;

        let id = identity("alias");
        let ctx = request(Method::PUT, &id);
        fx.links
            .create_link(&ctx, "acct", "photos/alias", "photos/real")
            .await
            .unwrap();

        let response = fx.pipeline.handle(id.clone(), request(Method::GET, &id)).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(&response.body[..], b"the payload");
        assert_ne!(response.content_type(), Some(LINK_CONTENT_TYPE));
    }

    #[tokio::test]
    async fn link_chains_resolve_only_one_hop() {
        let fx = fixture().await;
        put_object(&fx, "real", b"the payload").await;

        let ctx = request(Method::PUT, &identity("unused"));
        fx.links
            .create_link(&ctx, "acct", "photos/middle", "photos/real")
            .await
            .unwrap();
        fx.links
            .create_link(&ctx, "acct", "photos/outer", "photos/middle")
            .await
            .unwrap();

        // one hop lands on the middle link and stops; the payload behind it
        // is not fetched
        let id = identity("outer");
        let response = fx.pipeline.handle(id.clone(), request(Method::GET, &id)).await.unwrap();
        assert_eq!(response.content_type(), Some(LINK_CONTENT_TYPE));
        assert!(response.body.is_empty());
    }

    #[tokio::test]
    async fn put_with_move_header_copies_then_links() {
        let fx = fixture().await;
        put_object(&fx, "orig", b"contents").await;

        let id = identity("orig");
        let ctx = request(Method::PUT, &id).with_header(
            HeaderName::from_static(MOVE_HEADER),
            HeaderValue::from_static("photos/archived"),
        );
        let response = fx.pipeline.handle(id.clone(), ctx).await.unwrap();
        assert!(response.is_success());

        // destination owns the content now
        let (_, body) = fx
            .storage
            .read_object("acct", "photos", "archived")
            .await
            .unwrap();
        assert_eq!(&body[..], b"contents");

        // and the old name still reads through the link
        let response = fx.pipeline.handle(id.clone(), request(Method::GET, &id)).await.unwrap();
        assert_eq!(&response.body[..], b"contents");
    }

    #[tokio::test]
    async fn same_path_move_is_a_conflict_without_writes() {
        let fx = fixture().await;
        put_object(&fx, "solo", b"untouched").await;

        let id = identity("solo");
        let ctx = request(Method::PUT, &id).with_header(
            HeaderName::from_static(MOVE_HEADER),
            HeaderValue::from_static("photos/solo"),
        );
        let err = fx.pipeline.handle(id.clone(), ctx).await.unwrap_err();
        assert!(matches!(err, PipelineError::Link(LinkError::PathConflict)));

        let (record, body) = fx.storage.read_object("acct", "photos", "solo").await.unwrap();
        assert_eq!(&body[..], b"untouched");
        assert_eq!(record.content_type.as_deref(), Some("text/plain"));
    }

    #[tokio::test]
    async fn assignment_creates_the_binding() {
        let fx = fixture().await;
        put_object(&fx, "cat.jpg", b"meow!").await;

        let id = identity("cat.jpg");
        let ctx = request(Method::PUT, &id).with_header(
            HeaderName::from_static("x-trigger-assign-on-read"),
            HeaderValue::from_static("noop"),
        );
        let response = fx.pipeline.handle(id.clone(), ctx).await.unwrap();
        assert_eq!(response.status, StatusCode::ACCEPTED);

        let data_file = fx.storage.object_path("acct", "photos", "cat.jpg");
        let map = fx.registry.trigger_map(&data_file).unwrap().unwrap();
        assert_eq!(map.on_read.as_deref(), Some(&["noop".to_string()][..]));
        assert!(map.on_write.is_none());
        assert!(map.on_delete.is_none());
        assert!(map.on_timer.is_none());
    }

    #[tokio::test]
    async fn assignment_body_becomes_the_binding_config() {
        let fx = fixture().await;
        put_object(&fx, "cat.jpg", b"meow!").await;

        let id = identity("cat.jpg");
        let ctx = request(Method::PUT, &id)
            .with_header(
                HeaderName::from_static("x-trigger-assign-on-read"),
                HeaderValue::from_static("noop"),
            )
            .with_body(Bytes::from_static(b"{\"quality\": 80}\n"));
        fx.pipeline.handle(id.clone(), ctx).await.unwrap();

        let data_file = fx.storage.object_path("acct", "photos", "cat.jpg");
        let sysmeta = fx.registry.sysmeta(&data_file).unwrap();
        let key = binding_config_key(Trigger::OnRead, "noop");
        assert_eq!(
            sysmeta.get(&key),
            Some(&Value::String("{\"quality\": 80}".to_string()))
        );
    }

    #[tokio::test]
    async fn assignment_requires_access_to_the_handler() {
        let fx = fixture().await;
        put_object(&fx, "cat.jpg", b"meow!").await;

        let id = identity("cat.jpg");
        let ctx = request(Method::PUT, &id).with_header(
            HeaderName::from_static("x-trigger-assign-on-read"),
            HeaderValue::from_static("ghost-handler"),
        );
        let err = fx.pipeline.handle(id.clone(), ctx).await.unwrap_err();
        assert!(matches!(err, PipelineError::Access(AccessError::NotFound { .. })));

        let data_file = fx.storage.object_path("acct", "photos", "cat.jpg");
        assert!(fx.registry.trigger_map(&data_file).unwrap().is_none());
    }

    #[tokio::test]
    async fn assignment_on_a_link_lands_on_the_destination() {
        let fx = fixture().await;
        put_object(&fx, "real", b"payload").await;
        let id = identity("alias");
        fx.links
            .create_link(&request(Method::PUT, &id), "acct", "photos/alias", "photos/real")
            .await
            .unwrap();

        let ctx = request(Method::PUT, &id).with_header(
            HeaderName::from_static("x-trigger-assign-on-write"),
            HeaderValue::from_static("noop"),
        );
        fx.pipeline.handle(id.clone(), ctx).await.unwrap();

        let dest_file = fx.storage.object_path("acct", "photos", "real");
        let map = fx.registry.trigger_map(&dest_file).unwrap().unwrap();
        assert_eq!(map.on_write.as_deref(), Some(&["noop".to_string()][..]));

        let link_file = fx.storage.object_path("acct", "photos", "alias");
        assert!(fx.registry.trigger_map(&link_file).unwrap().is_none());
    }

    #[tokio::test]
    async fn pseudo_folder_wildcard_mutates_each_member_only() {
        let fx = fixture().await;
        for name in ["docs/one", "docs/two", "docs/three", "other/outside"] {
            put_object(&fx, name, b"x").await;
        }

        let id = identity("docs/*");
        let ctx = request(Method::PUT, &id).with_header(
            HeaderName::from_static("x-trigger-assign-on-read"),
            HeaderValue::from_static("noop"),
        );
        let response = fx.pipeline.handle(id.clone(), ctx).await.unwrap();
        assert_eq!(response.status, StatusCode::ACCEPTED);

        for name in ["docs/one", "docs/two", "docs/three"] {
            let data_file = fx.storage.object_path("acct", "photos", name);
            let map = fx.registry.trigger_map(&data_file).unwrap().unwrap();
            assert_eq!(
                map.on_read.as_deref(),
                Some(&["noop".to_string()][..]),
                "{name} missing the binding"
            );
        }
        let outside = fx.storage.object_path("acct", "photos", "other/outside");
        assert!(fx.registry.trigger_map(&outside).unwrap().is_none());
    }

    #[tokio::test]
    async fn bare_wildcard_covers_the_whole_container() {
        let fx = fixture().await;
        put_object(&fx, "a", b"x").await;
        put_object(&fx, "b", b"x").await;

        let id = identity("*");
        let ctx = request(Method::PUT, &id).with_header(
            HeaderName::from_static("x-trigger-assign-on-delete"),
            HeaderValue::from_static("noop"),
        );
        fx.pipeline.handle(id.clone(), ctx).await.unwrap();

        for name in ["a", "b"] {
            let data_file = fx.storage.object_path("acct", "photos", name);
            let map = fx.registry.trigger_map(&data_file).unwrap().unwrap();
            assert_eq!(map.on_delete.as_deref(), Some(&["noop".to_string()][..]));
        }
    }

    #[tokio::test]
    async fn post_deletion_collapses_the_map() {
        let fx = fixture().await;
        put_object(&fx, "cat.jpg", b"meow!").await;
        let data_file = fx.storage.object_path("acct", "photos", "cat.jpg");
        fx.registry
            .add_binding(&data_file, Trigger::OnRead, "noop", "")
            .unwrap();

        let id = identity("cat.jpg");
        let ctx = request(Method::POST, &id).with_header(
            HeaderName::from_static("x-trigger-delete-on-read"),
            HeaderValue::from_static(HANDLER_WILDCARD),
        );
        let response = fx.pipeline.handle(id.clone(), ctx).await.unwrap();
        assert_eq!(response.status, StatusCode::ACCEPTED);

        assert!(fx.registry.trigger_map(&data_file).unwrap().is_none());
        assert!(!fx.registry.sysmeta(&data_file).unwrap().contains_key(TRIGGER_MAP_KEY));
    }

    #[tokio::test]
    async fn deleting_an_unbound_handler_reports_it() {
        let fx = fixture().await;
        put_object(&fx, "cat.jpg", b"meow!").await;
        let data_file = fx.storage.object_path("acct", "photos", "cat.jpg");
        fx.registry
            .add_binding(&data_file, Trigger::OnRead, "noop", "")
            .unwrap();

        let id = identity("cat.jpg");
        let ctx = request(Method::POST, &id).with_header(
            HeaderName::from_static("x-trigger-delete-on-timer"),
            HeaderValue::from_static("noop"),
        );
        let err = fx.pipeline.handle(id.clone(), ctx).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Registry(RegistryError::BindingNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn pending_handlers_reach_the_executor_with_configs() {
        let fx = fixture().await;
        put_object(&fx, "cat.jpg", b"meow!").await;
        let data_file = fx.storage.object_path("acct", "photos", "cat.jpg");
        fx.registry
            .add_binding(&data_file, Trigger::OnRead, "noop", "{\"size\": 128}")
            .unwrap();

        let id = identity("cat.jpg");
        let response = fx.pipeline.handle(id.clone(), request(Method::GET, &id)).await.unwrap();
        assert!(response.header(PENDING_HANDLERS_HEADER).is_none());

        let runs = fx.executor.runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].0, vec!["noop".to_string()]);
        assert_eq!(runs[0].1.get("noop").map(String::as_str), Some("{\"size\": 128}"));
    }

    #[tokio::test]
    async fn reentrant_token_suppresses_execution() {
        let fx = fixture().await;
        put_object(&fx, "cat.jpg", b"meow!").await;
        let data_file = fx.storage.object_path("acct", "photos", "cat.jpg");
        fx.registry
            .add_binding(&data_file, Trigger::OnRead, "noop", "")
            .unwrap();

        let id = identity("cat.jpg");
        fx.cache.put(
            format!("{TOKEN_CACHE_PREFIX}/secret/{}", id.cache_key()),
            b"secret-0042".to_vec(),
        );

        let ctx = request(Method::GET, &id)
            .with_header(header::USER_AGENT, HeaderValue::from_static(HANDLER_USER_AGENT))
            .with_header(
                HeaderName::from_static(CAPABILITY_TOKEN_HEADER),
                HeaderValue::from_static("secret-0042"),
            );
        let response = fx.pipeline.handle(id.clone(), ctx).await.unwrap();
        assert_eq!(&response.body[..], b"meow!");
        assert!(response.header(PENDING_HANDLERS_HEADER).is_none());
        assert!(fx.executor.runs().is_empty());
    }

    #[tokio::test]
    async fn forged_token_still_triggers() {
        let fx = fixture().await;
        put_object(&fx, "cat.jpg", b"meow!").await;
        let data_file = fx.storage.object_path("acct", "photos", "cat.jpg");
        fx.registry
            .add_binding(&data_file, Trigger::OnRead, "noop", "")
            .unwrap();

        let id = identity("cat.jpg");
        // no matching token was ever issued
        let ctx = request(Method::GET, &id)
            .with_header(header::USER_AGENT, HeaderValue::from_static(HANDLER_USER_AGENT))
            .with_header(
                HeaderName::from_static(CAPABILITY_TOKEN_HEADER),
                HeaderValue::from_static("forged-0001"),
            );
        fx.pipeline.handle(id.clone(), ctx).await.unwrap();
        assert_eq!(fx.executor.runs().len(), 1);
    }

    #[tokio::test]
    async fn head_publishes_the_reserved_namespace() {
        let fx = fixture().await;
        put_object(&fx, "cat.jpg", b"meow!").await;
        let data_file = fx.storage.object_path("acct", "photos", "cat.jpg");
        fx.registry
            .add_binding(&data_file, Trigger::OnRead, "noop", "cfg")
            .unwrap();

        let id = identity("cat.jpg");
        let response = fx.pipeline.handle(id.clone(), request(Method::HEAD, &id)).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);

        let map: Value =
            serde_json::from_str(response.header("trigger-handlers").unwrap()).unwrap();
        assert_eq!(map["on-read"], serde_json::json!(["noop"]));
        // null slots are filtered out, not published
        assert!(map.get("on-write").is_none());

        assert_eq!(response.header("trigger-on-read-noop"), Some("cfg"));
        assert!(
            response
                .headers
                .keys()
                .all(|name| !name.as_str().starts_with(SYSMETA_PREFIX))
        );
    }

    #[tokio::test]
    async fn delete_passes_through() {
        let fx = fixture().await;
        put_object(&fx, "cat.jpg", b"meow!").await;

        let id = identity("cat.jpg");
        let response = fx
            .pipeline
            .handle(id.clone(), request(Method::DELETE, &id))
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::NO_CONTENT);

        let response = fx.pipeline.handle(id.clone(), request(Method::GET, &id)).await.unwrap();
        assert_eq!(response.status, StatusCode::NOT_FOUND);
    }
}
