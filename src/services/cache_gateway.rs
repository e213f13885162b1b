//! Best-effort read-through access to the external cache collaborator.
//!
//! The core never populates or invalidates the cache; a population job owns
//! the entry lifecycle. Everything read from here is advisory, so a decode
//! failure degrades to a miss instead of failing the request.

use crate::models::identity::ObjectIdentity;
use crate::services::backend::BackendResponse;
use async_trait::async_trait;
use axum::http::{HeaderName, HeaderValue, StatusCode, header};
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Port to the external cache collaborator. Read-only from this core.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Option<Vec<u8>>;
}

/// Serialized form of a cached (headers, body) pair.
#[derive(Debug, Serialize, Deserialize)]
pub struct CachedEntry {
    pub headers: BTreeMap<String, String>,
    /// Base64 of the body bytes.
    pub body: String,
}

impl CachedEntry {
    pub fn new(headers: BTreeMap<String, String>, body: &[u8]) -> Self {
        Self {
            headers,
            body: general_purpose::STANDARD.encode(body),
        }
    }
}

/// Read-through accessor translating an object identity into a previously
/// cached response.
#[derive(Clone)]
pub struct CacheGateway {
    backend: Arc<dyn CacheBackend>,
}

impl CacheGateway {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend }
    }

    /// Raw lookup, used for capability-token entries.
    pub async fn raw_get(&self, key: &str) -> Option<Vec<u8>> {
        self.backend.get(key).await
    }

    /// Single best-effort lookup. On a hit, rebuilds the response and
    /// recomputes Content-Length from the actual cached body size; a stale
    /// stored length is never trusted.
    pub async fn lookup(&self, identity: &ObjectIdentity) -> Option<BackendResponse> {
        let key = identity.cache_key();
        let raw = self.backend.get(&key).await?;

        let entry: CachedEntry = match serde_json::from_slice(&raw) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(key, error = %err, "cached entry does not decode; treating as a miss");
                return None;
            }
        };
        let body = match general_purpose::STANDARD.decode(&entry.body) {
            Ok(body) => body,
            Err(err) => {
                warn!(key, error = %err, "cached body is not valid base64; treating as a miss");
                return None;
            }
        };

        debug!(key, bytes = body.len(), "cache hit");
        let mut response = BackendResponse::new(StatusCode::OK);
        for (name, value) in &entry.headers {
            let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) else {
                continue;
            };
            response.headers.insert(name, value);
        }
        if let Ok(value) = HeaderValue::from_str(&body.len().to_string()) {
            response.headers.insert(header::CONTENT_LENGTH, value);
        }
        Some(response.with_body(Bytes::from(body)))
    }
}

/// Cache backend that never hits; the default when no cache is deployed.
pub struct NullCache;

#[async_trait]
impl CacheBackend for NullCache {
    async fn get(&self, _key: &str) -> Option<Vec<u8>> {
        None
    }
}

/// In-process cache backend. Stands in for the external collaborator in
/// tests and single-node setups; `put` is the population side the core
/// itself never calls.
#[derive(Default)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: impl Into<String>, value: Vec<u8>) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.into(), value);
        }
    }

    pub fn put_entry(&self, key: impl Into<String>, entry: &CachedEntry) {
        if let Ok(raw) = serde_json::to_vec(entry) {
            self.put(key, raw);
        }
    }
}

#[async_trait]
impl CacheBackend for InMemoryCache {
    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.lock().ok()?.get(key).cloned()
    }
}
