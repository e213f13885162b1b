//! Registry of per-object trigger bindings.
//!
//! Bindings live inside the object's sysmeta mapping under the reserved
//! `X-Object-Sysmeta-Trigger-` key prefix: one aggregate trigger-map entry
//! plus one optional configuration entry per (trigger, handler) pair. The
//! registry owns the shape of those entries; persistence goes through the
//! chunked attribute codec.

use crate::models::trigger::{HANDLER_WILDCARD, Trigger, TriggerMap, TriggerTarget};
use crate::services::metadata_codec::{
    self, CodecError, DEFAULT_SLOT_BYTES, Mapping, SYSMETA_XATTR_KEY,
};
use serde_json::Value;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Reserved key prefix for every entry this engine owns. Keys double as
/// HTTP header names on the sub-request surface, hence the lowercase form.
pub const SYSMETA_PREFIX: &str = "x-object-sysmeta-trigger-";

/// Mapping entry holding the aggregate trigger map.
pub const TRIGGER_MAP_KEY: &str = "x-object-sysmeta-trigger-handlers";

/// Mapping entry recording a link object's destination.
pub const LINK_TO_KEY: &str = "x-object-sysmeta-trigger-link-to";

/// Mapping entry for the configuration blob of one (trigger, handler) pair.
pub fn binding_config_key(trigger: Trigger, handler: &str) -> String {
    format!("{SYSMETA_PREFIX}{trigger}-{handler}")
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("handler `{handler}` is not assigned to the `{trigger}` trigger")]
    BindingNotFound { trigger: String, handler: String },
    #[error("object has no trigger bindings")]
    NoTriggerMap,
    #[error("stored trigger map does not decode: {0}")]
    MalformedTriggerMap(#[source] serde_json::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Normalize a persisted trigger-map value into the canonical shape.
///
/// The canonical representation is a JSON object; a string value containing
/// JSON is accepted for compatibility with older writers. Anything else is a
/// typed decode error, never silently defaulted to empty.
pub fn normalize_trigger_map(value: &Value) -> Result<TriggerMap, RegistryError> {
    match value {
        Value::String(text) => {
            serde_json::from_str(text).map_err(RegistryError::MalformedTriggerMap)
        }
        other => {
            serde_json::from_value(other.clone()).map_err(RegistryError::MalformedTriggerMap)
        }
    }
}

/// Stateless accessor for an object's trigger bindings.
#[derive(Debug, Clone)]
pub struct TriggerRegistry {
    /// Per-slot ceiling handed down to the codec on every persist.
    pub max_slot_bytes: usize,
}

impl Default for TriggerRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_SLOT_BYTES)
    }
}

impl TriggerRegistry {
    pub fn new(max_slot_bytes: usize) -> Self {
        Self { max_slot_bytes }
    }

    fn load(&self, data_file: &Path) -> Result<Option<Mapping>, RegistryError> {
        Ok(metadata_codec::read_mapping(data_file, SYSMETA_XATTR_KEY)?)
    }

    fn persist(&self, data_file: &Path, mapping: &Mapping) -> Result<(), RegistryError> {
        metadata_codec::write_mapping(data_file, SYSMETA_XATTR_KEY, mapping, self.max_slot_bytes)?;
        Ok(())
    }

    /// The whole sysmeta mapping, empty when none has been written yet.
    pub fn sysmeta(&self, data_file: &Path) -> Result<Mapping, RegistryError> {
        Ok(self.load(data_file)?.unwrap_or_default())
    }

    /// Insert raw sysmeta entries (e.g. from `X-Object-Sysmeta-Trigger-*`
    /// request headers) without touching the trigger map.
    pub fn set_sysmeta_entries(
        &self,
        data_file: &Path,
        entries: Vec<(String, String)>,
    ) -> Result<(), RegistryError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut mapping = self.sysmeta(data_file)?;
        for (key, value) in entries {
            mapping.insert(key, Value::String(value));
        }
        self.persist(data_file, &mapping)
    }

    /// The object's trigger map, `None` when nothing is configured.
    pub fn trigger_map(&self, data_file: &Path) -> Result<Option<TriggerMap>, RegistryError> {
        let Some(mapping) = self.load(data_file)? else {
            return Ok(None);
        };
        match mapping.get(TRIGGER_MAP_KEY) {
            Some(value) => normalize_trigger_map(value).map(Some),
            None => Ok(None),
        }
    }

    /// Bind `handler` to `trigger`, storing or clearing the handler-specific
    /// configuration blob. Adding an existing binding is idempotent.
    pub fn add_binding(
        &self,
        data_file: &Path,
        trigger: Trigger,
        handler: &str,
        config: &str,
    ) -> Result<(), RegistryError> {
        let mut mapping = self.sysmeta(data_file)?;
        let mut map = match mapping.get(TRIGGER_MAP_KEY) {
            Some(value) => normalize_trigger_map(value)?,
            None => TriggerMap::default(),
        };

        let list = map.get_mut(trigger).get_or_insert_with(Vec::new);
        if !list.iter().any(|bound| bound == handler) {
            list.push(handler.to_string());
        }

        let config_key = binding_config_key(trigger, handler);
        let config = config.trim_end();
        if config.is_empty() {
            mapping.remove(&config_key);
        } else {
            mapping.insert(config_key, Value::String(config.to_string()));
        }

        mapping.insert(TRIGGER_MAP_KEY.to_string(), trigger_map_value(&map)?);
        debug!(%trigger, handler, "binding assigned");
        self.persist(data_file, &mapping)
    }

    /// Unbind handlers. Three cases, evaluated in order:
    ///
    /// 1. all-triggers wildcard + handler wildcard: strip every entry in the
    ///    reserved namespace, links included;
    /// 2. handler wildcard: null the trigger's list and drop the config of
    ///    every handler previously in it;
    /// 3. exact: the handler must currently be bound, else
    ///    [`RegistryError::BindingNotFound`].
    pub fn remove_binding(
        &self,
        data_file: &Path,
        target: TriggerTarget,
        handler: &str,
    ) -> Result<(), RegistryError> {
        let mut mapping = match self.load(data_file)? {
            Some(mapping) => mapping,
            // nothing persisted at all; the full wipe is a no-op
            None if matches!(target, TriggerTarget::All) && handler == HANDLER_WILDCARD => {
                return Ok(());
            }
            None => return Err(RegistryError::NoTriggerMap),
        };

        if matches!(target, TriggerTarget::All) && handler == HANDLER_WILDCARD {
            mapping.retain(|key, _| !key.starts_with(SYSMETA_PREFIX));
            return self.persist(data_file, &mapping);
        }

        let TriggerTarget::One(trigger) = target else {
            // all-triggers with a concrete handler name is not a defined
            // operation; report it the same way as an unbound handler
            return Err(RegistryError::BindingNotFound {
                trigger: target.to_string(),
                handler: handler.to_string(),
            });
        };

        let Some(value) = mapping.get(TRIGGER_MAP_KEY) else {
            return Err(RegistryError::NoTriggerMap);
        };
        let mut map = normalize_trigger_map(value)?;

        if handler == HANDLER_WILDCARD {
            let previous = map.get_mut(trigger).take().unwrap_or_default();
            for bound in &previous {
                mapping.remove(&binding_config_key(trigger, bound));
            }
            debug!(%trigger, removed = previous.len(), "trigger cleared");
        } else {
            let list = map
                .get_mut(trigger)
                .as_mut()
                .ok_or_else(|| RegistryError::BindingNotFound {
                    trigger: trigger.to_string(),
                    handler: handler.to_string(),
                })?;
            let position = list.iter().position(|bound| bound == handler).ok_or_else(|| {
                RegistryError::BindingNotFound {
                    trigger: trigger.to_string(),
                    handler: handler.to_string(),
                }
            })?;
            list.remove(position);
            mapping.remove(&binding_config_key(trigger, handler));
            debug!(%trigger, handler, "binding removed");
        }

        map.cleanup();
        if map.is_all_null() {
            mapping.remove(TRIGGER_MAP_KEY);
        } else {
            mapping.insert(TRIGGER_MAP_KEY.to_string(), trigger_map_value(&map)?);
        }
        self.persist(data_file, &mapping)
    }
}

fn trigger_map_value(map: &TriggerMap) -> Result<Value, RegistryError> {
    serde_json::to_value(map).map_err(RegistryError::MalformedTriggerMap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs::File;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, PathBuf) {
        let dir = tempfile::tempdir_in(env!("CARGO_MANIFEST_DIR")).unwrap();
        let path = dir.path().join("obj.data");
        File::create(&path).unwrap();
        (dir, path)
    }

    fn registry() -> TriggerRegistry {
        TriggerRegistry::default()
    }

    #[test]
    fn first_binding_creates_the_canonical_map() {
        let (_dir, path) = fixture();
        registry()
            .add_binding(&path, Trigger::OnRead, "noop", "")
            .unwrap();

        let map = registry().trigger_map(&path).unwrap().unwrap();
        assert_eq!(map.on_read.as_deref(), Some(&["noop".to_string()][..]));
        assert!(map.on_write.is_none());
        assert!(map.on_delete.is_none());
        assert!(map.on_timer.is_none());
    }

    #[test]
    fn adding_twice_is_idempotent() {
        let (_dir, path) = fixture();
        let registry = registry();
        registry
            .add_binding(&path, Trigger::OnRead, "noop", "")
            .unwrap();
        registry
            .add_binding(&path, Trigger::OnRead, "noop", "")
            .unwrap();

        let map = registry.trigger_map(&path).unwrap().unwrap();
        assert_eq!(map.on_read.as_deref(), Some(&["noop".to_string()][..]));
    }

    #[test]
    fn config_blob_is_stored_and_replaced() {
        let (_dir, path) = fixture();
        let registry = registry();
        registry
            .add_binding(&path, Trigger::OnWrite, "counter", "{\"step\": 2}\n")
            .unwrap();

        let sysmeta = registry.sysmeta(&path).unwrap();
        let key = binding_config_key(Trigger::OnWrite, "counter");
        assert_eq!(sysmeta.get(&key), Some(&json!("{\"step\": 2}")));

        // re-assigning with an empty body drops the blob
        registry
            .add_binding(&path, Trigger::OnWrite, "counter", "")
            .unwrap();
        assert!(!registry.sysmeta(&path).unwrap().contains_key(&key));
    }

    #[test]
    fn removing_last_handler_collapses_the_entry() {
        let (_dir, path) = fixture();
        let registry = registry();
        registry
            .add_binding(&path, Trigger::OnRead, "noop", "")
            .unwrap();
        registry
            .remove_binding(&path, TriggerTarget::One(Trigger::OnRead), "noop")
            .unwrap();

        assert!(registry.trigger_map(&path).unwrap().is_none());
        assert!(
            !registry
                .sysmeta(&path)
                .unwrap()
                .contains_key(TRIGGER_MAP_KEY)
        );
    }

    #[test]
    fn handler_wildcard_clears_configs_of_previous_handlers() {
        let (_dir, path) = fixture();
        let registry = registry();
        registry
            .add_binding(&path, Trigger::OnRead, "noop", "cfg-a")
            .unwrap();
        registry
            .add_binding(&path, Trigger::OnRead, "counter", "cfg-b")
            .unwrap();
        registry
            .add_binding(&path, Trigger::OnDelete, "counter", "cfg-c")
            .unwrap();

        registry
            .remove_binding(&path, TriggerTarget::One(Trigger::OnRead), HANDLER_WILDCARD)
            .unwrap();

        let sysmeta = registry.sysmeta(&path).unwrap();
        assert!(!sysmeta.contains_key(&binding_config_key(Trigger::OnRead, "noop")));
        assert!(!sysmeta.contains_key(&binding_config_key(Trigger::OnRead, "counter")));
        // other trigger untouched
        assert!(sysmeta.contains_key(&binding_config_key(Trigger::OnDelete, "counter")));

        let map = registry.trigger_map(&path).unwrap().unwrap();
        assert!(map.on_read.is_none());
        assert_eq!(map.on_delete.as_deref(), Some(&["counter".to_string()][..]));
    }

    #[test]
    fn all_triggers_wildcard_strips_the_reserved_namespace() {
        let (_dir, path) = fixture();
        let registry = registry();
        registry
            .add_binding(&path, Trigger::OnRead, "noop", "cfg")
            .unwrap();
        registry
            .set_sysmeta_entries(
                &path,
                vec![(LINK_TO_KEY.to_string(), "c/o".to_string())],
            )
            .unwrap();

        registry
            .remove_binding(&path, TriggerTarget::All, HANDLER_WILDCARD)
            .unwrap();

        let sysmeta = registry.sysmeta(&path).unwrap();
        assert!(sysmeta.keys().all(|k| !k.starts_with(SYSMETA_PREFIX)));
        assert!(registry.trigger_map(&path).unwrap().is_none());
    }

    #[test]
    fn removing_unbound_handler_is_an_error() {
        let (_dir, path) = fixture();
        let registry = registry();
        registry
            .add_binding(&path, Trigger::OnRead, "noop", "")
            .unwrap();

        let err = registry
            .remove_binding(&path, TriggerTarget::One(Trigger::OnRead), "ghost")
            .unwrap_err();
        assert!(matches!(err, RegistryError::BindingNotFound { .. }));

        let err = registry
            .remove_binding(&path, TriggerTarget::One(Trigger::OnTimer), "noop")
            .unwrap_err();
        assert!(matches!(err, RegistryError::BindingNotFound { .. }));
    }

    #[test]
    fn removal_without_any_map_is_an_error() {
        let (_dir, path) = fixture();
        let err = registry()
            .remove_binding(&path, TriggerTarget::One(Trigger::OnRead), "noop")
            .unwrap_err();
        assert!(matches!(err, RegistryError::NoTriggerMap));
    }

    #[test]
    fn string_encoded_map_normalizes_like_a_structured_one() {
        let (_dir, path) = fixture();
        let registry = registry();
        let encoded = json!({"on-read": ["noop"], "on-write": null}).to_string();
        registry
            .set_sysmeta_entries(&path, vec![(TRIGGER_MAP_KEY.to_string(), encoded)])
            .unwrap();

        let map = registry.trigger_map(&path).unwrap().unwrap();
        assert_eq!(map.on_read.as_deref(), Some(&["noop".to_string()][..]));
    }

    #[test]
    fn garbage_map_is_a_typed_error() {
        let (_dir, path) = fixture();
        let registry = registry();
        registry
            .set_sysmeta_entries(
                &path,
                vec![(TRIGGER_MAP_KEY.to_string(), "not json at all".to_string())],
            )
            .unwrap();

        let err = registry.trigger_map(&path).unwrap_err();
        assert!(matches!(err, RegistryError::MalformedTriggerMap(_)));
    }
}
