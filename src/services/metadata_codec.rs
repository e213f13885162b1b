//! Chunked extended-attribute codec for per-object metadata mappings.
//!
//! The attribute store caps the value size of a single key, so a serialized
//! mapping is split across consecutively numbered slots: `key`, `key1`,
//! `key2`, … Reading concatenates slots in ascending order and stops at the
//! first missing index, which makes gap-free numbering a hard requirement of
//! the format. Individual slot writes are atomic but a multi-slot write is
//! not; two writers racing on the same object can interleave slots and
//! produce a mapping that fails to decode.

use serde_json::Value;
use std::collections::BTreeMap;
use std::io::{self, ErrorKind};
use std::path::Path;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Reserved attribute key for the engine's own sysmeta (triggers, links).
pub const SYSMETA_XATTR_KEY: &str = "user.object.sysmeta";

/// Attribute key for generic object metadata.
pub const METADATA_XATTR_KEY: &str = "user.object.metadata";

/// Default per-slot value-size ceiling enforced by the attribute store.
pub const DEFAULT_SLOT_BYTES: usize = 65536;

/// A persisted metadata mapping. Values are either opaque strings or
/// structured JSON (the trigger map entry).
pub type Mapping = BTreeMap<String, Value>;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("filesystem at {path} does not support extended attributes")]
    Unsupported { path: String },
    #[error("no attribute space left on device for {path}")]
    SpaceExhausted { path: String },
    #[error("data file {path} is gone")]
    ObjectGone { path: String },
    #[error("malformed metadata mapping under `{key}`: {source}")]
    Malformed {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Attribute name for slot `index` of `key`. Slot zero is unsuffixed.
fn slot_name(key: &str, index: usize) -> String {
    if index == 0 {
        key.to_string()
    } else {
        format!("{key}{index}")
    }
}

/// Inverse of [`slot_name`]: `Some(index)` when `name` is a slot of `key`.
fn slot_index(name: &str, key: &str) -> Option<usize> {
    let suffix = name.strip_prefix(key)?;
    if suffix.is_empty() {
        Some(0)
    } else {
        suffix.parse().ok().filter(|index| *index >= 1)
    }
}

fn classify(err: io::Error, data_file: &Path) -> CodecError {
    let path = data_file.display().to_string();
    match err.kind() {
        ErrorKind::Unsupported => CodecError::Unsupported { path },
        ErrorKind::NotFound => CodecError::ObjectGone { path },
        ErrorKind::StorageFull | ErrorKind::QuotaExceeded => {
            CodecError::SpaceExhausted { path }
        }
        _ => CodecError::Io(err),
    }
}

/// Read the mapping stored under `key` on `data_file`.
///
/// Returns `Ok(None)` when no slot exists at all. A vanished data file is
/// reported as [`CodecError::ObjectGone`], distinct from the
/// missing-attribute case.
pub fn read_mapping(data_file: &Path, key: &str) -> Result<Option<Mapping>, CodecError> {
    let mut raw = Vec::new();
    for index in 0.. {
        match xattr::get(data_file, slot_name(key, index)) {
            Ok(Some(chunk)) => raw.extend_from_slice(&chunk),
            Ok(None) => break,
            Err(err) => return Err(classify(err, data_file)),
        }
    }

    if raw.is_empty() {
        return Ok(None);
    }

    let mapping = serde_json::from_slice(&raw).map_err(|source| CodecError::Malformed {
        key: key.to_string(),
        source,
    })?;
    Ok(Some(mapping))
}

/// Write `mapping` under `key` on `data_file`, chunked at `max_slot_bytes`.
///
/// Slots beyond the new count are removed before returning, so a shrinking
/// value can never leave stale trailing chunks behind for the next read to
/// pick up.
pub fn write_mapping(
    data_file: &Path,
    key: &str,
    mapping: &Mapping,
    max_slot_bytes: usize,
) -> Result<(), CodecError> {
    let raw = serde_json::to_vec(mapping).map_err(|source| CodecError::Malformed {
        key: key.to_string(),
        source,
    })?;

    let slot_count = raw.len().div_ceil(max_slot_bytes).max(1);
    for (index, chunk) in raw.chunks(max_slot_bytes).enumerate() {
        xattr::set(data_file, slot_name(key, index), chunk)
            .map_err(|err| classify(err, data_file))?;
    }

    clear_stale_slots(data_file, key, slot_count)
}

/// Verify that `dir`'s filesystem can hold extended attributes.
///
/// Writes a throwaway probe file, round-trips one attribute slot on it, and
/// removes it again. A filesystem without user attributes cannot store
/// trigger bindings at all, so [`CodecError::Unsupported`] from here is a
/// configuration error rather than a per-request failure.
pub fn probe_attribute_support(dir: &Path) -> Result<(), CodecError> {
    let probe = dir.join(format!(".attr-probe-{}", Uuid::new_v4()));
    std::fs::write(&probe, b"probe")?;
    let outcome = (|| {
        xattr::set(&probe, SYSMETA_XATTR_KEY, b"probe").map_err(|err| classify(err, &probe))?;
        match xattr::get(&probe, SYSMETA_XATTR_KEY).map_err(|err| classify(err, &probe))? {
            Some(read) if read == b"probe" => Ok(()),
            _ => Err(CodecError::Io(io::Error::other(
                "attribute probe did not read back",
            ))),
        }
    })();
    let _ = std::fs::remove_file(&probe);
    outcome
}

/// Remove every slot of `key` with index >= `keep`.
fn clear_stale_slots(data_file: &Path, key: &str, keep: usize) -> Result<(), CodecError> {
    let names = xattr::list(data_file).map_err(|err| classify(err, data_file))?;
    for name in names {
        let Some(name) = name.to_str() else { continue };
        let Some(index) = slot_index(name, key) else {
            continue;
        };
        if index < keep {
            continue;
        }
        debug!(slot = name, "clearing stale attribute slot");
        match xattr::remove(data_file, name) {
            Ok(()) => {}
            // lost a race with a concurrent writer; the slot is gone either way
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(classify(err, data_file)),
        }
    }
    Ok(())
}
