//! Represents an object (data file) stored in a container.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Metadata row for a single stored object.
///
/// The row describes the payload on disk; trigger bindings and other sysmeta
/// live in extended attributes on the data file itself, not in this table.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct ObjectRecord {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Foreign key linking to the parent container.
    pub container_id: Uuid,

    /// Object name (path-like identifier within the container).
    pub name: String,

    /// Content type (MIME type). Link placeholders carry the link marker.
    pub content_type: Option<String>,

    /// Size in bytes.
    pub size_bytes: i64,

    /// MD5 checksum for integrity verification.
    pub etag: Option<String>,

    /// Timestamp when the object was last modified.
    pub last_modified: DateTime<Utc>,

    /// Whether the object is marked as deleted (soft delete).
    pub is_deleted: bool,
}
