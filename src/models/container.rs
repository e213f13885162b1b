//! Represents a logical container — a per-account namespace for objects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A storage container scoped to one account.
///
/// Containers act as namespaces for objects. Objects sharing a
/// slash-delimited name prefix inside a container form a pseudo-folder.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Container {
    /// Unique identifier for this container (UUID for internal DB use).
    pub id: Uuid,

    /// Account the container belongs to.
    pub account: String,

    /// Container name, unique within the account.
    pub name: String,

    /// When this container was created.
    pub created_at: DateTime<Utc>,
}
