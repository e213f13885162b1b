//! StorageService — durable object storage backed by SQLite for metadata
//! rows and local disk for payloads, sharded beneath
//! `base_path/{account}/{container}/{shard}/{shard}/{name}`. This file holds
//! no trigger or link logic; it is the storage collaborator the request
//! pipeline forwards to, and its data files are where the attribute codec
//! hangs the per-object sysmeta.

use crate::models::{container::Container, object::ObjectRecord};
use bytes::Bytes;
use chrono::Utc;
use md5::Context;
use sqlx::SqlitePool;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("container `{0}` not found")]
    ContainerNotFound(String),
    #[error("container `{0}` already exists")]
    ContainerAlreadyExists(String),
    #[error("container `{name}` invalid: {reason}")]
    InvalidContainerName { name: String, reason: String },
    #[error("object `{object}` not found in container `{container}`")]
    ObjectNotFound { container: String, object: String },
    #[error("invalid object name")]
    InvalidObjectName,
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

const MAX_OBJECT_NAME_LEN: usize = 1024;
const MAX_CONTAINER_NAME_LEN: usize = 256;
const MAX_LISTING: i64 = 10_000;

/// StorageService provides the storage-engine operations the pipeline
/// composes:
/// - Write an object (bytes to disk, metadata row upserted in SQLite)
/// - Read an object (metadata row from SQLite, payload from disk)
/// - List object names (SQLite, optionally prefix-filtered)
/// - Delete an object (soft-delete the row, remove the data file)
///
/// The struct intentionally keeps a minimal surface area so it is easy to
/// test and reason about. Placement, replication and ring logic live with a
/// real cluster backend, not here.
#[derive(Clone)]
pub struct StorageService {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,
}

impl StorageService {
    /// Create a new StorageService backed by the provided SQLite pool and
    /// using `base_path` as the root directory for object payloads.
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
        }
    }

    /// Basic name validation to avoid trivial path traversal vectors.
    ///
    /// Rejects names that begin with `/`, contain `..`, or carry wildcard
    /// characters. Wildcards are expanded by the pipeline before storage is
    /// ever asked for a concrete object.
    fn ensure_object_name_safe(&self, name: &str) -> StorageResult<()> {
        if name.is_empty() || name.len() > MAX_OBJECT_NAME_LEN {
            return Err(StorageError::InvalidObjectName);
        }
        if name.starts_with('/') || name.contains("..") || name.contains('*') {
            return Err(StorageError::InvalidObjectName);
        }
        if name
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(StorageError::InvalidObjectName);
        }
        Ok(())
    }

    /// Validate container (and account) path segments.
    ///
    /// Segments become directory names, so slashes, traversal sequences and
    /// control bytes are rejected outright.
    fn ensure_segment_safe(&self, name: &str) -> StorageResult<()> {
        let reason = if name.is_empty() {
            Some("cannot be empty")
        } else if name.len() > MAX_CONTAINER_NAME_LEN {
            Some("longer than 256 characters")
        } else if name.contains('/') || name.contains("..") {
            Some("cannot contain `/` or `..`")
        } else if name
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            Some("contains control characters")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(StorageError::InvalidContainerName {
                name: name.to_string(),
                reason: reason.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Compute the physical base folder for a container.
    ///
    /// This does not check for existence. Used for building object paths.
    fn container_root(&self, account: &str, container: &str) -> PathBuf {
        let mut path = self.base_path.clone();
        path.push(account);
        path.push(container);
        path
    }

    /// Generate two-level shard identifiers for an object name.
    ///
    /// Uses MD5(account/container/name) and returns the first two bytes as
    /// lowercase hexadecimal strings (00–ff). Reduces file count per
    /// directory.
    fn object_shards(account: &str, container: &str, name: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}/{}", account, container, name));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// Construct a fully-qualified object payload path.
    ///
    /// Combines base_path/account/container/{shard}/{shard}/{name}. Parent
    /// directories may not exist yet. The path is deterministic in the
    /// identity alone, which is what lets the attribute codec address an
    /// object's data file without consulting SQLite.
    pub fn object_path(&self, account: &str, container: &str, name: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(account, container, name);
        let mut path = self.container_root(account, container);
        path.push(shard_a);
        path.push(shard_b);
        path.push(name);
        path
    }

    /// Fetch container metadata from SQLite.
    ///
    /// Returns ContainerNotFound if missing. Validates both segments before
    /// querying.
    async fn fetch_container(&self, account: &str, container: &str) -> StorageResult<Container> {
        self.ensure_segment_safe(account)?;
        self.ensure_segment_safe(container)?;
        sqlx::query_as::<sqlx::sqlite::Sqlite, Container>(
            "SELECT id, account, name, created_at
             FROM containers WHERE account = ? AND name = ?",
        )
        .bind(account)
        .bind(container)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StorageError::ContainerNotFound(container.to_string()),
            other => StorageError::Sqlx(other),
        })
    }

    /// Fetch a non-deleted object metadata record.
    async fn fetch_object(
        &self,
        container: &Container,
        name: &str,
    ) -> StorageResult<ObjectRecord> {
        sqlx::query_as::<_, ObjectRecord>(
            "SELECT id, container_id, name, content_type, size_bytes, etag,
                    last_modified, is_deleted
             FROM objects
             WHERE name = ? AND container_id = ? AND is_deleted = 0",
        )
        .bind(name)
        .bind(container.id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StorageError::ObjectNotFound {
                container: container.name.clone(),
                object: name.to_string(),
            },
            other => StorageError::Sqlx(other),
        })
    }

    /// Write an object to disk and upsert its metadata row.
    ///
    /// - Writes bytes to a temporary file, fsyncs, then renames into place.
    /// - Computes the MD5 etag while writing.
    /// - Upserts the row with overwrite semantics.
    ///
    /// A rename over an existing data file drops that file's extended
    /// attributes with it, so a content overwrite also resets sysmeta.
    pub async fn write_object(
        &self,
        account: &str,
        container: &str,
        name: &str,
        content_type: Option<String>,
        body: Bytes,
    ) -> StorageResult<ObjectRecord> {
        self.ensure_object_name_safe(name)?;
        let container_rec = self.fetch_container(account, container).await?;

        let file_path = self.object_path(account, container, name);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Io(io::Error::other("object path missing parent directory"))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut digest = Context::new();
        digest.consume(&body);
        if let Err(err) = file.write_all(&body).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }
        drop(file);

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(&file_path).await?;
                fs::rename(&tmp_path, &file_path).await?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Io(err));
            }
        }

        let last_modified = Utc::now();
        let etag = format!("{:x}", digest.compute());

        let insert_result = sqlx::query_as::<_, ObjectRecord>(
            r#"
            INSERT INTO objects (
                id, container_id, name, content_type, size_bytes,
                etag, last_modified, is_deleted
            ) VALUES (?, ?, ?, ?, ?, ?, ?, 0)
            ON CONFLICT(container_id, name) DO UPDATE SET
                content_type = excluded.content_type,
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                last_modified = excluded.last_modified,
                is_deleted = 0
            RETURNING id, container_id, name, content_type, size_bytes,
                      etag, last_modified, is_deleted
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(container_rec.id)
        .bind(name)
        .bind(content_type)
        .bind(body.len() as i64)
        .bind(&etag)
        .bind(last_modified)
        .fetch_one(&*self.db)
        .await;

        match insert_result {
            Ok(record) => Ok(record),
            Err(err) => {
                let _ = fs::remove_file(&file_path).await;
                Err(StorageError::Sqlx(err))
            }
        }
    }

    /// Read an object's metadata row and payload.
    ///
    /// Returns ObjectNotFound when the row exists but the physical file is
    /// missing.
    pub async fn read_object(
        &self,
        account: &str,
        container: &str,
        name: &str,
    ) -> StorageResult<(ObjectRecord, Bytes)> {
        self.ensure_object_name_safe(name)?;
        let container_rec = self.fetch_container(account, container).await?;
        let record = self.fetch_object(&container_rec, name).await?;

        let file_path = self.object_path(account, container, name);
        let body = fs::read(&file_path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StorageError::ObjectNotFound {
                    container: container.to_string(),
                    object: name.to_string(),
                }
            } else {
                StorageError::Io(err)
            }
        })?;

        Ok((record, Bytes::from(body)))
    }

    /// Fetch only object metadata.
    pub async fn object_metadata(
        &self,
        account: &str,
        container: &str,
        name: &str,
    ) -> StorageResult<ObjectRecord> {
        self.ensure_object_name_safe(name)?;
        let container_rec = self.fetch_container(account, container).await?;
        self.fetch_object(&container_rec, name).await
    }

    /// List object names in a container, lexicographically ordered,
    /// optionally restricted to a name prefix. Soft-deleted rows are
    /// filtered out.
    pub async fn list_object_names(
        &self,
        account: &str,
        container: &str,
        prefix: Option<&str>,
    ) -> StorageResult<Vec<String>> {
        let container_rec = self.fetch_container(account, container).await?;

        let names: Vec<String> = match prefix {
            Some(prefix) => {
                sqlx::query_scalar(
                    "SELECT name FROM objects
                     WHERE container_id = ? AND is_deleted = 0 AND name LIKE ?
                     ORDER BY name ASC LIMIT ?",
                )
                .bind(container_rec.id)
                .bind(format!("{}%", prefix))
                .bind(MAX_LISTING)
                .fetch_all(&*self.db)
                .await?
            }
            None => {
                sqlx::query_scalar(
                    "SELECT name FROM objects
                     WHERE container_id = ? AND is_deleted = 0
                     ORDER BY name ASC LIMIT ?",
                )
                .bind(container_rec.id)
                .bind(MAX_LISTING)
                .fetch_all(&*self.db)
                .await?
            }
        };

        Ok(names)
    }

    /// Soft-delete an object and remove its payload.
    ///
    /// - Sets `is_deleted = 1`
    /// - Deletes the physical file best-effort (its extended attributes,
    ///   trigger bindings included, go with it)
    /// - Prunes empty shard directories
    ///
    /// Repeated calls return ObjectNotFound once the row is gone.
    pub async fn delete_object(
        &self,
        account: &str,
        container: &str,
        name: &str,
    ) -> StorageResult<ObjectRecord> {
        self.ensure_object_name_safe(name)?;
        let container_rec = self.fetch_container(account, container).await?;
        let record = self.fetch_object(&container_rec, name).await?;

        let result =
            sqlx::query("UPDATE objects SET is_deleted = 1 WHERE name = ? AND container_id = ?")
                .bind(name)
                .bind(container_rec.id)
                .execute(&*self.db)
                .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::ObjectNotFound {
                container: container.to_string(),
                object: name.to_string(),
            });
        }

        let file_path = self.object_path(account, container, name);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(StorageError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            let container_root = self.container_root(account, container);
            self.prune_empty_dirs(parent, &container_root).await;
        }

        Ok(record)
    }

    /// Create a container and initialize its directory.
    ///
    /// Returns ContainerAlreadyExists on a name conflict within the account.
    pub async fn create_container(&self, account: &str, name: &str) -> StorageResult<Container> {
        self.ensure_segment_safe(account)?;
        self.ensure_segment_safe(name)?;
        let container_root = self.container_root(account, name);
        fs::create_dir_all(&container_root).await?;

        let container = Container {
            id: Uuid::new_v4(),
            account: account.to_string(),
            name: name.to_string(),
            created_at: Utc::now(),
        };

        match sqlx::query(
            "INSERT INTO containers (id, account, name, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(container.id)
        .bind(&container.account)
        .bind(&container.name)
        .bind(container.created_at)
        .execute(&*self.db)
        .await
        {
            Ok(_) => Ok(container),
            Err(err) if is_unique_violation(&err) => {
                Err(StorageError::ContainerAlreadyExists(name.to_string()))
            }
            Err(err) => Err(StorageError::Sqlx(err)),
        }
    }

    /// Delete a container from metadata and filesystem.
    ///
    /// Removes the row, then recursively deletes the container directory,
    /// ignoring a missing directory.
    pub async fn delete_container(&self, account: &str, name: &str) -> StorageResult<()> {
        self.ensure_segment_safe(account)?;
        self.ensure_segment_safe(name)?;
        let result = sqlx::query("DELETE FROM containers WHERE account = ? AND name = ?")
            .bind(account)
            .bind(name)
            .execute(&*self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::ContainerNotFound(name.to_string()));
        }

        let container_path = self.container_root(account, name);
        if let Err(err) = fs::remove_dir_all(&container_path).await {
            if err.kind() != ErrorKind::NotFound {
                debug!(
                    "failed to remove container directory {} after delete: {}",
                    container_path.display(),
                    err
                );
            }
        }

        Ok(())
    }

    /// Recursively remove empty directories up to the container root.
    ///
    /// Stops when a directory is not empty, not found, or an unexpected I/O
    /// error shows up.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}
