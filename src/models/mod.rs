//! Core data models for the trigger-augmented object storage service.
//!
//! These entities represent object identities, the per-object trigger map,
//! and the container/object rows persisted in SQLite. The database rows map
//! cleanly to tables via `sqlx::FromRow` and serialize naturally as JSON via
//! `serde`.

pub mod container;
pub mod identity;
pub mod object;
pub mod trigger;
