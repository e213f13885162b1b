//! Service layer: the trigger engine core and the collaborators it composes.
//!
//! `metadata_codec` is the lowest-level primitive (chunked xattr mappings);
//! `trigger_registry` owns the binding shape on top of it; `link_resolver`,
//! `cache_gateway` and `request_pipeline` make up the per-request decision
//! flow. `storage_service` and the ports in `backend` are the storage-engine
//! side the pipeline forwards to.

pub mod backend;
pub mod cache_gateway;
pub mod context;
pub mod link_resolver;
pub mod metadata_codec;
pub mod request_pipeline;
pub mod storage_service;
pub mod trigger_registry;
