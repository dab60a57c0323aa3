//! Metadata and lifecycle control plane for object storage.
//!
//! Buckets and objects live in SQLite; object bytes live in a blob store
//! reached only through presigned grants. A transactional outbox drives
//! the reconciliation of expired uploads and deleted objects.

pub mod blob;
pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
