//! Core data models for the object-storage control plane.
//!
//! Buckets and objects map to SQLite rows via `sqlx::FromRow` and serialize
//! as JSON via `serde`. Task payloads are the opaque documents stored in the
//! reconciliation outbox.

pub mod bucket;
pub mod metadata;
pub mod object;
pub mod task;
