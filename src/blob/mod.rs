//! Blob-store collaborator.
//!
//! The control plane never moves object bytes itself. It asks a [`BlobStore`]
//! for time-bounded grants that clients use directly, and probes or deletes
//! blobs when reconciling metadata.

pub mod local;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{io, time::Duration};
use thiserror::Error;

pub use local::LocalBlobStore;
pub use memory::MemoryBlobStore;

/// A time-bounded, single-purpose URL/method pair.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PresignedGrant {
    pub url: String,
    pub method: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob `{name}` not found in bucket `{bucket}`")]
    NotFound { bucket: String, name: String },
    #[error("invalid blob key: {0}")]
    InvalidKey(String),
    #[error("signed url has expired")]
    Expired,
    #[error("signed url signature is invalid")]
    InvalidSignature,
    #[error("uploaded {actual} bytes but the grant allows {declared}")]
    SizeMismatch { declared: i64, actual: i64 },
    #[error("blob store unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type BlobResult<T> = Result<T, BlobError>;

/// Operations the control plane needs from the external blob store.
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    /// Grant a single upload of `size` bytes of `content_type` to `bucket/name`.
    async fn presign_upload(
        &self,
        bucket: &str,
        name: &str,
        content_type: &str,
        size: i64,
        expires_in: Duration,
    ) -> BlobResult<PresignedGrant>;

    /// Grant downloads of `bucket/name` until the grant expires.
    async fn presign_download(
        &self,
        bucket: &str,
        name: &str,
        expires_in: Duration,
    ) -> BlobResult<PresignedGrant>;

    /// Whether the bytes for `bucket/name` are present.
    async fn exists(&self, bucket: &str, name: &str) -> BlobResult<bool>;

    /// Remove `bucket/name`. Removing an absent blob succeeds.
    async fn delete(&self, bucket: &str, name: &str) -> BlobResult<()>;
}

/// Absolute expiry for a grant issued now.
pub(crate) fn expiry_from_now(expires_in: Duration) -> BlobResult<DateTime<Utc>> {
    chrono::Duration::from_std(expires_in)
        .ok()
        .and_then(|ttl| Utc::now().checked_add_signed(ttl))
        .ok_or_else(|| BlobError::Unavailable("grant expiry out of range".into()))
}
