//! In-process blob store.
//!
//! Tracks which blobs exist without holding their bytes. Tests use it to
//! simulate clients uploading (or never uploading) through a grant, and to
//! inject collaborator failures.

use async_trait::async_trait;
use std::{
    collections::HashSet,
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use super::{BlobError, BlobResult, BlobStore, PresignedGrant, expiry_from_now};

#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashSet<(String, String)>>,
    fail_probes: AtomicBool,
    fail_deletes: AtomicBool,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `bucket/name` as uploaded.
    pub fn put(&self, bucket: &str, name: &str) {
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((bucket.to_string(), name.to_string()));
    }

    /// Drop `bucket/name` without going through [`BlobStore::delete`].
    pub fn remove(&self, bucket: &str, name: &str) {
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(bucket.to_string(), name.to_string()));
    }

    pub fn contains(&self, bucket: &str, name: &str) -> bool {
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&(bucket.to_string(), name.to_string()))
    }

    /// Make every `exists` call fail until reset.
    pub fn fail_probes(&self, fail: bool) {
        self.fail_probes.store(fail, Ordering::SeqCst);
    }

    /// Make every `delete` call fail until reset.
    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    fn grant(method: &str, bucket: &str, name: &str, expires_in: Duration) -> BlobResult<PresignedGrant> {
        let expires_at = expiry_from_now(expires_in)?;
        Ok(PresignedGrant {
            url: format!("memory://{bucket}/{name}?expires={}", expires_at.timestamp()),
            method: method.to_string(),
            expires_at,
        })
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn presign_upload(
        &self,
        bucket: &str,
        name: &str,
        _content_type: &str,
        _size: i64,
        expires_in: Duration,
    ) -> BlobResult<PresignedGrant> {
        Self::grant("PUT", bucket, name, expires_in)
    }

    async fn presign_download(
        &self,
        bucket: &str,
        name: &str,
        expires_in: Duration,
    ) -> BlobResult<PresignedGrant> {
        Self::grant("GET", bucket, name, expires_in)
    }

    async fn exists(&self, bucket: &str, name: &str) -> BlobResult<bool> {
        if self.fail_probes.load(Ordering::SeqCst) {
            return Err(BlobError::Unavailable("injected probe failure".into()));
        }
        Ok(self.contains(bucket, name))
    }

    async fn delete(&self, bucket: &str, name: &str) -> BlobResult<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(BlobError::Unavailable("injected delete failure".into()));
        }
        self.remove(bucket, name);
        Ok(())
    }
}
