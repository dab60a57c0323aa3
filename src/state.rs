//! Shared state handed to the router.
//!
//! Handlers extract only the piece they use through [`FromRef`].

use axum::extract::FromRef;
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::{
    blob::LocalBlobStore,
    services::{bucket_service::BucketService, object_service::ObjectService},
};

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<SqlitePool>,
    pub buckets: BucketService,
    pub objects: ObjectService,
    /// Data-plane store behind the `/blobs` routes.
    pub blob_store: Arc<LocalBlobStore>,
}

impl FromRef<AppState> for BucketService {
    fn from_ref(state: &AppState) -> Self {
        state.buckets.clone()
    }
}

impl FromRef<AppState> for ObjectService {
    fn from_ref(state: &AppState) -> Self {
        state.objects.clone()
    }
}

impl FromRef<AppState> for Arc<LocalBlobStore> {
    fn from_ref(state: &AppState) -> Self {
        state.blob_store.clone()
    }
}
