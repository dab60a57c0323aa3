//! Task bodies for the reconciliation outbox.
//!
//! Both checks treat the blob store as ground truth for byte existence and
//! run whatever the bucket's disabled/locked state, so every pending upload
//! reaches a terminal status.

use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    blob::BlobStore,
    db::{UnitOfWork, objects},
    errors::{ServiceError, ServiceResult},
    models::{
        object::{Object, UploadStatus},
        task::TaskPayload,
    },
};

/// What a reconciliation run did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    Completed,
    Failed,
    /// The upload had already left `pending`.
    AlreadyResolved,
    /// The object row no longer exists.
    Gone,
    /// The blob is still there, so the delete never reached the store.
    Retained,
    /// A row whose blob was deleted has been removed.
    Removed,
}

#[derive(Clone)]
pub struct ExpiryReconciler {
    pub db: Arc<SqlitePool>,
    pub blobs: Arc<dyn BlobStore>,
}

impl ExpiryReconciler {
    pub fn new(db: Arc<SqlitePool>, blobs: Arc<dyn BlobStore>) -> Self {
        Self { db, blobs }
    }

    /// Execute the task described by `payload`.
    pub async fn run(&self, payload: &TaskPayload) -> ServiceResult<Reconciliation> {
        match payload {
            TaskPayload::UploadExpiry {
                bucket_name,
                object_name,
                object_id,
            } => self.resolve_upload(bucket_name, object_name, *object_id).await,
            TaskPayload::DeletionCheck {
                bucket_name,
                object_name,
                object_id,
            } => self.check_deletion(bucket_name, object_name, *object_id).await,
        }
    }

    async fn load(uow: &mut UnitOfWork, object_id: Uuid, op: &'static str) -> ServiceResult<Option<Object>> {
        match objects::get_by_id(uow.conn(), object_id).await {
            Ok(object) => Ok(Some(object)),
            Err(sqlx::Error::RowNotFound) => Ok(None),
            Err(err) => Err(ServiceError::database(op, err)),
        }
    }

    async fn blob_exists(&self, bucket_name: &str, object: &Object, op: &'static str) -> ServiceResult<bool> {
        self.blobs
            .exists(bucket_name, &object.name)
            .await
            .map_err(|err| ServiceError::blob(op, err))
    }

    /// Finalize a pending upload once its grant has expired.
    #[instrument(skip(self))]
    pub async fn resolve_upload(
        &self,
        bucket_name: &str,
        object_name: &str,
        object_id: Uuid,
    ) -> ServiceResult<Reconciliation> {
        const OP: &str = "ExpiryReconciler::resolve_upload";

        let mut uow = UnitOfWork::begin(&self.db)
            .await
            .map_err(|err| ServiceError::database(OP, err))?;

        let Some(object) = Self::load(&mut uow, object_id, OP).await? else {
            debug!("object no longer exists");
            return Ok(Reconciliation::Gone);
        };
        if object.upload_status.is_terminal() {
            debug!(status = %object.upload_status, "upload already resolved");
            return Ok(Reconciliation::AlreadyResolved);
        }

        let next = if self.blob_exists(bucket_name, &object, OP).await? {
            UploadStatus::Completed
        } else {
            UploadStatus::Failed
        };

        let applied = objects::update_upload_status(
            uow.conn(),
            object.id,
            object.version,
            UploadStatus::Pending,
            next,
            Utc::now(),
        )
        .await
        .map_err(|err| ServiceError::database(OP, err))?;
        if !applied {
            return Err(ServiceError::stale(format!("object '{}'", object.name)));
        }

        uow.commit()
            .await
            .map_err(|err| ServiceError::database(OP, err))?;

        match next {
            UploadStatus::Completed => {
                info!("upload pending -> completed at expiry");
                Ok(Reconciliation::Completed)
            }
            _ => {
                warn!("upload pending -> failed, blob never arrived");
                Ok(Reconciliation::Failed)
            }
        }
    }

    /// Compensate a delete that removed the blob but not the row.
    #[instrument(skip(self))]
    pub async fn check_deletion(
        &self,
        bucket_name: &str,
        object_name: &str,
        object_id: Uuid,
    ) -> ServiceResult<Reconciliation> {
        const OP: &str = "ExpiryReconciler::check_deletion";

        let mut uow = UnitOfWork::begin(&self.db)
            .await
            .map_err(|err| ServiceError::database(OP, err))?;

        let Some(object) = Self::load(&mut uow, object_id, OP).await? else {
            return Ok(Reconciliation::Gone);
        };
        if object.upload_status != UploadStatus::Completed || self.blob_exists(bucket_name, &object, OP).await? {
            return Ok(Reconciliation::Retained);
        }

        let applied = objects::delete(uow.conn(), object.id, object.version)
            .await
            .map_err(|err| ServiceError::database(OP, err))?;
        if !applied {
            return Err(ServiceError::stale(format!("object '{}'", object.name)));
        }
        uow.commit()
            .await
            .map_err(|err| ServiceError::database(OP, err))?;

        warn!("removed metadata of an object whose blob was already deleted");
        Ok(Reconciliation::Removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        blob::MemoryBlobStore,
        db::{buckets, testing::memory_pool},
        models::{bucket::Bucket, metadata::Metadata},
    };

    struct Fixture {
        reconciler: ExpiryReconciler,
        blobs: Arc<MemoryBlobStore>,
        bucket: Bucket,
    }

    async fn fixture() -> Fixture {
        let db = Arc::new(memory_pool().await);
        let blobs = Arc::new(MemoryBlobStore::new());
        let bucket = Bucket {
            id: Uuid::new_v4(),
            version: 0,
            name: "b1b".into(),
            allowed_content_types: vec!["*/*".into()],
            max_allowed_object_size: None,
            public: false,
            disabled: false,
            locked: false,
            lock_reason: None,
            locked_at: None,
            created_at: Utc::now(),
            updated_at: None,
        };
        buckets::insert(&*db, &bucket).await.unwrap();
        Fixture {
            reconciler: ExpiryReconciler::new(db, blobs.clone()),
            blobs,
            bucket,
        }
    }

    impl Fixture {
        async fn object(&self, name: &str, status: UploadStatus) -> Object {
            let object = Object {
                id: Uuid::new_v4(),
                version: 0,
                bucket_id: self.bucket.id,
                name: name.into(),
                content_type: "image/png".into(),
                size: 10,
                metadata: Metadata::new(),
                upload_status: status,
                last_accessed_at: None,
                created_at: Utc::now(),
                updated_at: None,
            };
            objects::insert(&*self.reconciler.db, &object).await.unwrap();
            object
        }

        async fn status(&self, id: Uuid) -> UploadStatus {
            objects::get_by_id(&*self.reconciler.db, id)
                .await
                .unwrap()
                .upload_status
        }

        fn expiry(object: &Object) -> TaskPayload {
            TaskPayload::UploadExpiry {
                bucket_name: "b1b".into(),
                object_name: object.name.clone(),
                object_id: object.id,
            }
        }

        fn deletion(object: &Object) -> TaskPayload {
            TaskPayload::DeletionCheck {
                bucket_name: "b1b".into(),
                object_name: object.name.clone(),
                object_id: object.id,
            }
        }
    }

    #[tokio::test]
    async fn expiry_without_blob_fails_the_upload() {
        let f = fixture().await;
        let object = f.object("a.png", UploadStatus::Pending).await;

        let outcome = f.reconciler.run(&Fixture::expiry(&object)).await.unwrap();
        assert_eq!(outcome, Reconciliation::Failed);
        assert_eq!(f.status(object.id).await, UploadStatus::Failed);

        // A redelivered task leaves the terminal status alone.
        f.blobs.put("b1b", "a.png");
        let outcome = f.reconciler.run(&Fixture::expiry(&object)).await.unwrap();
        assert_eq!(outcome, Reconciliation::AlreadyResolved);
        assert_eq!(f.status(object.id).await, UploadStatus::Failed);
    }

    #[tokio::test]
    async fn expiry_with_blob_completes_the_upload() {
        let f = fixture().await;
        let object = f.object("a.png", UploadStatus::Pending).await;
        f.blobs.put("b1b", "a.png");

        let outcome = f.reconciler.run(&Fixture::expiry(&object)).await.unwrap();
        assert_eq!(outcome, Reconciliation::Completed);
        assert_eq!(f.status(object.id).await, UploadStatus::Completed);
    }

    #[tokio::test]
    async fn expiry_ignores_resolved_and_missing_objects() {
        let f = fixture().await;
        let completed = f.object("a.png", UploadStatus::Completed).await;
        assert_eq!(
            f.reconciler.run(&Fixture::expiry(&completed)).await.unwrap(),
            Reconciliation::AlreadyResolved
        );

        let outcome = f
            .reconciler
            .resolve_upload("b1b", "ghost.png", Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(outcome, Reconciliation::Gone);
    }

    #[tokio::test]
    async fn expiry_runs_on_disabled_buckets() {
        let f = fixture().await;
        let object = f.object("a.png", UploadStatus::Pending).await;
        buckets::set_disabled(&*f.reconciler.db, f.bucket.id, 0, true, Utc::now())
            .await
            .unwrap();

        let outcome = f.reconciler.run(&Fixture::expiry(&object)).await.unwrap();
        assert_eq!(outcome, Reconciliation::Failed);
    }

    #[tokio::test]
    async fn probe_failure_leaves_upload_pending() {
        let f = fixture().await;
        let object = f.object("a.png", UploadStatus::Pending).await;
        f.blobs.fail_probes(true);

        let err = f.reconciler.run(&Fixture::expiry(&object)).await.unwrap_err();
        assert!(matches!(err, ServiceError::Unknown { .. }));
        assert_eq!(f.status(object.id).await, UploadStatus::Pending);
    }

    #[tokio::test]
    async fn deletion_check_removes_row_without_blob() {
        let f = fixture().await;
        let orphan = f.object("orphan.png", UploadStatus::Completed).await;
        let kept = f.object("kept.png", UploadStatus::Completed).await;
        f.blobs.put("b1b", "kept.png");

        assert_eq!(
            f.reconciler.run(&Fixture::deletion(&orphan)).await.unwrap(),
            Reconciliation::Removed
        );
        assert!(matches!(
            objects::get_by_id(&*f.reconciler.db, orphan.id).await,
            Err(sqlx::Error::RowNotFound)
        ));

        assert_eq!(
            f.reconciler.run(&Fixture::deletion(&kept)).await.unwrap(),
            Reconciliation::Retained
        );
        assert_eq!(f.status(kept.id).await, UploadStatus::Completed);

        assert_eq!(
            f.reconciler.run(&Fixture::deletion(&orphan)).await.unwrap(),
            Reconciliation::Gone
        );
    }
}
