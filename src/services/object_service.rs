//! ObjectService: the upload/download lifecycle of objects whose bytes live
//! in an external [`BlobStore`].
//!
//! Every mutation resolves its bucket through the disabled/locked guard
//! inside the same [`UnitOfWork`] that writes the object row. Upload grants
//! are issued together with an outbox task that resolves the upload once the
//! grant expires, so a `pending` row can never outlive its grant unresolved.

use chrono::Utc;
use serde::Deserialize;
use sqlx::{SqliteExecutor, SqlitePool};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::{
    blob::BlobStore,
    config::ServiceConfig,
    db::{UnitOfWork, is_unique_violation, objects},
    errors::{ServiceError, ServiceResult},
    models::{
        bucket::Bucket,
        metadata::Metadata,
        object::{DEFAULT_CONTENT_TYPE, Object, PresignedDownload, PresignedUpload, UploadStatus},
        task::TaskPayload,
    },
    services::{
        after,
        bucket_service::{DEFAULT_PAGE_LIMIT, resolve_by_name},
        validation::{
            ensure_non_negative, ensure_not_blank, resolve_expires_in, validate_content_size,
            validate_object_content_type, validate_object_name,
        },
    },
};

const DEFAULT_SEARCH_LEVEL: i64 = 1;

/// Input for [`ObjectService::create_presigned_upload`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreatePresignedUpload {
    pub name: String,
    pub size: i64,
    pub content_type: Option<String>,
    /// Grant lifetime in seconds.
    pub expires_in: Option<i64>,
    pub metadata: Option<Metadata>,
}

/// Query for [`ObjectService::search_objects_by_path`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchObjects {
    pub path: String,
    pub level: Option<i64>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Clone)]
pub struct ObjectService {
    pub db: Arc<SqlitePool>,
    pub blobs: Arc<dyn BlobStore>,
    pub config: ServiceConfig,
}

/// Load `object_id` and make sure it lives in `bucket`.
async fn load_object<'e, E: SqliteExecutor<'e>>(
    exec: E,
    bucket: &Bucket,
    object_id: Uuid,
    op: &'static str,
) -> ServiceResult<Object> {
    let entity = || format!("object '{object_id}'");
    let object = objects::get_by_id(exec, object_id)
        .await
        .map_err(|err| ServiceError::lookup(op, entity(), err))?;
    if object.bucket_id != bucket.id {
        return Err(ServiceError::NotFound(format!("{} not found", entity())));
    }
    Ok(object)
}

/// Fail with `InvalidInput` unless `object` is still pending.
fn ensure_pending(object: &Object) -> ServiceResult<()> {
    match object.upload_status {
        UploadStatus::Pending => Ok(()),
        UploadStatus::Completed => Err(ServiceError::InvalidInput(format!(
            "upload already completed for object '{}'",
            object.name
        ))),
        UploadStatus::Failed => Err(ServiceError::InvalidInput(format!(
            "upload has failed for object '{}'",
            object.name
        ))),
    }
}

impl ObjectService {
    pub fn new(db: Arc<SqlitePool>, blobs: Arc<dyn BlobStore>, config: ServiceConfig) -> Self {
        Self { db, blobs, config }
    }

    async fn begin(&self, op: &'static str) -> ServiceResult<UnitOfWork> {
        UnitOfWork::begin(&self.db)
            .await
            .map_err(|err| ServiceError::database(op, err))
    }

    async fn commit(uow: UnitOfWork, op: &'static str) -> ServiceResult<()> {
        uow.commit()
            .await
            .map_err(|err| ServiceError::database(op, err))
    }

    /// Probe the blob store and move a pending object to `completed`.
    /// Leaves the row untouched when the blob is not there yet.
    async fn confirm_upload(
        &self,
        uow: &mut UnitOfWork,
        bucket: &Bucket,
        object: &Object,
        op: &'static str,
    ) -> ServiceResult<()> {
        let exists = self
            .blobs
            .exists(&bucket.name, &object.name)
            .await
            .map_err(|err| ServiceError::blob(op, err))?;
        if !exists {
            return Err(ServiceError::NotFound(format!(
                "object '{}' has not yet been uploaded to storage",
                object.name
            )));
        }

        let applied = objects::update_upload_status(
            uow.conn(),
            object.id,
            object.version,
            UploadStatus::Pending,
            UploadStatus::Completed,
            Utc::now(),
        )
        .await
        .map_err(|err| ServiceError::database(op, err))?;
        if !applied {
            return Err(ServiceError::stale(format!("object '{}'", object.name)));
        }

        info!(object_id = %object.id, bucket = %bucket.name, "upload pending -> completed");
        Ok(())
    }

    /// Issue an upload grant and record the object as `pending`.
    ///
    /// The row and its expiry task commit together; if either write fails
    /// the grant is simply never returned.
    #[instrument(skip(self, req), fields(object = %req.name, size = req.size))]
    pub async fn create_presigned_upload(
        &self,
        bucket_name: &str,
        req: CreatePresignedUpload,
    ) -> ServiceResult<PresignedUpload> {
        const OP: &str = "ObjectService::create_presigned_upload";

        ensure_not_blank(bucket_name, "bucket name")?;
        validate_object_name(&req.name)?;
        validate_content_size(req.size)?;
        let content_type = match req.content_type {
            Some(content_type) => {
                validate_object_content_type(&content_type)?;
                content_type
            }
            None => DEFAULT_CONTENT_TYPE.to_string(),
        };
        let expires_in = resolve_expires_in(req.expires_in, self.config.default_expires_in)?;

        let mut uow = self.begin(OP).await?;
        let bucket = resolve_by_name(uow.conn(), bucket_name, OP).await?;

        if !bucket.allows_content_type(&content_type) {
            return Err(ServiceError::InvalidInput(format!(
                "content type '{content_type}' is not allowed in bucket '{}'",
                bucket.name
            )));
        }
        if !bucket.allows_size(req.size) {
            return Err(ServiceError::InvalidInput(format!(
                "object size {} exceeds the {} byte limit of bucket '{}'",
                req.size,
                bucket.max_allowed_object_size.unwrap_or_default(),
                bucket.name
            )));
        }

        let conflict = || {
            ServiceError::Conflict(format!(
                "object with name '{}' already exists in bucket '{}'",
                req.name, bucket.name
            ))
        };
        match objects::get_by_bucket_and_name(uow.conn(), bucket.id, &req.name).await {
            Ok(_) => return Err(conflict()),
            Err(sqlx::Error::RowNotFound) => {}
            Err(err) => return Err(ServiceError::database(OP, err)),
        }

        let grant = self
            .blobs
            .presign_upload(&bucket.name, &req.name, &content_type, req.size, expires_in)
            .await
            .map_err(|err| ServiceError::blob(OP, err))?;

        let object = Object {
            id: Uuid::new_v4(),
            version: 0,
            bucket_id: bucket.id,
            name: req.name.clone(),
            content_type,
            size: req.size,
            metadata: req.metadata.unwrap_or_default(),
            upload_status: UploadStatus::Pending,
            last_accessed_at: None,
            created_at: Utc::now(),
            updated_at: None,
        };
        objects::insert(uow.conn(), &object).await.map_err(|err| {
            if is_unique_violation(&err) {
                conflict()
            } else {
                ServiceError::database(OP, err)
            }
        })?;

        let task = TaskPayload::UploadExpiry {
            bucket_name: bucket.name.clone(),
            object_name: object.name.clone(),
            object_id: object.id,
        };
        uow.schedule(&task, grant.expires_at)
            .await
            .map_err(|err| ServiceError::database(OP, err))?;

        Self::commit(uow, OP).await?;

        info!(object_id = %object.id, bucket = %bucket.name, expires_at = %grant.expires_at, "upload grant issued");
        Ok(PresignedUpload {
            id: object.id,
            url: grant.url,
            method: grant.method,
            expires_at: grant.expires_at,
        })
    }

    /// One-shot confirmation that the client finished uploading.
    #[instrument(skip(self))]
    pub async fn complete_presigned_upload(&self, bucket_name: &str, object_id: Uuid) -> ServiceResult<Object> {
        const OP: &str = "ObjectService::complete_presigned_upload";

        ensure_not_blank(bucket_name, "bucket name")?;

        let mut uow = self.begin(OP).await?;
        let bucket = resolve_by_name(uow.conn(), bucket_name, OP).await?;
        let object = load_object(uow.conn(), &bucket, object_id, OP).await?;
        ensure_pending(&object)?;

        self.confirm_upload(&mut uow, &bucket, &object, OP).await?;

        let object = load_object(uow.conn(), &bucket, object_id, OP).await?;
        Self::commit(uow, OP).await?;
        Ok(object)
    }

    /// Issue a download grant, finalizing a pending upload whose blob has
    /// already arrived.
    #[instrument(skip(self))]
    pub async fn create_presigned_download(
        &self,
        bucket_name: &str,
        object_id: Uuid,
        expires_in: Option<i64>,
    ) -> ServiceResult<PresignedDownload> {
        const OP: &str = "ObjectService::create_presigned_download";

        ensure_not_blank(bucket_name, "bucket name")?;
        let expires_in = resolve_expires_in(expires_in, self.config.default_expires_in)?;

        let mut uow = self.begin(OP).await?;
        let bucket = resolve_by_name(uow.conn(), bucket_name, OP).await?;
        let mut object = load_object(uow.conn(), &bucket, object_id, OP).await?;

        if object.upload_status != UploadStatus::Completed {
            ensure_pending(&object)?;
            self.confirm_upload(&mut uow, &bucket, &object, OP).await?;
            object.version += 1;
        }

        let grant = self
            .blobs
            .presign_download(&bucket.name, &object.name, expires_in)
            .await
            .map_err(|err| ServiceError::blob(OP, err))?;

        let applied = objects::touch_last_accessed(uow.conn(), object.id, object.version, Utc::now())
            .await
            .map_err(|err| ServiceError::database(OP, err))?;
        if !applied {
            return Err(ServiceError::stale(format!("object '{}'", object.name)));
        }

        Self::commit(uow, OP).await?;
        Ok(PresignedDownload {
            url: grant.url,
            method: grant.method,
            expires_at: grant.expires_at,
        })
    }

    /// Delete a completed object from the blob store and then from metadata.
    ///
    /// A deletion check is committed first. If the process dies between the
    /// blob delete and the row delete, the check finds the row without its
    /// blob and removes it.
    #[instrument(skip(self))]
    pub async fn delete_object(&self, bucket_name: &str, object_id: Uuid) -> ServiceResult<()> {
        const OP: &str = "ObjectService::delete_object";

        ensure_not_blank(bucket_name, "bucket name")?;

        // Phase one: guard checks and the compensating task.
        let mut uow = self.begin(OP).await?;
        let bucket = resolve_by_name(uow.conn(), bucket_name, OP).await?;
        let object = load_object(uow.conn(), &bucket, object_id, OP).await?;
        if object.upload_status != UploadStatus::Completed {
            return Err(ServiceError::InvalidInput(format!(
                "upload has not yet been completed for object '{}'. only uploaded objects can be deleted",
                object.name
            )));
        }
        let task = TaskPayload::DeletionCheck {
            bucket_name: bucket.name.clone(),
            object_name: object.name.clone(),
            object_id: object.id,
        };
        uow.schedule(&task, after(self.config.deletion_check_delay, OP)?)
            .await
            .map_err(|err| ServiceError::database(OP, err))?;
        Self::commit(uow, OP).await?;

        // Phase two: blob first, then the row.
        let mut uow = self.begin(OP).await?;
        let current = load_object(uow.conn(), &bucket, object_id, OP).await?;
        if current.version != object.version {
            return Err(ServiceError::stale(format!("object '{}'", object.name)));
        }

        self.blobs
            .delete(&bucket.name, &object.name)
            .await
            .map_err(|err| ServiceError::blob(OP, err))?;

        let applied = objects::delete(uow.conn(), object.id, object.version)
            .await
            .map_err(|err| ServiceError::database(OP, err))?;
        if !applied {
            return Err(ServiceError::stale(format!("object '{}'", object.name)));
        }
        Self::commit(uow, OP).await?;

        info!(object_id = %object.id, bucket = %bucket.name, "object deleted");
        Ok(())
    }

    pub async fn get_object_by_id(&self, bucket_name: &str, object_id: Uuid) -> ServiceResult<Object> {
        const OP: &str = "ObjectService::get_object_by_id";

        ensure_not_blank(bucket_name, "bucket name")?;
        let bucket = resolve_by_name(&*self.db, bucket_name, OP).await?;
        load_object(&*self.db, &bucket, object_id, OP).await
    }

    /// Objects under `path` at most `level` segments deep. An empty result
    /// is `NotFound`.
    #[instrument(skip(self))]
    pub async fn search_objects_by_path(&self, bucket_name: &str, query: SearchObjects) -> ServiceResult<Vec<Object>> {
        const OP: &str = "ObjectService::search_objects_by_path";

        ensure_not_blank(bucket_name, "bucket name")?;
        ensure_not_blank(&query.path, "object path")?;
        ensure_non_negative(query.level, "level")?;
        ensure_non_negative(query.limit, "limit")?;
        ensure_non_negative(query.offset, "offset")?;

        let level = query.level.filter(|&l| l > 0).unwrap_or(DEFAULT_SEARCH_LEVEL);
        let limit = query.limit.filter(|&l| l > 0).unwrap_or(DEFAULT_PAGE_LIMIT);
        let offset = query.offset.unwrap_or(0);

        let bucket = resolve_by_name(&*self.db, bucket_name, OP).await?;
        let found = objects::search_by_path(&*self.db, bucket.id, &query.path, level, limit, offset)
            .await
            .map_err(|err| ServiceError::database(OP, err))?;

        if found.is_empty() {
            return Err(ServiceError::NotFound(format!(
                "no objects found for bucket '{}' with path '{}'",
                bucket.name, query.path
            )));
        }
        Ok(found)
    }
}
