//! BucketService: bucket metadata and the policy every object operation
//! consults.
//!
//! Each mutation runs in one [`UnitOfWork`] that re-reads the bucket, checks
//! its guards against that fresh row and writes with a compare-and-swap on
//! `version`.

use chrono::Utc;
use serde::Deserialize;
use sqlx::{SqliteExecutor, SqlitePool};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::{
    db::{UnitOfWork, buckets},
    errors::{ServiceError, ServiceResult},
    models::bucket::{Bucket, BucketSize, WILDCARD_CONTENT_TYPE},
    services::validation::{
        ensure_non_negative, ensure_not_blank, validate_allowed_content_types,
        validate_bucket_name, validate_content_type_patterns, validate_max_allowed_object_size,
    },
};

pub const DEFAULT_PAGE_LIMIT: i64 = 100;

/// Input for [`BucketService::create`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateBucket {
    pub name: String,
    pub allowed_content_types: Option<Vec<String>>,
    pub max_allowed_object_size: Option<i64>,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub disabled: bool,
}

/// Input for [`BucketService::update`]. Absent fields keep their value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateBucket {
    pub max_allowed_object_size: Option<i64>,
    pub public: Option<bool>,
}

#[derive(Clone)]
pub struct BucketService {
    pub db: Arc<SqlitePool>,
}

/// Reject any use of a disabled or locked bucket.
pub(crate) fn ensure_usable(bucket: &Bucket) -> ServiceResult<()> {
    if bucket.disabled {
        return Err(ServiceError::Forbidden(format!(
            "bucket '{}' is disabled",
            bucket.name
        )));
    }
    if bucket.locked {
        return Err(ServiceError::Forbidden(format!(
            "bucket '{}' is locked for '{}'",
            bucket.name,
            bucket.lock_reason.as_deref().unwrap_or_default()
        )));
    }
    Ok(())
}

/// Resolve a bucket by name for the object path. A disabled or locked
/// bucket is reported as `Forbidden` to readers and writers alike.
pub(crate) async fn resolve_by_name<'e, E: SqliteExecutor<'e>>(
    exec: E,
    name: &str,
    op: &'static str,
) -> ServiceResult<Bucket> {
    validate_bucket_name(name)?;
    let bucket = buckets::get_by_name(exec, name)
        .await
        .map_err(|err| ServiceError::lookup(op, format!("bucket '{name}'"), err))?;
    ensure_usable(&bucket)?;
    Ok(bucket)
}

fn page(limit: Option<i64>, offset: Option<i64>) -> ServiceResult<(i64, i64)> {
    ensure_non_negative(limit, "limit")?;
    ensure_non_negative(offset, "offset")?;
    let limit = match limit {
        None | Some(0) => DEFAULT_PAGE_LIMIT,
        Some(limit) => limit,
    };
    Ok((limit, offset.unwrap_or(0)))
}

/// Order-preserving de-duplication.
fn dedupe(types: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for t in types {
        if !out.contains(&t) {
            out.push(t);
        }
    }
    out
}

impl BucketService {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    async fn begin(&self, op: &'static str) -> ServiceResult<UnitOfWork> {
        UnitOfWork::begin(&self.db)
            .await
            .map_err(|err| ServiceError::database(op, err))
    }

    async fn load(uow: &mut UnitOfWork, id: Uuid, op: &'static str) -> ServiceResult<Bucket> {
        buckets::get_by_id(uow.conn(), id)
            .await
            .map_err(|err| ServiceError::lookup(op, format!("bucket '{id}'"), err))
    }

    /// Re-read the written row and commit.
    async fn finish(mut uow: UnitOfWork, id: Uuid, op: &'static str) -> ServiceResult<Bucket> {
        let bucket = Self::load(&mut uow, id, op).await?;
        uow.commit()
            .await
            .map_err(|err| ServiceError::database(op, err))?;
        Ok(bucket)
    }

    fn applied(applied: bool, bucket: &Bucket) -> ServiceResult<()> {
        if applied {
            Ok(())
        } else {
            Err(ServiceError::stale(format!("bucket '{}'", bucket.name)))
        }
    }

    #[instrument(skip(self, req), fields(name = %req.name))]
    pub async fn create(&self, req: CreateBucket) -> ServiceResult<Bucket> {
        const OP: &str = "BucketService::create";

        validate_bucket_name(&req.name)?;
        let allowed_content_types = match req.allowed_content_types {
            Some(types) => {
                validate_allowed_content_types(&types)?;
                dedupe(types)
            }
            None => vec![WILDCARD_CONTENT_TYPE.to_string()],
        };
        validate_max_allowed_object_size(req.max_allowed_object_size)?;

        let bucket = Bucket {
            id: Uuid::new_v4(),
            version: 0,
            name: req.name,
            allowed_content_types,
            max_allowed_object_size: req.max_allowed_object_size,
            public: req.public,
            disabled: req.disabled,
            locked: false,
            lock_reason: None,
            locked_at: None,
            created_at: Utc::now(),
            updated_at: None,
        };

        buckets::insert(&*self.db, &bucket).await.map_err(|err| {
            if crate::db::is_unique_violation(&err) {
                ServiceError::Conflict(format!(
                    "bucket with name '{}' already exists",
                    bucket.name
                ))
            } else {
                ServiceError::database(OP, err)
            }
        })?;

        info!(bucket_id = %bucket.id, "bucket created");
        Ok(bucket)
    }

    #[instrument(skip(self))]
    pub async fn enable(&self, id: Uuid) -> ServiceResult<Bucket> {
        self.set_disabled(id, false, "BucketService::enable").await
    }

    #[instrument(skip(self))]
    pub async fn disable(&self, id: Uuid) -> ServiceResult<Bucket> {
        self.set_disabled(id, true, "BucketService::disable").await
    }

    async fn set_disabled(&self, id: Uuid, disabled: bool, op: &'static str) -> ServiceResult<Bucket> {
        let mut uow = self.begin(op).await?;
        let bucket = Self::load(&mut uow, id, op).await?;

        if bucket.disabled == disabled {
            let state = if disabled { "disabled" } else { "enabled" };
            return Err(ServiceError::BadRequest(format!(
                "bucket '{}' is already {state}",
                bucket.name
            )));
        }

        let applied = buckets::set_disabled(uow.conn(), id, bucket.version, disabled, Utc::now())
            .await
            .map_err(|err| ServiceError::database(op, err))?;
        Self::applied(applied, &bucket)?;

        info!(bucket = %bucket.name, disabled, "bucket state changed");
        Self::finish(uow, id, op).await
    }

    /// Lock a bucket against every mutation. Allowed while disabled.
    #[instrument(skip(self))]
    pub async fn lock(&self, id: Uuid, reason: &str) -> ServiceResult<Bucket> {
        const OP: &str = "BucketService::lock";

        ensure_not_blank(reason, "lock reason")?;

        let mut uow = self.begin(OP).await?;
        let bucket = Self::load(&mut uow, id, OP).await?;
        if bucket.locked {
            return Err(ServiceError::BadRequest(format!(
                "bucket '{}' is already locked",
                bucket.name
            )));
        }

        let applied = buckets::lock(uow.conn(), id, bucket.version, reason.trim(), Utc::now())
            .await
            .map_err(|err| ServiceError::database(OP, err))?;
        Self::applied(applied, &bucket)?;

        info!(bucket = %bucket.name, reason, "bucket locked");
        Self::finish(uow, id, OP).await
    }

    #[instrument(skip(self))]
    pub async fn unlock(&self, id: Uuid) -> ServiceResult<Bucket> {
        const OP: &str = "BucketService::unlock";

        let mut uow = self.begin(OP).await?;
        let bucket = Self::load(&mut uow, id, OP).await?;
        if !bucket.locked {
            return Err(ServiceError::BadRequest(format!(
                "bucket '{}' is not locked",
                bucket.name
            )));
        }

        let applied = buckets::unlock(uow.conn(), id, bucket.version, Utc::now())
            .await
            .map_err(|err| ServiceError::database(OP, err))?;
        Self::applied(applied, &bucket)?;

        info!(bucket = %bucket.name, "bucket unlocked");
        Self::finish(uow, id, OP).await
    }

    /// Add explicit patterns. A bucket that allowed everything ends up
    /// allowing exactly `types`.
    #[instrument(skip(self))]
    pub async fn add_allowed_content_types(&self, id: Uuid, types: Vec<String>) -> ServiceResult<Bucket> {
        const OP: &str = "BucketService::add_allowed_content_types";

        if types.iter().any(|t| t == WILDCARD_CONTENT_TYPE) {
            return Err(ServiceError::InvalidInput(format!(
                "wildcard '{WILDCARD_CONTENT_TYPE}' cannot be added as an allowed content type"
            )));
        }
        validate_content_type_patterns(&types)?;

        let mut uow = self.begin(OP).await?;
        let bucket = Self::load(&mut uow, id, OP).await?;
        ensure_usable(&bucket)?;

        let current = if bucket.allowed_content_types.iter().any(|t| t == WILDCARD_CONTENT_TYPE) {
            Vec::new()
        } else {
            bucket.allowed_content_types.clone()
        };
        let allowed = dedupe(current.into_iter().chain(types));

        let applied = buckets::update_allowed_content_types(uow.conn(), id, bucket.version, &allowed, Utc::now())
            .await
            .map_err(|err| ServiceError::database(OP, err))?;
        Self::applied(applied, &bucket)?;

        Self::finish(uow, id, OP).await
    }

    /// Remove patterns. Removing the wildcard clears the whole set.
    #[instrument(skip(self))]
    pub async fn remove_allowed_content_types(&self, id: Uuid, types: Vec<String>) -> ServiceResult<Bucket> {
        const OP: &str = "BucketService::remove_allowed_content_types";

        validate_content_type_patterns(&types)?;

        let mut uow = self.begin(OP).await?;
        let bucket = Self::load(&mut uow, id, OP).await?;
        ensure_usable(&bucket)?;

        let allowed: Vec<String> = if types.iter().any(|t| t == WILDCARD_CONTENT_TYPE) {
            Vec::new()
        } else {
            bucket
                .allowed_content_types
                .iter()
                .filter(|t| !types.contains(t))
                .cloned()
                .collect()
        };

        let applied = buckets::update_allowed_content_types(uow.conn(), id, bucket.version, &allowed, Utc::now())
            .await
            .map_err(|err| ServiceError::database(OP, err))?;
        Self::applied(applied, &bucket)?;

        Self::finish(uow, id, OP).await
    }

    #[instrument(skip(self))]
    pub async fn update(&self, id: Uuid, req: UpdateBucket) -> ServiceResult<Bucket> {
        const OP: &str = "BucketService::update";

        validate_max_allowed_object_size(req.max_allowed_object_size)?;

        let mut uow = self.begin(OP).await?;
        let bucket = Self::load(&mut uow, id, OP).await?;
        ensure_usable(&bucket)?;

        let max_allowed_object_size = req.max_allowed_object_size.or(bucket.max_allowed_object_size);
        let public = req.public.unwrap_or(bucket.public);

        let applied = buckets::update_policy(
            uow.conn(),
            id,
            bucket.version,
            max_allowed_object_size,
            public,
            Utc::now(),
        )
        .await
        .map_err(|err| ServiceError::database(OP, err))?;
        Self::applied(applied, &bucket)?;

        Self::finish(uow, id, OP).await
    }

    /// Delete an enabled, unlocked and empty bucket.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: Uuid) -> ServiceResult<()> {
        const OP: &str = "BucketService::delete";

        let mut uow = self.begin(OP).await?;
        let bucket = Self::load(&mut uow, id, OP).await?;
        ensure_usable(&bucket)?;

        let objects = buckets::count_live_objects(uow.conn(), id)
            .await
            .map_err(|err| ServiceError::database(OP, err))?;
        if objects > 0 {
            return Err(ServiceError::InvalidInput(format!(
                "bucket '{}' still holds {objects} objects",
                bucket.name
            )));
        }

        let applied = buckets::delete(uow.conn(), id, bucket.version)
            .await
            .map_err(|err| ServiceError::database(OP, err))?;
        Self::applied(applied, &bucket)?;

        uow.commit()
            .await
            .map_err(|err| ServiceError::database(OP, err))?;
        info!(bucket = %bucket.name, "bucket deleted");
        Ok(())
    }

    pub async fn get_by_id(&self, id: Uuid) -> ServiceResult<Bucket> {
        buckets::get_by_id(&*self.db, id)
            .await
            .map_err(|err| ServiceError::lookup("BucketService::get_by_id", format!("bucket '{id}'"), err))
    }

    pub async fn get_by_name(&self, name: &str) -> ServiceResult<Bucket> {
        ensure_not_blank(name, "bucket name")?;
        buckets::get_by_name(&*self.db, name)
            .await
            .map_err(|err| ServiceError::lookup("BucketService::get_by_name", format!("bucket '{name}'"), err))
    }

    pub async fn list_buckets(&self, limit: Option<i64>, offset: Option<i64>) -> ServiceResult<Vec<Bucket>> {
        let (limit, offset) = page(limit, offset)?;
        buckets::list(&*self.db, limit, offset)
            .await
            .map_err(|err| ServiceError::database("BucketService::list_buckets", err))
    }

    /// Case-insensitive name search.
    pub async fn search_buckets(
        &self,
        fragment: &str,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> ServiceResult<Vec<Bucket>> {
        ensure_not_blank(fragment, "search term")?;
        let (limit, offset) = page(limit, offset)?;
        buckets::search(&*self.db, fragment.trim(), limit, offset)
            .await
            .map_err(|err| ServiceError::database("BucketService::search_buckets", err))
    }

    /// Bytes and object count of completed uploads.
    pub async fn get_bucket_size(&self, id: Uuid) -> ServiceResult<BucketSize> {
        buckets::size(&*self.db, id)
            .await
            .map_err(|err| ServiceError::lookup("BucketService::get_bucket_size", format!("bucket '{id}'"), err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::{objects, testing::memory_pool},
        models::{
            metadata::Metadata,
            object::{Object, UploadStatus},
        },
    };

    async fn service() -> BucketService {
        BucketService::new(Arc::new(memory_pool().await))
    }

    async fn create(service: &BucketService, name: &str) -> Bucket {
        service
            .create(CreateBucket {
                name: name.into(),
                ..Default::default()
            })
            .await
            .unwrap()
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    async fn insert_object(service: &BucketService, bucket: &Bucket, name: &str, size: i64, status: UploadStatus) {
        let object = Object {
            id: Uuid::new_v4(),
            version: 0,
            bucket_id: bucket.id,
            name: name.into(),
            content_type: "text/plain".into(),
            size,
            metadata: Metadata::new(),
            upload_status: status,
            last_accessed_at: None,
            created_at: Utc::now(),
            updated_at: None,
        };
        objects::insert(&*service.db, &object).await.unwrap();
    }

    #[tokio::test]
    async fn create_defaults_to_wildcard_and_rejects_duplicates() {
        let service = service().await;
        let bucket = create(&service, "b1-media").await;
        assert_eq!(bucket.allowed_content_types, vec!["*/*"]);
        assert!(!bucket.disabled && !bucket.locked);

        let err = service
            .create(CreateBucket {
                name: "b1-media".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));
        assert_eq!(service.get_by_name("b1-media").await.unwrap().id, bucket.id);
    }

    #[tokio::test]
    async fn create_validates_before_writing() {
        let service = service().await;
        for req in [
            CreateBucket { name: "  ".into(), ..Default::default() },
            CreateBucket { name: "-bad".into(), ..Default::default() },
            CreateBucket {
                name: "b1".repeat(2),
                allowed_content_types: Some(strings(&["*/*", "image/png"])),
                ..Default::default()
            },
            CreateBucket {
                name: "b1b1".into(),
                max_allowed_object_size: Some(0),
                ..Default::default()
            },
        ] {
            let err = service.create(req).await.unwrap_err();
            assert!(matches!(err, ServiceError::InvalidInput(_)), "{err:?}");
        }
        assert!(service.list_buckets(None, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn adding_a_type_replaces_the_wildcard() {
        let service = service().await;
        let bucket = create(&service, "b1b").await;

        let bucket = service
            .add_allowed_content_types(bucket.id, strings(&["image/png"]))
            .await
            .unwrap();
        assert_eq!(bucket.allowed_content_types, vec!["image/png"]);
        assert_eq!(bucket.version, 1);

        let bucket = service
            .add_allowed_content_types(bucket.id, strings(&["image/png", "text/*"]))
            .await
            .unwrap();
        assert_eq!(bucket.allowed_content_types, vec!["image/png", "text/*"]);

        let err = service
            .add_allowed_content_types(bucket.id, strings(&["*/*"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn removing_the_wildcard_clears_everything() {
        let service = service().await;
        let bucket = create(&service, "b1b").await;
        service
            .add_allowed_content_types(bucket.id, strings(&["image/png", "image/jpeg"]))
            .await
            .unwrap();

        let bucket = service
            .remove_allowed_content_types(bucket.id, strings(&["image/jpeg"]))
            .await
            .unwrap();
        assert_eq!(bucket.allowed_content_types, vec!["image/png"]);

        let bucket = service
            .remove_allowed_content_types(bucket.id, strings(&["*/*"]))
            .await
            .unwrap();
        assert!(bucket.allowed_content_types.is_empty());
    }

    #[tokio::test]
    async fn redundant_state_changes_are_bad_requests() {
        let service = service().await;
        let bucket = create(&service, "b1b").await;

        let err = service.enable(bucket.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::BadRequest(_)));

        let bucket = service.disable(bucket.id).await.unwrap();
        assert!(bucket.disabled);
        let err = service.disable(bucket.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::BadRequest(_)));

        let err = service.unlock(bucket.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::BadRequest(_)));
    }

    #[tokio::test]
    async fn disabled_or_locked_buckets_reject_policy_changes() {
        let service = service().await;
        let bucket = create(&service, "b1b").await;

        service.disable(bucket.id).await.unwrap();
        let err = service
            .update(bucket.id, UpdateBucket { public: Some(true), ..Default::default() })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));

        // Locking is independent of disabling.
        let bucket = service.lock(bucket.id, "legal hold").await.unwrap();
        assert!(bucket.locked && bucket.locked_at.is_some());
        service.enable(bucket.id).await.unwrap();

        let err = service
            .add_allowed_content_types(bucket.id, strings(&["text/plain"]))
            .await
            .unwrap_err();
        match err {
            ServiceError::Forbidden(message) => assert!(message.contains("legal hold")),
            other => panic!("expected Forbidden, got {other:?}"),
        }
        let err = service.delete(bucket.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));

        let bucket = service.unlock(bucket.id).await.unwrap();
        assert!(!bucket.locked && bucket.lock_reason.is_none());
        let bucket = service
            .update(bucket.id, UpdateBucket { max_allowed_object_size: Some(10), public: None })
            .await
            .unwrap();
        assert_eq!(bucket.max_allowed_object_size, Some(10));
    }

    #[tokio::test]
    async fn lock_requires_a_reason() {
        let service = service().await;
        let bucket = create(&service, "b1b").await;
        let err = service.lock(bucket.id, "   ").await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidInput(_)));
        let err = service.lock(Uuid::new_v4(), "why").await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_requires_an_empty_bucket() {
        let service = service().await;
        let bucket = create(&service, "b1b").await;
        insert_object(&service, &bucket, "a.txt", 4, UploadStatus::Pending).await;

        let err = service.delete(bucket.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidInput(_)));

        let empty = create(&service, "b2b").await;
        service.delete(empty.id).await.unwrap();
        let err = service.get_by_id(empty.id).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn failed_uploads_do_not_block_deletion() {
        let service = service().await;
        let bucket = create(&service, "b1b").await;
        insert_object(&service, &bucket, "abandoned.bin", 4, UploadStatus::Failed).await;

        service.delete(bucket.id).await.unwrap();
        let left: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM objects WHERE bucket_id = ?")
            .bind(bucket.id)
            .fetch_one(&*service.db)
            .await
            .unwrap();
        assert_eq!(left, 0);

        let busy = create(&service, "b2b").await;
        insert_object(&service, &busy, "done.bin", 4, UploadStatus::Completed).await;
        insert_object(&service, &busy, "gone.bin", 4, UploadStatus::Failed).await;
        match service.delete(busy.id).await.unwrap_err() {
            ServiceError::InvalidInput(message) => assert!(message.contains("holds 1 objects")),
            other => panic!("expected InvalidInput, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn size_counts_completed_uploads_only() {
        let service = service().await;
        let bucket = create(&service, "b1b").await;
        insert_object(&service, &bucket, "a", 10, UploadStatus::Completed).await;
        insert_object(&service, &bucket, "b", 5, UploadStatus::Completed).await;
        insert_object(&service, &bucket, "c", 100, UploadStatus::Pending).await;
        insert_object(&service, &bucket, "d", 7, UploadStatus::Failed).await;

        let size = service.get_bucket_size(bucket.id).await.unwrap();
        assert_eq!(size.name, "b1b");
        assert_eq!(size.size, 15);
        assert_eq!(size.object_count, 2);

        let empty = create(&service, "b2b").await;
        assert_eq!(service.get_bucket_size(empty.id).await.unwrap().size, 0);
    }

    #[tokio::test]
    async fn list_and_search_paginate_by_name() {
        let service = service().await;
        for name in ["gamma", "alpha", "beta", "alphabet"] {
            create(&service, name).await;
        }

        let names = |buckets: Vec<Bucket>| buckets.into_iter().map(|b| b.name).collect::<Vec<_>>();
        assert_eq!(
            names(service.list_buckets(Some(2), Some(1)).await.unwrap()),
            vec!["alphabet", "beta"]
        );
        assert_eq!(
            names(service.search_buckets("ALPHA", None, None).await.unwrap()),
            vec!["alpha", "alphabet"]
        );
        assert!(matches!(
            service.list_buckets(Some(-1), None).await.unwrap_err(),
            ServiceError::InvalidInput(_)
        ));
    }

    #[tokio::test]
    async fn resolve_by_name_hides_unusable_buckets() {
        let service = service().await;
        let bucket = create(&service, "b1b").await;
        assert!(resolve_by_name(&*service.db, "b1b", "test").await.is_ok());

        service.disable(bucket.id).await.unwrap();
        let err = resolve_by_name(&*service.db, "b1b", "test").await.unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));

        let err = resolve_by_name(&*service.db, "missing", "test").await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }
}
