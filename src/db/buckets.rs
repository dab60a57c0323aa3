//! Row-level bucket queries.
//!
//! Updates are compare-and-swap on `version`; they return `false` when the
//! row changed (or vanished) since it was read.

use chrono::{DateTime, Utc};
use sqlx::{SqliteExecutor, types::Json};
use uuid::Uuid;

use crate::models::bucket::{Bucket, BucketSize};

const BUCKET_COLUMNS: &str = "id, version, name, allowed_content_types, max_allowed_object_size, \
     public, disabled, locked, lock_reason, locked_at, created_at, updated_at";

pub async fn insert<'e, E: SqliteExecutor<'e>>(exec: E, bucket: &Bucket) -> sqlx::Result<()> {
    sqlx::query(
        "INSERT INTO buckets (id, version, name, allowed_content_types, max_allowed_object_size,
                              public, disabled, locked, lock_reason, locked_at, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(bucket.id)
    .bind(bucket.version)
    .bind(&bucket.name)
    .bind(Json(&bucket.allowed_content_types))
    .bind(bucket.max_allowed_object_size)
    .bind(bucket.public)
    .bind(bucket.disabled)
    .bind(bucket.locked)
    .bind(&bucket.lock_reason)
    .bind(bucket.locked_at)
    .bind(bucket.created_at)
    .bind(bucket.updated_at)
    .execute(exec)
    .await?;
    Ok(())
}

pub async fn get_by_id<'e, E: SqliteExecutor<'e>>(exec: E, id: Uuid) -> sqlx::Result<Bucket> {
    sqlx::query_as::<_, Bucket>(&format!("SELECT {BUCKET_COLUMNS} FROM buckets WHERE id = ?"))
        .bind(id)
        .fetch_one(exec)
        .await
}

pub async fn get_by_name<'e, E: SqliteExecutor<'e>>(exec: E, name: &str) -> sqlx::Result<Bucket> {
    sqlx::query_as::<_, Bucket>(&format!("SELECT {BUCKET_COLUMNS} FROM buckets WHERE name = ?"))
        .bind(name)
        .fetch_one(exec)
        .await
}

pub async fn list<'e, E: SqliteExecutor<'e>>(
    exec: E,
    limit: i64,
    offset: i64,
) -> sqlx::Result<Vec<Bucket>> {
    sqlx::query_as::<_, Bucket>(&format!(
        "SELECT {BUCKET_COLUMNS} FROM buckets ORDER BY name ASC LIMIT ? OFFSET ?"
    ))
    .bind(limit)
    .bind(offset)
    .fetch_all(exec)
    .await
}

/// Case-insensitive substring search on the bucket name.
pub async fn search<'e, E: SqliteExecutor<'e>>(
    exec: E,
    fragment: &str,
    limit: i64,
    offset: i64,
) -> sqlx::Result<Vec<Bucket>> {
    sqlx::query_as::<_, Bucket>(&format!(
        "SELECT {BUCKET_COLUMNS} FROM buckets
         WHERE instr(lower(name), lower(?)) > 0
         ORDER BY name ASC LIMIT ? OFFSET ?"
    ))
    .bind(fragment)
    .bind(limit)
    .bind(offset)
    .fetch_all(exec)
    .await
}

pub async fn update_allowed_content_types<'e, E: SqliteExecutor<'e>>(
    exec: E,
    id: Uuid,
    version: i64,
    allowed: &[String],
    now: DateTime<Utc>,
) -> sqlx::Result<bool> {
    let result = sqlx::query(
        "UPDATE buckets SET allowed_content_types = ?, version = version + 1, updated_at = ?
         WHERE id = ? AND version = ?",
    )
    .bind(Json(allowed))
    .bind(now)
    .bind(id)
    .bind(version)
    .execute(exec)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn update_policy<'e, E: SqliteExecutor<'e>>(
    exec: E,
    id: Uuid,
    version: i64,
    max_allowed_object_size: Option<i64>,
    public: bool,
    now: DateTime<Utc>,
) -> sqlx::Result<bool> {
    let result = sqlx::query(
        "UPDATE buckets SET max_allowed_object_size = ?, public = ?, version = version + 1, updated_at = ?
         WHERE id = ? AND version = ?",
    )
    .bind(max_allowed_object_size)
    .bind(public)
    .bind(now)
    .bind(id)
    .bind(version)
    .execute(exec)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn set_disabled<'e, E: SqliteExecutor<'e>>(
    exec: E,
    id: Uuid,
    version: i64,
    disabled: bool,
    now: DateTime<Utc>,
) -> sqlx::Result<bool> {
    let result = sqlx::query(
        "UPDATE buckets SET disabled = ?, version = version + 1, updated_at = ?
         WHERE id = ? AND version = ?",
    )
    .bind(disabled)
    .bind(now)
    .bind(id)
    .bind(version)
    .execute(exec)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn lock<'e, E: SqliteExecutor<'e>>(
    exec: E,
    id: Uuid,
    version: i64,
    reason: &str,
    now: DateTime<Utc>,
) -> sqlx::Result<bool> {
    let result = sqlx::query(
        "UPDATE buckets SET locked = 1, lock_reason = ?, locked_at = ?, version = version + 1, updated_at = ?
         WHERE id = ? AND version = ?",
    )
    .bind(reason)
    .bind(now)
    .bind(now)
    .bind(id)
    .bind(version)
    .execute(exec)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn unlock<'e, E: SqliteExecutor<'e>>(
    exec: E,
    id: Uuid,
    version: i64,
    now: DateTime<Utc>,
) -> sqlx::Result<bool> {
    let result = sqlx::query(
        "UPDATE buckets SET locked = 0, lock_reason = NULL, locked_at = NULL, version = version + 1, updated_at = ?
         WHERE id = ? AND version = ?",
    )
    .bind(now)
    .bind(id)
    .bind(version)
    .execute(exec)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn delete<'e, E: SqliteExecutor<'e>>(exec: E, id: Uuid, version: i64) -> sqlx::Result<bool> {
    let result = sqlx::query("DELETE FROM buckets WHERE id = ? AND version = ?")
        .bind(id)
        .bind(version)
        .execute(exec)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// Total completed bytes and object count for a bucket.
pub async fn size<'e, E: SqliteExecutor<'e>>(exec: E, id: Uuid) -> sqlx::Result<BucketSize> {
    sqlx::query_as::<_, BucketSize>(
        "SELECT b.id AS id,
                b.name AS name,
                COALESCE(SUM(CASE WHEN o.upload_status = 'completed' THEN o.size END), 0) AS size,
                COUNT(CASE WHEN o.upload_status = 'completed' THEN 1 END) AS object_count
         FROM buckets b
         LEFT JOIN objects o ON o.bucket_id = b.id
         WHERE b.id = ?
         GROUP BY b.id, b.name",
    )
    .bind(id)
    .fetch_one(exec)
    .await
}

/// Objects that hold or may still receive a blob. `failed` rows never do.
pub async fn count_live_objects<'e, E: SqliteExecutor<'e>>(exec: E, id: Uuid) -> sqlx::Result<i64> {
    sqlx::query_scalar(
        "SELECT COUNT(*) FROM objects
         WHERE bucket_id = ? AND upload_status IN ('pending', 'completed')",
    )
        .bind(id)
        .fetch_one(exec)
        .await
}
