//! Row-level object queries.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqliteExecutor};
use uuid::Uuid;

use crate::models::{
    metadata,
    object::{Object, UploadStatus},
};

const OBJECT_COLUMNS: &str = "id, version, bucket_id, name, content_type, size, metadata, \
     upload_status, last_accessed_at, created_at, updated_at";

/// Storage shape of an object; `metadata` is still encoded.
#[derive(FromRow)]
struct ObjectRow {
    id: Uuid,
    version: i64,
    bucket_id: Uuid,
    name: String,
    content_type: String,
    size: i64,
    metadata: String,
    upload_status: UploadStatus,
    last_accessed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
}

impl TryFrom<ObjectRow> for Object {
    type Error = sqlx::Error;

    fn try_from(row: ObjectRow) -> Result<Self, Self::Error> {
        let metadata = metadata::decode(&row.metadata).map_err(|err| sqlx::Error::ColumnDecode {
            index: "metadata".into(),
            source: Box::new(err),
        })?;
        Ok(Object {
            id: row.id,
            version: row.version,
            bucket_id: row.bucket_id,
            name: row.name,
            content_type: row.content_type,
            size: row.size,
            metadata,
            upload_status: row.upload_status,
            last_accessed_at: row.last_accessed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

pub async fn insert<'e, E: SqliteExecutor<'e>>(exec: E, object: &Object) -> sqlx::Result<()> {
    let encoded = metadata::encode(&object.metadata).map_err(|err| sqlx::Error::Encode(Box::new(err)))?;
    sqlx::query(
        "INSERT INTO objects (id, version, bucket_id, name, content_type, size, metadata,
                              upload_status, last_accessed_at, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(object.id)
    .bind(object.version)
    .bind(object.bucket_id)
    .bind(&object.name)
    .bind(&object.content_type)
    .bind(object.size)
    .bind(encoded)
    .bind(object.upload_status)
    .bind(object.last_accessed_at)
    .bind(object.created_at)
    .bind(object.updated_at)
    .execute(exec)
    .await?;
    Ok(())
}

pub async fn get_by_id<'e, E: SqliteExecutor<'e>>(exec: E, id: Uuid) -> sqlx::Result<Object> {
    let row = sqlx::query_as::<_, ObjectRow>(&format!(
        "SELECT {OBJECT_COLUMNS} FROM objects WHERE id = ?"
    ))
    .bind(id)
    .fetch_one(exec)
    .await?;
    Object::try_from(row)
}

pub async fn get_by_bucket_and_name<'e, E: SqliteExecutor<'e>>(
    exec: E,
    bucket_id: Uuid,
    name: &str,
) -> sqlx::Result<Object> {
    let row = sqlx::query_as::<_, ObjectRow>(&format!(
        "SELECT {OBJECT_COLUMNS} FROM objects WHERE bucket_id = ? AND name = ?"
    ))
    .bind(bucket_id)
    .bind(name)
    .fetch_one(exec)
    .await?;
    Object::try_from(row)
}

/// Move an object out of `from`. Returns `false` if the row is no longer at
/// `version` or no longer in `from`.
pub async fn update_upload_status<'e, E: SqliteExecutor<'e>>(
    exec: E,
    id: Uuid,
    version: i64,
    from: UploadStatus,
    to: UploadStatus,
    now: DateTime<Utc>,
) -> sqlx::Result<bool> {
    let result = sqlx::query(
        "UPDATE objects SET upload_status = ?, version = version + 1, updated_at = ?
         WHERE id = ? AND version = ? AND upload_status = ?",
    )
    .bind(to)
    .bind(now)
    .bind(id)
    .bind(version)
    .bind(from)
    .execute(exec)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn touch_last_accessed<'e, E: SqliteExecutor<'e>>(
    exec: E,
    id: Uuid,
    version: i64,
    now: DateTime<Utc>,
) -> sqlx::Result<bool> {
    let result = sqlx::query(
        "UPDATE objects SET last_accessed_at = ?, version = version + 1, updated_at = ?
         WHERE id = ? AND version = ?",
    )
    .bind(now)
    .bind(now)
    .bind(id)
    .bind(version)
    .execute(exec)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn delete<'e, E: SqliteExecutor<'e>>(exec: E, id: Uuid, version: i64) -> sqlx::Result<bool> {
    let result = sqlx::query("DELETE FROM objects WHERE id = ? AND version = ?")
        .bind(id)
        .bind(version)
        .execute(exec)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// Objects whose name starts with `prefix` and that sit fewer than `level`
/// `/` separators below it, ordered by name.
pub async fn search_by_path<'e, E: SqliteExecutor<'e>>(
    exec: E,
    bucket_id: Uuid,
    prefix: &str,
    level: i64,
    limit: i64,
    offset: i64,
) -> sqlx::Result<Vec<Object>> {
    let rows = sqlx::query_as::<_, ObjectRow>(&format!(
        "SELECT {OBJECT_COLUMNS} FROM objects
         WHERE bucket_id = ?1
           AND substr(name, 1, length(?2)) = ?2
           AND length(substr(name, length(?2) + 1))
               - length(replace(substr(name, length(?2) + 1), '/', '')) < ?3
         ORDER BY name ASC
         LIMIT ?4 OFFSET ?5"
    ))
    .bind(bucket_id)
    .bind(prefix)
    .bind(level)
    .bind(limit)
    .bind(offset)
    .fetch_all(exec)
    .await?;
    rows.into_iter().map(Object::try_from).collect()
}
