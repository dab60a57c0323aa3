//! Outbox queries backing the durable delayed-task queue.
//!
//! A task row is claimed by pushing its `run_at` forward by a lease while
//! bumping `attempts`, guarded by the values the worker read. Two workers can
//! therefore never claim the same due row, and a worker that dies mid-task
//! leaves the row to be picked up again once the lease lapses.

use chrono::{DateTime, Utc};
use sqlx::SqliteExecutor;
use uuid::Uuid;

use crate::models::task::{TaskPayload, TaskRecord};

const TASK_COLUMNS: &str = "id, kind, payload, run_at, attempts, state, last_error, created_at";

pub const STATE_SCHEDULED: &str = "scheduled";
pub const STATE_DISCARDED: &str = "discarded";

pub async fn insert<'e, E: SqliteExecutor<'e>>(
    exec: E,
    payload: &TaskPayload,
    run_at: DateTime<Utc>,
) -> sqlx::Result<Uuid> {
    let id = Uuid::new_v4();
    let encoded = serde_json::to_string(payload).map_err(|err| sqlx::Error::Encode(Box::new(err)))?;
    sqlx::query(
        "INSERT INTO tasks (id, kind, payload, run_at, attempts, state, created_at)
         VALUES (?, ?, ?, ?, 0, ?, ?)",
    )
    .bind(id)
    .bind(payload.kind())
    .bind(encoded)
    .bind(run_at.timestamp_millis())
    .bind(STATE_SCHEDULED)
    .bind(Utc::now())
    .execute(exec)
    .await?;
    Ok(id)
}

/// Scheduled tasks due at or before `now`, oldest first.
pub async fn due<'e, E: SqliteExecutor<'e>>(
    exec: E,
    now: DateTime<Utc>,
    limit: i64,
) -> sqlx::Result<Vec<TaskRecord>> {
    sqlx::query_as::<_, TaskRecord>(&format!(
        "SELECT {TASK_COLUMNS} FROM tasks
         WHERE state = ? AND run_at <= ?
         ORDER BY run_at ASC
         LIMIT ?"
    ))
    .bind(STATE_SCHEDULED)
    .bind(now.timestamp_millis())
    .bind(limit)
    .fetch_all(exec)
    .await
}

/// Claim `task` until `lease_until`. Returns `false` if another worker got
/// there first.
pub async fn lease<'e, E: SqliteExecutor<'e>>(
    exec: E,
    task: &TaskRecord,
    lease_until: DateTime<Utc>,
) -> sqlx::Result<bool> {
    let result = sqlx::query(
        "UPDATE tasks SET run_at = ?, attempts = attempts + 1
         WHERE id = ? AND run_at = ? AND attempts = ? AND state = ?",
    )
    .bind(lease_until.timestamp_millis())
    .bind(task.id)
    .bind(task.run_at)
    .bind(task.attempts)
    .bind(STATE_SCHEDULED)
    .execute(exec)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn complete<'e, E: SqliteExecutor<'e>>(exec: E, id: Uuid) -> sqlx::Result<()> {
    sqlx::query("DELETE FROM tasks WHERE id = ?")
        .bind(id)
        .execute(exec)
        .await?;
    Ok(())
}

pub async fn retry_at<'e, E: SqliteExecutor<'e>>(
    exec: E,
    id: Uuid,
    run_at: DateTime<Utc>,
    error: &str,
) -> sqlx::Result<()> {
    sqlx::query("UPDATE tasks SET run_at = ?, last_error = ? WHERE id = ?")
        .bind(run_at.timestamp_millis())
        .bind(error)
        .bind(id)
        .execute(exec)
        .await?;
    Ok(())
}

pub async fn discard<'e, E: SqliteExecutor<'e>>(exec: E, id: Uuid, error: &str) -> sqlx::Result<()> {
    sqlx::query("UPDATE tasks SET state = ?, last_error = ? WHERE id = ?")
        .bind(STATE_DISCARDED)
        .bind(error)
        .bind(id)
        .execute(exec)
        .await?;
    Ok(())
}

pub async fn get<'e, E: SqliteExecutor<'e>>(exec: E, id: Uuid) -> sqlx::Result<TaskRecord> {
    sqlx::query_as::<_, TaskRecord>(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))
        .bind(id)
        .fetch_one(exec)
        .await
}

/// All tasks, scheduled or discarded, that reference `object_id`.
pub async fn for_object<'e, E: SqliteExecutor<'e>>(
    exec: E,
    object_id: Uuid,
) -> sqlx::Result<Vec<TaskRecord>> {
    sqlx::query_as::<_, TaskRecord>(&format!(
        "SELECT {TASK_COLUMNS} FROM tasks
         WHERE json_extract(payload, '$.object_id') = ?
         ORDER BY run_at ASC"
    ))
    .bind(object_id.to_string())
    .fetch_all(exec)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::memory_pool;
    use chrono::Duration;

    fn payload() -> TaskPayload {
        TaskPayload::UploadExpiry {
            bucket_name: "b1".into(),
            object_name: "a/b.png".into(),
            object_id: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn only_due_tasks_are_returned() {
        let pool = memory_pool().await;
        let now = Utc::now();
        let due_id = insert(&pool, &payload(), now - Duration::seconds(1)).await.unwrap();
        insert(&pool, &payload(), now + Duration::hours(1)).await.unwrap();

        let found = due(&pool, now, 10).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, due_id);
    }

    #[tokio::test]
    async fn lease_is_single_winner() {
        let pool = memory_pool().await;
        let now = Utc::now();
        insert(&pool, &payload(), now).await.unwrap();
        let task = due(&pool, now, 1).await.unwrap().remove(0);

        assert!(lease(&pool, &task, now + Duration::seconds(30)).await.unwrap());
        assert!(!lease(&pool, &task, now + Duration::seconds(30)).await.unwrap());

        let leased = get(&pool, task.id).await.unwrap();
        assert_eq!(leased.attempts, 1);
        assert!(due(&pool, now, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn discarded_tasks_are_never_due() {
        let pool = memory_pool().await;
        let now = Utc::now();
        let id = insert(&pool, &payload(), now).await.unwrap();
        discard(&pool, id, "gave up").await.unwrap();

        assert!(due(&pool, now, 10).await.unwrap().is_empty());
        let task = get(&pool, id).await.unwrap();
        assert_eq!(task.state, STATE_DISCARDED);
        assert_eq!(task.last_error.as_deref(), Some("gave up"));
    }

    #[tokio::test]
    async fn tasks_are_found_by_object() {
        let pool = memory_pool().await;
        let payload = payload();
        insert(&pool, &payload, Utc::now()).await.unwrap();
        insert(&pool, &self::payload(), Utc::now()).await.unwrap();

        let found = for_object(&pool, payload.object_id()).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].decode_payload().unwrap(), payload);
    }
}
