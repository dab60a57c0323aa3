//! Payloads stored in the reconciliation task outbox.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Work item executed by the task worker once its due time is reached.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskPayload {
    /// Resolve a `pending` upload once its grant has expired.
    UploadExpiry {
        bucket_name: String,
        object_name: String,
        object_id: Uuid,
    },
    /// Finish or confirm a two-phase object delete.
    DeletionCheck {
        bucket_name: String,
        object_name: String,
        object_id: Uuid,
    },
}

impl TaskPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            TaskPayload::UploadExpiry { .. } => "upload_expiry",
            TaskPayload::DeletionCheck { .. } => "deletion_check",
        }
    }

    pub fn object_id(&self) -> Uuid {
        match self {
            TaskPayload::UploadExpiry { object_id, .. }
            | TaskPayload::DeletionCheck { object_id, .. } => *object_id,
        }
    }
}

/// Outbox row as stored in the `tasks` table.
#[derive(Clone, FromRow, Debug)]
pub struct TaskRecord {
    pub id: Uuid,
    pub kind: String,
    pub payload: String,
    /// Due time, unix milliseconds.
    pub run_at: i64,
    pub attempts: i64,
    pub state: String,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn decode_payload(&self) -> serde_json::Result<TaskPayload> {
        serde_json::from_str(&self.payload)
    }
}
