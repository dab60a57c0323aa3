//! Represents an object (blob reference) tracked within a bucket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::metadata::Metadata;

/// Content type recorded when the caller does not supply one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Upload lifecycle of an object.
///
/// Objects start `Pending`; the only legal transitions are
/// `Pending -> Completed` and `Pending -> Failed`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Completed,
    Failed,
}

impl UploadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Completed => "completed",
            UploadStatus::Failed => "failed",
        }
    }

    /// Whether no further transition is permitted.
    pub fn is_terminal(self) -> bool {
        !matches!(self, UploadStatus::Pending)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: UploadStatus) -> bool {
        self == UploadStatus::Pending && next.is_terminal()
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata about a single object. The bytes live in the blob store.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Object {
    pub id: Uuid,

    /// Optimistic-concurrency counter, bumped on every update.
    pub version: i64,

    /// Owning bucket.
    pub bucket_id: Uuid,

    /// Path-like name, unique within the bucket.
    pub name: String,

    pub content_type: String,

    /// Declared size in bytes. Always positive.
    pub size: i64,

    pub metadata: Metadata,

    pub upload_status: UploadStatus,

    /// Touched whenever a download grant is issued.
    pub last_accessed_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Result of issuing an upload grant.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PresignedUpload {
    /// Id of the newly created `pending` object.
    pub id: Uuid,
    pub url: String,
    pub method: String,
    pub expires_at: DateTime<Utc>,
}

/// Result of issuing a download grant.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PresignedDownload {
    pub url: String,
    pub method: String,
    pub expires_at: DateTime<Utc>,
}
