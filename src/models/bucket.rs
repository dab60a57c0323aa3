//! Represents a logical bucket: a named, policy-governed container for objects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Content-type pattern that admits every object.
pub const WILDCARD_CONTENT_TYPE: &str = "*/*";

/// A storage bucket and its upload policy.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct Bucket {
    /// Stable identifier.
    pub id: Uuid,

    /// Optimistic-concurrency counter, bumped on every update.
    pub version: i64,

    /// Globally unique bucket name. Immutable after creation.
    pub name: String,

    /// MIME patterns objects must match. `*/*` never coexists with other entries.
    #[sqlx(json)]
    pub allowed_content_types: Vec<String>,

    /// Optional byte ceiling for a single object.
    pub max_allowed_object_size: Option<i64>,

    /// Whether the bucket is publicly readable.
    pub public: bool,

    /// When set, every read and write through the bucket is rejected.
    pub disabled: bool,

    /// When set, every mutating operation is rejected with `lock_reason`.
    pub locked: bool,
    pub lock_reason: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Bucket {
    /// Whether an object of `content_type` may be stored in this bucket.
    ///
    /// `content_type` is expected to be concrete (`type/subtype`); parameters
    /// after `;` are ignored.
    pub fn allows_content_type(&self, content_type: &str) -> bool {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or(content_type)
            .trim();
        self.allowed_content_types
            .iter()
            .any(|pattern| content_type_matches(pattern, essence))
    }

    /// Whether `size` fits under the bucket's object size ceiling.
    pub fn allows_size(&self, size: i64) -> bool {
        self.max_allowed_object_size.is_none_or(|max| size <= max)
    }
}

/// Aggregate usage of a bucket.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct BucketSize {
    pub id: Uuid,
    pub name: String,
    /// Sum of completed object sizes in bytes.
    pub size: i64,
    pub object_count: i64,
}

fn content_type_matches(pattern: &str, content_type: &str) -> bool {
    let Some((pattern_type, pattern_sub)) = pattern.split_once('/') else {
        return false;
    };
    let Some((ct_type, ct_sub)) = content_type.split_once('/') else {
        return false;
    };
    let half = |p: &str, v: &str| p == "*" || p.eq_ignore_ascii_case(v);
    half(pattern_type, ct_type) && half(pattern_sub, ct_sub)
}
