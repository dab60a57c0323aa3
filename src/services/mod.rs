//! Control-plane services: bucket policy, object lifecycle, reconciliation
//! and the outbox worker that drives it.

pub mod bucket_service;
pub mod object_service;
pub mod reconciler;
pub mod task_worker;
pub mod validation;

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::errors::{ServiceError, ServiceResult};

/// The instant `delay` from now.
pub(crate) fn after(delay: Duration, op: &'static str) -> ServiceResult<DateTime<Utc>> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| Utc::now().checked_add_signed(delay))
        .ok_or_else(|| ServiceError::unknown(op, "scheduled time out of range", "delay overflow"))
}
