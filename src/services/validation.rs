//! Input validation shared by the bucket and object services.
//!
//! Every check here runs before any collaborator is called and fails with
//! [`ServiceError::InvalidInput`].

use std::time::Duration;

use crate::{
    errors::{ServiceError, ServiceResult},
    models::bucket::WILDCARD_CONTENT_TYPE,
};

const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;
const MAX_OBJECT_NAME_LEN: usize = 1024;
const MAX_MIME_TOKEN_LEN: usize = 127;
/// Longest grant a caller may request: seven days.
pub const MAX_EXPIRES_IN_SECS: i64 = 7 * 24 * 60 * 60;

/// Reject empty or whitespace-only values.
pub fn ensure_not_blank(value: &str, field: &str) -> ServiceResult<()> {
    if value.trim().is_empty() {
        return Err(ServiceError::InvalidInput(format!(
            "{field} cannot be empty"
        )));
    }
    Ok(())
}

/// Validate bucket name format.
///
/// - 3–63 characters
/// - ASCII letters, digits, dots, hyphens only
/// - must start and end with a letter or digit
pub fn validate_bucket_name(name: &str) -> ServiceResult<()> {
    ensure_not_blank(name, "bucket name")?;

    let invalid = |reason: &str| {
        Err(ServiceError::InvalidInput(format!(
            "bucket name '{name}' is not valid: {reason}"
        )))
    };

    if name.trim() != name {
        return invalid("cannot begin or end with whitespace");
    }

    let len = name.len();
    if !(BUCKET_NAME_MIN_LEN..=BUCKET_NAME_MAX_LEN).contains(&len) {
        return invalid("must be between 3 and 63 characters");
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-'))
    {
        return invalid("allowed characters are letters, digits, dots, and hyphens");
    }

    let first_last_ok = name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
        && name.chars().last().is_some_and(|c| c.is_ascii_alphanumeric());
    if !first_last_ok {
        return invalid("must start and end with a letter or digit");
    }

    Ok(())
}

/// Validate an object name: a relative, slash-delimited path.
pub fn validate_object_name(name: &str) -> ServiceResult<()> {
    ensure_not_blank(name, "object name")?;
    if name.len() > MAX_OBJECT_NAME_LEN {
        return Err(ServiceError::InvalidInput(format!(
            "object name cannot exceed {MAX_OBJECT_NAME_LEN} bytes"
        )));
    }
    if name.starts_with('/')
        || name
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(ServiceError::InvalidInput(format!(
            "object name '{name}' must be a relative path without empty, '.' or '..' segments"
        )));
    }
    if name.chars().any(|c| c.is_control() || c == '\\') {
        return Err(ServiceError::InvalidInput(
            "object name cannot contain control characters or backslashes".into(),
        ));
    }
    Ok(())
}

fn is_mime_token(token: &str) -> bool {
    let mut chars = token.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    token.len() <= MAX_MIME_TOKEN_LEN
        && first.is_ascii_alphanumeric()
        && chars.all(|c| {
            c.is_ascii_alphanumeric() || matches!(c, '!' | '#' | '$' | '&' | '-' | '^' | '_' | '.' | '+')
        })
}

/// Whether `pattern` is `type/subtype`, where either half may be `*`.
pub fn is_content_type_pattern(pattern: &str) -> bool {
    let Some((kind, subtype)) = pattern.split_once('/') else {
        return false;
    };
    let half = |h: &str| h == "*" || is_mime_token(h);
    half(kind) && half(subtype)
}

/// Whether `content_type` is a concrete `type/subtype`, optionally followed
/// by `;` parameters.
pub fn is_concrete_content_type(content_type: &str) -> bool {
    let essence = content_type.split(';').next().unwrap_or_default().trim();
    match essence.split_once('/') {
        Some((kind, subtype)) => is_mime_token(kind) && is_mime_token(subtype),
        None => false,
    }
}

/// Validate a non-empty list of content type patterns.
pub fn validate_content_type_patterns(types: &[String]) -> ServiceResult<()> {
    if types.is_empty() {
        return Err(ServiceError::InvalidInput(
            "content types cannot be empty".into(),
        ));
    }
    if let Some(bad) = types.iter().find(|t| !is_content_type_pattern(t)) {
        return Err(ServiceError::InvalidInput(format!(
            "invalid content type '{bad}'"
        )));
    }
    Ok(())
}

/// Validate the allowed content types of a new bucket.
pub fn validate_allowed_content_types(types: &[String]) -> ServiceResult<()> {
    validate_content_type_patterns(types)?;
    if types.len() > 1 && types.iter().any(|t| t == WILDCARD_CONTENT_TYPE) {
        return Err(ServiceError::InvalidInput(format!(
            "wildcard '{WILDCARD_CONTENT_TYPE}' cannot be combined with other content types"
        )));
    }
    Ok(())
}

/// Validate the content type of an object about to be uploaded.
pub fn validate_object_content_type(content_type: &str) -> ServiceResult<()> {
    if !is_concrete_content_type(content_type) {
        return Err(ServiceError::InvalidInput(format!(
            "invalid content type '{content_type}'"
        )));
    }
    Ok(())
}

pub fn validate_max_allowed_object_size(max: Option<i64>) -> ServiceResult<()> {
    match max {
        Some(max) if max <= 0 => Err(ServiceError::InvalidInput(
            "max allowed object size must be greater than 0".into(),
        )),
        _ => Ok(()),
    }
}

pub fn validate_content_size(size: i64) -> ServiceResult<()> {
    if size <= 0 {
        return Err(ServiceError::InvalidInput(
            "content size must be greater than 0".into(),
        ));
    }
    Ok(())
}

/// Resolve a caller-supplied grant lifetime in seconds.
pub fn resolve_expires_in(expires_in: Option<i64>, default: Duration) -> ServiceResult<Duration> {
    match expires_in {
        None => Ok(default),
        Some(secs) if secs > MAX_EXPIRES_IN_SECS => Err(ServiceError::InvalidInput(format!(
            "expires in cannot exceed {MAX_EXPIRES_IN_SECS} seconds"
        ))),
        Some(secs) if secs > 0 => Ok(Duration::from_secs(secs.unsigned_abs())),
        Some(_) => Err(ServiceError::InvalidInput(
            "expires in must be greater than 0".into(),
        )),
    }
}

/// Reject negative pagination/depth parameters.
pub fn ensure_non_negative(value: Option<i64>, field: &str) -> ServiceResult<()> {
    if value.is_some_and(|v| v < 0) {
        return Err(ServiceError::InvalidInput(format!(
            "{field} cannot be less than 0"
        )));
    }
    Ok(())
}
