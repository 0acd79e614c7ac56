//! ETag 计算与条件请求校验。

use axum::http::{HeaderMap, header};

use crate::drive::ObjectMetadata;
use crate::error::DavError;

/// 有内容哈希时直接使用，否则由修改时间和大小拼出强 ETag。
pub fn etag_for(meta: &ObjectMetadata) -> String {
    if let Some(hash) = meta.content_hash() {
        return format!("\"{hash}\"");
    }
    let modified = meta
        .updated_at
        .or(meta.created_at)
        .and_then(|at| at.timestamp_nanos_opt())
        .unwrap_or_default();
    format!("\"{:x}{:x}\"", modified, meta.size)
}

/// 校验 If-Match / If-None-Match 条件。
pub fn check_preconditions(
    headers: &HeaderMap,
    current_etag: Option<&str>,
    exists: bool,
) -> Result<(), DavError> {
    if let Some(value) = headers.get(header::IF_MATCH).and_then(|v| v.to_str().ok()) {
        if value.trim() == "*" {
            if !exists {
                return Err(DavError::PreconditionFailed);
            }
        } else if !etag_matches(value, current_etag) {
            return Err(DavError::PreconditionFailed);
        }
    }

    if let Some(value) = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
    {
        if value.trim() == "*" {
            if exists {
                return Err(DavError::PreconditionFailed);
            }
        } else if etag_matches(value, current_etag) {
            return Err(DavError::PreconditionFailed);
        }
    }

    Ok(())
}

fn etag_matches(header_value: &str, current: Option<&str>) -> bool {
    let Some(current) = current else {
        return false;
    };
    header_value
        .split(',')
        .map(|item| item.trim().trim_start_matches("W/"))
        .any(|item| item == current)
}
