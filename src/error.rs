//! 统一的 WebDAV 错误类型与转换。

use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use tracing::{error, warn};

use crate::dav::headers::InvalidHeader;
use crate::dav::xml::XmlError;
use crate::drive::DriveError;
use crate::locks::LockError;
use crate::resolver::ResolveError;
use crate::upload::UploadError;

#[derive(Debug)]
pub enum DavError {
    BadRequest,
    NotFound,
    Conflict,
    PreconditionFailed,
    Locked,
    Forbidden,
    MethodNotAllowed,
    UnsupportedMediaType,
    LengthRequired,
    BadGateway,
    NotImplemented,
    Internal(String),
    Unauthorized(HeaderMap),
    TooManyRequests(u64),
}

impl DavError {
    pub fn status(&self) -> StatusCode {
        match self {
            DavError::BadRequest => StatusCode::BAD_REQUEST,
            DavError::NotFound => StatusCode::NOT_FOUND,
            DavError::Conflict => StatusCode::CONFLICT,
            DavError::PreconditionFailed => StatusCode::PRECONDITION_FAILED,
            DavError::Locked => StatusCode::LOCKED,
            DavError::Forbidden => StatusCode::FORBIDDEN,
            DavError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            DavError::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            DavError::LengthRequired => StatusCode::LENGTH_REQUIRED,
            DavError::BadGateway => StatusCode::BAD_GATEWAY,
            DavError::NotImplemented => StatusCode::NOT_IMPLEMENTED,
            DavError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            DavError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            DavError::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
        }
    }
}

/// 响应体为状态码的标准短语。
impl IntoResponse for DavError {
    fn into_response(self) -> Response {
        let status = self.status();
        let text = status.canonical_reason().unwrap_or_default();
        match self {
            DavError::Internal(msg) => {
                error!(error = %msg, "request failed");
                (status, text).into_response()
            }
            DavError::Unauthorized(headers) => (status, headers, text).into_response(),
            DavError::TooManyRequests(retry_after) => {
                let mut headers = HeaderMap::new();
                if retry_after > 0
                    && let Ok(value) = HeaderValue::from_str(&retry_after.to_string())
                {
                    headers.insert(header::RETRY_AFTER, value);
                }
                (status, headers, text).into_response()
            }
            _ => (status, text).into_response(),
        }
    }
}

impl From<DriveError> for DavError {
    fn from(err: DriveError) -> Self {
        match err {
            DriveError::NotFound => DavError::NotFound,
            DriveError::Status { status: 409, .. } => DavError::Conflict,
            other => DavError::Internal(other.to_string()),
        }
    }
}

impl From<ResolveError> for DavError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::NotFound(_) => DavError::NotFound,
            ResolveError::Drive(err) => err.into(),
        }
    }
}

impl From<LockError> for DavError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Locked => DavError::Locked,
            LockError::NoSuchLock | LockError::ConfirmationFailed => DavError::PreconditionFailed,
            LockError::Forbidden => DavError::Forbidden,
        }
    }
}

/// 上传失败一律视为 400，目标资源保持不存在。
impl From<UploadError> for DavError {
    fn from(err: UploadError) -> Self {
        warn!(error = %err, "upload failed");
        DavError::BadRequest
    }
}

impl From<InvalidHeader> for DavError {
    fn from(err: InvalidHeader) -> Self {
        warn!(header = err.0, "malformed header");
        DavError::BadRequest
    }
}

impl From<XmlError> for DavError {
    fn from(_: XmlError) -> Self {
        DavError::BadRequest
    }
}
