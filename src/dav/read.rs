//! OPTIONS 与 GET/HEAD/POST：能力声明和下载代理。

use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use tracing::{debug, info};

use super::headers::{Depth, parse_depth};
use super::xml::PropfindRequest;
use super::{DavHandler, VirtualPath, header_value};
use crate::drive::ObjectMetadata;
use crate::error::DavError;
use crate::etag::etag_for;
use crate::resolver::ResolveError;

const ABSENT_ALLOW: &str = "OPTIONS, LOCK, PUT, MKCOL";
const FOLDER_ALLOW: &str = "OPTIONS, LOCK, DELETE, PROPPATCH, COPY, MOVE, UNLOCK, PROPFIND";
const FILE_ALLOW: &str =
    "OPTIONS, LOCK, GET, HEAD, POST, DELETE, PROPPATCH, COPY, MOVE, UNLOCK, PROPFIND, PUT";

/// 被代理的上游响应头。
const FORWARDED: [header::HeaderName; 4] = [
    header::CONTENT_LENGTH,
    header::CONTENT_RANGE,
    header::ACCEPT_RANGES,
    header::LAST_MODIFIED,
];

/// Rewrites `bytes=a-b` to `bytes=a-` when `b` runs past the end of the file.
pub(super) fn clamp_range(raw: &str, size: u64) -> String {
    if let Some(spec) = raw.strip_prefix("bytes=")
        && let Some((start, end)) = spec.split_once('-')
        && let Ok(end) = end.trim().parse::<u64>()
        && end >= size
    {
        return format!("bytes={}-", start.trim());
    }
    raw.to_string()
}

fn content_type(meta: &ObjectMetadata) -> Result<HeaderValue, DavError> {
    header_value(
        mime_guess::from_path(&meta.name)
            .first_or_octet_stream()
            .essence_str(),
    )
}

impl DavHandler {
    pub(super) async fn handle_options(&self, path: &VirtualPath) -> Result<Response, DavError> {
        let allow = match self.resolver.resolve(path).await {
            Ok(meta) if meta.is_folder() => FOLDER_ALLOW,
            Ok(_) => FILE_ALLOW,
            Err(ResolveError::NotFound(_)) => ABSENT_ALLOW,
            Err(err) => {
                debug!(path = %path, error = %err, "options lookup failed, reporting absent");
                ABSENT_ALLOW
            }
        };
        let mut headers = HeaderMap::new();
        headers.insert(header::ALLOW, HeaderValue::from_static(allow));
        headers.insert("dav", HeaderValue::from_static("1, 2"));
        headers.insert("ms-author-via", HeaderValue::from_static("DAV"));
        Ok((StatusCode::OK, headers).into_response())
    }

    pub(super) async fn handle_get(
        &self,
        parts: &Parts,
        path: &VirtualPath,
    ) -> Result<Response, DavError> {
        let meta = self.resolver.resolve(path).await?;
        if meta.is_folder() {
            if self.config.browse_dirs && parts.method == Method::GET {
                let depth = parse_depth(&parts.headers, Depth::One)?;
                return self
                    .propfind_response(path, meta, &PropfindRequest::AllProp, depth)
                    .await;
            }
            return Err(DavError::MethodNotAllowed);
        }

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, content_type(&meta)?);
        headers.insert(header::ETAG, header_value(&etag_for(&meta))?);

        if parts.method == Method::HEAD {
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(meta.size));
            headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
            if let Some(at) = meta.updated_at {
                headers.insert(
                    header::LAST_MODIFIED,
                    header_value(&httpdate::fmt_http_date(at.into()))?,
                );
            }
            return Ok((StatusCode::OK, headers).into_response());
        }

        let range = parts
            .headers
            .get(header::RANGE)
            .and_then(|value| value.to_str().ok())
            .map(|raw| clamp_range(raw, meta.size));
        let if_range = parts
            .headers
            .get(header::IF_RANGE)
            .and_then(|value| value.to_str().ok());

        let drive = self.resolver.drive();
        let url = drive.download_url(&meta.id).await?;
        let download = drive.fetch(&url, range.as_deref(), if_range).await?;
        for name in FORWARDED {
            if let Some(value) = download.headers.get(&name) {
                headers.insert(name, value.clone());
            }
        }
        info!(path = %path, status = download.status.as_u16(), range = range.as_deref(), "download proxied");
        Ok((download.status, headers, download.body).into_response())
    }
}
