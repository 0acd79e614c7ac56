//! WebDAV 协议分发：按方法把请求交给各处理函数。

mod copymove;
pub mod headers;
mod lock;
mod path;
pub mod props;
mod propfind;
mod read;
#[cfg(test)]
mod testing;
pub mod walk;
mod write;
pub mod xml;

pub use path::VirtualPath;

use axum::body::{Body, Bytes};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode, header};
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::MAX_XML_BODY;
use crate::credentials::CredentialStore;
use crate::drive::TokenRefresher;
use crate::error::DavError;
use crate::locks::{LockDetails, LockError, LockGuard, LockTable};
use crate::resolver::PathResolver;
use crate::upload::UploadEngine;
use headers::{Destination, InvalidHeader, parse_if, split_resource_tag};
use props::PropertyStore;

const XML_CONTENT_TYPE: &str = "application/xml; charset=utf-8";

/// Dispatcher settings taken from the command line.
#[derive(Clone, Debug, Default)]
pub struct DavConfig {
    /// URL prefix stripped from every request path.
    pub prefix: String,
    /// Serve GET on a folder as a `Depth: 1` listing.
    pub browse_dirs: bool,
}

pub struct DavHandler {
    config: DavConfig,
    resolver: PathResolver,
    uploads: UploadEngine,
    locks: Arc<LockTable>,
    props: PropertyStore,
    credentials: Arc<CredentialStore>,
    refresher: Arc<dyn TokenRefresher>,
}

impl DavHandler {
    pub fn new(
        config: DavConfig,
        resolver: PathResolver,
        uploads: UploadEngine,
        locks: Arc<LockTable>,
        credentials: Arc<CredentialStore>,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Self {
        Self {
            config,
            resolver,
            uploads,
            locks,
            props: PropertyStore::new(),
            credentials,
            refresher,
        }
    }

    /// 处理一个 WebDAV 请求；任何失败都转成带状态短语的响应。
    pub async fn handle(&self, request: Request<Body>) -> Response {
        if let Err(err) = self.credentials.ensure_fresh(self.refresher.as_ref()).await {
            warn!(error = %err, "access token refresh before dispatch failed");
        }

        let (parts, body) = request.into_parts();
        let Some(path) = VirtualPath::from_uri_path(parts.uri.path(), &self.config.prefix) else {
            return DavError::NotFound.into_response();
        };
        debug!(method = %parts.method, path = %path, "dispatch");

        let result = match parts.method.as_str() {
            "OPTIONS" => self.handle_options(&path).await,
            "GET" | "HEAD" | "POST" => self.handle_get(&parts, &path).await,
            "PUT" => self.handle_put(&parts, &path, body).await,
            "DELETE" => self.handle_delete(&parts, &path).await,
            "MKCOL" => self.handle_mkcol(&parts, &path, body).await,
            "COPY" | "MOVE" => self.handle_copy_move(&parts, &path).await,
            "LOCK" => self.handle_lock(&parts, &path, body).await,
            "UNLOCK" => self.handle_unlock(&parts, &path).await,
            "PROPFIND" => self.handle_propfind(&parts, &path, body).await,
            "PROPPATCH" => self.handle_proppatch(&parts, &path, body).await,
            _ => Err(DavError::MethodNotAllowed),
        };
        result.unwrap_or_else(IntoResponse::into_response)
    }

    /// Takes the locks a mutating request needs on `src` and `dst`.
    ///
    /// Without an `If` header, temporary zero-depth locks are created so a
    /// concurrent lock holder makes the request fail with 423. With one, the
    /// first condition list whose tag matches this host and whose tokens
    /// cover both paths is held until the guard is released.
    async fn confirm_locks(
        &self,
        parts: &Parts,
        src: Option<&VirtualPath>,
        dst: Option<&VirtualPath>,
    ) -> Result<LockGuard, DavError> {
        let Some(raw) = parts.headers.get("if") else {
            let mut tokens = Vec::new();
            for path in [src, dst].into_iter().flatten() {
                let details = LockDetails {
                    root: path.clone(),
                    duration: None,
                    owner_xml: String::new(),
                    zero_depth: true,
                };
                match self.locks.create(details) {
                    Ok(token) => tokens.push(token),
                    Err(err) => {
                        self.locks.remove(&tokens);
                        return Err(err.into());
                    }
                }
            }
            return Ok(LockGuard::temporary(self.locks.clone(), tokens));
        };

        let raw = raw.to_str().map_err(|_| InvalidHeader("If"))?;
        let lists = parse_if(raw).ok_or(InvalidHeader("If"))?;
        let host = request_host(parts);
        for list in &lists {
            let tagged;
            let list_src = match &list.resource_tag {
                None => src,
                Some(tag) => {
                    let Some(Destination::Path(tag_path)) = split_resource_tag(tag, host) else {
                        continue;
                    };
                    tagged = VirtualPath::from_uri_path(&tag_path, &self.config.prefix)
                        .ok_or(DavError::BadRequest)?;
                    Some(&tagged)
                }
            };
            match self.locks.confirm(list_src, dst, &list.conditions) {
                Ok(tokens) => return Ok(LockGuard::held(self.locks.clone(), tokens)),
                Err(LockError::ConfirmationFailed) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        debug!(path = ?src.or(dst).map(ToString::to_string), "no If condition list confirmed");
        Err(DavError::PreconditionFailed)
    }

    fn href(&self, path: &VirtualPath, is_folder: bool) -> String {
        path.href(&self.config.prefix, is_folder)
    }
}

/// `Host` of the request, falling back to the URI authority.
fn request_host(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| parts.uri.authority().map(|authority| authority.as_str()))
}

fn is_darwin(parts: &Parts) -> bool {
    parts
        .headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|agent| agent.contains("Darwin"))
}

fn header_value(value: &str) -> Result<HeaderValue, DavError> {
    HeaderValue::from_str(value).map_err(|_| DavError::Internal("响应头构建失败".into()))
}

/// 207 响应，正文为已拼好的 multistatus 文档。
fn multi_status(xml: String) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(XML_CONTENT_TYPE));
    (StatusCode::MULTI_STATUS, headers, xml).into_response()
}

/// 读取 XML 请求体，超过上限按格式错误处理。
async fn read_xml_body(body: Body) -> Result<Bytes, DavError> {
    axum::body::to_bytes(body, MAX_XML_BODY)
        .await
        .map_err(|err| {
            warn!(error = %err, "failed to read request body");
            DavError::BadRequest
        })
}
