//! PUT、DELETE 与 MKCOL。

use axum::body::Body;
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use tracing::{debug, info, warn};

use super::{DavHandler, VirtualPath, header_value, is_darwin, read_xml_body};
use crate::drive::ObjectMetadata;
use crate::error::DavError;
use crate::etag::{check_preconditions, etag_for};
use crate::resolver::ResolveError;
use crate::upload::UploadRequest;

impl DavHandler {
    pub(super) async fn handle_put(
        &self,
        parts: &Parts,
        path: &VirtualPath,
        body: Body,
    ) -> Result<Response, DavError> {
        // Finder 的 AppleDouble 伴生文件（含 `._` 目录下的文件）直接确认，不上传。
        if is_darwin(parts) && path.segments().any(|segment| segment.starts_with("._")) {
            debug!(path = %path, "appledouble file skipped");
            return Ok(StatusCode::OK.into_response());
        }
        if path.is_root() {
            return Err(DavError::MethodNotAllowed);
        }
        let guard = self.confirm_locks(parts, Some(path), None).await?;
        let result = self.put(parts, path, body).await;
        guard.release();
        result
    }

    async fn put(
        &self,
        parts: &Parts,
        path: &VirtualPath,
        body: Body,
    ) -> Result<Response, DavError> {
        let size = parts
            .headers
            .get(header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .ok_or(DavError::LengthRequired)?;
        let Some(_in_flight) = self.uploads.begin(path) else {
            warn!(path = %path, "upload already in progress, acknowledging duplicate");
            return Ok(StatusCode::CREATED.into_response());
        };

        let parent = self.existing_parent(path).await?;
        let existing = self.lookup(path).await?;
        if existing.as_ref().is_some_and(ObjectMetadata::is_folder) {
            return Err(DavError::MethodNotAllowed);
        }
        let current_etag = existing.as_ref().map(etag_for);
        check_preconditions(&parts.headers, current_etag.as_deref(), existing.is_some())?;

        let credentials = self.credentials.snapshot();
        let meta = self
            .uploads
            .upload(
                UploadRequest {
                    path,
                    parent_id: &parent.id,
                    size,
                    access_token: &credentials.access_token,
                },
                body,
            )
            .await?;
        info!(path = %path, id = meta.id, size, "upload finished");

        let mut headers = HeaderMap::new();
        headers.insert(header::ETAG, header_value(&etag_for(&meta))?);
        Ok((StatusCode::CREATED, headers).into_response())
    }

    pub(super) async fn handle_delete(
        &self,
        parts: &Parts,
        path: &VirtualPath,
    ) -> Result<Response, DavError> {
        if path.is_root() {
            return Err(DavError::Forbidden);
        }
        let guard = self.confirm_locks(parts, Some(path), None).await?;
        let result = self.delete(path).await;
        guard.release();
        result
    }

    async fn delete(&self, path: &VirtualPath) -> Result<Response, DavError> {
        let meta = self.locate_for_delete(path).await?;
        self.resolver.drive().trash(&meta.id).await?;
        self.resolver.cache().invalidate_tree(path);
        self.props.remove_tree(path);
        self.locks.remove_tree(path);
        info!(path = %path, id = meta.id, "moved to trash");
        Ok(StatusCode::NO_CONTENT.into_response())
    }

    /// The cached answer is only trusted when its name and parent still
    /// agree with the path; otherwise the tree is walked again from the root.
    async fn locate_for_delete(&self, path: &VirtualPath) -> Result<ObjectMetadata, DavError> {
        let meta = self.resolver.resolve(path).await?;
        let parent_disagrees = path
            .parent()
            .and_then(|parent| self.resolver.cache().get_id(&parent))
            .is_some_and(|parent_id| parent_id != meta.parent_id);
        if meta.name == path.name() && !parent_disagrees {
            return Ok(meta);
        }
        warn!(path = %path, id = meta.id, name = meta.name, "cached object disagrees with path, walking from root");
        self.resolver.cache().invalidate(path);
        Ok(self.resolver.walk_from_root(path).await?)
    }

    pub(super) async fn handle_mkcol(
        &self,
        parts: &Parts,
        path: &VirtualPath,
        body: Body,
    ) -> Result<Response, DavError> {
        if !read_xml_body(body).await?.is_empty() {
            return Err(DavError::UnsupportedMediaType);
        }
        if path.is_root() {
            return Err(DavError::MethodNotAllowed);
        }
        let guard = self.confirm_locks(parts, Some(path), None).await?;
        let result = self.mkcol(path).await;
        guard.release();
        result
    }

    async fn mkcol(&self, path: &VirtualPath) -> Result<Response, DavError> {
        let parent = self.existing_parent(path).await?;
        let parent_path = path.parent().unwrap_or_default();
        let siblings = self.resolver.list(&parent, &parent_path).await?;
        if siblings.iter().any(|child| child.name == path.name()) {
            return Err(DavError::Conflict);
        }

        let folder = self
            .resolver
            .drive()
            .create_folder(&parent.id, path.name())
            .await?;
        let cache = self.resolver.cache();
        cache.drop_object(&parent.id);
        cache.set_id(path, &folder.id);
        cache.set_object(&folder);
        cache.append_child(&parent.id, &folder);
        info!(path = %path, id = folder.id, "folder created");
        Ok(StatusCode::CREATED.into_response())
    }

    /// 目标的父目录；不存在或不是目录时返回 409。
    pub(super) async fn existing_parent(
        &self,
        path: &VirtualPath,
    ) -> Result<ObjectMetadata, DavError> {
        let parent_path = path.parent().ok_or(DavError::Forbidden)?;
        match self.resolver.resolve(&parent_path).await {
            Ok(parent) if parent.is_folder() => Ok(parent),
            Ok(_) | Err(ResolveError::NotFound(_)) => Err(DavError::Conflict),
            Err(err) => Err(err.into()),
        }
    }

    /// 路径不存在时返回 `None`，其余错误照常传播。
    pub(super) async fn lookup(
        &self,
        path: &VirtualPath,
    ) -> Result<Option<ObjectMetadata>, DavError> {
        match self.resolver.resolve(path).await {
            Ok(meta) => Ok(Some(meta)),
            Err(ResolveError::NotFound(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}
