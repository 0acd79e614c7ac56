//! 路径解析：先查身份缓存，未命中时从最深的已缓存祖先逐级列目录。

use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::IdentityCache;
use crate::dav::VirtualPath;
use crate::drive::{DriveApi, DriveError, ObjectMetadata};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no such path: {0}")]
    NotFound(VirtualPath),
    #[error(transparent)]
    Drive(#[from] DriveError),
}

/// Maps virtual paths onto backend object ids.
pub struct PathResolver {
    cache: Arc<IdentityCache>,
    drive: Arc<dyn DriveApi>,
}

impl PathResolver {
    pub fn new(cache: Arc<IdentityCache>, drive: Arc<dyn DriveApi>) -> Self {
        Self { cache, drive }
    }

    pub fn cache(&self) -> &IdentityCache {
        &self.cache
    }

    pub fn drive(&self) -> &Arc<dyn DriveApi> {
        &self.drive
    }

    /// Resolves `path`, populating the cache along the way.
    pub async fn resolve(&self, path: &VirtualPath) -> Result<ObjectMetadata, ResolveError> {
        if path.is_root() {
            return Ok(ObjectMetadata::root());
        }
        if let Some(id) = self.cache.get_id(path) {
            if let Some(meta) = self.cache.get_object(&id) {
                debug!(path = %path, id, "cache hit");
                return Ok(meta);
            }
            match self.drive.get_detail(&id).await {
                Ok(meta) => {
                    self.cache.set_object(&meta);
                    return Ok(meta);
                }
                Err(DriveError::NotFound) => self.cache.invalidate(path),
                Err(err) => return Err(err.into()),
            }
        }
        debug!(path = %path, "cache miss");
        match self.walk(path, true).await {
            // 缓存中的祖先已被外部删除。
            Err(ResolveError::Drive(DriveError::NotFound)) => self.walk(path, false).await,
            other => other,
        }
    }

    /// 忽略已缓存的目录列表，从根目录重新逐级解析。
    pub async fn walk_from_root(&self, path: &VirtualPath) -> Result<ObjectMetadata, ResolveError> {
        if path.is_root() {
            return Ok(ObjectMetadata::root());
        }
        self.walk(path, false).await
    }

    /// Children of `folder`, served from the cached listing when present.
    /// Every child's path and metadata are cached as a side effect.
    pub async fn list(
        &self,
        folder: &ObjectMetadata,
        path: &VirtualPath,
    ) -> Result<Vec<ObjectMetadata>, ResolveError> {
        let children = self.children(&folder.id, true).await?;
        self.remember_siblings(path, &children);
        Ok(children)
    }

    async fn children(
        &self,
        parent_id: &str,
        use_cache: bool,
    ) -> Result<Vec<ObjectMetadata>, ResolveError> {
        if use_cache && let Some(children) = self.cache.get_children(parent_id) {
            return Ok(children);
        }
        let children = self.drive.list_children(parent_id).await?;
        self.cache.set_children(parent_id, children.clone());
        Ok(children)
    }

    /// 缓存同一目录下所有子项；重名时只记录第一个。
    fn remember_siblings(&self, parent: &VirtualPath, children: &[ObjectMetadata]) {
        let mut seen = HashSet::new();
        for child in children {
            if seen.insert(child.name.as_str()) {
                self.cache.set_id(&parent.join(&child.name), &child.id);
            }
            self.cache.set_object(child);
        }
    }

    async fn walk(
        &self,
        path: &VirtualPath,
        use_cache: bool,
    ) -> Result<ObjectMetadata, ResolveError> {
        let segments: Vec<&str> = path.segments().collect();
        let mut start = 0;
        let mut current_id = crate::drive::ROOT_ID.to_string();
        if use_cache {
            for depth in (1..segments.len()).rev() {
                if let Some(id) = self.cache.get_id(&path.prefix(depth)) {
                    start = depth;
                    current_id = id;
                    break;
                }
            }
        }

        let mut found = None;
        for (depth, name) in segments.iter().enumerate().skip(start) {
            let children = self.children(&current_id, use_cache).await?;
            let parent = path.prefix(depth);
            self.remember_siblings(&parent, &children);

            let mut matches = children.into_iter().filter(|child| child.name == *name);
            let Some(child) = matches.next() else {
                return Err(ResolveError::NotFound(path.clone()));
            };
            if matches.next().is_some() {
                warn!(path = %parent.join(name), id = child.id, "duplicate names in listing, using first match");
            }
            current_id = child.id.clone();
            found = Some(child);
        }
        found.ok_or_else(|| ResolveError::NotFound(path.clone()))
    }
}
