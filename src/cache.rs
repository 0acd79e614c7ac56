//! 身份缓存：虚拟路径与对象 ID 到元数据的映射，本身不发起任何网络请求。

use dashmap::DashMap;
use tracing::debug;

use crate::dav::VirtualPath;
use crate::drive::{ObjectMetadata, ROOT_ID};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// 虚拟路径 -> 对象 ID。
    Path(VirtualPath),
    /// 对象 ID -> 元数据。
    Object(String),
    /// 目录 ID -> 子项列表。
    Children(String),
}

#[derive(Clone, Debug)]
pub enum CacheValue {
    Id(String),
    Object(ObjectMetadata),
    Listing(Vec<ObjectMetadata>),
}

/// Process-wide cache with no TTL. Every mutation this process performs
/// invalidates the touched entries; external changes are not tracked.
#[derive(Default)]
pub struct IdentityCache {
    entries: DashMap<CacheKey, CacheValue>,
}

impl IdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_id(&self, path: &VirtualPath) -> Option<String> {
        if path.is_root() {
            return Some(ROOT_ID.to_string());
        }
        match self.entries.get(&CacheKey::Path(path.clone())) {
            Some(entry) => match entry.value() {
                CacheValue::Id(id) => Some(id.clone()),
                _ => None,
            },
            None => None,
        }
    }

    pub fn set_id(&self, path: &VirtualPath, id: &str) {
        if path.is_root() {
            return;
        }
        self.entries
            .insert(CacheKey::Path(path.clone()), CacheValue::Id(id.to_string()));
    }

    pub fn get_object(&self, id: &str) -> Option<ObjectMetadata> {
        match self.entries.get(&CacheKey::Object(id.to_string())) {
            Some(entry) => match entry.value() {
                CacheValue::Object(meta) => Some(meta.clone()),
                _ => None,
            },
            None => None,
        }
    }

    pub fn set_object(&self, meta: &ObjectMetadata) {
        self.entries.insert(
            CacheKey::Object(meta.id.clone()),
            CacheValue::Object(meta.clone()),
        );
    }

    pub fn get_children(&self, parent_id: &str) -> Option<Vec<ObjectMetadata>> {
        match self.entries.get(&CacheKey::Children(parent_id.to_string())) {
            Some(entry) => match entry.value() {
                CacheValue::Listing(children) => Some(children.clone()),
                _ => None,
            },
            None => None,
        }
    }

    pub fn set_children(&self, parent_id: &str, children: Vec<ObjectMetadata>) {
        self.entries.insert(
            CacheKey::Children(parent_id.to_string()),
            CacheValue::Listing(children),
        );
    }

    /// 把新对象并入已缓存的父目录列表（同 ID 或同名的旧项被替换）；未缓存列表时不做任何事。
    pub fn append_child(&self, parent_id: &str, meta: &ObjectMetadata) {
        if let Some(mut entry) = self
            .entries
            .get_mut(&CacheKey::Children(parent_id.to_string()))
            && let CacheValue::Listing(children) = entry.value_mut()
        {
            children.retain(|child| child.id != meta.id && child.name != meta.name);
            children.push(meta.clone());
        }
    }

    /// 只删除对象元数据，保留子项列表。
    pub fn drop_object(&self, id: &str) {
        self.entries.remove(&CacheKey::Object(id.to_string()));
    }

    /// 删除对象条目及其子项列表。
    fn forget_object(&self, id: &str) {
        self.entries.remove(&CacheKey::Object(id.to_string()));
        self.entries.remove(&CacheKey::Children(id.to_string()));
    }

    /// Drops the entry for `path` and, conservatively, its parent's object
    /// and listing. The parent's own path mapping is kept.
    pub fn invalidate(&self, path: &VirtualPath) {
        if let Some((_, CacheValue::Id(id))) = self.entries.remove(&CacheKey::Path(path.clone())) {
            self.forget_object(&id);
        }
        if let Some(parent) = path.parent()
            && let Some(parent_id) = self.get_id(&parent)
        {
            self.forget_object(&parent_id);
        }
        debug!(path = %path, "cache invalidated");
    }

    /// 同 [`invalidate`](Self::invalidate)，并清除所有后代路径。
    pub fn invalidate_tree(&self, path: &VirtualPath) {
        let mut doomed = Vec::new();
        for entry in self.entries.iter() {
            if let CacheKey::Path(key) = entry.key()
                && key != path
                && key.is_within(path)
            {
                doomed.push(key.clone());
            }
        }
        for key in doomed {
            if let Some((_, CacheValue::Id(id))) = self.entries.remove(&CacheKey::Path(key)) {
                self.forget_object(&id);
            }
        }
        self.invalidate(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::ObjectKind;

    fn meta(id: &str, parent: &str, name: &str) -> ObjectMetadata {
        ObjectMetadata {
            id: id.into(),
            parent_id: parent.into(),
            name: name.into(),
            kind: ObjectKind::File,
            size: 1,
            content_hash: None,
            created_at: None,
            updated_at: None,
        }
    }

    fn path(raw: &str) -> VirtualPath {
        VirtualPath::parse(raw).expect("path")
    }

    #[test]
    fn root_always_resolves_to_root_id() {
        let cache = IdentityCache::new();
        assert_eq!(cache.get_id(&VirtualPath::root()).as_deref(), Some(ROOT_ID));
        cache.set_id(&VirtualPath::root(), "other");
        assert_eq!(cache.get_id(&VirtualPath::root()).as_deref(), Some(ROOT_ID));
    }

    #[test]
    fn tagged_values_do_not_cross_kinds() {
        let cache = IdentityCache::new();
        cache.set_id(&path("a"), "id-a");
        cache.set_object(&meta("id-a", ROOT_ID, "a"));
        cache.set_children("id-a", vec![meta("c", "id-a", "c")]);
        assert_eq!(cache.get_id(&path("a")).as_deref(), Some("id-a"));
        assert_eq!(cache.get_object("id-a").map(|m| m.name), Some("a".into()));
        assert_eq!(cache.get_children("id-a").map(|c| c.len()), Some(1));
        assert!(cache.get_object("c").is_none());
    }

    #[test]
    fn invalidate_drops_entry_and_parent_listing() {
        let cache = IdentityCache::new();
        cache.set_id(&path("dir"), "d");
        cache.set_object(&meta("d", ROOT_ID, "dir"));
        cache.set_id(&path("dir/f"), "f");
        cache.set_object(&meta("f", "d", "f"));
        cache.set_children("d", vec![meta("f", "d", "f")]);

        cache.invalidate(&path("dir/f"));

        assert!(cache.get_id(&path("dir/f")).is_none());
        assert!(cache.get_object("f").is_none());
        assert!(cache.get_children("d").is_none());
        assert!(cache.get_object("d").is_none());
        assert_eq!(cache.get_id(&path("dir")).as_deref(), Some("d"));
    }

    #[test]
    fn invalidate_tree_drops_descendants_only() {
        let cache = IdentityCache::new();
        cache.set_id(&path("a"), "a");
        cache.set_id(&path("a/b"), "b");
        cache.set_id(&path("a/b/c"), "c");
        cache.set_id(&path("ab"), "ab");
        cache.invalidate_tree(&path("a"));
        assert!(cache.get_id(&path("a")).is_none());
        assert!(cache.get_id(&path("a/b")).is_none());
        assert!(cache.get_id(&path("a/b/c")).is_none());
        assert_eq!(cache.get_id(&path("ab")).as_deref(), Some("ab"));
    }

    #[test]
    fn append_child_replaces_same_name() {
        let cache = IdentityCache::new();
        cache.append_child("p", &meta("x", "p", "x"));
        assert!(cache.get_children("p").is_none());

        cache.set_children("p", vec![meta("old", "p", "x"), meta("y", "p", "y")]);
        cache.append_child("p", &meta("new", "p", "x"));
        let children = cache.get_children("p").expect("listing");
        assert_eq!(children.len(), 2);
        assert!(children.iter().any(|c| c.id == "new"));
        assert!(!children.iter().any(|c| c.id == "old"));
    }
}
