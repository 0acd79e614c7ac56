//! 属性子系统：活属性由元数据计算，死属性保存在内存中。

use axum::http::StatusCode;
use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use super::VirtualPath;
use super::xml::{PropName, PropPatch, escape};
use crate::drive::ObjectMetadata;
use crate::etag::etag_for;
use crate::locks::ActiveLock;

const LIVE: [&str; 9] = [
    "resourcetype",
    "displayname",
    "getcontentlength",
    "getlastmodified",
    "creationdate",
    "getcontenttype",
    "getetag",
    "supportedlock",
    "lockdiscovery",
];

const SUPPORTED_LOCK: &str = "<D:lockentry><D:lockscope><D:exclusive/></D:lockscope><D:locktype><D:write/></D:locktype></D:lockentry>";

pub fn is_live(name: &PropName) -> bool {
    name.is_dav() && LIVE.contains(&name.name.as_str())
}

fn to_system_time(at: DateTime<Utc>) -> SystemTime {
    u64::try_from(at.timestamp())
        .map(|secs| UNIX_EPOCH + std::time::Duration::from_secs(secs))
        .unwrap_or(UNIX_EPOCH)
}

/// Inner XML of a live property, or `None` when it does not apply.
/// `prefix` is the mount prefix used for lock root hrefs.
pub fn live_value(
    name: &str,
    meta: &ObjectMetadata,
    prefix: &str,
    locks: &[ActiveLock],
) -> Option<String> {
    let is_file = !meta.is_folder();
    match name {
        "resourcetype" => Some(if is_file {
            String::new()
        } else {
            PropName::dav("collection").empty()
        }),
        "displayname" => Some(escape(&meta.name)),
        "getcontentlength" if is_file => Some(meta.size.to_string()),
        "getlastmodified" => {
            let at = meta.updated_at.or(meta.created_at)?;
            Some(httpdate::fmt_http_date(to_system_time(at)))
        }
        "creationdate" => {
            let at = meta.created_at.or(meta.updated_at)?;
            Some(at.to_rfc3339_opts(SecondsFormat::Secs, true))
        }
        "getcontenttype" if is_file => Some(escape(
            mime_guess::from_path(&meta.name)
                .first_or_octet_stream()
                .essence_str(),
        )),
        "getetag" if is_file => Some(escape(&etag_for(meta))),
        "supportedlock" => Some(SUPPORTED_LOCK.to_string()),
        "lockdiscovery" => Some(
            locks
                .iter()
                .map(|lock| activelock_xml(lock, &lock.details.root.href(prefix, false)))
                .collect(),
        ),
        _ => None,
    }
}

/// 当前对象适用的全部活属性名。
pub fn live_names(meta: &ObjectMetadata) -> Vec<PropName> {
    LIVE.iter()
        .filter(|name| live_value(name, meta, "", &[]).is_some())
        .map(|name| PropName::dav(name))
        .collect()
}

/// `<D:activelock>` for one lock; `root_href` is the lock root's href.
pub fn activelock_xml(lock: &ActiveLock, root_href: &str) -> String {
    let depth = if lock.details.zero_depth { "0" } else { "infinity" };
    let timeout = match lock.remaining {
        Some(remaining) => format!("Second-{}", remaining.as_secs()),
        None => "Infinite".to_string(),
    };
    let owner = if lock.details.owner_xml.is_empty() {
        String::new()
    } else {
        format!("<D:owner>{}</D:owner>", lock.details.owner_xml)
    };
    format!(
        "<D:activelock><D:locktype><D:write/></D:locktype><D:lockscope><D:exclusive/></D:lockscope>\
         <D:depth>{depth}</D:depth>{owner}<D:timeout>{timeout}</D:timeout>\
         <D:locktoken><D:href>{}</D:href></D:locktoken>\
         <D:lockroot><D:href>{}</D:href></D:lockroot></D:activelock>",
        escape(&lock.token),
        escape(root_href)
    )
}

/// 按虚拟路径保存的死属性。
#[derive(Default)]
pub struct PropertyStore {
    props: DashMap<VirtualPath, BTreeMap<PropName, String>>,
}

impl PropertyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &VirtualPath, name: &PropName) -> Option<String> {
        self.props.get(path)?.get(name).cloned()
    }

    pub fn all(&self, path: &VirtualPath) -> Vec<(PropName, String)> {
        self.props
            .get(path)
            .map(|props| {
                props
                    .iter()
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Applies all patches or none. Touching a live property fails that
    /// property with 403 and every other one with 424.
    pub fn apply(&self, path: &VirtualPath, patches: &[PropPatch]) -> Vec<(PropName, StatusCode)> {
        let names = patches.iter().flat_map(|patch| patch.props.iter().map(|(name, _)| name));
        if patches
            .iter()
            .flat_map(|patch| &patch.props)
            .any(|(name, _)| is_live(name))
        {
            return names
                .map(|name| {
                    let status = if is_live(name) {
                        StatusCode::FORBIDDEN
                    } else {
                        StatusCode::FAILED_DEPENDENCY
                    };
                    (name.clone(), status)
                })
                .collect();
        }

        let mut entry = self.props.entry(path.clone()).or_default();
        for patch in patches {
            for (name, value) in &patch.props {
                if patch.remove {
                    entry.remove(name);
                } else {
                    entry.insert(name.clone(), value.clone());
                }
            }
        }
        drop(entry);
        names.map(|name| (name.clone(), StatusCode::OK)).collect()
    }

    pub fn remove_tree(&self, path: &VirtualPath) {
        self.props.retain(|key, _| !key.is_within(path));
    }

    /// 复制死属性；`deep` 为假时只复制 `from` 自身的属性。
    pub fn copy_tree(&self, from: &VirtualPath, to: &VirtualPath, deep: bool) {
        let copies: Vec<(VirtualPath, BTreeMap<PropName, String>)> = self
            .props
            .iter()
            .filter(|entry| {
                let key = entry.key();
                key == from || (deep && key.is_within(from))
            })
            .map(|entry| (entry.key().rebase(from, to), entry.value().clone()))
            .collect();
        for (key, value) in copies {
            self.props.insert(key, value);
        }
    }

    pub fn move_tree(&self, from: &VirtualPath, to: &VirtualPath) {
        self.copy_tree(from, to, true);
        let moved: Vec<VirtualPath> = self
            .props
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|key| key.is_within(from) && !key.is_within(to))
            .collect();
        for key in moved {
            self.props.remove(&key);
        }
    }
}
