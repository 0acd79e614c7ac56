//! 云盘后端的数据模型。

use axum::body::Body;
use axum::http::{HeaderMap, StatusCode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 根目录在后端的固定标识。
pub const ROOT_ID: &str = "root";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    File,
    Folder,
}

/// Backend-owned metadata for one object. The identity cache keeps copies.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    #[serde(rename = "file_id")]
    pub id: String,
    #[serde(rename = "parent_file_id", default)]
    pub parent_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ObjectKind,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ObjectMetadata {
    /// 虚拟根目录，不需要任何网络请求。
    pub fn root() -> Self {
        Self {
            id: ROOT_ID.to_string(),
            parent_id: String::new(),
            name: String::new(),
            kind: ObjectKind::Folder,
            size: 0,
            content_hash: None,
            created_at: None,
            updated_at: None,
        }
    }

    pub fn is_folder(&self) -> bool {
        self.kind == ObjectKind::Folder
    }

    pub fn is_root(&self) -> bool {
        self.id == ROOT_ID
    }

    /// 非空的内容哈希。
    pub fn content_hash(&self) -> Option<&str> {
        self.content_hash.as_deref().filter(|hash| !hash.is_empty())
    }
}

/// Hash sent with a create-file call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileHash {
    /// SHA1 of the first KiB, used as an existence probe.
    PreHash(String),
    /// Uppercase SHA1 of the whole content.
    Content(String),
    None,
}

#[derive(Clone, Debug)]
pub struct CreateFile {
    pub parent_id: String,
    pub name: String,
    pub size: u64,
    pub part_count: u64,
    pub hash: FileHash,
    pub proof: Option<String>,
    pub rapid: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct UploadTargets {
    pub file_id: String,
    pub upload_id: String,
    pub rapid_upload: bool,
    pub part_urls: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum CreateOutcome {
    /// 后端返回 409：已有首 KiB 哈希一致的文件。
    PreHashMatched,
    Created(UploadTargets),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Quota {
    pub total: u64,
    pub used: u64,
}

impl Quota {
    pub fn available(&self) -> u64 {
        self.total.saturating_sub(self.used)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    pub default_drive_id: String,
}

/// 下载代理的上游响应。
pub struct Download {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Body,
}
