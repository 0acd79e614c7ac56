//! 云盘后端客户端：以对象 ID 为寻址方式的 REST 接口。

mod client;
#[cfg(test)]
pub(crate) mod memory;
mod model;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub use client::AliyunDrive;
pub use model::{
    CreateFile, CreateOutcome, Download, FileHash, ObjectKind, ObjectMetadata, Quota, ROOT_ID,
    TokenGrant, UploadTargets,
};

pub type DriveResult<T> = Result<T, DriveError>;

#[derive(Debug, Error)]
pub enum DriveError {
    #[error("backend transport error: {0}")]
    Transport(String),
    #[error("backend returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("object not found")]
    NotFound,
    #[error("backend rejected credentials")]
    Unauthorized,
    #[error("unexpected backend payload: {0}")]
    Decode(String),
}

/// Operations the gateway needs from the drive backend.
///
/// Every call is authenticated with the current credential snapshot and is
/// retried by the implementation; callers only see the final outcome.
#[async_trait]
pub trait DriveApi: Send + Sync {
    async fn list_children(&self, parent_id: &str) -> DriveResult<Vec<ObjectMetadata>>;

    async fn get_detail(&self, id: &str) -> DriveResult<ObjectMetadata>;

    async fn create_folder(&self, parent_id: &str, name: &str) -> DriveResult<ObjectMetadata>;

    /// 创建文件或初始化上传；预哈希命中时返回 [`CreateOutcome::PreHashMatched`]。
    async fn create_file(&self, request: &CreateFile) -> DriveResult<CreateOutcome>;

    /// Fresh pre-signed urls for every part of an ongoing upload.
    async fn get_upload_urls(
        &self,
        file_id: &str,
        upload_id: &str,
        part_count: u64,
    ) -> DriveResult<Vec<String>>;

    async fn upload_part(&self, url: &str, data: Bytes) -> DriveResult<()>;

    async fn complete_upload(&self, file_id: &str, upload_id: &str)
    -> DriveResult<ObjectMetadata>;

    async fn rename(&self, id: &str, name: &str) -> DriveResult<()>;

    /// 单次批量移动调用，不改名。
    async fn batch_move(&self, id: &str, to_parent_id: &str) -> DriveResult<()>;

    async fn move_to(&self, id: &str, to_parent_id: &str, new_name: &str) -> DriveResult<()>;

    async fn copy_to(&self, id: &str, to_parent_id: &str, new_name: &str) -> DriveResult<String>;

    async fn trash(&self, id: &str) -> DriveResult<()>;

    async fn download_url(&self, id: &str) -> DriveResult<String>;

    async fn fetch(
        &self,
        url: &str,
        range: Option<&str>,
        if_range: Option<&str>,
    ) -> DriveResult<Download>;

    async fn quota(&self) -> DriveResult<Quota>;
}

/// Exchanges a refresh token for a new credential grant.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> DriveResult<TokenGrant>;
}
