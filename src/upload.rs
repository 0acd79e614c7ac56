//! 上传引擎：暂存请求体、秒传探测、分片上传与地址续期。

use axum::body::Body;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashSet;
use md5::{Digest as _, Md5};
use sha1::Sha1;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::IdentityCache;
use crate::config::{
    CHUNK_SIZE, EMPTY_CONTENT_HASH, PRE_HASH_LEN, PROOF_LEN, RAPID_UPLOAD_MAX, RAPID_UPLOAD_MIN,
    RENEW_ATTEMPTS, RENEW_DELAY,
};
use crate::dav::VirtualPath;
use crate::drive::{
    CreateFile, CreateOutcome, DriveApi, DriveError, FileHash, ObjectMetadata, UploadTargets,
};
use crate::spool::SpoolFile;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("spool i/o failed: {0}")]
    Spool(#[from] io::Error),
    #[error(transparent)]
    Drive(#[from] DriveError),
    #[error("upload urls expired and could not be renewed")]
    UrlExpired,
    #[error("received {actual} bytes, expected {expected}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("backend returned no usable upload targets")]
    MissingUploadTargets,
}

/// 上传配置。
#[derive(Clone, Debug)]
pub struct UploadConfig {
    pub spool_dir: PathBuf,
    pub chunk_size: u64,
    pub renew_attempts: u32,
    pub renew_delay: Duration,
}

impl UploadConfig {
    pub fn new(spool_dir: PathBuf) -> Self {
        Self {
            spool_dir,
            chunk_size: CHUNK_SIZE,
            renew_attempts: RENEW_ATTEMPTS,
            renew_delay: RENEW_DELAY,
        }
    }
}

/// One PUT to be ingested.
pub struct UploadRequest<'a> {
    pub path: &'a VirtualPath,
    pub parent_id: &'a str,
    pub size: u64,
    /// 用于计算秒传校验偏移的访问令牌。
    pub access_token: &'a str,
}

/// 正在上传的路径登记，离开作用域时注销。
pub struct InFlight<'a> {
    paths: &'a DashSet<VirtualPath>,
    path: VirtualPath,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.paths.remove(&self.path);
    }
}

pub struct UploadEngine {
    drive: Arc<dyn DriveApi>,
    cache: Arc<IdentityCache>,
    config: UploadConfig,
    in_flight: DashSet<VirtualPath>,
}

/// Number of chunks for `size` bytes; at least one.
pub fn chunk_count(size: u64, chunk_size: u64) -> u64 {
    size.div_ceil(chunk_size).max(1)
}

/// 第 `index` 个分片的长度，最后一片为余数。
pub fn chunk_len(size: u64, chunk_size: u64, index: u64) -> u64 {
    let start = index * chunk_size;
    size.saturating_sub(start).min(chunk_size)
}

pub fn rapid_eligible(size: u64) -> bool {
    size > RAPID_UPLOAD_MIN && size <= RAPID_UPLOAD_MAX
}

/// 首 KiB 的 SHA1（小写十六进制）。
pub fn pre_hash(head: &[u8]) -> String {
    hex::encode(Sha1::digest(head))
}

/// Proof read window `[offset, end)` derived from the access token.
pub fn proof_window(access_token: &str, size: u64) -> (u64, u64) {
    if size == 0 {
        return (0, 0);
    }
    let digest = hex::encode(Md5::digest(access_token.as_bytes()));
    let seed = u64::from_str_radix(&digest[..16], 16).unwrap_or_default();
    let offset = seed % size;
    (offset, offset.saturating_add(PROOF_LEN).min(size))
}

pub fn proof_code(window: &[u8]) -> String {
    STANDARD.encode(window)
}

/// 预签名地址里的 `x-oss-expires` 时间戳（秒）。
pub fn url_expiry(url: &str) -> Option<i64> {
    let parsed = url::Url::parse(url).ok()?;
    parsed
        .query_pairs()
        .find(|(key, _)| key == "x-oss-expires")
        .and_then(|(_, value)| value.parse().ok())
}

fn url_expired(url: &str, now: i64) -> bool {
    matches!(url_expiry(url), Some(expires) if now > expires)
}

impl UploadEngine {
    pub fn new(drive: Arc<dyn DriveApi>, cache: Arc<IdentityCache>, config: UploadConfig) -> Self {
        Self {
            drive,
            cache,
            config,
            in_flight: DashSet::new(),
        }
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// 登记正在上传的路径；同一路径已有上传时返回 None。
    pub fn begin(&self, path: &VirtualPath) -> Option<InFlight<'_>> {
        if !self.in_flight.insert(path.clone()) {
            return None;
        }
        Some(InFlight {
            paths: &self.in_flight,
            path: path.clone(),
        })
    }

    /// Ingests `body` and returns the finished object. The cache is only
    /// touched once the backend has confirmed the upload.
    pub async fn upload(
        &self,
        request: UploadRequest<'_>,
        body: Body,
    ) -> Result<ObjectMetadata, UploadError> {
        let meta = if request.size == 0 {
            self.upload_empty(&request).await?
        } else {
            self.upload_spooled(&request, body).await?
        };
        self.cache.set_id(request.path, &meta.id);
        self.cache.set_object(&meta);
        self.cache.drop_object(request.parent_id);
        self.cache.append_child(request.parent_id, &meta);
        Ok(meta)
    }

    async fn upload_empty(&self, request: &UploadRequest<'_>) -> Result<ObjectMetadata, UploadError> {
        let outcome = self
            .drive
            .create_file(&CreateFile {
                parent_id: request.parent_id.to_string(),
                name: request.path.name().to_string(),
                size: 0,
                part_count: 1,
                hash: FileHash::Content(EMPTY_CONTENT_HASH.to_string()),
                proof: Some(String::new()),
                rapid: true,
            })
            .await?;
        let CreateOutcome::Created(targets) = outcome else {
            return Err(UploadError::MissingUploadTargets);
        };
        for url in &targets.part_urls {
            self.drive.upload_part(url, Bytes::new()).await?;
        }
        info!(path = %request.path, "empty file created");
        self.complete(&targets).await
    }

    async fn upload_spooled(
        &self,
        request: &UploadRequest<'_>,
        body: Body,
    ) -> Result<ObjectMetadata, UploadError> {
        let size = request.size;
        let name = request.path.name();
        let mut spool = SpoolFile::create(&self.config.spool_dir).await?;
        let written = spool.fill(body).await?;
        if written != size {
            return Err(UploadError::SizeMismatch {
                expected: size,
                actual: written,
            });
        }
        let part_count = chunk_count(size, self.config.chunk_size);

        let mut proof = None;
        if rapid_eligible(size) {
            let head = spool.read_at(0, PRE_HASH_LEN as u64).await?;
            let probe = self
                .drive
                .create_file(&CreateFile {
                    parent_id: request.parent_id.to_string(),
                    name: name.to_string(),
                    size,
                    part_count,
                    hash: FileHash::PreHash(pre_hash(&head)),
                    proof: None,
                    rapid: false,
                })
                .await;
            match probe {
                Ok(CreateOutcome::PreHashMatched) => {
                    let (start, end) = proof_window(request.access_token, size);
                    let window = spool.read_at(start, end - start).await?;
                    debug!(path = %request.path, offset = start, "pre-hash matched, proof computed");
                    proof = Some(proof_code(&window));
                }
                Ok(CreateOutcome::Created(_)) => {
                    debug!(path = %request.path, "pre-hash miss");
                }
                Err(err) => {
                    warn!(path = %request.path, error = %err, "pre-hash probe failed, rapid upload disabled");
                }
            }
        }

        let content_hash = full_hash(&mut spool).await?;
        let rapid = proof.is_some();
        let outcome = self
            .drive
            .create_file(&CreateFile {
                parent_id: request.parent_id.to_string(),
                name: name.to_string(),
                size,
                part_count,
                hash: FileHash::Content(content_hash),
                proof,
                rapid,
            })
            .await?;
        let CreateOutcome::Created(targets) = outcome else {
            return Err(UploadError::MissingUploadTargets);
        };
        if targets.rapid_upload {
            info!(path = %request.path, size, "rapid upload");
            return self.complete(&targets).await;
        }
        if targets.part_urls.len() as u64 != part_count {
            return Err(UploadError::MissingUploadTargets);
        }

        info!(path = %request.path, size, part_count, upload_id = targets.upload_id, "normal upload");
        spool.rewind().await?;
        let mut urls = targets.part_urls.clone();
        for index in 0..part_count {
            let len = chunk_len(size, self.config.chunk_size, index);
            let data = spool.read_next(len).await?;
            if url_expired(&urls[index as usize], Utc::now().timestamp()) {
                info!(path = %request.path, index, "upload url expired, renewing");
                urls = self.renew(&targets, part_count, index as usize).await?;
            }
            self.drive
                .upload_part(&urls[index as usize], Bytes::from(data))
                .await?;
            debug!(path = %request.path, index, len, "chunk uploaded");
        }
        self.complete(&targets).await
    }

    /// 重新申请全部分片地址，直到 `index` 对应的地址未过期。
    async fn renew(
        &self,
        targets: &UploadTargets,
        part_count: u64,
        index: usize,
    ) -> Result<Vec<String>, UploadError> {
        for attempt in 1..=self.config.renew_attempts {
            match self
                .drive
                .get_upload_urls(&targets.file_id, &targets.upload_id, part_count)
                .await
            {
                Ok(urls)
                    if urls.len() as u64 == part_count
                        && !url_expired(&urls[index], Utc::now().timestamp()) =>
                {
                    return Ok(urls);
                }
                Ok(_) => warn!(attempt, upload_id = targets.upload_id, "renewed urls still unusable"),
                Err(err) => warn!(attempt, error = %err, "upload url renewal failed"),
            }
            if attempt < self.config.renew_attempts {
                tokio::time::sleep(self.config.renew_delay).await;
            }
        }
        Err(UploadError::UrlExpired)
    }

    async fn complete(&self, targets: &UploadTargets) -> Result<ObjectMetadata, UploadError> {
        if targets.upload_id.is_empty() {
            return Ok(self.drive.get_detail(&targets.file_id).await?);
        }
        Ok(self
            .drive
            .complete_upload(&targets.file_id, &targets.upload_id)
            .await?)
    }
}

/// 全文 SHA1（大写十六进制）。
async fn full_hash(spool: &mut SpoolFile) -> io::Result<String> {
    let mut hasher = Sha1::new();
    spool.for_each_block(|block| hasher.update(block)).await?;
    Ok(hex::encode_upper(hasher.finalize()))
}
