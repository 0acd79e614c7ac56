//! 测试用的内存后端，按插入顺序保存对象并统计调用次数。

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use chrono::Utc;
use md5::{Digest as _, Md5};
use sha1::Sha1;
use std::collections::HashMap;
use std::sync::Mutex;

use super::{
    CreateFile, CreateOutcome, Download, DriveApi, DriveError, DriveResult, FileHash, ObjectKind,
    ObjectMetadata, Quota, ROOT_ID, UploadTargets,
};

pub const TEST_ACCESS_TOKEN: &str = "test-access-token";

struct Stored {
    meta: ObjectMetadata,
    content: Vec<u8>,
}

struct PendingUpload {
    file_id: String,
    parent_id: String,
    name: String,
    size: u64,
    parts: Vec<Option<Bytes>>,
    finished: bool,
}

struct State {
    objects: Vec<Stored>,
    uploads: HashMap<String, PendingUpload>,
    calls: HashMap<&'static str, usize>,
    failing: Vec<&'static str>,
    next_id: u64,
    url_ttl_secs: i64,
    renew_ttl_secs: i64,
    quota_total: u64,
}

pub struct MemoryDrive {
    state: Mutex<State>,
}

fn sha1_upper(data: &[u8]) -> String {
    hex::encode_upper(Sha1::digest(data))
}

fn expected_proof(content: &[u8]) -> String {
    let digest = hex::encode(Md5::digest(TEST_ACCESS_TOKEN.as_bytes()));
    let seed = u64::from_str_radix(&digest[..16], 16).unwrap_or_default();
    let size = content.len() as u64;
    if size == 0 {
        return String::new();
    }
    let start = (seed % size) as usize;
    let end = (start + 8).min(content.len());
    STANDARD.encode(&content[start..end])
}

fn status(code: u16) -> DriveError {
    DriveError::Status {
        status: code,
        message: String::new(),
    }
}

impl State {
    fn record(&mut self, op: &'static str) -> DriveResult<()> {
        *self.calls.entry(op).or_default() += 1;
        if self.failing.contains(&op) {
            return Err(status(500));
        }
        Ok(())
    }

    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}{}", self.next_id)
    }

    fn find(&self, id: &str) -> Option<&Stored> {
        self.objects.iter().find(|stored| stored.meta.id == id)
    }

    fn find_mut(&mut self, id: &str) -> Option<&mut Stored> {
        self.objects.iter_mut().find(|stored| stored.meta.id == id)
    }

    fn exists(&self, id: &str) -> bool {
        id == ROOT_ID || self.find(id).is_some()
    }

    fn child_named(&self, parent_id: &str, name: &str) -> Option<&Stored> {
        self.objects
            .iter()
            .find(|stored| stored.meta.parent_id == parent_id && stored.meta.name == name)
    }

    fn insert(&mut self, parent_id: &str, name: &str, kind: ObjectKind, content: Vec<u8>) -> String {
        let id = self.next_id(if kind == ObjectKind::Folder { "d" } else { "f" });
        let now = Utc::now();
        let content_hash = (kind == ObjectKind::File).then(|| sha1_upper(&content));
        self.objects.push(Stored {
            meta: ObjectMetadata {
                id: id.clone(),
                parent_id: parent_id.to_string(),
                name: name.to_string(),
                kind,
                size: content.len() as u64,
                content_hash,
                created_at: Some(now),
                updated_at: Some(now),
            },
            content,
        });
        id
    }

    /// 覆盖模式：先移走同名文件再插入。
    fn overwrite(&mut self, parent_id: &str, name: &str, content: Vec<u8>) -> String {
        let existing = self
            .child_named(parent_id, name)
            .filter(|stored| stored.meta.kind == ObjectKind::File)
            .map(|stored| stored.meta.id.clone());
        if let Some(id) = existing {
            self.remove_tree(&id);
        }
        self.insert(parent_id, name, ObjectKind::File, content)
    }

    fn remove_tree(&mut self, id: &str) {
        let children: Vec<String> = self
            .objects
            .iter()
            .filter(|stored| stored.meta.parent_id == id)
            .map(|stored| stored.meta.id.clone())
            .collect();
        for child in children {
            self.remove_tree(&child);
        }
        self.objects.retain(|stored| stored.meta.id != id);
    }

    fn copy_tree(&mut self, id: &str, to_parent_id: &str, name: &str) -> Option<String> {
        let (kind, content) = {
            let source = self.find(id)?;
            (source.meta.kind, source.content.clone())
        };
        let new_id = self.insert(to_parent_id, name, kind, content);
        let children: Vec<(String, String)> = self
            .objects
            .iter()
            .filter(|stored| stored.meta.parent_id == id)
            .map(|stored| (stored.meta.id.clone(), stored.meta.name.clone()))
            .collect();
        for (child_id, child_name) in children {
            self.copy_tree(&child_id, &new_id, &child_name);
        }
        Some(new_id)
    }

    fn part_urls(&self, upload_id: &str, part_count: u64, ttl: i64) -> Vec<String> {
        let expires = Utc::now().timestamp() + ttl;
        (1..=part_count)
            .map(|part| format!("https://oss.test/{upload_id}/{part}?x-oss-expires={expires}&sig=1"))
            .collect()
    }
}

impl MemoryDrive {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                objects: Vec::new(),
                uploads: HashMap::new(),
                calls: HashMap::new(),
                failing: Vec::new(),
                next_id: 0,
                url_ttl_secs: 3600,
                renew_ttl_secs: 3600,
                quota_total: 1 << 40,
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("memory drive poisoned")
    }

    pub fn add_folder(&self, parent_id: &str, name: &str) -> String {
        self.state()
            .insert(parent_id, name, ObjectKind::Folder, Vec::new())
    }

    pub fn add_file(&self, parent_id: &str, name: &str, content: &[u8]) -> String {
        self.state()
            .insert(parent_id, name, ObjectKind::File, content.to_vec())
    }

    /// 绕过网关直接删除，模拟外部修改。
    pub fn remove_external(&self, id: &str) {
        self.state().remove_tree(id);
    }

    pub fn calls(&self, op: &str) -> usize {
        self.state().calls.get(op).copied().unwrap_or_default()
    }

    pub fn fail(&self, op: &'static str) {
        self.state().failing.push(op);
    }

    /// 新建上传返回的地址有效期（秒，可为负）。
    pub fn set_url_ttl(&self, secs: i64) {
        self.state().url_ttl_secs = secs;
    }

    pub fn set_renew_ttl(&self, secs: i64) {
        self.state().renew_ttl_secs = secs;
    }

    pub fn content(&self, id: &str) -> Option<Vec<u8>> {
        self.state().find(id).map(|stored| stored.content.clone())
    }

    pub fn meta(&self, id: &str) -> Option<ObjectMetadata> {
        self.state().find(id).map(|stored| stored.meta.clone())
    }

    pub fn child(&self, parent_id: &str, name: &str) -> Option<ObjectMetadata> {
        self.state()
            .child_named(parent_id, name)
            .map(|stored| stored.meta.clone())
    }

    pub fn object_count(&self) -> usize {
        self.state().objects.len()
    }
}

#[async_trait]
impl DriveApi for MemoryDrive {
    async fn list_children(&self, parent_id: &str) -> DriveResult<Vec<ObjectMetadata>> {
        let mut state = self.state();
        state.record("list_children")?;
        if !state.exists(parent_id) {
            return Err(DriveError::NotFound);
        }
        Ok(state
            .objects
            .iter()
            .filter(|stored| stored.meta.parent_id == parent_id)
            .map(|stored| stored.meta.clone())
            .collect())
    }

    async fn get_detail(&self, id: &str) -> DriveResult<ObjectMetadata> {
        let mut state = self.state();
        state.record("get_detail")?;
        state
            .find(id)
            .map(|stored| stored.meta.clone())
            .ok_or(DriveError::NotFound)
    }

    async fn create_folder(&self, parent_id: &str, name: &str) -> DriveResult<ObjectMetadata> {
        let mut state = self.state();
        state.record("create_folder")?;
        if !state.exists(parent_id) {
            return Err(DriveError::NotFound);
        }
        if state.child_named(parent_id, name).is_some() {
            return Err(status(409));
        }
        let id = state.insert(parent_id, name, ObjectKind::Folder, Vec::new());
        state
            .find(&id)
            .map(|stored| stored.meta.clone())
            .ok_or(DriveError::NotFound)
    }

    async fn create_file(&self, request: &CreateFile) -> DriveResult<CreateOutcome> {
        let mut state = self.state();
        state.record("create_file")?;
        if !state.exists(&request.parent_id) {
            return Err(DriveError::NotFound);
        }
        match &request.hash {
            FileHash::PreHash(pre_hash) => {
                let matched = state.objects.iter().any(|stored| {
                    stored.meta.kind == ObjectKind::File
                        && stored.content.len() >= 1024
                        && hex::encode(Sha1::digest(&stored.content[..1024])) == *pre_hash
                });
                if matched {
                    return Ok(CreateOutcome::PreHashMatched);
                }
            }
            FileHash::Content(_) if request.size == 0 => {
                let file_id = state.overwrite(&request.parent_id, &request.name, Vec::new());
                return Ok(CreateOutcome::Created(UploadTargets {
                    file_id,
                    upload_id: String::new(),
                    rapid_upload: true,
                    part_urls: Vec::new(),
                }));
            }
            FileHash::Content(hash) if request.rapid => {
                let source = state
                    .objects
                    .iter()
                    .find(|stored| stored.meta.content_hash.as_deref() == Some(hash.as_str()))
                    .map(|stored| stored.content.clone());
                if let Some(content) = source
                    && request.proof.as_deref() == Some(expected_proof(&content).as_str())
                {
                    let file_id = state.overwrite(&request.parent_id, &request.name, content);
                    let upload_id = state.next_id("u");
                    state.uploads.insert(
                        upload_id.clone(),
                        PendingUpload {
                            file_id: file_id.clone(),
                            parent_id: request.parent_id.clone(),
                            name: request.name.clone(),
                            size: request.size,
                            parts: Vec::new(),
                            finished: true,
                        },
                    );
                    return Ok(CreateOutcome::Created(UploadTargets {
                        file_id,
                        upload_id,
                        rapid_upload: true,
                        part_urls: Vec::new(),
                    }));
                }
            }
            _ => {}
        }

        let upload_id = state.next_id("u");
        let file_id = state.next_id("f");
        let ttl = state.url_ttl_secs;
        let part_urls = state.part_urls(&upload_id, request.part_count, ttl);
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                file_id: file_id.clone(),
                parent_id: request.parent_id.clone(),
                name: request.name.clone(),
                size: request.size,
                parts: vec![None; request.part_count as usize],
                finished: false,
            },
        );
        Ok(CreateOutcome::Created(UploadTargets {
            file_id,
            upload_id,
            rapid_upload: false,
            part_urls,
        }))
    }

    async fn get_upload_urls(
        &self,
        _file_id: &str,
        upload_id: &str,
        part_count: u64,
    ) -> DriveResult<Vec<String>> {
        let mut state = self.state();
        state.record("get_upload_urls")?;
        if !state.uploads.contains_key(upload_id) {
            return Err(DriveError::NotFound);
        }
        let ttl = state.renew_ttl_secs;
        Ok(state.part_urls(upload_id, part_count, ttl))
    }

    async fn upload_part(&self, url: &str, data: Bytes) -> DriveResult<()> {
        let mut state = self.state();
        state.record("upload_part")?;
        let parsed = url::Url::parse(url).map_err(|err| DriveError::Decode(err.to_string()))?;
        let expires = parsed
            .query_pairs()
            .find(|(key, _)| key == "x-oss-expires")
            .and_then(|(_, value)| value.parse::<i64>().ok())
            .unwrap_or_default();
        if expires < Utc::now().timestamp() {
            return Err(status(403));
        }
        let mut segments = parsed.path_segments().into_iter().flatten();
        let upload_id = segments.next().unwrap_or_default().to_string();
        let part: usize = segments
            .next()
            .and_then(|part| part.parse().ok())
            .unwrap_or_default();
        let upload = state
            .uploads
            .get_mut(&upload_id)
            .ok_or(DriveError::NotFound)?;
        let slot = upload
            .parts
            .get_mut(part.wrapping_sub(1))
            .ok_or_else(|| status(400))?;
        *slot = Some(data);
        Ok(())
    }

    async fn complete_upload(
        &self,
        file_id: &str,
        upload_id: &str,
    ) -> DriveResult<ObjectMetadata> {
        let mut state = self.state();
        state.record("complete_upload")?;
        let upload = state.uploads.remove(upload_id).ok_or(DriveError::NotFound)?;
        if upload.file_id != file_id {
            return Err(status(400));
        }
        let id = if upload.finished {
            upload.file_id
        } else {
            let mut content = Vec::new();
            for part in &upload.parts {
                let part = part.as_ref().ok_or_else(|| status(400))?;
                content.extend_from_slice(part);
            }
            if content.len() as u64 != upload.size {
                return Err(status(400));
            }
            state.overwrite(&upload.parent_id, &upload.name, content)
        };
        state
            .find(&id)
            .map(|stored| stored.meta.clone())
            .ok_or(DriveError::NotFound)
    }

    async fn rename(&self, id: &str, name: &str) -> DriveResult<()> {
        let mut state = self.state();
        state.record("rename")?;
        let parent_id = state
            .find(id)
            .map(|stored| stored.meta.parent_id.clone())
            .ok_or(DriveError::NotFound)?;
        if state.child_named(&parent_id, name).is_some() {
            return Err(status(409));
        }
        if let Some(stored) = state.find_mut(id) {
            stored.meta.name = name.to_string();
        }
        Ok(())
    }

    async fn batch_move(&self, id: &str, to_parent_id: &str) -> DriveResult<()> {
        let mut state = self.state();
        state.record("batch_move")?;
        let name = state
            .find(id)
            .map(|stored| stored.meta.name.clone())
            .ok_or(DriveError::NotFound)?;
        if !state.exists(to_parent_id) {
            return Err(DriveError::NotFound);
        }
        if state.child_named(to_parent_id, &name).is_some() {
            return Err(status(409));
        }
        if let Some(stored) = state.find_mut(id) {
            stored.meta.parent_id = to_parent_id.to_string();
        }
        Ok(())
    }

    async fn move_to(&self, id: &str, to_parent_id: &str, new_name: &str) -> DriveResult<()> {
        let mut state = self.state();
        state.record("move_to")?;
        if state.find(id).is_none() || !state.exists(to_parent_id) {
            return Err(DriveError::NotFound);
        }
        if state.child_named(to_parent_id, new_name).is_some() {
            return Err(status(409));
        }
        if let Some(stored) = state.find_mut(id) {
            stored.meta.parent_id = to_parent_id.to_string();
            stored.meta.name = new_name.to_string();
        }
        Ok(())
    }

    async fn copy_to(&self, id: &str, to_parent_id: &str, new_name: &str) -> DriveResult<String> {
        let mut state = self.state();
        state.record("copy_to")?;
        if !state.exists(to_parent_id) {
            return Err(DriveError::NotFound);
        }
        if state.child_named(to_parent_id, new_name).is_some() {
            return Err(status(409));
        }
        state
            .copy_tree(id, to_parent_id, new_name)
            .ok_or(DriveError::NotFound)
    }

    async fn trash(&self, id: &str) -> DriveResult<()> {
        let mut state = self.state();
        state.record("trash")?;
        if state.find(id).is_none() {
            return Err(DriveError::NotFound);
        }
        state.remove_tree(id);
        Ok(())
    }

    async fn download_url(&self, id: &str) -> DriveResult<String> {
        let mut state = self.state();
        state.record("download_url")?;
        if state.find(id).is_none() {
            return Err(DriveError::NotFound);
        }
        Ok(format!("https://download.test/{id}"))
    }

    async fn fetch(
        &self,
        url: &str,
        range: Option<&str>,
        _if_range: Option<&str>,
    ) -> DriveResult<Download> {
        let mut state = self.state();
        state.record("fetch")?;
        let id = url.rsplit('/').next().unwrap_or_default();
        let content = state
            .find(id)
            .map(|stored| stored.content.clone())
            .ok_or(DriveError::NotFound)?;
        let total = content.len();
        let mut headers = HeaderMap::new();
        let window = range
            .and_then(|value| value.strip_prefix("bytes="))
            .and_then(|spec| spec.split_once('-'))
            .and_then(|(start, end)| {
                let start: usize = start.parse().ok()?;
                let end: usize = if end.is_empty() {
                    total.checked_sub(1)?
                } else {
                    end.parse().ok()?
                };
                (start <= end && end < total).then_some((start, end))
            });
        let (status, body) = match window {
            Some((start, end)) => {
                headers.insert(
                    header::CONTENT_RANGE,
                    HeaderValue::from_str(&format!("bytes {start}-{end}/{total}"))
                        .map_err(|err| DriveError::Decode(err.to_string()))?,
                );
                (StatusCode::PARTIAL_CONTENT, content[start..=end].to_vec())
            }
            None if range.is_some() => (StatusCode::RANGE_NOT_SATISFIABLE, Vec::new()),
            None => (StatusCode::OK, content),
        };
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
        Ok(Download {
            status,
            headers,
            body: Body::from(body),
        })
    }

    async fn quota(&self) -> DriveResult<Quota> {
        let mut state = self.state();
        state.record("quota")?;
        let used = state.objects.iter().map(|stored| stored.meta.size).sum();
        Ok(Quota {
            total: state.quota_total,
            used,
        })
    }
}
