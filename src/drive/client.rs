//! 基于 reqwest 的后端实现，所有调用带 Bearer 凭据并按固定间隔重试。

use async_trait::async_trait;
use axum::body::Body;
use bytes::Bytes;
use reqwest::header::{AUTHORIZATION, IF_RANGE, RANGE, REFERER};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{
    CreateFile, CreateOutcome, Download, DriveApi, DriveError, DriveResult, FileHash,
    ObjectMetadata, Quota, TokenGrant, TokenRefresher, UploadTargets,
};
use crate::config::{BACKEND_RETRIES, BACKEND_RETRY_DELAY};
use crate::credentials::CredentialStore;

const REFERER_VALUE: &str = "https://www.aliyundrive.com/";
const LIST_PAGE_LIMIT: u32 = 200;

const FILE_LIST: &str = "/adrive/v3/file/list";
const FILE_GET: &str = "/v2/file/get";
const FILE_CREATE: &str = "/adrive/v2/file/createWithFolders";
const FILE_UPLOAD_URL: &str = "/v2/file/get_upload_url";
const FILE_COMPLETE: &str = "/v2/file/complete";
const FILE_UPDATE: &str = "/v3/file/update";
const FILE_MOVE: &str = "/v2/file/move";
const FILE_COPY: &str = "/v2/file/copy";
const BATCH: &str = "/v3/batch";
const TRASH: &str = "/v2/recyclebin/trash";
const DOWNLOAD_URL: &str = "/v2/file/get_download_url";
const PERSONAL_INFO: &str = "/v2/databox/get_personal_info";
const ACCOUNT_TOKEN: &str = "/v2/account/token";

pub struct AliyunDrive {
    http: Client,
    api_base: String,
    auth_base: String,
    credentials: Arc<CredentialStore>,
    retries: u32,
    retry_delay: Duration,
}

#[derive(Deserialize)]
struct ListPage {
    #[serde(default)]
    items: Vec<ObjectMetadata>,
    #[serde(default)]
    next_marker: Option<String>,
}

#[derive(Deserialize)]
struct PartInfo {
    #[serde(default)]
    upload_url: String,
}

#[derive(Deserialize)]
struct CreateResponse {
    file_id: String,
    #[serde(default)]
    upload_id: Option<String>,
    #[serde(default)]
    rapid_upload: bool,
    #[serde(default)]
    part_info_list: Vec<PartInfo>,
}

#[derive(Deserialize)]
struct UploadUrlResponse {
    #[serde(default)]
    part_info_list: Vec<PartInfo>,
}

#[derive(Deserialize)]
struct BatchResponse {
    #[serde(default)]
    responses: Vec<BatchItem>,
}

#[derive(Deserialize)]
struct BatchItem {
    status: u16,
    #[serde(default)]
    body: Value,
}

#[derive(Deserialize)]
struct CopyResponse {
    file_id: String,
}

#[derive(Deserialize)]
struct DownloadUrlResponse {
    url: String,
}

#[derive(Deserialize)]
struct PersonalInfo {
    personal_space_info: SpaceInfo,
}

#[derive(Deserialize)]
struct SpaceInfo {
    used_size: u64,
    total_size: u64,
}

impl AliyunDrive {
    pub fn new(
        api_base: impl Into<String>,
        auth_base: impl Into<String>,
        credentials: Arc<CredentialStore>,
    ) -> Self {
        Self {
            http: Client::new(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            auth_base: auth_base.into().trim_end_matches('/').to_string(),
            credentials,
            retries: BACKEND_RETRIES,
            retry_delay: BACKEND_RETRY_DELAY,
        }
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    /// 发送请求；网络错误、5xx 与 429 按固定间隔重试。
    async fn send_with_retry<F>(&self, what: &str, build: F) -> DriveResult<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut last_error = DriveError::Transport("no attempt made".into());
        for attempt in 1..=self.retries {
            match build().send().await {
                Ok(response)
                    if response.status().is_server_error()
                        || response.status() == StatusCode::TOO_MANY_REQUESTS =>
                {
                    let status = response.status().as_u16();
                    warn!(what, attempt, status, "backend call failed, retrying");
                    last_error = DriveError::Status {
                        status,
                        message: response.text().await.unwrap_or_default(),
                    };
                }
                Ok(response) => return Ok(response),
                Err(err) => {
                    warn!(what, attempt, error = %err, "backend call failed, retrying");
                    last_error = DriveError::Transport(err.to_string());
                }
            }
            if attempt < self.retries {
                tokio::time::sleep(self.retry_delay).await;
            }
        }
        Err(last_error)
    }

    async fn post(&self, path: &str, body: Value) -> DriveResult<Response> {
        let token = self.credentials.snapshot().access_token.clone();
        let url = self.api_url(path);
        self.send_with_retry(path, || {
            self.http
                .post(&url)
                .header(AUTHORIZATION, format!("Bearer {token}"))
                .header(REFERER, REFERER_VALUE)
                .json(&body)
        })
        .await
    }

    async fn post_json<T: DeserializeOwned>(&self, path: &str, body: Value) -> DriveResult<T> {
        let response = check_status(self.post(path, body).await?).await?;
        response
            .json::<T>()
            .await
            .map_err(|err| DriveError::Decode(err.to_string()))
    }

    async fn post_unit(&self, path: &str, body: Value) -> DriveResult<()> {
        check_status(self.post(path, body).await?).await?;
        Ok(())
    }

    fn drive_id(&self) -> String {
        self.credentials.snapshot().drive_id.clone()
    }
}

async fn check_status(response: Response) -> DriveResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match status {
        StatusCode::NOT_FOUND => Err(DriveError::NotFound),
        StatusCode::UNAUTHORIZED => Err(DriveError::Unauthorized),
        _ => Err(DriveError::Status {
            status: status.as_u16(),
            message: response.text().await.unwrap_or_default(),
        }),
    }
}

fn part_info_list(part_count: u64) -> Vec<Value> {
    (1..=part_count)
        .map(|part_number| json!({ "part_number": part_number }))
        .collect()
}

fn part_urls(parts: Vec<PartInfo>) -> Vec<String> {
    parts.into_iter().map(|part| part.upload_url).collect()
}

#[async_trait]
impl DriveApi for AliyunDrive {
    async fn list_children(&self, parent_id: &str) -> DriveResult<Vec<ObjectMetadata>> {
        let drive_id = self.drive_id();
        let mut items = Vec::new();
        let mut marker = String::new();
        loop {
            let page: ListPage = self
                .post_json(
                    FILE_LIST,
                    json!({
                        "drive_id": drive_id,
                        "parent_file_id": parent_id,
                        "limit": LIST_PAGE_LIMIT,
                        "marker": marker,
                        "all": false,
                        "fields": "*",
                        "order_by": "name",
                        "order_direction": "ASC",
                    }),
                )
                .await?;
            items.extend(page.items);
            match page.next_marker {
                Some(next) if !next.is_empty() => marker = next,
                _ => break,
            }
        }
        debug!(parent_id, count = items.len(), "listed children");
        Ok(items)
    }

    async fn get_detail(&self, id: &str) -> DriveResult<ObjectMetadata> {
        self.post_json(FILE_GET, json!({ "drive_id": self.drive_id(), "file_id": id }))
            .await
    }

    async fn create_folder(&self, parent_id: &str, name: &str) -> DriveResult<ObjectMetadata> {
        let created: CreateResponse = self
            .post_json(
                FILE_CREATE,
                json!({
                    "drive_id": self.drive_id(),
                    "parent_file_id": parent_id,
                    "name": name,
                    "type": "folder",
                    "check_name_mode": "refuse",
                }),
            )
            .await?;
        self.get_detail(&created.file_id).await
    }

    async fn create_file(&self, request: &CreateFile) -> DriveResult<CreateOutcome> {
        let mut body = json!({
            "drive_id": self.drive_id(),
            "parent_file_id": request.parent_id,
            "name": request.name,
            "type": "file",
            "check_name_mode": "overwrite",
            "size": request.size,
            "part_info_list": part_info_list(request.part_count),
        });
        match &request.hash {
            FileHash::PreHash(hash) => {
                body["pre_hash"] = json!(hash);
            }
            FileHash::Content(hash) => {
                body["content_hash_name"] = json!("sha1");
                body["content_hash"] = json!(hash);
            }
            FileHash::None => {}
        }
        if let Some(proof) = &request.proof {
            body["proof_code"] = json!(proof);
        }
        if request.rapid || matches!(request.hash, FileHash::PreHash(_)) {
            body["proof_version"] = json!("v1");
        }

        let response = self.post(FILE_CREATE, body).await?;
        if response.status() == StatusCode::CONFLICT {
            return Ok(CreateOutcome::PreHashMatched);
        }
        let created: CreateResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(|err| DriveError::Decode(err.to_string()))?;
        Ok(CreateOutcome::Created(UploadTargets {
            file_id: created.file_id,
            upload_id: created.upload_id.unwrap_or_default(),
            rapid_upload: created.rapid_upload,
            part_urls: part_urls(created.part_info_list),
        }))
    }

    async fn get_upload_urls(
        &self,
        file_id: &str,
        upload_id: &str,
        part_count: u64,
    ) -> DriveResult<Vec<String>> {
        let response: UploadUrlResponse = self
            .post_json(
                FILE_UPLOAD_URL,
                json!({
                    "drive_id": self.drive_id(),
                    "file_id": file_id,
                    "upload_id": upload_id,
                    "part_info_list": part_info_list(part_count),
                }),
            )
            .await?;
        Ok(part_urls(response.part_info_list))
    }

    async fn upload_part(&self, url: &str, data: Bytes) -> DriveResult<()> {
        let response = self
            .send_with_retry("upload part", || self.http.put(url).body(data.clone()))
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn complete_upload(
        &self,
        file_id: &str,
        upload_id: &str,
    ) -> DriveResult<ObjectMetadata> {
        self.post_json(
            FILE_COMPLETE,
            json!({
                "drive_id": self.drive_id(),
                "file_id": file_id,
                "upload_id": upload_id,
            }),
        )
        .await
    }

    async fn rename(&self, id: &str, name: &str) -> DriveResult<()> {
        self.post_unit(
            FILE_UPDATE,
            json!({
                "drive_id": self.drive_id(),
                "file_id": id,
                "name": name,
                "check_name_mode": "refuse",
            }),
        )
        .await
    }

    async fn batch_move(&self, id: &str, to_parent_id: &str) -> DriveResult<()> {
        let drive_id = self.drive_id();
        let batch: BatchResponse = self
            .post_json(
                BATCH,
                json!({
                    "requests": [{
                        "body": {
                            "drive_id": drive_id,
                            "file_id": id,
                            "to_drive_id": drive_id,
                            "to_parent_file_id": to_parent_id,
                        },
                        "headers": { "Content-Type": "application/json" },
                        "id": id,
                        "method": "POST",
                        "url": "/file/move",
                    }],
                    "resource": "file",
                }),
            )
            .await?;
        match batch.responses.into_iter().next() {
            Some(item) if item.status < 300 => Ok(()),
            Some(item) if item.status == 404 => Err(DriveError::NotFound),
            Some(item) => Err(DriveError::Status {
                status: item.status,
                message: item.body.to_string(),
            }),
            None => Err(DriveError::Decode("empty batch response".into())),
        }
    }

    async fn move_to(&self, id: &str, to_parent_id: &str, new_name: &str) -> DriveResult<()> {
        self.post_unit(
            FILE_MOVE,
            json!({
                "drive_id": self.drive_id(),
                "file_id": id,
                "to_parent_file_id": to_parent_id,
                "new_name": new_name,
                "check_name_mode": "refuse",
            }),
        )
        .await
    }

    async fn copy_to(&self, id: &str, to_parent_id: &str, new_name: &str) -> DriveResult<String> {
        let copied: CopyResponse = self
            .post_json(
                FILE_COPY,
                json!({
                    "drive_id": self.drive_id(),
                    "file_id": id,
                    "to_parent_file_id": to_parent_id,
                    "new_name": new_name,
                    "auto_rename": false,
                }),
            )
            .await?;
        Ok(copied.file_id)
    }

    async fn trash(&self, id: &str) -> DriveResult<()> {
        self.post_unit(TRASH, json!({ "drive_id": self.drive_id(), "file_id": id }))
            .await
    }

    async fn download_url(&self, id: &str) -> DriveResult<String> {
        let response: DownloadUrlResponse = self
            .post_json(
                DOWNLOAD_URL,
                json!({ "drive_id": self.drive_id(), "file_id": id }),
            )
            .await?;
        Ok(response.url)
    }

    async fn fetch(
        &self,
        url: &str,
        range: Option<&str>,
        if_range: Option<&str>,
    ) -> DriveResult<Download> {
        let token = self.credentials.snapshot().access_token.clone();
        let response = self
            .send_with_retry("download", || {
                let mut request = self
                    .http
                    .get(url)
                    .header(AUTHORIZATION, format!("Bearer {token}"))
                    .header(REFERER, REFERER_VALUE);
                if let Some(range) = range {
                    request = request.header(RANGE, range);
                }
                if let Some(if_range) = if_range {
                    request = request.header(IF_RANGE, if_range);
                }
                request
            })
            .await?;
        Ok(Download {
            status: response.status(),
            headers: response.headers().clone(),
            body: Body::from_stream(response.bytes_stream()),
        })
    }

    async fn quota(&self) -> DriveResult<Quota> {
        let info: PersonalInfo = self.post_json(PERSONAL_INFO, json!({})).await?;
        Ok(Quota {
            total: info.personal_space_info.total_size,
            used: info.personal_space_info.used_size,
        })
    }
}

#[async_trait]
impl TokenRefresher for AliyunDrive {
    async fn refresh(&self, refresh_token: &str) -> DriveResult<TokenGrant> {
        let url = format!("{}{}", self.auth_base, ACCOUNT_TOKEN);
        let body = json!({ "grant_type": "refresh_token", "refresh_token": refresh_token });
        let response = self
            .send_with_retry("refresh token", || self.http.post(&url).json(&body))
            .await?;
        check_status(response)
            .await?
            .json::<TokenGrant>()
            .await
            .map_err(|err| DriveError::Decode(err.to_string()))
    }
}
