//! 分发器测试用的内存后端装配。

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use chrono::Utc;
use http_body_util::BodyExt;
use std::sync::Arc;
use tempfile::TempDir;

use super::{DavConfig, DavHandler};
use crate::cache::IdentityCache;
use crate::credentials::{CredentialStore, DriveConfig};
use crate::drive::memory::{MemoryDrive, TEST_ACCESS_TOKEN};
use crate::drive::{DriveError, DriveResult, TokenGrant, TokenRefresher};
use crate::locks::LockTable;
use crate::resolver::PathResolver;
use crate::upload::{UploadConfig, UploadEngine};

struct NoRefresh;

#[async_trait]
impl TokenRefresher for NoRefresh {
    async fn refresh(&self, _refresh_token: &str) -> DriveResult<TokenGrant> {
        Err(DriveError::Unauthorized)
    }
}

pub(crate) struct Harness {
    pub drive: Arc<MemoryDrive>,
    pub cache: Arc<IdentityCache>,
    pub handler: DavHandler,
    _spool: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(DavConfig {
            prefix: "/".into(),
            browse_dirs: false,
        })
    }

    pub fn with_prefix(prefix: &str) -> Self {
        Self::build(DavConfig {
            prefix: prefix.into(),
            browse_dirs: false,
        })
    }

    pub fn browsing() -> Self {
        Self::build(DavConfig {
            prefix: "/".into(),
            browse_dirs: true,
        })
    }

    fn build(config: DavConfig) -> Self {
        let spool = tempfile::tempdir().expect("spool dir");
        let drive = Arc::new(MemoryDrive::new());
        let cache = Arc::new(IdentityCache::new());
        let mut uploads = UploadConfig::new(spool.path().to_path_buf());
        uploads.renew_delay = std::time::Duration::from_millis(1);
        let credentials = Arc::new(CredentialStore::new(
            DriveConfig {
                access_token: TEST_ACCESS_TOKEN.into(),
                refresh_token: "rt".into(),
                drive_id: "drive".into(),
                expires_at: Utc::now().timestamp() + 86_400,
            },
            None,
        ));
        let handler = DavHandler::new(
            config,
            PathResolver::new(cache.clone(), drive.clone()),
            UploadEngine::new(drive.clone(), cache.clone(), uploads),
            Arc::new(LockTable::new()),
            credentials,
            Arc::new(NoRefresh),
        );
        Self {
            drive,
            cache,
            handler,
            _spool: spool,
        }
    }

    pub async fn send(
        &self,
        method: &str,
        uri: &str,
        headers: &[(&str, &str)],
        body: impl Into<Body>,
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = builder.body(body.into()).expect("request");
        self.handler.handle(request).await
    }

    /// Exclusive infinite-depth lock on `uri`, returning its token.
    pub async fn lock(&self, uri: &str) -> String {
        let response = self
            .send("LOCK", uri, &[("timeout", "Second-600")], LOCKINFO)
            .await;
        assert!(
            response.status() == StatusCode::OK || response.status() == StatusCode::CREATED,
            "lock failed: {}",
            response.status()
        );
        let token = response
            .headers()
            .get("lock-token")
            .and_then(|value| value.to_str().ok())
            .expect("lock token");
        token.trim_matches(['<', '>']).to_string()
    }
}

pub(crate) const LOCKINFO: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<D:lockinfo xmlns:D="DAV:">
  <D:lockscope><D:exclusive/></D:lockscope>
  <D:locktype><D:write/></D:locktype>
  <D:owner>tester</D:owner>
</D:lockinfo>"#;

pub(crate) async fn body_text(response: Response) -> String {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Number of `<D:response>` fragments in a multistatus body.
pub(crate) fn response_count(xml: &str) -> usize {
    xml.matches("<D:response>").count()
}
