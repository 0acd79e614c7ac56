//! 访问凭据快照：刷新时整体替换，读者只会看到完整的旧值或新值。

use arc_swap::ArcSwap;
use chrono::Utc;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::TOKEN_EXPIRY_MARGIN_SECS;
use crate::drive::{DriveResult, TokenGrant, TokenRefresher};

/// Immutable credential snapshot shared by every in-flight request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DriveConfig {
    pub access_token: String,
    pub refresh_token: String,
    pub drive_id: String,
    /// Unix seconds.
    pub expires_at: i64,
}

impl DriveConfig {
    pub fn from_grant(grant: TokenGrant, now: i64) -> Self {
        Self {
            access_token: grant.access_token,
            refresh_token: grant.refresh_token,
            drive_id: grant.default_drive_id,
            expires_at: now + grant.expires_in,
        }
    }

    /// 启动时只有刷新令牌，访问令牌视为已过期。
    pub fn unrefreshed(refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: String::new(),
            refresh_token: refresh_token.into(),
            drive_id: String::new(),
            expires_at: 0,
        }
    }

    pub fn expires_within(&self, now: i64, margin_secs: i64) -> bool {
        self.expires_at - margin_secs <= now
    }
}

pub struct CredentialStore {
    current: ArcSwap<DriveConfig>,
    token_file: Option<PathBuf>,
    refresh_lock: Mutex<()>,
}

impl CredentialStore {
    pub fn new(config: DriveConfig, token_file: Option<PathBuf>) -> Self {
        Self {
            current: ArcSwap::from_pointee(config),
            token_file,
            refresh_lock: Mutex::new(()),
        }
    }

    /// 当前凭据快照。
    pub fn snapshot(&self) -> Arc<DriveConfig> {
        self.current.load_full()
    }

    /// 快到期时先刷新，再返回可用快照。
    pub async fn ensure_fresh(
        &self,
        refresher: &dyn TokenRefresher,
    ) -> DriveResult<Arc<DriveConfig>> {
        let seen = self.snapshot();
        if !seen.expires_within(Utc::now().timestamp(), TOKEN_EXPIRY_MARGIN_SECS) {
            return Ok(seen);
        }
        self.refresh_from(seen, refresher).await
    }

    /// 无条件刷新（定时任务使用）。
    pub async fn refresh(&self, refresher: &dyn TokenRefresher) -> DriveResult<Arc<DriveConfig>> {
        self.refresh_from(self.snapshot(), refresher).await
    }

    async fn refresh_from(
        &self,
        seen: Arc<DriveConfig>,
        refresher: &dyn TokenRefresher,
    ) -> DriveResult<Arc<DriveConfig>> {
        let _guard = self.refresh_lock.lock().await;
        // Refresh tokens rotate: a concurrent refresh already consumed `seen`.
        let current = self.snapshot();
        if !Arc::ptr_eq(&current, &seen) {
            return Ok(current);
        }

        let grant = refresher.refresh(&seen.refresh_token).await?;
        let next = Arc::new(DriveConfig::from_grant(grant, Utc::now().timestamp()));
        self.current.store(next.clone());
        info!(drive_id = %next.drive_id, expires_at = next.expires_at, "access token refreshed");
        self.persist(&next.refresh_token).await;
        Ok(next)
    }

    async fn persist(&self, refresh_token: &str) {
        let Some(path) = &self.token_file else {
            return;
        };
        if let Err(err) = fs::write(path, refresh_token).await {
            warn!(path = ?path, error = %err, "failed to persist refresh token");
        }
    }
}

/// 读取启动用的刷新令牌：命令行优先，其次是令牌文件。
pub async fn load_refresh_token(arg: Option<&str>, path: &Path) -> io::Result<Option<String>> {
    if let Some(token) = arg.map(str::trim).filter(|token| !token.is_empty()) {
        return Ok(Some(token.to_string()));
    }
    match fs::read_to_string(path).await {
        Ok(content) => {
            let token = content.trim();
            Ok((!token.is_empty()).then(|| token.to_string()))
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}
