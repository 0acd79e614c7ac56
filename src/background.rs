//! 后台任务：令牌定时刷新、锁与登录记录清理、上传暂存目录清理。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, interval, interval_at};
use tracing::{debug, warn};

use crate::auth::{AuthConfig, prune_login_attempts};
use crate::config::{LOCK_PRUNE_INTERVAL_SECS, SPOOL_STALE_SECS, SPOOL_SWEEP_INTERVAL_SECS};
use crate::credentials::CredentialStore;
use crate::drive::TokenRefresher;
use crate::locks::LockTable;
use crate::spool::sweep_stale;

pub struct BackgroundDeps {
    pub credentials: Arc<CredentialStore>,
    pub refresher: Arc<dyn TokenRefresher>,
    pub refresh_interval: Duration,
    pub locks: Arc<LockTable>,
    pub auth: Arc<AuthConfig>,
    pub spool_dir: PathBuf,
}

/// 启动后台任务。启动时已刷新过一次令牌，刷新循环从一个周期之后开始。
pub fn spawn_background_tasks(deps: BackgroundDeps) {
    let BackgroundDeps {
        credentials,
        refresher,
        refresh_interval,
        locks,
        auth,
        spool_dir,
    } = deps;

    if !refresh_interval.is_zero() {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + refresh_interval, refresh_interval);
            loop {
                ticker.tick().await;
                // 失败时保留旧凭据，下个周期再试。
                if let Err(err) = credentials.refresh(refresher.as_ref()).await {
                    warn!(error = %err, "scheduled token refresh failed");
                }
            }
        });
    }

    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(LOCK_PRUNE_INTERVAL_SECS));
        loop {
            ticker.tick().await;
            let pruned = locks.prune();
            if pruned > 0 {
                debug!(pruned, "expired locks removed");
            }
            prune_login_attempts(&auth).await;
        }
    });

    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(SPOOL_SWEEP_INTERVAL_SECS));
        let ttl = Duration::from_secs(SPOOL_STALE_SECS);
        loop {
            ticker.tick().await;
            match sweep_stale(&spool_dir, ttl).await {
                Ok(0) => {}
                Ok(removed) => debug!(removed, "spool sweep finished"),
                Err(err) => warn!(error = %err, dir = ?spool_dir, "spool sweep failed"),
            }
        }
    });
}
