//! Basic 认证中间件与按客户端 IP 的失败锁定。

use axum::body::Body;
use axum::extract::{Extension, connect_info::ConnectInfo};
use axum::http::{HeaderMap, HeaderValue, Request, header};
use axum::middleware::Next;
use axum::response::Response;
use axum_extra::TypedHeader;
use axum_extra::headers::{Authorization, authorization::Basic};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::DavError;
use crate::http::resolve_client_ip;

const REALM: &str = r#"Basic realm="drive-dav""#;

#[derive(Debug)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
    pub login_attempts: Mutex<HashMap<IpAddr, LoginAttempt>>,
    pub login_window: Duration,
    pub login_max_attempts: u32,
    pub login_lockout: Duration,
}

#[derive(Debug)]
pub struct LoginAttempt {
    pub window_start: Instant,
    pub failures: u32,
    pub locked_until: Option<Instant>,
}

impl AuthConfig {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        login_max_attempts: u32,
        login_window: Duration,
        login_lockout: Duration,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            login_attempts: Mutex::new(HashMap::new()),
            login_window,
            login_max_attempts,
            login_lockout,
        }
    }

    fn accepts(&self, credentials: &Basic) -> bool {
        credentials.username() == self.username && credentials.password() == self.password
    }
}

/// 认证中间件：每个请求都要带正确的 Basic 凭据。
///
/// 只有带了错误凭据的请求才计入失败次数；未带凭据的请求只收到质询。
pub async fn auth_middleware(
    Extension(auth): Extension<Arc<AuthConfig>>,
    auth_header: Option<TypedHeader<Authorization<Basic>>>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, DavError> {
    let connect_ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let client_ip = resolve_client_ip(req.headers(), connect_ip);

    if let Some(ip) = client_ip
        && let Some(retry_after) = check_login_rate_limit(&auth, ip).await
    {
        debug!(client_ip = %ip, retry_after, "request rejected during lockout");
        return Err(DavError::TooManyRequests(retry_after));
    }

    if let Some(TypedHeader(Authorization(credentials))) = auth_header {
        if auth.accepts(&credentials) {
            if let Some(ip) = client_ip {
                clear_login_failures(&auth, ip).await;
            }
            return Ok(next.run(req).await);
        }
        warn!(client_ip = ?client_ip, user = credentials.username(), "bad credentials");
        if let Some(ip) = client_ip {
            register_login_failure(&auth, ip).await;
        }
    }

    let mut headers = HeaderMap::new();
    headers.insert(header::WWW_AUTHENTICATE, HeaderValue::from_static(REALM));
    Err(DavError::Unauthorized(headers))
}

/// 处于锁定期时返回剩余秒数。
async fn check_login_rate_limit(auth: &AuthConfig, ip: IpAddr) -> Option<u64> {
    if auth.login_max_attempts == 0 {
        return None;
    }

    let mut attempts = auth.login_attempts.lock().await;
    let now = Instant::now();
    let entry = attempts.get_mut(&ip)?;

    if let Some(locked_until) = entry.locked_until {
        if now < locked_until {
            return Some(locked_until.saturating_duration_since(now).as_secs().max(1));
        }
        entry.locked_until = None;
        entry.failures = 0;
        entry.window_start = now;
    }

    if now.duration_since(entry.window_start) > auth.login_window {
        entry.window_start = now;
        entry.failures = 0;
    }

    None
}

async fn register_login_failure(auth: &AuthConfig, ip: IpAddr) {
    if auth.login_max_attempts == 0 {
        return;
    }

    let mut attempts = auth.login_attempts.lock().await;
    let now = Instant::now();
    let entry = attempts.entry(ip).or_insert(LoginAttempt {
        window_start: now,
        failures: 0,
        locked_until: None,
    });

    if now.duration_since(entry.window_start) > auth.login_window {
        entry.window_start = now;
        entry.failures = 0;
        entry.locked_until = None;
    }

    entry.failures = entry.failures.saturating_add(1);
    if entry.failures >= auth.login_max_attempts {
        entry.locked_until = Some(now + auth.login_lockout);
        warn!(client_ip = %ip, "login locked out");
    }
}

async fn clear_login_failures(auth: &AuthConfig, ip: IpAddr) {
    let mut attempts = auth.login_attempts.lock().await;
    attempts.remove(&ip);
}

/// 清理过期的登录失败记录。
pub async fn prune_login_attempts(auth: &AuthConfig) {
    let mut attempts = auth.login_attempts.lock().await;
    let now = Instant::now();
    attempts.retain(|_, entry| {
        if let Some(locked_until) = entry.locked_until {
            return locked_until > now;
        }
        now.duration_since(entry.window_start) <= auth.login_window
    });
}
