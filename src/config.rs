//! CLI arguments and server configuration defaults.

use clap::Parser;
use shadow_rs::formatcp;
use std::time::Duration;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const DEFAULT_API_BASE: &str = "https://api.aliyundrive.com";
pub const DEFAULT_AUTH_BASE: &str = "https://auth.aliyundrive.com";
pub const DEFAULT_AUTH_USER: &str = "admin";
pub const DEFAULT_AUTH_PASS: &str = "123456";
pub const DEFAULT_PORT: u16 = 8085;
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_LOGIN_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_LOGIN_WINDOW_SECS: u64 = 5 * 60;
pub const DEFAULT_LOGIN_LOCKOUT_SECS: u64 = 10 * 60;

/// 分片大小：每个预签名地址承载 10 MiB。
pub const CHUNK_SIZE: u64 = 10 * 1024 * 1024;
/// 秒传探测的下限（不含）。
pub const RAPID_UPLOAD_MIN: u64 = 150 * 1024;
/// 秒传探测的上限（含）。
pub const RAPID_UPLOAD_MAX: u64 = 25 * 1024 * 1024 * 1024;
pub const PRE_HASH_LEN: usize = 1024;
pub const PROOF_LEN: u64 = 8;
/// SHA1 of the empty byte sequence, as the backend expects it.
pub const EMPTY_CONTENT_HASH: &str = "DA39A3EE5E6B4B0D3255BFEF95601890AFD80709";

pub const BACKEND_RETRIES: u32 = 5;
pub const BACKEND_RETRY_DELAY: Duration = Duration::from_secs(5);
pub const RENEW_ATTEMPTS: u32 = 10;
pub const RENEW_DELAY: Duration = Duration::from_secs(5);
pub const TOKEN_EXPIRY_MARGIN_SECS: i64 = 100;

pub const LOCK_PRUNE_INTERVAL_SECS: u64 = 60;
pub const SPOOL_SWEEP_INTERVAL_SECS: u64 = 900;
pub const SPOOL_STALE_SECS: u64 = 24 * 60 * 60;
pub const MAX_XML_BODY: usize = 1024 * 1024;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "drive-dav", version = VERSION_INFO, about = "WebDAV gateway for a cloud drive")]
pub struct Args {
    #[arg(
        short = 'b',
        long,
        env = "DRIVE_DAV_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "DRIVE_DAV_PORT",
        default_value_t = DEFAULT_PORT,
        help = "HTTP port"
    )]
    pub port: u16,
    #[arg(
        long,
        env = "DRIVE_DAV_PREFIX",
        default_value = "/",
        help = "URL prefix stripped from WebDAV paths"
    )]
    pub prefix: String,
    #[arg(
        long,
        env = "DRIVE_DAV_USER",
        default_value = DEFAULT_AUTH_USER,
        help = "Basic auth username"
    )]
    pub auth_user: String,
    #[arg(
        long,
        env = "DRIVE_DAV_PASS",
        default_value = DEFAULT_AUTH_PASS,
        help = "Basic auth password"
    )]
    pub auth_pass: String,
    #[arg(
        short = 'r',
        long,
        env = "DRIVE_DAV_REFRESH_TOKEN",
        help = "Drive refresh token (falls back to the token file)"
    )]
    pub refresh_token: Option<String>,
    #[arg(
        long,
        env = "DRIVE_DAV_TOKEN_FILE",
        help = "Where the rotated refresh token is kept (default .refresh_token_<port>)"
    )]
    pub token_file: Option<String>,
    #[arg(long, help = "Check whether a refresh token is still usable and exit")]
    pub check_token: Option<String>,
    #[arg(
        long,
        env = "DRIVE_DAV_API_BASE",
        default_value = DEFAULT_API_BASE,
        help = "Drive API base url"
    )]
    pub api_base: String,
    #[arg(
        long,
        env = "DRIVE_DAV_AUTH_BASE",
        default_value = DEFAULT_AUTH_BASE,
        help = "Token endpoint base url"
    )]
    pub auth_base: String,
    #[arg(
        long,
        env = "DRIVE_DAV_SPOOL_DIR",
        help = "Directory for upload spool files (default: system temp dir)"
    )]
    pub spool_dir: Option<String>,
    #[arg(
        long,
        env = "DRIVE_DAV_REFRESH_INTERVAL_SECS",
        default_value_t = DEFAULT_REFRESH_INTERVAL_SECS,
        help = "Access token refresh interval in seconds"
    )]
    pub refresh_interval_secs: u64,
    #[arg(long, env = "DRIVE_DAV_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "DRIVE_DAV_BROWSE_DIRS",
        help = "Serve GET on a folder as a Depth: 1 listing"
    )]
    pub browse_dirs: bool,
    #[arg(short = 'v', long, env = "DRIVE_DAV_VERBOSE", help = "Verbose logging")]
    pub verbose: bool,
    #[arg(
        long,
        env = "DRIVE_DAV_LOGIN_MAX_ATTEMPTS",
        default_value_t = DEFAULT_LOGIN_MAX_ATTEMPTS,
        help = "Max failed auth attempts before lockout (0 to disable)"
    )]
    pub login_max_attempts: u32,
    #[arg(
        long,
        env = "DRIVE_DAV_LOGIN_WINDOW_SECS",
        default_value_t = DEFAULT_LOGIN_WINDOW_SECS,
        help = "Failed auth attempt window in seconds"
    )]
    pub login_window_secs: u64,
    #[arg(
        long,
        env = "DRIVE_DAV_LOGIN_LOCKOUT_SECS",
        default_value_t = DEFAULT_LOGIN_LOCKOUT_SECS,
        help = "Lockout time after max failed attempts"
    )]
    pub login_lockout_secs: u64,
}

impl Args {
    /// 刷新令牌持久化文件路径。
    pub fn token_file_path(&self) -> String {
        self.token_file
            .clone()
            .unwrap_or_else(|| format!(".refresh_token_{}", self.port))
    }
}
