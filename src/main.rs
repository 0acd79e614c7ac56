//! drive-dav server binary.
//!
//! Exposes an ID-addressed cloud drive as a WebDAV share. The main entry
//! point refreshes drive credentials, builds the Axum router with Basic
//! authentication in front of the WebDAV dispatcher, and serves it until a
//! termination signal arrives.

mod auth;
mod background;
mod cache;
mod config;
mod credentials;
mod dav;
mod drive;
mod error;
mod etag;
mod http;
mod locks;
mod logging;
mod resolver;
mod spool;
mod upload;

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::response::Response;
use axum::routing::any;
use axum::{Router, middleware};
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span};

use crate::auth::AuthConfig;
use crate::background::{BackgroundDeps, spawn_background_tasks};
use crate::cache::IdentityCache;
use crate::config::Args;
use crate::credentials::{CredentialStore, DriveConfig, load_refresh_token};
use crate::dav::{DavConfig, DavHandler};
use crate::drive::{AliyunDrive, TokenRefresher};
use crate::http::{build_cors_layer, resolve_client_ip};
use crate::locks::LockTable;
use crate::resolver::PathResolver;
use crate::upload::{UploadConfig, UploadEngine};

shadow!(build);

/// Starts the gateway and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), io::Error> {
    let args = Args::parse();
    logging::init_logging(args.verbose);

    if let Some(token) = args.check_token.as_deref() {
        return check_token(&args, token).await;
    }

    let token_file = PathBuf::from(args.token_file_path());
    let refresh_token = load_refresh_token(args.refresh_token.as_deref(), &token_file)
        .await?
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "no refresh token: pass --refresh-token or write one to {}",
                    token_file.display()
                ),
            )
        })?;
    let credentials = Arc::new(CredentialStore::new(
        DriveConfig::unrefreshed(refresh_token),
        Some(token_file),
    ));
    let drive = Arc::new(AliyunDrive::new(
        args.api_base.as_str(),
        args.auth_base.as_str(),
        credentials.clone(),
    ));
    let refresher: Arc<dyn TokenRefresher> = drive.clone();
    let snapshot = credentials
        .refresh(refresher.as_ref())
        .await
        .map_err(|err| io::Error::other(format!("initial token refresh failed: {err}")))?;
    info!(drive_id = %snapshot.drive_id, "drive credentials ready");

    let spool_dir = args
        .spool_dir
        .as_deref()
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    tokio::fs::create_dir_all(&spool_dir).await?;

    let cache = Arc::new(IdentityCache::new());
    let locks = Arc::new(LockTable::new());
    let dav_handler = Arc::new(DavHandler::new(
        DavConfig {
            prefix: args.prefix.clone(),
            browse_dirs: args.browse_dirs,
        },
        PathResolver::new(cache.clone(), drive.clone()),
        UploadEngine::new(drive.clone(), cache, UploadConfig::new(spool_dir.clone())),
        locks.clone(),
        credentials.clone(),
        refresher.clone(),
    ));
    let auth_config = Arc::new(AuthConfig::new(
        args.auth_user.clone(),
        args.auth_pass.clone(),
        args.login_max_attempts,
        Duration::from_secs(args.login_window_secs),
        Duration::from_secs(args.login_lockout_secs),
    ));

    let app = Router::new()
        .route("/", any(dav_entry))
        .route("/{*path}", any(dav_entry))
        .layer(DefaultBodyLimit::disable())
        .layer(middleware::from_fn(auth::auth_middleware))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.ip());
                    let client_ip = resolve_client_ip(request.headers(), connect_ip)
                        .map(|ip| ip.to_string())
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = %request.method(),
                        path = request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(auth_config.clone()))
        .layer(Extension(dav_handler))
        .layer(build_cors_layer(args.cors_origins.as_deref()));

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err.to_string()))?;
    let addr = SocketAddr::new(host, args.port);
    let handle = Handle::new();

    info!(prefix = %args.prefix, "🚀 Starting WebDAV server at {}", addr);

    let server = axum_server::bind(addr)
        .handle(handle.clone())
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());

    spawn_background_tasks(BackgroundDeps {
        credentials,
        refresher,
        refresh_interval: Duration::from_secs(args.refresh_interval_secs),
        locks,
        auth: auth_config,
        spool_dir,
    });
    tokio::select! {
        result = server => result?,
        _ = shutdown_signal(handle) => {}
    }

    Ok(())
}

async fn dav_entry(
    Extension(dav): Extension<Arc<DavHandler>>,
    request: Request<Body>,
) -> Response {
    dav.handle(request).await
}

/// `--check-token`：换取一次访问令牌并报告结果，不写令牌文件。
async fn check_token(args: &Args, token: &str) -> Result<(), io::Error> {
    let credentials = Arc::new(CredentialStore::new(DriveConfig::unrefreshed(token), None));
    let drive = AliyunDrive::new(args.api_base.as_str(), args.auth_base.as_str(), credentials);
    match drive.refresh(token.trim()).await {
        Ok(grant) => {
            println!("refresh token is valid");
            println!("drive_id: {}", grant.default_drive_id);
            println!("expires_in: {}s", grant.expires_in);
            println!("rotated refresh_token: {}", grant.refresh_token);
            Ok(())
        }
        Err(err) => Err(io::Error::other(format!("refresh token rejected: {err}"))),
    }
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
