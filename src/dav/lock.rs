//! LOCK 与 UNLOCK。

use axum::body::Body;
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::headers::{Depth, InvalidHeader, parse_depth, parse_if, parse_lock_token, parse_timeout};
use super::props::activelock_xml;
use super::xml::{lock_response, parse_lockinfo};
use super::{DavHandler, VirtualPath, XML_CONTENT_TYPE, header_value, is_darwin, read_xml_body};
use crate::drive::ObjectMetadata;
use crate::error::DavError;
use crate::locks::{ActiveLock, LockDetails, LockError};

impl DavHandler {
    pub(super) async fn handle_lock(
        &self,
        parts: &Parts,
        path: &VirtualPath,
        body: Body,
    ) -> Result<Response, DavError> {
        let duration = parse_timeout(&parts.headers)?;
        let body = read_xml_body(body).await?;
        let Some(info) = parse_lockinfo(&body)? else {
            return self.refresh_lock(parts, duration).await;
        };
        if !info.exclusive || !info.write {
            return Err(DavError::NotImplemented);
        }
        let depth = parse_depth(&parts.headers, Depth::Infinity)?;
        if depth == Depth::One {
            return Err(DavError::BadRequest);
        }

        let mut owner_xml = info.owner_xml;
        if is_darwin(parts) {
            // Finder 复用同一个 owner，加毫秒后缀区分。
            owner_xml.push_str(&Utc::now().timestamp_millis().to_string());
        }
        let details = LockDetails {
            root: path.clone(),
            duration,
            owner_xml,
            zero_depth: depth == Depth::Zero,
        };
        let token = self.locks.create(details.clone())?;
        let target = match self.lock_target(path).await {
            Ok(target) => target,
            Err(err) => {
                if let Err(unlock_err) = self.locks.unlock(&token) {
                    warn!(token, error = %unlock_err, "failed to drop lock after error");
                }
                return Err(err);
            }
        };
        let created = target.is_none();
        info!(path = %path, token, created, zero_depth = details.zero_depth, "lock granted");

        let is_folder = target.as_ref().is_some_and(ObjectMetadata::is_folder);
        let lock = ActiveLock {
            token: token.clone(),
            details,
            remaining: duration,
        };
        let xml = lock_response(&[activelock_xml(&lock, &self.href(path, is_folder))]);

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(XML_CONTENT_TYPE));
        headers.insert("lock-token", header_value(&format!("<{token}>"))?);
        let status = if created {
            StatusCode::CREATED
        } else {
            StatusCode::OK
        };
        Ok((status, headers, xml).into_response())
    }

    /// The locked resource, or `None` when the lock was taken on an unmapped
    /// name. Nothing is created remotely in that case.
    async fn lock_target(&self, path: &VirtualPath) -> Result<Option<ObjectMetadata>, DavError> {
        if path.is_root() {
            return Ok(Some(ObjectMetadata::root()));
        }
        self.existing_parent(path).await?;
        self.lookup(path).await
    }

    /// 空请求体的 LOCK：按 If 头里唯一的令牌续期。
    async fn refresh_lock(
        &self,
        parts: &Parts,
        duration: Option<Duration>,
    ) -> Result<Response, DavError> {
        let raw = parts
            .headers
            .get("if")
            .and_then(|value| value.to_str().ok())
            .ok_or(InvalidHeader("If"))?;
        let lists = parse_if(raw).ok_or(InvalidHeader("If"))?;
        let token = match lists.as_slice() {
            [list] => match list.conditions.as_slice() {
                [condition] => condition.token.clone(),
                _ => None,
            },
            _ => None,
        }
        .ok_or(DavError::BadRequest)?;

        let details = self.locks.refresh(&token, duration)?;
        debug!(token, path = %details.root, ?duration, "lock refreshed");
        let is_folder = self
            .lookup(&details.root)
            .await
            .ok()
            .flatten()
            .is_some_and(|meta| meta.is_folder());
        let href = self.href(&details.root, is_folder);
        let lock = ActiveLock {
            token,
            details,
            remaining: duration,
        };
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(XML_CONTENT_TYPE));
        Ok((
            StatusCode::OK,
            headers,
            lock_response(&[activelock_xml(&lock, &href)]),
        )
            .into_response())
    }

    pub(super) async fn handle_unlock(
        &self,
        parts: &Parts,
        path: &VirtualPath,
    ) -> Result<Response, DavError> {
        let token = parse_lock_token(&parts.headers).ok_or(InvalidHeader("Lock-Token"))?;
        if let Some(root) = self.locks.root_of(&token)
            && !path.is_within(&root)
        {
            return Err(DavError::Forbidden);
        }
        match self.locks.unlock(&token) {
            Ok(()) => {
                info!(path = %path, token, "lock released");
                Ok(StatusCode::NO_CONTENT.into_response())
            }
            Err(LockError::NoSuchLock) => Err(DavError::Conflict),
            Err(err) => Err(err.into()),
        }
    }
}
