//! WebDAV 内存锁表，支持超时清理。

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::dav::VirtualPath;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    #[error("resource is locked")]
    Locked,
    #[error("no such lock")]
    NoSuchLock,
    #[error("lock confirmation failed")]
    ConfirmationFailed,
    #[error("lock token does not cover the resource")]
    Forbidden,
}

/// 锁的描述信息。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockDetails {
    pub root: VirtualPath,
    /// `None` 表示永不超时。
    pub duration: Option<Duration>,
    /// Inner XML of the client's `<owner>` element.
    pub owner_xml: String,
    pub zero_depth: bool,
}

/// 锁发现结果。
#[derive(Clone, Debug)]
pub struct ActiveLock {
    pub token: String,
    pub details: LockDetails,
    pub remaining: Option<Duration>,
}

/// One `If` header condition. Only a plain lock token takes part in lock
/// confirmation; `Not` and etag conditions never match a lock.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Condition {
    pub not: bool,
    pub token: Option<String>,
    pub etag: Option<String>,
}

#[derive(Debug)]
struct LockNode {
    details: LockDetails,
    expires_at: Option<Instant>,
    held: bool,
}

impl LockNode {
    fn expired(&self, now: Instant) -> bool {
        !self.held && self.expires_at.is_some_and(|at| at <= now)
    }

    fn covers(&self, path: &VirtualPath) -> bool {
        let root = &self.details.root;
        root == path || (!self.details.zero_depth && path.is_within(root))
    }
}

/// 进程内锁表（带超时清理）。
///
/// 按令牌分片存放锁，另以锁根路径为键登记令牌；一个路径同一时刻只能是一把锁的根。
#[derive(Debug, Default)]
pub struct LockTable {
    locks: DashMap<String, LockNode>,
    roots: DashMap<VirtualPath, String>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 创建锁并返回令牌。
    ///
    /// 先登记根路径再检查祖先与后代；两个并发的冲突请求至少有一个会看到对方。
    pub fn create(&self, details: LockDetails) -> Result<String, LockError> {
        let now = Instant::now();
        self.prune_expired(now);
        let token = Uuid::new_v4().urn().to_string();
        let root = details.root.clone();
        let zero_depth = details.zero_depth;
        match self.roots.entry(root.clone()) {
            Entry::Occupied(_) => {
                debug!(path = %root, "lock conflict on root");
                return Err(LockError::Locked);
            }
            Entry::Vacant(slot) => {
                self.locks.insert(
                    token.clone(),
                    LockNode {
                        expires_at: details.duration.map(|d| now + d),
                        details,
                        held: false,
                    },
                );
                slot.insert(token.clone());
            }
        }
        if self.conflicts(&root, zero_depth) {
            debug!(path = %root, "lock conflict with ancestor or descendant");
            self.forget(&token, &root);
            return Err(LockError::Locked);
        }
        debug!(path = %root, token, zero_depth, "lock created");
        Ok(token)
    }

    pub fn refresh(
        &self,
        token: &str,
        duration: Option<Duration>,
    ) -> Result<LockDetails, LockError> {
        let now = Instant::now();
        self.prune_expired(now);
        let mut node = self.locks.get_mut(token).ok_or(LockError::NoSuchLock)?;
        if node.held {
            return Err(LockError::Locked);
        }
        node.details.duration = duration;
        node.expires_at = duration.map(|d| now + d);
        Ok(node.details.clone())
    }

    pub fn unlock(&self, token: &str) -> Result<(), LockError> {
        self.prune_expired(Instant::now());
        let (_, node) = self
            .locks
            .remove_if(token, |_, node| !node.held)
            .ok_or_else(|| {
                if self.locks.contains_key(token) {
                    LockError::Locked
                } else {
                    LockError::NoSuchLock
                }
            })?;
        self.roots
            .remove_if(&node.details.root, |_, owner| owner == token);
        Ok(())
    }

    /// Root of the lock named by `token`, if it is alive.
    pub fn root_of(&self, token: &str) -> Option<VirtualPath> {
        let now = Instant::now();
        self.locks
            .get(token)
            .filter(|node| !node.expired(now))
            .map(|node| node.details.root.clone())
    }

    /// 校验 If 条件能覆盖 `src` 与 `dst`，成功后占用对应的锁直到 [`release`](Self::release)。
    pub fn confirm(
        &self,
        src: Option<&VirtualPath>,
        dst: Option<&VirtualPath>,
        conditions: &[Condition],
    ) -> Result<Vec<String>, LockError> {
        let now = Instant::now();
        let mut held = Vec::new();
        for path in [src, dst].into_iter().flatten() {
            let reused = held.iter().any(|token: &String| {
                self.locks.get(token).is_some_and(|node| node.covers(path))
            });
            if reused {
                continue;
            }
            match self.claim(path, conditions, now) {
                Some(token) => held.push(token),
                None => {
                    self.release(&held);
                    return Err(LockError::ConfirmationFailed);
                }
            }
        }
        Ok(held)
    }

    /// 释放 [`confirm`](Self::confirm) 占用的锁。
    pub fn release(&self, tokens: &[String]) {
        for token in tokens {
            match self.locks.get_mut(token) {
                Some(mut node) => node.held = false,
                None => debug!(token, "released lock already gone"),
            }
        }
    }

    /// 删除临时锁。
    pub fn remove(&self, tokens: &[String]) {
        for token in tokens {
            if let Some((_, node)) = self.locks.remove(token) {
                self.roots
                    .remove_if(&node.details.root, |_, owner| owner == token);
            }
        }
    }

    /// Locks that apply to `path`: its own and infinite-depth ancestors'.
    pub fn discover(&self, path: &VirtualPath) -> Vec<ActiveLock> {
        let now = Instant::now();
        self.locks
            .iter()
            .filter(|entry| !entry.expired(now) && entry.covers(path))
            .map(|entry| ActiveLock {
                token: entry.key().clone(),
                details: entry.details.clone(),
                remaining: entry.expires_at.map(|at| at.saturating_duration_since(now)),
            })
            .collect()
    }

    /// 删除 `path` 及其后代上的所有锁。
    pub fn remove_tree(&self, path: &VirtualPath) {
        self.roots.retain(|root, _| !root.is_within(path));
        self.locks
            .retain(|_, node| !node.details.root.is_within(path));
    }

    /// 清理过期锁，返回清理数量。
    pub fn prune(&self) -> usize {
        self.prune_expired(Instant::now())
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    fn prune_expired(&self, now: Instant) -> usize {
        let mut expired = Vec::new();
        self.locks.retain(|token, node| {
            if node.expired(now) {
                expired.push((token.clone(), node.details.root.clone()));
                return false;
            }
            true
        });
        for (token, root) in &expired {
            self.roots.remove_if(root, |_, owner| owner == token);
        }
        expired.len()
    }

    /// An infinite-depth lock above `root`, or any lock below it when the
    /// new lock is infinite.
    fn conflicts(&self, root: &VirtualPath, zero_depth: bool) -> bool {
        let mut ancestor = root.parent();
        while let Some(path) = ancestor {
            let owner = self.roots.get(&path).map(|token| token.clone());
            if let Some(owner) = owner
                && self
                    .locks
                    .get(&owner)
                    .is_some_and(|node| !node.details.zero_depth)
            {
                return true;
            }
            ancestor = path.parent();
        }
        !zero_depth
            && self
                .roots
                .iter()
                .any(|entry| entry.key() != root && entry.key().is_within(root))
    }

    /// 占用第一个能覆盖 `path` 的空闲锁。
    fn claim(&self, path: &VirtualPath, conditions: &[Condition], now: Instant) -> Option<String> {
        for condition in conditions {
            if condition.not {
                continue;
            }
            let Some(token) = condition.token.as_deref() else {
                continue;
            };
            let Some(mut node) = self.locks.get_mut(token) else {
                continue;
            };
            if node.held || node.expired(now) || !node.covers(path) {
                continue;
            }
            node.held = true;
            return Some(token.to_string());
        }
        None
    }

    fn forget(&self, token: &str, root: &VirtualPath) {
        self.locks.remove(token);
        self.roots.remove_if(root, |_, owner| owner == token);
    }
}

/// Locks taken for the duration of one request; released on drop.
pub struct LockGuard {
    table: Arc<LockTable>,
    tokens: Vec<String>,
    temporary: bool,
}

impl LockGuard {
    /// 由 If 条件确认而占用的锁。
    pub fn held(table: Arc<LockTable>, tokens: Vec<String>) -> Self {
        Self {
            table,
            tokens,
            temporary: false,
        }
    }

    /// 没有 If 头时为本次请求临时创建的锁。
    pub fn temporary(table: Arc<LockTable>, tokens: Vec<String>) -> Self {
        Self {
            table,
            tokens,
            temporary: true,
        }
    }

    /// 立即释放，等同于 drop。
    pub fn release(self) {}
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.temporary {
            self.table.remove(&self.tokens);
        } else {
            self.table.release(&self.tokens);
        }
    }
}
