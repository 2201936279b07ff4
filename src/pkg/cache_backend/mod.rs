/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Key/value cache backends with TTL.
//!
//! One trait, two implementations: an in-memory sharded map with a periodic
//! sweeper and a redis backend behind a process-wide per-URL client pool.

use crate::core::error::Result;
use async_trait::async_trait;
use std::fmt::Debug;
use std::time::{Duration, SystemTime};

pub mod memory;
pub mod redis;

/// Deadline for one detached lazy cache update.
pub const DEFAULT_LAZY_UPDATE_TIMEOUT: Duration = Duration::from_secs(5);

/// TTL handed out for responses served from an expired lazy entry.
pub const EXPIRED_MSG_TTL: u32 = 5;

/// Config sentinel: do not reset the backend's physical expiry on write.
pub const KEEP_TTL: i64 = -1;

/// Physical store TTL for one write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreTtl {
    /// Preserve the entry's existing expiry (redis `KEEPTTL`).
    Keep,
    For(Duration),
}

impl StoreTtl {
    pub fn from_secs(secs: i64) -> StoreTtl {
        if secs == KEEP_TTL {
            StoreTtl::Keep
        } else {
            StoreTtl::For(Duration::from_secs(secs.max(0) as u64))
        }
    }
}

/// One stored entry as returned by `get`.
#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub value: String,
    /// Absolute physical expiry; `None` means the entry does not expire.
    pub expires_at: Option<SystemTime>,
}

/// Key/value store with TTL used by the DNS caches.
///
/// Backend failures are transient: implementations log and report a miss
/// instead of propagating errors into the query path.
#[async_trait]
pub trait CacheBackend: Debug + Send + Sync + 'static {
    async fn get(&self, key: &str) -> Option<StoredEntry>;

    async fn store(&self, key: &str, value: String, ttl: StoreTtl);

    /// Remove entries matching a glob-style pattern (`prefix*`).
    async fn delete(&self, pattern: &str) -> Result<()>;

    async fn len(&self) -> usize;

    /// Stop background work and reject new operations.
    fn close(&self);
}
