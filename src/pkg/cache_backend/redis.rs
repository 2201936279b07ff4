/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Redis cache backend.
//!
//! Connections are pooled per URL for the whole process; every operation is
//! bounded by the configured client timeout and failures degrade to cache
//! misses.

use crate::core::error::{DnsError, Result};
use crate::pkg::cache_backend::{CacheBackend, StoreTtl, StoredEntry};
use async_trait::async_trait;
use dashmap::DashMap;
use lazy_static::lazy_static;
use redis::aio::ConnectionManager;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};
use tracing::warn;

pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(1);

lazy_static! {
    static ref POOLS: DashMap<String, ConnectionManager> = DashMap::new();
}

/// Drop the shared per-URL connection pool entry.
fn forget_pool(url: &str) {
    POOLS.remove(url);
}

pub struct RedisBackend {
    url: String,
    conn: ConnectionManager,
    timeout: Duration,
    closed: AtomicBool,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("url", &self.url)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl RedisBackend {
    /// Connect to `url`, reusing the process-wide client for that URL.
    pub async fn connect(url: &str, timeout: Duration) -> Result<RedisBackend> {
        let conn = match POOLS.get(url) {
            Some(existing) => existing.clone(),
            None => {
                let client = redis::Client::open(url)
                    .map_err(|e| DnsError::config(format!("invalid redis url '{}': {}", url, e)))?;
                let manager = ConnectionManager::new(client).await?;
                POOLS.insert(url.to_string(), manager.clone());
                manager
            }
        };

        Ok(RedisBackend {
            url: url.to_string(),
            conn,
            timeout,
            closed: AtomicBool::new(false),
        })
    }

    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> Option<T>
    where
        F: std::future::Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(v)) => Some(v),
            Ok(Err(e)) => {
                warn!(op, error = %e, "redis operation failed");
                None
            }
            Err(_) => {
                warn!(op, timeout_ms = self.timeout.as_millis() as u64, "redis operation timed out");
                None
            }
        }
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn get(&self, key: &str) -> Option<StoredEntry> {
        if self.closed.load(Ordering::Relaxed) {
            return None;
        }

        let mut conn = self.conn.clone();
        let key = key.to_string();
        let result: Option<(Option<String>, i64)> = self
            .bounded("get", async move {
                let value: Option<String> =
                    redis::cmd("GET").arg(&key).query_async(&mut conn).await?;
                let pttl: i64 = redis::cmd("PTTL").arg(&key).query_async(&mut conn).await?;
                Ok((value, pttl))
            })
            .await;

        let (value, pttl) = result?;
        let value = value?;
        // PTTL < 0 means no expiry (-1) or a raced removal (-2).
        let expires_at = if pttl >= 0 {
            Some(SystemTime::now() + Duration::from_millis(pttl as u64))
        } else {
            None
        };
        Some(StoredEntry { value, expires_at })
    }

    async fn store(&self, key: &str, value: String, ttl: StoreTtl) {
        if self.closed.load(Ordering::Relaxed) {
            return;
        }

        let mut conn = self.conn.clone();
        let key = key.to_string();
        self.bounded::<(), _>("set", async move {
            let mut cmd = redis::cmd("SET");
            cmd.arg(&key).arg(&value);
            match ttl {
                StoreTtl::Keep => {
                    cmd.arg("KEEPTTL");
                }
                StoreTtl::For(d) => {
                    let millis = d.as_millis().max(1) as u64;
                    cmd.arg("PX").arg(millis);
                }
            }
            cmd.query_async(&mut conn).await
        })
        .await;
    }

    async fn delete(&self, pattern: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let pattern = pattern.to_string();
        let deleted = self
            .bounded::<(), _>("delete", async move {
                let keys: Vec<String> =
                    redis::cmd("KEYS").arg(&pattern).query_async(&mut conn).await?;
                if keys.is_empty() {
                    return Ok(());
                }
                let mut cmd = redis::cmd("DEL");
                for key in &keys {
                    cmd.arg(key);
                }
                cmd.query_async(&mut conn).await
            })
            .await;

        match deleted {
            Some(()) => Ok(()),
            None => Err(DnsError::plugin("redis delete failed")),
        }
    }

    async fn len(&self) -> usize {
        let mut conn = self.conn.clone();
        self.bounded::<i64, _>("dbsize", async move {
            redis::cmd("DBSIZE").query_async(&mut conn).await
        })
        .await
        .unwrap_or(0)
        .max(0) as usize
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::Relaxed) {
            forget_pool(&self.url);
        }
    }
}
