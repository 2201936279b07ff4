/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! In-memory cache backend.
//!
//! A sharded concurrent map plus a periodic sweeper that discards expired
//! entries. Expired entries are also dropped lazily on read, so the sweeper
//! interval only bounds memory, not correctness.

use crate::core::error::Result;
use crate::pkg::cache_backend::{CacheBackend, StoreTtl, StoredEntry};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};
use tracing::debug;

const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug)]
struct Elem {
    value: String,
    expires_at: Option<SystemTime>,
}

#[derive(Debug)]
pub struct MemoryBackend {
    map: Arc<DashMap<String, Elem>>,
    closed: Arc<AtomicBool>,
    sweep_interval: Duration,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_sweep_interval(DEFAULT_SWEEP_INTERVAL)
    }

    pub fn with_sweep_interval(sweep_interval: Duration) -> Self {
        MemoryBackend {
            map: Arc::new(DashMap::new()),
            closed: Arc::new(AtomicBool::new(false)),
            sweep_interval,
        }
    }

    /// Start the background sweeper. Must run inside a tokio runtime.
    pub fn start_sweeper(&self) {
        let map = self.map.clone();
        let closed = self.closed.clone();
        let interval = self.sweep_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if closed.load(Ordering::Relaxed) {
                    return;
                }
                let now = SystemTime::now();
                let before = map.len();
                map.retain(|_, elem| match elem.expires_at {
                    Some(at) => at > now,
                    None => true,
                });
                let swept = before.saturating_sub(map.len());
                if swept > 0 {
                    debug!(swept, "memory cache sweep");
                }
            }
        });
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Option<StoredEntry> {
        if self.closed.load(Ordering::Relaxed) {
            return None;
        }
        let expired = match self.map.get(key) {
            None => return None,
            Some(elem) => match elem.expires_at {
                Some(at) if at <= SystemTime::now() => true,
                _ => {
                    return Some(StoredEntry {
                        value: elem.value.clone(),
                        expires_at: elem.expires_at,
                    });
                }
            },
        };
        if expired {
            self.map.remove(key);
        }
        None
    }

    async fn store(&self, key: &str, value: String, ttl: StoreTtl) {
        if self.closed.load(Ordering::Relaxed) {
            return;
        }
        let expires_at = match ttl {
            StoreTtl::For(d) => Some(SystemTime::now() + d),
            StoreTtl::Keep => {
                // Preserve the previous physical expiry, if any.
                self.map.get(key).and_then(|elem| elem.expires_at)
            }
        };
        self.map.insert(key.to_string(), Elem { value, expires_at });
    }

    async fn delete(&self, pattern: &str) -> Result<()> {
        if let Some(prefix) = pattern.strip_suffix('*') {
            self.map.retain(|k, _| !k.starts_with(prefix));
        } else {
            self.map.remove(pattern);
        }
        Ok(())
    }

    async fn len(&self) -> usize {
        self.map.len()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_get_roundtrip() {
        let backend = MemoryBackend::new();
        backend
            .store("k", "v".to_string(), StoreTtl::For(Duration::from_secs(60)))
            .await;

        let entry = backend.get("k").await.unwrap();
        assert_eq!(entry.value, "v");
        assert!(entry.expires_at.is_some());
        assert_eq!(backend.len().await, 1);
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss() {
        let backend = MemoryBackend::new();
        backend
            .store("k", "v".to_string(), StoreTtl::For(Duration::ZERO))
            .await;

        assert!(backend.get("k").await.is_none());
        // The lazy read-side drop also removed the entry.
        assert_eq!(backend.len().await, 0);
    }

    #[tokio::test]
    async fn test_keep_ttl_preserves_expiry() {
        let backend = MemoryBackend::new();
        backend
            .store("k", "v1".to_string(), StoreTtl::For(Duration::from_secs(3600)))
            .await;
        let first = backend.get("k").await.unwrap().expires_at;

        backend.store("k", "v2".to_string(), StoreTtl::Keep).await;
        let entry = backend.get("k").await.unwrap();
        assert_eq!(entry.value, "v2");
        assert_eq!(entry.expires_at, first);
    }

    #[tokio::test]
    async fn test_delete_pattern() {
        let backend = MemoryBackend::new();
        backend
            .store("p:a", "1".to_string(), StoreTtl::For(Duration::from_secs(60)))
            .await;
        backend
            .store("p:b", "2".to_string(), StoreTtl::For(Duration::from_secs(60)))
            .await;
        backend
            .store("q:c", "3".to_string(), StoreTtl::For(Duration::from_secs(60)))
            .await;

        backend.delete("p:*").await.unwrap();
        assert_eq!(backend.len().await, 1);
        assert!(backend.get("q:c").await.is_some());
    }

    #[tokio::test]
    async fn test_close_rejects_operations() {
        let backend = MemoryBackend::new();
        backend.close();
        backend
            .store("k", "v".to_string(), StoreTtl::For(Duration::from_secs(60)))
            .await;
        assert!(backend.get("k").await.is_none());
    }
}
