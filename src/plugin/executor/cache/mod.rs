/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! DNS response cache plugins.
//!
//! `memory_cache` and `redis_cache` share one engine: a recursive executable
//! that probes the cache before running the rest of the chain and stores the
//! chain's response afterwards. Expired entries inside a longer physical TTL
//! window are served stale with a short TTL while a single-flight background
//! task refreshes them.

pub mod codec;

use crate::config::types::PluginConfig;
use crate::continue_next;
use crate::core::context::DnsContext;
use crate::core::dns_utils::{minimal_ttl, set_ttl, subtract_ttl};
use crate::core::error::{DnsError, Result};
use crate::pkg::cache_backend::memory::MemoryBackend;
use crate::pkg::cache_backend::redis::{DEFAULT_CLIENT_TIMEOUT, RedisBackend};
use crate::pkg::cache_backend::{
    CacheBackend, DEFAULT_LAZY_UPDATE_TIMEOUT, EXPIRED_MSG_TTL, KEEP_TTL, StoreTtl,
};
use crate::pkg::singleflight::SingleFlight;
use crate::plugin::executor::sequence::chain::ChainNode;
use crate::plugin::executor::{ExecResult, Executor};
use crate::plugin::{
    DnsStore, DnsStoreHandle, Plugin, PluginFactory, PluginRegistry, UninitializedPlugin,
};
use async_trait::async_trait;
use codec::CacheItem;
use hickory_proto::op::{Message, ResponseCode};
use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

const DEFAULT_SEPARATOR: &str = ":";
const NXDOMAIN_MSG_TTL: i64 = 30;
const SERVFAIL_MSG_TTL: i64 = 5;
const MAX_EMPTY_ANSWER_TTL: i64 = 300;

/// Derive the cache key for a query message, or `None` when the query must
/// bypass the cache (only single-question queries are cached).
pub(crate) fn msg_key(q: &Message, separator: &str, prefix: &str) -> Option<String> {
    if q.queries().len() != 1 {
        return None;
    }
    let query = q.queries().first()?;
    let qtype = query.query_type();
    let qclass = query.query_class();
    let qname = query.name().to_string();

    Some(if prefix.trim().is_empty() {
        format!("{}{}{}{}{}", qtype, separator, qclass, separator, qname)
    } else {
        format!(
            "{}{}{}{}{}{}{}",
            prefix, separator, qtype, separator, qclass, separator, qname
        )
    })
}

fn now_unix_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Engine shared by the cache plugin and its `DnsStore` handle.
#[derive(Debug)]
pub struct CacheState {
    tag: String,
    backend: OnceCell<Arc<dyn CacheBackend>>,
    separator: String,
    prefix: String,
    lazy_cache_ttl: i64,
    store_only: bool,
    lazy_update: SingleFlight,

    query_total: AtomicU64,
    hit_total: AtomicU64,
    lazy_hit_total: AtomicU64,
    updated_key: AtomicU64,
}

impl CacheState {
    fn new(tag: String, separator: String, prefix: String, lazy_cache_ttl: i64, store_only: bool) -> Self {
        CacheState {
            tag,
            backend: OnceCell::new(),
            separator,
            prefix,
            lazy_cache_ttl,
            store_only,
            lazy_update: SingleFlight::new(),
            query_total: AtomicU64::new(0),
            hit_total: AtomicU64::new(0),
            lazy_hit_total: AtomicU64::new(0),
            updated_key: AtomicU64::new(0),
        }
    }

    fn lazy_enabled(&self) -> bool {
        self.lazy_cache_ttl > 0 || self.lazy_cache_ttl == KEEP_TTL
    }

    fn key_for(&self, q: &Message) -> Option<String> {
        msg_key(q, &self.separator, &self.prefix)
    }

    /// Look `key` up and return a TTL-adjusted copy of the cached response.
    ///
    /// The second value reports a lazy hit: the message's own TTL has
    /// passed, every record TTL was reset to `lazy_ttl` and the caller
    /// should refresh the entry. Callers must rewrite the message id.
    async fn get_resp_from_cache_at(
        &self,
        key: &str,
        lazy_enabled: bool,
        lazy_ttl: u32,
        now_ms: i64,
    ) -> Option<(Message, bool)> {
        let backend = self.backend.get()?;
        let entry = backend.get(key).await?;
        let item = match codec::unmarshal_item(&entry.value) {
            Ok(item) => item,
            Err(e) => {
                warn!(tag = %self.tag, key, error = %e, "dropping undecodable cache entry");
                return None;
            }
        };

        if now_ms < item.expiration_time {
            let mut resp = item.resp;
            let elapsed_secs = ((now_ms - item.stored_time) / 1000).max(0) as u32;
            subtract_ttl(&mut resp, elapsed_secs);
            return Some((resp, false));
        }

        if lazy_enabled {
            let mut resp = item.resp;
            set_ttl(&mut resp, lazy_ttl);
            return Some((resp, true));
        }

        None
    }

    /// Store `r` under `key`. Returns false when the response must not be
    /// cached (truncated, uncacheable rcode, zero TTL).
    async fn save_resp_to_cache_at(
        &self,
        key: &str,
        r: &Message,
        lazy_cache_ttl: i64,
        black_hole_tag: &str,
        now_ms: i64,
    ) -> bool {
        if r.truncated() {
            return false;
        }

        let mut msg_ttl: i64 = 0;
        let mut cache_ttl: i64 = 0;
        match r.response_code() {
            ResponseCode::NXDomain => {
                msg_ttl = NXDOMAIN_MSG_TTL;
                cache_ttl = msg_ttl;
            }
            ResponseCode::ServFail => {
                msg_ttl = SERVFAIL_MSG_TTL;
                cache_ttl = msg_ttl;
            }
            ResponseCode::NoError => {
                let min_ttl = i64::from(minimal_ttl(r, 0));
                if r.answers().is_empty() {
                    msg_ttl = min_ttl.min(MAX_EMPTY_ANSWER_TTL);
                    cache_ttl = if lazy_cache_ttl == KEEP_TTL { KEEP_TTL } else { msg_ttl };
                } else {
                    msg_ttl = min_ttl;
                    cache_ttl = if lazy_cache_ttl == KEEP_TTL {
                        KEEP_TTL
                    } else if lazy_cache_ttl > 0 {
                        lazy_cache_ttl
                    } else {
                        msg_ttl
                    };
                }
            }
            _ => {}
        }

        if msg_ttl <= 0 || (cache_ttl <= 0 && cache_ttl != KEEP_TTL) {
            return false;
        }
        let Some(backend) = self.backend.get() else {
            return false;
        };

        let item = CacheItem {
            resp: r.clone(),
            stored_time: now_ms,
            expiration_time: now_ms + msg_ttl * 1000,
            black_hole_tag: black_hole_tag.to_string(),
        };
        let value = match codec::marshal_item(&item) {
            Ok(value) => value,
            Err(e) => {
                warn!(tag = %self.tag, key, error = %e, "failed to encode cache entry");
                return false;
            }
        };

        backend.store(key, value, StoreTtl::from_secs(cache_ttl)).await;
        true
    }

    /// Pick the message to persist: the interceptor's preserved original
    /// response when present (the cache keeps upstream truth, tagged), the
    /// context response otherwise.
    async fn save_context_resp(self: &Arc<Self>, key: &str, context: &DnsContext) {
        let saved = if let Some(orig) = context.black_hole_orig_resp() {
            self.save_resp_to_cache_at(
                key,
                orig,
                self.lazy_cache_ttl,
                context.black_hole_tag().unwrap_or(""),
                now_unix_millis(),
            )
            .await
        } else if let Some(resp) = context.response.as_ref() {
            self.save_resp_to_cache_at(key, resp, self.lazy_cache_ttl, "", now_unix_millis())
                .await
        } else {
            false
        };

        if saved {
            self.updated_key.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Refresh `key` in a detached task running the remainder of the chain
    /// on a context copy. Duplicate refreshes per key collapse; errors are
    /// logged and never reach the original query.
    fn spawn_lazy_update(
        self: &Arc<Self>,
        key: &str,
        context: &DnsContext,
        next: Option<&Arc<dyn ChainNode>>,
    ) {
        let Some(next) = next else {
            return;
        };
        let Some(guard) = self.lazy_update.try_acquire(key) else {
            debug!(tag = %self.tag, key, "lazy update already in flight");
            return;
        };

        let state = self.clone();
        let next = next.clone();
        let mut ctx = context.copy_for_update(DEFAULT_LAZY_UPDATE_TIMEOUT);
        let key = key.to_string();

        tokio::spawn(async move {
            let _guard = guard;
            debug!(tag = %state.tag, key = %key, "lazy cache update started");

            match tokio::time::timeout(DEFAULT_LAZY_UPDATE_TIMEOUT, next.next(&mut ctx)).await {
                Err(_) => {
                    warn!(tag = %state.tag, key = %key, "lazy cache update timed out");
                }
                Ok(Err(e)) => {
                    warn!(tag = %state.tag, key = %key, error = %e, "lazy cache update failed");
                }
                Ok(Ok(())) => {}
            }

            if ctx.response.is_some() {
                state.save_context_resp(&key, &ctx).await;
                debug!(tag = %state.tag, key = %key, "lazy cache updated");
            }
        });
    }
}

#[async_trait]
impl DnsStore for CacheState {
    async fn query_dns(&self, q: &Message) -> Option<Message> {
        let key = self.key_for(q)?;
        let (resp, _) = self
            .get_resp_from_cache_at(&key, false, 0, now_unix_millis())
            .await?;
        Some(resp)
    }

    async fn store_dns(&self, q: &Message, r: &Message) {
        let Some(key) = self.key_for(q) else {
            return;
        };
        self.save_resp_to_cache_at(&key, r, 0, "", now_unix_millis())
            .await;
    }

    async fn clean(&self) {
        if self.prefix.trim().is_empty() || self.separator.trim().is_empty() {
            return;
        }
        if let Some(backend) = self.backend.get() {
            let pattern = format!("{}{}*", self.prefix, self.separator);
            if let Err(e) = backend.delete(&pattern).await {
                warn!(tag = %self.tag, error = %e, "cache clean failed");
            }
        }
    }
}

#[derive(Debug)]
enum BackendInit {
    Memory,
    Redis { url: String, timeout: Duration },
}

/// The cache plugin proper.
#[derive(Debug)]
pub struct CachePlugin {
    state: Arc<CacheState>,
    backend_init: BackendInit,
}

#[async_trait]
impl Plugin for CachePlugin {
    fn tag(&self) -> &str {
        &self.state.tag
    }

    async fn init(&mut self) -> Result<()> {
        let backend: Arc<dyn CacheBackend> = match &self.backend_init {
            BackendInit::Memory => {
                let backend = MemoryBackend::new();
                backend.start_sweeper();
                Arc::new(backend)
            }
            BackendInit::Redis { url, timeout } => {
                Arc::new(RedisBackend::connect(url, *timeout).await?)
            }
        };
        self.state
            .backend
            .set(backend)
            .map_err(|_| DnsError::plugin(format!("cache '{}' initialized twice", self.state.tag)))
    }

    async fn destroy(&self) {
        if let Some(backend) = self.state.backend.get() {
            backend.close();
        }
    }
}

#[async_trait]
impl Executor for CachePlugin {
    async fn execute(
        &self,
        context: &mut DnsContext,
        next: Option<&Arc<dyn ChainNode>>,
    ) -> ExecResult {
        let state = &self.state;
        state.query_total.fetch_add(1, Ordering::Relaxed);

        let Some(key) = state.key_for(&context.request) else {
            // Multi-question queries bypass the cache entirely.
            return continue_next!(next, context);
        };

        // Revision of the response we installed from cache, if any. After
        // the chain runs, a differing revision means downstream produced a
        // fresh response that must be stored.
        let mut cached_rev = None;

        if state.store_only {
            debug!(tag = %state.tag, key = %key, "store only, skipping cache read");
        } else if let Some((mut resp, lazy_hit)) = state
            .get_resp_from_cache_at(
                &key,
                state.lazy_enabled(),
                EXPIRED_MSG_TTL,
                now_unix_millis(),
            )
            .await
        {
            state.hit_total.fetch_add(1, Ordering::Relaxed);
            if lazy_hit {
                state.lazy_hit_total.fetch_add(1, Ordering::Relaxed);
                debug!(tag = %state.tag, key = %key, "lazy cache hit");
                state.spawn_lazy_update(&key, context, next);
            } else {
                debug!(tag = %state.tag, key = %key, "cache hit");
            }
            resp.set_id(context.request.id());
            context.set_response(resp);
            cached_rev = Some(context.response_rev());
        }

        // A hit does not terminate the walk: later steps (interceptors,
        // other caches) still observe the response.
        let chain_result = continue_next!(next, context);

        // Store whatever response exists even when the chain errored out.
        if context.response.is_some() && cached_rev != Some(context.response_rev()) {
            state.save_context_resp(&key, context).await;
        }
        chain_result
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
struct MemoryCacheArgs {
    lazy_cache_ttl: Option<i64>,
    separator: Option<String>,
    prefix: Option<String>,
    #[serde(default)]
    store_only: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct RedisCacheArgs {
    url: String,
    /// Operation timeout in milliseconds.
    redis_timeout: Option<u64>,
    lazy_cache_ttl: Option<i64>,
    separator: Option<String>,
    prefix: Option<String>,
    #[serde(default)]
    store_only: bool,
}

fn build_plugin(
    registry: &Arc<PluginRegistry>,
    tag: &str,
    separator: Option<String>,
    prefix: Option<String>,
    lazy_cache_ttl: i64,
    store_only: bool,
    backend_init: BackendInit,
) -> UninitializedPlugin {
    let separator = separator
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| DEFAULT_SEPARATOR.to_string());
    let prefix = prefix.unwrap_or_default();

    let state = Arc::new(CacheState::new(
        tag.to_string(),
        separator,
        prefix,
        lazy_cache_ttl,
        store_only,
    ));

    // Publish the message-level store so `cache_tag` consumers can reach it.
    registry.register_shared(
        tag,
        Arc::new(DnsStoreHandle(state.clone() as Arc<dyn DnsStore>)),
    );

    UninitializedPlugin::Executor(Box::new(CachePlugin {
        state,
        backend_init,
    }))
}

#[derive(Debug, Clone)]
pub struct MemoryCacheFactory;

impl PluginFactory for MemoryCacheFactory {
    fn create(
        &self,
        plugin_config: &PluginConfig,
        registry: Arc<PluginRegistry>,
    ) -> Result<UninitializedPlugin> {
        let args = plugin_config
            .args
            .clone()
            .map(serde_yml::from_value::<MemoryCacheArgs>)
            .transpose()
            .map_err(|e| DnsError::plugin(format!("failed to parse memory_cache config: {}", e)))?
            .unwrap_or_default();

        Ok(build_plugin(
            &registry,
            &plugin_config.tag,
            args.separator,
            args.prefix,
            args.lazy_cache_ttl.unwrap_or(0),
            args.store_only,
            BackendInit::Memory,
        ))
    }
}

#[derive(Debug, Clone)]
pub struct RedisCacheFactory;

impl PluginFactory for RedisCacheFactory {
    fn validate_config(&self, plugin_config: &PluginConfig) -> Result<()> {
        let args = plugin_config
            .args
            .clone()
            .ok_or_else(|| DnsError::plugin("redis_cache requires args"))?;
        serde_yml::from_value::<RedisCacheArgs>(args)
            .map_err(|e| DnsError::plugin(format!("failed to parse redis_cache config: {}", e)))?;
        Ok(())
    }

    fn create(
        &self,
        plugin_config: &PluginConfig,
        registry: Arc<PluginRegistry>,
    ) -> Result<UninitializedPlugin> {
        let args = plugin_config
            .args
            .clone()
            .ok_or_else(|| DnsError::plugin("redis_cache requires args"))?;
        let args = serde_yml::from_value::<RedisCacheArgs>(args)
            .map_err(|e| DnsError::plugin(format!("failed to parse redis_cache config: {}", e)))?;

        let timeout = args
            .redis_timeout
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_CLIENT_TIMEOUT);

        Ok(build_plugin(
            &registry,
            &plugin_config.tag,
            args.separator,
            args.prefix,
            args.lazy_cache_ttl.unwrap_or(0),
            args.store_only,
            BackendInit::Redis {
                url: args.url,
                timeout,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dns_utils::{build_response_from_request, fake_soa};
    use hickory_proto::op::Query;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record, RecordType};
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicUsize;

    fn make_query(qname: &str, qtype: RecordType) -> Message {
        let mut q = Message::new();
        q.set_id(0x4242);
        q.add_query(Query::query(Name::from_ascii(qname).unwrap(), qtype));
        q
    }

    fn make_answer(q: &Message, ip: Ipv4Addr, ttl: u32) -> Message {
        let mut r = build_response_from_request(q, ResponseCode::NoError);
        let qname = q.queries()[0].name().clone();
        r.add_answer(Record::from_rdata(qname, ttl, RData::A(A(ip))));
        r
    }

    async fn memory_state(lazy_cache_ttl: i64) -> Arc<CacheState> {
        let state = Arc::new(CacheState::new(
            "cache".into(),
            ":".into(),
            String::new(),
            lazy_cache_ttl,
            false,
        ));
        state
            .backend
            .set(Arc::new(MemoryBackend::new()) as Arc<dyn CacheBackend>)
            .unwrap();
        state
    }

    #[test]
    fn test_msg_key_layout() {
        let q = make_query("example.com.", RecordType::A);
        assert_eq!(msg_key(&q, ":", "").unwrap(), "A:IN:example.com.");
        assert_eq!(msg_key(&q, ":", "dns").unwrap(), "dns:A:IN:example.com.");

        let mut multi = make_query("example.com.", RecordType::A);
        multi.add_query(Query::query(
            Name::from_ascii("other.com.").unwrap(),
            RecordType::AAAA,
        ));
        assert!(msg_key(&multi, ":", "").is_none());
    }

    #[tokio::test]
    async fn test_fresh_hit_subtracts_elapsed_ttl() {
        let state = memory_state(0).await;
        let q = make_query("example.com.", RecordType::A);
        let r = make_answer(&q, Ipv4Addr::new(203, 0, 113, 1), 60);
        let key = state.key_for(&q).unwrap();

        let t0 = now_unix_millis();
        assert!(state.save_resp_to_cache_at(&key, &r, 0, "", t0).await);

        let (resp, lazy) = state
            .get_resp_from_cache_at(&key, false, 0, t0 + 10_000)
            .await
            .unwrap();
        assert!(!lazy);
        assert_eq!(resp.answers()[0].ttl(), 50);

        // TTLs shrink by exactly the elapsed wall time until expiry.
        let (resp, _) = state
            .get_resp_from_cache_at(&key, false, 0, t0 + 25_000)
            .await
            .unwrap();
        assert_eq!(resp.answers()[0].ttl(), 35);

        // Past the message TTL the fresh path reports a miss.
        assert!(
            state
                .get_resp_from_cache_at(&key, false, 0, t0 + 61_000)
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_lazy_hit_serves_stale_with_short_ttl() {
        let state = memory_state(3600).await;
        let q = make_query("example.com.", RecordType::A);
        let r = make_answer(&q, Ipv4Addr::new(203, 0, 113, 1), 60);
        let key = state.key_for(&q).unwrap();

        let t0 = now_unix_millis();
        assert!(state.save_resp_to_cache_at(&key, &r, 3600, "", t0).await);

        // Message TTL has passed but the physical entry lives on.
        let (resp, lazy) = state
            .get_resp_from_cache_at(&key, true, EXPIRED_MSG_TTL, t0 + 120_000)
            .await
            .unwrap();
        assert!(lazy);
        assert_eq!(resp.answers()[0].ttl(), EXPIRED_MSG_TTL);

        // Without lazy enabled the expired message is a miss.
        assert!(
            state
                .get_resp_from_cache_at(&key, false, 0, t0 + 120_000)
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_nxdomain_and_servfail_ttls() {
        let state = memory_state(0).await;
        let q = make_query("missing.example.", RecordType::A);
        let key = state.key_for(&q).unwrap();
        let t0 = now_unix_millis();

        let nx = build_response_from_request(&q, ResponseCode::NXDomain);
        assert!(state.save_resp_to_cache_at(&key, &nx, 0, "", t0).await);
        let entry = state.backend.get().unwrap().get(&key).await.unwrap();
        let item = codec::unmarshal_item(&entry.value).unwrap();
        assert_eq!(item.expiration_time - item.stored_time, 30_000);

        let servfail = build_response_from_request(&q, ResponseCode::ServFail);
        assert!(state.save_resp_to_cache_at(&key, &servfail, 0, "", t0).await);
        let entry = state.backend.get().unwrap().get(&key).await.unwrap();
        let item = codec::unmarshal_item(&entry.value).unwrap();
        assert_eq!(item.expiration_time - item.stored_time, 5_000);
    }

    #[tokio::test]
    async fn test_empty_answer_ttl_is_capped() {
        let state = memory_state(0).await;
        let q = make_query("empty.example.", RecordType::A);
        let key = state.key_for(&q).unwrap();

        let mut r = build_response_from_request(&q, ResponseCode::NoError);
        let mut soa = fake_soa(q.queries()[0].name());
        soa.set_ttl(600);
        r.add_name_server(soa);

        let t0 = now_unix_millis();
        assert!(state.save_resp_to_cache_at(&key, &r, 0, "", t0).await);
        let entry = state.backend.get().unwrap().get(&key).await.unwrap();
        let item = codec::unmarshal_item(&entry.value).unwrap();
        assert_eq!(item.expiration_time - item.stored_time, 300_000);
    }

    #[tokio::test]
    async fn test_truncated_and_zero_ttl_not_stored() {
        let state = memory_state(0).await;
        let q = make_query("example.com.", RecordType::A);
        let key = state.key_for(&q).unwrap();
        let t0 = now_unix_millis();

        let mut truncated = make_answer(&q, Ipv4Addr::new(203, 0, 113, 1), 60);
        truncated.set_truncated(true);
        assert!(!state.save_resp_to_cache_at(&key, &truncated, 0, "", t0).await);

        let zero_ttl = make_answer(&q, Ipv4Addr::new(203, 0, 113, 1), 0);
        assert!(!state.save_resp_to_cache_at(&key, &zero_ttl, 0, "", t0).await);

        let refused = build_response_from_request(&q, ResponseCode::Refused);
        assert!(!state.save_resp_to_cache_at(&key, &refused, 0, "", t0).await);

        assert_eq!(state.backend.get().unwrap().len().await, 0);
    }

    #[derive(Debug)]
    struct UpstreamStub {
        calls: Arc<AtomicUsize>,
        delay: Duration,
        ip: Ipv4Addr,
    }

    #[async_trait]
    impl ChainNode for UpstreamStub {
        async fn next(&self, context: &mut DnsContext) -> ExecResult {
            tokio::time::sleep(self.delay).await;
            self.calls.fetch_add(1, Ordering::SeqCst);
            if context.response.is_none() {
                let r = make_answer(&context.request, self.ip, 60);
                context.set_response(r);
            }
            Ok(())
        }

        fn set_next(&mut self, _next: Option<Arc<dyn ChainNode>>) {}
    }

    fn make_plugin(state: Arc<CacheState>) -> CachePlugin {
        CachePlugin {
            state,
            backend_init: BackendInit::Memory,
        }
    }

    fn make_context(q: &Message) -> DnsContext {
        DnsContext::new("127.0.0.1:53".parse().unwrap(), q.clone())
    }

    #[tokio::test]
    async fn test_exec_stores_once_per_fresh_window() {
        let state = memory_state(0).await;
        let plugin = make_plugin(state.clone());
        let calls = Arc::new(AtomicUsize::new(0));
        let upstream: Arc<dyn ChainNode> = Arc::new(UpstreamStub {
            calls: calls.clone(),
            delay: Duration::ZERO,
            ip: Ipv4Addr::new(203, 0, 113, 9),
        });
        let q = make_query("example.com.", RecordType::A);

        let mut ctx = make_context(&q);
        plugin.execute(&mut ctx, Some(&upstream)).await.unwrap();
        assert_eq!(ctx.response.as_ref().unwrap().id(), 0x4242);
        let stored_after_first = state.updated_key.load(Ordering::Relaxed);
        assert_eq!(stored_after_first, 1);

        // Second query inside the fresh window: the chain stub observes the
        // cached response, produces nothing new, and the store count stays.
        let mut ctx = make_context(&q);
        plugin.execute(&mut ctx, Some(&upstream)).await.unwrap();
        assert_eq!(ctx.response.as_ref().unwrap().id(), 0x4242);
        assert_eq!(state.updated_key.load(Ordering::Relaxed), stored_after_first);
        assert_eq!(state.hit_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_exec_stores_black_hole_original_response() {
        let state = memory_state(0).await;
        let plugin = make_plugin(state.clone());
        let q = make_query("bad.example.", RecordType::A);
        let key = state.key_for(&q).unwrap();

        #[derive(Debug)]
        struct RewritingStub;

        #[async_trait]
        impl ChainNode for RewritingStub {
            async fn next(&self, context: &mut DnsContext) -> ExecResult {
                let upstream = {
                    let mut r = build_response_from_request(
                        &context.request,
                        ResponseCode::NoError,
                    );
                    let qname = context.request.queries()[0].name().clone();
                    r.add_answer(Record::from_rdata(
                        qname,
                        60,
                        RData::A(A(Ipv4Addr::new(198, 51, 100, 7))),
                    ));
                    r
                };
                context.set_black_hole_orig_resp(upstream.clone());
                context.set_black_hole_tag("blocker");
                let mut rewrite =
                    build_response_from_request(&context.request, ResponseCode::NoError);
                let qname = context.request.queries()[0].name().clone();
                rewrite.add_answer(Record::from_rdata(
                    qname,
                    300,
                    RData::A(A(Ipv4Addr::new(0, 0, 0, 0))),
                ));
                context.set_response(rewrite);
                Ok(())
            }

            fn set_next(&mut self, _next: Option<Arc<dyn ChainNode>>) {}
        }

        let rewriting: Arc<dyn ChainNode> = Arc::new(RewritingStub);
        let mut ctx = make_context(&q);
        plugin.execute(&mut ctx, Some(&rewriting)).await.unwrap();

        // The client-visible response is the rewrite, but the cache holds
        // the upstream answer tagged with the interceptor.
        let entry = state.backend.get().unwrap().get(&key).await.unwrap();
        let item = codec::unmarshal_item(&entry.value).unwrap();
        assert_eq!(item.black_hole_tag, "blocker");
        match item.resp.answers()[0].data() {
            RData::A(a) => assert_eq!(**a, Ipv4Addr::new(198, 51, 100, 7)),
            other => panic!("expected upstream A record, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_lazy_refresh_single_flight() {
        let state = memory_state(3600).await;
        let q = make_query("example.com.", RecordType::A);
        let key = state.key_for(&q).unwrap();

        // Seed an entry whose message TTL is long gone.
        let r = make_answer(&q, Ipv4Addr::new(203, 0, 113, 1), 60);
        let t_past = now_unix_millis() - 120_000;
        assert!(state.save_resp_to_cache_at(&key, &r, 3600, "", t_past).await);

        let calls = Arc::new(AtomicUsize::new(0));
        let upstream: Arc<dyn ChainNode> = Arc::new(UpstreamStub {
            calls: calls.clone(),
            delay: Duration::from_millis(50),
            ip: Ipv4Addr::new(203, 0, 113, 2),
        });

        let ctx = make_context(&q);
        state.spawn_lazy_update(&key, &ctx, Some(&upstream));
        state.spawn_lazy_update(&key, &ctx, Some(&upstream));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // The refreshed entry replaced the stale one.
        let (resp, lazy) = state
            .get_resp_from_cache_at(&key, true, EXPIRED_MSG_TTL, now_unix_millis())
            .await
            .unwrap();
        assert!(!lazy);
        match resp.answers()[0].data() {
            RData::A(a) => assert_eq!(**a, Ipv4Addr::new(203, 0, 113, 2)),
            other => panic!("expected refreshed A record, got {:?}", other),
        }
    }
}
