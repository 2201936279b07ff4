/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! `reverse_lookup_redis_cache` executor plugin.
//!
//! A specialized cache keyed by address string: A/AAAA responses flowing
//! through are indexed as `addr -> owning fqdn`, and PTR queries are served
//! from that index with a short TTL.

use crate::config::types::PluginConfig;
use crate::continue_next;
use crate::core::context::DnsContext;
use crate::core::dns_utils::{build_response_from_request, minimal_ttl, parse_ptr_name, rr_to_ip};
use crate::core::error::{DnsError, Result};
use crate::pkg::cache_backend::redis::{DEFAULT_CLIENT_TIMEOUT, RedisBackend};
use crate::pkg::cache_backend::{CacheBackend, StoreTtl};
use crate::plugin::executor::sequence::chain::ChainNode;
use crate::plugin::executor::{ExecResult, Executor};
use crate::plugin::{
    DnsStore, DnsStoreHandle, Plugin, PluginFactory, PluginRegistry, UninitializedPlugin,
};
use async_trait::async_trait;
use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::rdata::name::PTR;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

/// TTL of synthesized PTR answers.
const PTR_ANSWER_TTL: u32 = 5;

#[derive(Debug)]
pub struct ReverseLookupState {
    tag: String,
    backend: OnceCell<Arc<dyn CacheBackend>>,
    separator: String,
    prefix: String,
    read_only: bool,
}

impl ReverseLookupState {
    fn addr_key(&self, addr: &str) -> String {
        if self.prefix.trim().is_empty() {
            addr.to_string()
        } else {
            format!("{}{}{}", self.prefix, self.separator, addr)
        }
    }

    /// Serve a PTR query from the index, if present.
    async fn response_ptr(&self, q: &Message) -> Option<Message> {
        let query = q.queries().first()?;
        if query.query_type() != RecordType::PTR {
            return None;
        }
        let addr = parse_ptr_name(query.name())?;
        let backend = self.backend.get()?;
        let entry = backend.get(&self.addr_key(&addr.to_string())).await?;

        let target = Name::from_ascii(&entry.value).ok()?;
        let mut r = build_response_from_request(q, ResponseCode::NoError);
        r.add_answer(Record::from_rdata(
            query.name().clone(),
            PTR_ANSWER_TTL,
            RData::PTR(PTR(target)),
        ));
        Some(r)
    }

    /// Index every A/AAAA answer of `r` under its address.
    async fn store_answers(&self, q: &Message, r: &Message) {
        let Some(backend) = self.backend.get() else {
            return;
        };
        let Some(qname) = q.queries().first().map(|query| query.name().to_string()) else {
            return;
        };

        let ttl = minimal_ttl(r, 0);
        if ttl == 0 {
            return;
        }
        for record in r.answers() {
            let Some(ip) = rr_to_ip(record) else {
                continue;
            };
            backend
                .store(
                    &self.addr_key(&ip.to_string()),
                    qname.clone(),
                    StoreTtl::For(Duration::from_secs(u64::from(ttl))),
                )
                .await;
        }
    }
}

#[async_trait]
impl DnsStore for ReverseLookupState {
    async fn query_dns(&self, q: &Message) -> Option<Message> {
        self.response_ptr(q).await
    }

    async fn store_dns(&self, q: &Message, r: &Message) {
        if !self.read_only {
            self.store_answers(q, r).await;
        }
    }

    async fn clean(&self) {
        if self.prefix.trim().is_empty() || self.separator.trim().is_empty() {
            return;
        }
        if let Some(backend) = self.backend.get() {
            let pattern = format!("{}{}*", self.prefix, self.separator);
            if let Err(e) = backend.delete(&pattern).await {
                warn!(tag = %self.tag, error = %e, "reverse lookup clean failed");
            }
        }
    }
}

#[derive(Debug)]
pub struct ReverseLookupCache {
    state: Arc<ReverseLookupState>,
    url: String,
    timeout: Duration,
}

#[async_trait]
impl Plugin for ReverseLookupCache {
    fn tag(&self) -> &str {
        &self.state.tag
    }

    async fn init(&mut self) -> Result<()> {
        let backend = RedisBackend::connect(&self.url, self.timeout).await?;
        self.state
            .backend
            .set(Arc::new(backend) as Arc<dyn CacheBackend>)
            .map_err(|_| {
                DnsError::plugin(format!(
                    "reverse lookup cache '{}' initialized twice",
                    self.state.tag
                ))
            })
    }

    async fn destroy(&self) {
        if let Some(backend) = self.state.backend.get() {
            backend.close();
        }
    }
}

#[async_trait]
impl Executor for ReverseLookupCache {
    async fn execute(
        &self,
        context: &mut DnsContext,
        next: Option<&Arc<dyn ChainNode>>,
    ) -> ExecResult {
        let qtype = context.request.query().map(|q| q.query_type());

        if qtype == Some(RecordType::PTR) {
            if let Some(mut r) = self.state.response_ptr(&context.request).await {
                debug!(tag = %self.state.tag, "ptr served from reverse lookup index");
                r.set_id(context.request.id());
                context.set_response(r);
                return Ok(());
            }
        }

        let chain_result = continue_next!(next, context);

        if !self.state.read_only
            && matches!(qtype, Some(RecordType::A) | Some(RecordType::AAAA))
        {
            if let Some(r) = context.response.clone() {
                self.state.store_answers(&context.request, &r).await;
            }
        }
        chain_result
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ReverseLookupCacheArgs {
    url: String,
    /// Operation timeout in milliseconds.
    redis_timeout: Option<u64>,
    separator: Option<String>,
    prefix: Option<String>,
    #[serde(default)]
    read_only: bool,
}

#[derive(Debug, Clone)]
pub struct ReverseLookupRedisCacheFactory;

impl PluginFactory for ReverseLookupRedisCacheFactory {
    fn validate_config(&self, plugin_config: &PluginConfig) -> Result<()> {
        parse_args(plugin_config)?;
        Ok(())
    }

    fn create(
        &self,
        plugin_config: &PluginConfig,
        registry: Arc<PluginRegistry>,
    ) -> Result<UninitializedPlugin> {
        let args = parse_args(plugin_config)?;

        let state = Arc::new(ReverseLookupState {
            tag: plugin_config.tag.clone(),
            backend: OnceCell::new(),
            separator: args
                .separator
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| ":".to_string()),
            prefix: args.prefix.unwrap_or_default(),
            read_only: args.read_only,
        });

        registry.register_shared(
            &plugin_config.tag,
            Arc::new(DnsStoreHandle(state.clone() as Arc<dyn DnsStore>)),
        );

        Ok(UninitializedPlugin::Executor(Box::new(ReverseLookupCache {
            state,
            url: args.url,
            timeout: args
                .redis_timeout
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_CLIENT_TIMEOUT),
        })))
    }
}

fn parse_args(plugin_config: &PluginConfig) -> Result<ReverseLookupCacheArgs> {
    let args = plugin_config
        .args
        .clone()
        .ok_or_else(|| DnsError::plugin("reverse_lookup_redis_cache requires args"))?;
    serde_yml::from_value(args).map_err(|e| {
        DnsError::plugin(format!(
            "failed to parse reverse_lookup_redis_cache config: {}",
            e
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkg::cache_backend::memory::MemoryBackend;
    use hickory_proto::op::Query;
    use hickory_proto::rr::rdata::A;
    use std::net::Ipv4Addr;

    fn state(read_only: bool) -> Arc<ReverseLookupState> {
        let state = Arc::new(ReverseLookupState {
            tag: "rl".into(),
            backend: OnceCell::new(),
            separator: ":".into(),
            prefix: "ptr".into(),
            read_only,
        });
        state
            .backend
            .set(Arc::new(MemoryBackend::new()) as Arc<dyn CacheBackend>)
            .unwrap();
        state
    }

    fn a_exchange(qname: &str, ip: Ipv4Addr, ttl: u32) -> (Message, Message) {
        let mut q = Message::new();
        q.add_query(Query::query(
            Name::from_ascii(qname).unwrap(),
            RecordType::A,
        ));
        let mut r = build_response_from_request(&q, ResponseCode::NoError);
        r.add_answer(Record::from_rdata(
            Name::from_ascii(qname).unwrap(),
            ttl,
            RData::A(A(ip)),
        ));
        (q, r)
    }

    fn ptr_query(addr: &str) -> Message {
        let fqdn = crate::core::dns_utils::ip_to_ptr_fqdn(addr.parse().unwrap());
        let mut q = Message::new();
        q.set_id(0x77);
        q.add_query(Query::query(
            Name::from_ascii(&fqdn).unwrap(),
            RecordType::PTR,
        ));
        q
    }

    #[tokio::test]
    async fn test_observed_answer_serves_ptr() {
        let state = state(false);
        let (q, r) = a_exchange("printer.lan.", Ipv4Addr::new(192, 168, 1, 5), 3600);
        state.store_dns(&q, &r).await;

        let ptr = state.query_dns(&ptr_query("192.168.1.5")).await.unwrap();
        assert_eq!(ptr.answers().len(), 1);
        assert_eq!(ptr.answers()[0].ttl(), PTR_ANSWER_TTL);
        match ptr.answers()[0].data() {
            RData::PTR(name) => assert_eq!(name.0.to_utf8(), "printer.lan."),
            other => panic!("expected PTR, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_address_is_a_miss() {
        let state = state(false);
        assert!(state.query_dns(&ptr_query("10.9.9.9")).await.is_none());
    }

    #[tokio::test]
    async fn test_read_only_disables_writes() {
        let state = state(true);
        let (q, r) = a_exchange("printer.lan.", Ipv4Addr::new(192, 168, 1, 5), 3600);
        state.store_dns(&q, &r).await;

        assert!(state.query_dns(&ptr_query("192.168.1.5")).await.is_none());
    }

    #[tokio::test]
    async fn test_zero_ttl_answers_not_indexed() {
        let state = state(false);
        let (q, r) = a_exchange("printer.lan.", Ipv4Addr::new(192, 168, 1, 5), 0);
        state.store_dns(&q, &r).await;
        assert!(state.query_dns(&ptr_query("192.168.1.5")).await.is_none());
    }
}
