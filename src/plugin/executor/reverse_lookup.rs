/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! `redis_reverse_lookup` executor plugin.
//!
//! Front-end over a cache plugin referenced by `cache_tag`: PTR queries are
//! answered from that cache, and observed responses are fed back into it
//! with a capped lifetime.

use crate::config::types::PluginConfig;
use crate::continue_next;
use crate::core::context::DnsContext;
use crate::core::error::{DnsError, Result};
use crate::plugin::executor::sequence::chain::ChainNode;
use crate::plugin::executor::{ExecResult, Executor};
use crate::plugin::{
    DnsStore, DnsStoreHandle, Plugin, PluginFactory, PluginRegistry, UninitializedPlugin,
};
use async_trait::async_trait;
use hickory_proto::rr::RecordType;
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

const DEFAULT_TTL: u32 = 7200;

#[derive(Debug, Clone, Deserialize)]
struct ReverseLookupArgs {
    #[serde(default)]
    handle_ptr: bool,
    /// Upper bound (seconds) for stored entry lifetimes.
    ttl: Option<u32>,
    cache_tag: String,
}

#[derive(Debug)]
struct RedisReverseLookup {
    tag: String,
    handle_ptr: bool,
    ttl: u32,
    cache_tag: String,
    store: Option<Arc<dyn DnsStore>>,
    registry: Arc<PluginRegistry>,
}

#[async_trait]
impl Plugin for RedisReverseLookup {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn init(&mut self) -> Result<()> {
        let handle = self
            .registry
            .get_shared::<DnsStoreHandle>(&self.cache_tag)
            .ok_or_else(|| {
                DnsError::plugin(format!(
                    "redis_reverse_lookup '{}': cache_tag '{}' is not a cache plugin",
                    self.tag, self.cache_tag
                ))
            })?;
        self.store = Some(handle.0.clone());
        Ok(())
    }
}

#[async_trait]
impl Executor for RedisReverseLookup {
    async fn execute(
        &self,
        context: &mut DnsContext,
        next: Option<&Arc<dyn ChainNode>>,
    ) -> ExecResult {
        let Some(store) = self.store.as_ref() else {
            return continue_next!(next, context);
        };

        let qtype = context.request.query().map(|q| q.query_type());
        if self.handle_ptr && qtype == Some(RecordType::PTR) {
            if let Some(mut r) = store.query_dns(&context.request).await {
                debug!(tag = %self.tag, "ptr answered from cache");
                r.set_id(context.request.id());
                context.set_response(r);
                return Ok(());
            }
        }

        continue_next!(next, context)?;

        if let Some(r) = context.response.as_ref() {
            let mut capped = r.clone();
            crate::core::dns_utils::apply_ttl_ceiling(&mut capped, self.ttl);
            store.store_dns(&context.request, &capped).await;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RedisReverseLookupFactory;

impl PluginFactory for RedisReverseLookupFactory {
    fn validate_config(&self, plugin_config: &PluginConfig) -> Result<()> {
        parse_args(plugin_config)?;
        Ok(())
    }

    fn get_dependencies(&self, plugin_config: &PluginConfig) -> Vec<String> {
        parse_args(plugin_config)
            .map(|args| vec![args.cache_tag])
            .unwrap_or_default()
    }

    fn create(
        &self,
        plugin_config: &PluginConfig,
        registry: Arc<PluginRegistry>,
    ) -> Result<UninitializedPlugin> {
        let args = parse_args(plugin_config)?;

        Ok(UninitializedPlugin::Executor(Box::new(RedisReverseLookup {
            tag: plugin_config.tag.clone(),
            handle_ptr: args.handle_ptr,
            ttl: args.ttl.unwrap_or(DEFAULT_TTL),
            cache_tag: args.cache_tag,
            store: None,
            registry,
        })))
    }
}

fn parse_args(plugin_config: &PluginConfig) -> Result<ReverseLookupArgs> {
    let args = plugin_config
        .args
        .clone()
        .ok_or_else(|| DnsError::plugin("redis_reverse_lookup requires args"))?;
    serde_yml::from_value(args).map_err(|e| {
        DnsError::plugin(format!("failed to parse redis_reverse_lookup config: {}", e))
    })
}
