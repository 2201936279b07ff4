/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! `resp_match_black_hole` executor plugin.
//!
//! Runs after an upstream response. When any answer address matches the
//! configured net lists, or any CNAME target matches the configured domain
//! matchers, the response is replaced with the black-hole answer and the
//! original response is preserved on the context.

use crate::config::types::PluginConfig;
use crate::continue_next;
use crate::core::context::DnsContext;
use crate::core::dns_utils::{rr_to_cname, rr_to_ip};
use crate::core::error::{DnsError, Result};
use crate::core::netlist::{NetList, load_from_text, parse_net_token};
use crate::core::rule_matcher::MixMatcher;
use crate::plugin::executor::black_hole::BlackHoleAddrs;
use crate::plugin::executor::sequence::chain::ChainNode;
use crate::plugin::executor::{ExecResult, Executor};
use crate::plugin::provider::Provider;
use crate::plugin::{Plugin, PluginFactory, PluginRegistry, UninitializedPlugin};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Deserialize, Default)]
struct RespMatchArgs {
    #[serde(default)]
    ips: Vec<String>,
    #[serde(default)]
    ip_sets: Vec<String>,
    #[serde(default)]
    ip_files: Vec<String>,

    #[serde(default)]
    cname_exps: Vec<String>,
    #[serde(default)]
    cname_domain_sets: Vec<String>,
    #[serde(default)]
    cname_files: Vec<String>,

    black_hole_set: Option<String>,
    #[serde(default)]
    black_hole_ips: Vec<String>,
    #[serde(default)]
    black_hole_files: Vec<String>,
}

#[derive(Debug)]
struct RespMatchBlackHole {
    tag: String,
    nets: NetList,
    cnames: MixMatcher<()>,
    ip_set_tags: Vec<String>,
    cname_set_tags: Vec<String>,
    ip_sets: Vec<Arc<dyn Provider>>,
    cname_sets: Vec<Arc<dyn Provider>>,
    black_hole_set: Option<String>,
    black_hole: Arc<BlackHoleAddrs>,
    registry: Arc<PluginRegistry>,
}

impl RespMatchBlackHole {
    fn response_matches(&self, context: &DnsContext) -> bool {
        let Some(response) = context.response.as_ref() else {
            return false;
        };

        for record in response.answers() {
            if let Some(ip) = rr_to_ip(record) {
                if self.nets.contains(ip) || self.ip_sets.iter().any(|s| s.contains_ip(ip)) {
                    return true;
                }
            }
            if let Some(target) = rr_to_cname(record) {
                if self.cnames.is_match(&target)
                    || self.cname_sets.iter().any(|s| s.contains_domain(&target))
                {
                    return true;
                }
            }
        }
        false
    }
}

#[async_trait]
impl Plugin for RespMatchBlackHole {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn init(&mut self) -> Result<()> {
        let ip_set_tags = std::mem::take(&mut self.ip_set_tags);
        for tag in &ip_set_tags {
            let plugin = self.registry.get_plugin(tag).ok_or_else(|| {
                DnsError::plugin(format!("ip_set '{}' does not exist", tag))
            })?;
            self.ip_sets.push(plugin.to_provider()?);
        }
        self.ip_set_tags = ip_set_tags;

        let cname_set_tags = std::mem::take(&mut self.cname_set_tags);
        for tag in &cname_set_tags {
            let plugin = self.registry.get_plugin(tag).ok_or_else(|| {
                DnsError::plugin(format!("cname_domain_set '{}' does not exist", tag))
            })?;
            self.cname_sets.push(plugin.to_provider()?);
        }
        self.cname_set_tags = cname_set_tags;
        if let Some(tag) = &self.black_hole_set {
            self.black_hole = self
                .registry
                .get_shared::<BlackHoleAddrs>(tag)
                .ok_or_else(|| {
                    DnsError::plugin(format!("black_hole_set '{}' is not a black_hole plugin", tag))
                })?;
        }
        Ok(())
    }
}

#[async_trait]
impl Executor for RespMatchBlackHole {
    async fn execute(
        &self,
        context: &mut DnsContext,
        next: Option<&Arc<dyn ChainNode>>,
    ) -> ExecResult {
        if self.response_matches(context) {
            if let Some(r) = self.black_hole.response(&context.request) {
                info!(
                    tag = %self.tag,
                    query = %context.request.queries().first().map(|q| q.name().to_utf8()).unwrap_or_default(),
                    "response matched, replacing with black hole answer"
                );
                if let Some(orig) = context.response.take() {
                    context.set_black_hole_orig_resp(orig);
                }
                context.set_black_hole_tag(&self.tag);
                context.set_response(r);
            }
        }
        continue_next!(next, context)
    }
}

#[derive(Debug, Clone)]
pub struct RespMatchBlackHoleFactory;

impl PluginFactory for RespMatchBlackHoleFactory {
    fn get_dependencies(&self, plugin_config: &PluginConfig) -> Vec<String> {
        let Ok(args) = parse_args(plugin_config) else {
            return Vec::new();
        };
        let mut deps = args.ip_sets;
        deps.extend(args.cname_domain_sets);
        deps.extend(args.black_hole_set);
        deps
    }

    fn create(
        &self,
        plugin_config: &PluginConfig,
        registry: Arc<PluginRegistry>,
    ) -> Result<UninitializedPlugin> {
        let args = parse_args(plugin_config)?;

        let mut nets = NetList::new();
        for token in &args.ips {
            nets.append(parse_net_token(token).map_err(DnsError::plugin)?);
        }
        for path in &args.ip_files {
            let text = std::fs::read_to_string(path).map_err(|e| {
                DnsError::plugin(format!("failed to read ip file '{}': {}", path, e))
            })?;
            load_from_text(&mut nets, &text)
                .map_err(|e| DnsError::plugin(format!("ip file '{}': {}", path, e)))?;
        }
        nets.sort();

        let mut cnames = MixMatcher::default();
        for exp in &args.cname_exps {
            cnames.add(exp, ()).map_err(DnsError::plugin)?;
        }
        for path in &args.cname_files {
            let text = std::fs::read_to_string(path).map_err(|e| {
                DnsError::plugin(format!("failed to read cname file '{}': {}", path, e))
            })?;
            for (idx, line) in text.lines().enumerate() {
                let raw = line.split('#').next().unwrap_or_default().trim();
                if raw.is_empty() {
                    continue;
                }
                cnames.add(raw, ()).map_err(|e| {
                    DnsError::plugin(format!("cname file '{}' line {}: {}", path, idx + 1, e))
                })?;
            }
        }
        cnames.finalize().map_err(DnsError::plugin)?;

        // Inline black-hole addresses; a referenced set replaces this at
        // init time.
        let black_hole = Arc::new(BlackHoleAddrs::load(
            &args.black_hole_ips,
            &args.black_hole_files,
        )?);

        Ok(UninitializedPlugin::Executor(Box::new(RespMatchBlackHole {
            tag: plugin_config.tag.clone(),
            nets,
            cnames,
            ip_set_tags: args.ip_sets,
            cname_set_tags: args.cname_domain_sets,
            ip_sets: Vec::new(),
            cname_sets: Vec::new(),
            black_hole_set: args.black_hole_set,
            black_hole,
            registry,
        })))
    }
}

fn parse_args(plugin_config: &PluginConfig) -> Result<RespMatchArgs> {
    let args = plugin_config
        .args
        .clone()
        .ok_or_else(|| DnsError::plugin("resp_match_black_hole requires args"))?;
    serde_yml::from_value(args).map_err(|e| {
        DnsError::plugin(format!("failed to parse resp_match_black_hole config: {}", e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dns_utils::build_response_from_request;
    use hickory_proto::op::{Message, Query, ResponseCode};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::rdata::name::CNAME;
    use hickory_proto::rr::{Name, RData, Record, RecordType};
    use std::net::Ipv4Addr;

    fn plugin(block_nets: &[&str], block_cnames: &[&str]) -> RespMatchBlackHole {
        let mut nets = NetList::new();
        for token in block_nets {
            nets.append(parse_net_token(token).unwrap());
        }
        nets.sort();

        let mut cnames = MixMatcher::default();
        for exp in block_cnames {
            cnames.add(exp, ()).unwrap();
        }
        cnames.finalize().unwrap();

        RespMatchBlackHole {
            tag: "resp_blocker".into(),
            nets,
            cnames,
            ip_set_tags: Vec::new(),
            cname_set_tags: Vec::new(),
            ip_sets: Vec::new(),
            cname_sets: Vec::new(),
            black_hole_set: None,
            black_hole: Arc::new(
                BlackHoleAddrs::load(&["0.0.0.0".to_string()], &[]).unwrap(),
            ),
            registry: Arc::new(PluginRegistry::new()),
        }
    }

    fn context_with_answer(ip: Ipv4Addr) -> DnsContext {
        let mut q = Message::new();
        q.set_id(0x99);
        q.add_query(Query::query(
            Name::from_ascii("bad.example.").unwrap(),
            RecordType::A,
        ));
        let mut ctx = DnsContext::new("127.0.0.1:53".parse().unwrap(), q.clone());

        let mut r = build_response_from_request(&q, ResponseCode::NoError);
        r.add_answer(Record::from_rdata(
            Name::from_ascii("bad.example.").unwrap(),
            60,
            RData::A(A(ip)),
        ));
        ctx.set_response(r);
        ctx
    }

    #[tokio::test]
    async fn test_matching_answer_is_rewritten_and_original_kept() {
        let plugin = plugin(&["198.51.100.0/24"], &[]);
        let mut ctx = context_with_answer(Ipv4Addr::new(198, 51, 100, 7));

        plugin.execute(&mut ctx, None).await.unwrap();

        let response = ctx.response.as_ref().unwrap();
        match response.answers()[0].data() {
            RData::A(a) => assert_eq!(**a, Ipv4Addr::new(0, 0, 0, 0)),
            other => panic!("expected rewritten A record, got {:?}", other),
        }

        let orig = ctx.black_hole_orig_resp().unwrap();
        match orig.answers()[0].data() {
            RData::A(a) => assert_eq!(**a, Ipv4Addr::new(198, 51, 100, 7)),
            other => panic!("expected original A record, got {:?}", other),
        }
        assert_eq!(ctx.black_hole_tag(), Some("resp_blocker"));
    }

    #[tokio::test]
    async fn test_non_matching_answer_passes_through() {
        let plugin = plugin(&["198.51.100.0/24"], &[]);
        let mut ctx = context_with_answer(Ipv4Addr::new(203, 0, 113, 7));

        plugin.execute(&mut ctx, None).await.unwrap();

        assert!(ctx.black_hole_orig_resp().is_none());
        match ctx.response.as_ref().unwrap().answers()[0].data() {
            RData::A(a) => assert_eq!(**a, Ipv4Addr::new(203, 0, 113, 7)),
            other => panic!("expected untouched A record, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cname_target_match() {
        let plugin = plugin(&[], &["domain:tracker.example"]);

        let mut q = Message::new();
        q.add_query(Query::query(
            Name::from_ascii("cdn.example.").unwrap(),
            RecordType::A,
        ));
        let mut ctx = DnsContext::new("127.0.0.1:53".parse().unwrap(), q.clone());
        let mut r = build_response_from_request(&q, ResponseCode::NoError);
        r.add_answer(Record::from_rdata(
            Name::from_ascii("cdn.example.").unwrap(),
            60,
            RData::CNAME(CNAME(Name::from_ascii("x.tracker.example.").unwrap())),
        ));
        ctx.set_response(r);

        plugin.execute(&mut ctx, None).await.unwrap();
        assert_eq!(ctx.black_hole_tag(), Some("resp_blocker"));
    }

    #[tokio::test]
    async fn test_no_response_is_noop() {
        let plugin = plugin(&["198.51.100.0/24"], &[]);
        let mut q = Message::new();
        q.add_query(Query::query(
            Name::from_ascii("bad.example.").unwrap(),
            RecordType::A,
        ));
        let mut ctx = DnsContext::new("127.0.0.1:53".parse().unwrap(), q);

        plugin.execute(&mut ctx, None).await.unwrap();
        assert!(ctx.response.is_none());
    }
}
