/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! `black_hole` executor plugin.
//!
//! Answers A/AAAA queries with a configured static address set. When it
//! replaces an existing response, the previous one is preserved on the
//! context together with this plugin's tag.

use crate::config::types::PluginConfig;
use crate::continue_next;
use crate::core::context::DnsContext;
use crate::core::dns_utils::build_response_from_request;
use crate::core::error::{DnsError, Result};
use crate::plugin::executor::sequence::chain::ChainNode;
use crate::plugin::executor::{ExecResult, Executor};
use crate::plugin::{Plugin, PluginFactory, PluginRegistry, UninitializedPlugin};
use async_trait::async_trait;
use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{RData, Record, RecordType};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tracing::info;

const ANSWER_TTL: u32 = 300;

/// The configured address set, shared with `resp_match_black_hole` via the
/// registry when referenced as a `black_hole_set`.
#[derive(Debug, Default)]
pub struct BlackHoleAddrs {
    pub ipv4: Vec<Ipv4Addr>,
    pub ipv6: Vec<Ipv6Addr>,
}

impl BlackHoleAddrs {
    /// Build from inline addresses and list files.
    pub fn load(ips: &[String], files: &[String]) -> Result<BlackHoleAddrs> {
        let mut addrs = BlackHoleAddrs::default();
        for token in ips {
            addrs.add_token(token)?;
        }
        for path in files {
            let text = std::fs::read_to_string(path).map_err(|e| {
                DnsError::plugin(format!("failed to read black_hole file '{}': {}", path, e))
            })?;
            for (idx, line) in text.lines().enumerate() {
                let data = line.split('#').next().unwrap_or_default();
                let Some(token) = data.split_whitespace().next() else {
                    continue;
                };
                addrs.add_token(token).map_err(|e| {
                    DnsError::plugin(format!("{} at '{}' line {}", e, path, idx + 1))
                })?;
            }
        }
        Ok(addrs)
    }

    fn add_token(&mut self, token: &str) -> Result<()> {
        let token = token.trim();
        if token.is_empty() {
            return Ok(());
        }
        let ip = token
            .parse::<IpAddr>()
            .map_err(|e| DnsError::plugin(format!("invalid black_hole ip '{}': {}", token, e)))?;
        match ip {
            IpAddr::V4(v4) => self.ipv4.push(v4),
            IpAddr::V6(v6) => self.ipv6.push(v6),
        }
        Ok(())
    }

    /// Synthesize a reply for the query, if its qtype has addresses.
    pub fn response(&self, q: &Message) -> Option<Message> {
        if q.queries().len() != 1 {
            return None;
        }
        let query = q.queries().first()?;
        let qname = query.name().clone();

        match query.query_type() {
            RecordType::A if !self.ipv4.is_empty() => {
                let mut r = build_response_from_request(q, ResponseCode::NoError);
                for ip in &self.ipv4 {
                    r.add_answer(Record::from_rdata(qname.clone(), ANSWER_TTL, RData::A(A(*ip))));
                }
                Some(r)
            }
            RecordType::AAAA if !self.ipv6.is_empty() => {
                let mut r = build_response_from_request(q, ResponseCode::NoError);
                for ip in &self.ipv6 {
                    r.add_answer(Record::from_rdata(
                        qname.clone(),
                        ANSWER_TTL,
                        RData::AAAA(AAAA(*ip)),
                    ));
                }
                Some(r)
            }
            _ => None,
        }
    }
}

#[derive(Debug)]
struct BlackHole {
    tag: String,
    addrs: Arc<BlackHoleAddrs>,
}

#[async_trait]
impl Plugin for BlackHole {
    fn tag(&self) -> &str {
        &self.tag
    }
}

#[async_trait]
impl Executor for BlackHole {
    async fn execute(
        &self,
        context: &mut DnsContext,
        next: Option<&Arc<dyn ChainNode>>,
    ) -> ExecResult {
        if let Some(r) = self.addrs.response(&context.request) {
            info!(
                tag = %self.tag,
                query = %context.request.queries().first().map(|q| q.name().to_utf8()).unwrap_or_default(),
                "replacing response with black hole answer"
            );
            if let Some(orig) = context.response.take() {
                context.set_black_hole_orig_resp(orig);
            }
            context.set_black_hole_tag(&self.tag);
            context.set_response(r);
        }
        continue_next!(next, context)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
struct BlackHoleArgs {
    #[serde(default)]
    ips: Vec<String>,
    #[serde(default)]
    files: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct BlackHoleFactory;

impl PluginFactory for BlackHoleFactory {
    fn validate_config(&self, plugin_config: &PluginConfig) -> Result<()> {
        let _ = parse_args(plugin_config.args.clone())?;
        Ok(())
    }

    fn create(
        &self,
        plugin_config: &PluginConfig,
        registry: Arc<PluginRegistry>,
    ) -> Result<UninitializedPlugin> {
        let args = parse_args(plugin_config.args.clone())?;
        build(&registry, &plugin_config.tag, &args)
    }

    /// Quick-setup tokens: `&path` loads a file, anything else is an address.
    fn quick_setup(
        &self,
        tag: &str,
        param: Option<String>,
        registry: Arc<PluginRegistry>,
    ) -> Result<UninitializedPlugin> {
        let mut args = BlackHoleArgs::default();
        for token in param.unwrap_or_default().split_whitespace() {
            if let Some(path) = token.strip_prefix('&') {
                args.files.push(path.to_string());
            } else {
                args.ips.push(token.to_string());
            }
        }
        build(&registry, tag, &args)
    }
}

fn build(
    registry: &Arc<PluginRegistry>,
    tag: &str,
    args: &BlackHoleArgs,
) -> Result<UninitializedPlugin> {
    let addrs = Arc::new(BlackHoleAddrs::load(&args.ips, &args.files)?);
    registry.register_shared(tag, addrs.clone());

    Ok(UninitializedPlugin::Executor(Box::new(BlackHole {
        tag: tag.to_string(),
        addrs,
    })))
}

fn parse_args(args: Option<serde_yml::Value>) -> Result<BlackHoleArgs> {
    let Some(args) = args else {
        return Ok(BlackHoleArgs::default());
    };

    // Bare string / list forms are quick-setup style ip tokens.
    if let Some(raw) = args.as_str() {
        return Ok(BlackHoleArgs {
            ips: raw.split_whitespace().map(str::to_string).collect(),
            files: Vec::new(),
        });
    }
    if let Some(seq) = args.as_sequence() {
        let mut ips = Vec::new();
        for item in seq {
            let token = item
                .as_str()
                .ok_or_else(|| DnsError::plugin("black_hole args list must contain strings"))?;
            ips.extend(token.split_whitespace().map(str::to_string));
        }
        return Ok(BlackHoleArgs {
            ips,
            files: Vec::new(),
        });
    }

    serde_yml::from_value(args)
        .map_err(|e| DnsError::plugin(format!("failed to parse black_hole config: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::Query;
    use hickory_proto::rr::Name;

    fn make_query(qtype: RecordType) -> Message {
        let mut q = Message::new();
        q.set_id(9);
        q.add_query(Query::query(
            Name::from_ascii("ads.example.").unwrap(),
            qtype,
        ));
        q
    }

    fn addrs(tokens: &[&str]) -> BlackHoleAddrs {
        let ips: Vec<String> = tokens.iter().map(|s| s.to_string()).collect();
        BlackHoleAddrs::load(&ips, &[]).unwrap()
    }

    #[test]
    fn test_a_response_uses_all_v4_addrs() {
        let addrs = addrs(&["0.0.0.0", "127.0.0.1", "::"]);
        let r = addrs.response(&make_query(RecordType::A)).unwrap();

        assert_eq!(r.id(), 9);
        assert_eq!(r.answers().len(), 2);
        assert!(r.answers().iter().all(|rr| rr.ttl() == ANSWER_TTL));
    }

    #[test]
    fn test_aaaa_and_passthrough() {
        let addrs = addrs(&["::"]);
        assert!(addrs.response(&make_query(RecordType::AAAA)).is_some());
        // No v4 addresses configured: A queries pass through.
        assert!(addrs.response(&make_query(RecordType::A)).is_none());
        assert!(addrs.response(&make_query(RecordType::TXT)).is_none());
    }

    #[tokio::test]
    async fn test_exec_preserves_previous_response() {
        let plugin = BlackHole {
            tag: "bh".into(),
            addrs: Arc::new(addrs(&["0.0.0.0"])),
        };

        let q = make_query(RecordType::A);
        let mut ctx = DnsContext::new("127.0.0.1:53".parse().unwrap(), q.clone());
        let upstream = build_response_from_request(&q, ResponseCode::NoError);
        ctx.set_response(upstream);

        plugin.execute(&mut ctx, None).await.unwrap();

        assert!(ctx.black_hole_orig_resp().is_some());
        assert_eq!(ctx.black_hole_tag(), Some("bh"));
        assert_eq!(ctx.response.as_ref().unwrap().answers().len(), 1);
    }

    #[test]
    fn test_invalid_ip_rejected() {
        let ips = vec!["not-an-ip".to_string()];
        assert!(BlackHoleAddrs::load(&ips, &[]).is_err());
    }
}
