/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! `resp_ip` matcher plugin.
//!
//! Matches A/AAAA records in response sections against configured IP rules
//! and/or referenced ip_set providers.

use crate::config::types::PluginConfig;
use crate::core::context::DnsContext;
use crate::core::dns_utils::{response_records, rr_to_ip};
use crate::core::error::{DnsError, Result as DnsResult};
use crate::core::netlist::{NetList, parse_net_token};
use crate::plugin::matcher::Matcher;
use crate::plugin::matcher::matcher_utils::{
    load_rules_from_files, parse_quick_setup_rules, parse_rules_from_value, resolve_provider_tags,
    split_rule_sources,
};
use crate::plugin::provider::Provider;
use crate::plugin::{Plugin, PluginFactory, PluginRegistry, UninitializedPlugin};
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct RespIpFactory;

impl PluginFactory for RespIpFactory {
    fn validate_config(&self, plugin_config: &PluginConfig) -> DnsResult<()> {
        let rules = parse_rules_from_value(plugin_config.args.clone())?;
        let (nets, set_tags) = parse_resp_ip_rules(rules)?;
        validate_non_empty(&nets, &set_tags)
    }

    fn get_dependencies(&self, plugin_config: &PluginConfig) -> Vec<String> {
        let Ok(rules) = parse_rules_from_value(plugin_config.args.clone()) else {
            return Vec::new();
        };
        let (_, set_tags, _) = split_rule_sources(rules);
        set_tags
    }

    fn create(
        &self,
        plugin_config: &PluginConfig,
        registry: Arc<PluginRegistry>,
    ) -> DnsResult<UninitializedPlugin> {
        let rules = parse_rules_from_value(plugin_config.args.clone())?;
        build_resp_ip_matcher(plugin_config.tag.clone(), rules, registry)
    }

    fn quick_setup(
        &self,
        tag: &str,
        param: Option<String>,
        registry: Arc<PluginRegistry>,
    ) -> DnsResult<UninitializedPlugin> {
        let rules = parse_quick_setup_rules(param)?;
        build_resp_ip_matcher(tag.to_string(), rules, registry)
    }
}

fn build_resp_ip_matcher(
    tag: String,
    rules: Vec<String>,
    registry: Arc<PluginRegistry>,
) -> DnsResult<UninitializedPlugin> {
    let (nets, set_tags) = parse_resp_ip_rules(rules)?;
    validate_non_empty(&nets, &set_tags)?;

    Ok(UninitializedPlugin::Matcher(Box::new(RespIpMatcher {
        tag,
        nets,
        set_tags,
        providers: Vec::new(),
        registry,
    })))
}

fn parse_resp_ip_rules(rules: Vec<String>) -> DnsResult<(NetList, Vec<String>)> {
    let (mut inline_rules, set_tags, files) = split_rule_sources(rules);
    inline_rules.extend(load_rules_from_files(&files, "resp_ip")?);

    let mut nets = NetList::new();
    for rule in &inline_rules {
        let net = parse_net_token(rule).map_err(DnsError::plugin)?;
        nets.append(net);
    }
    nets.sort();
    Ok((nets, set_tags))
}

fn validate_non_empty(nets: &NetList, set_tags: &[String]) -> DnsResult<()> {
    if nets.is_empty() && set_tags.is_empty() {
        return Err(DnsError::plugin(
            "resp_ip matcher requires at least one IP rule or ip_set tag",
        ));
    }
    Ok(())
}

#[derive(Debug)]
struct RespIpMatcher {
    tag: String,
    nets: NetList,
    set_tags: Vec<String>,
    providers: Vec<Arc<dyn Provider>>,
    registry: Arc<PluginRegistry>,
}

#[async_trait]
impl Plugin for RespIpMatcher {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn init(&mut self) -> DnsResult<()> {
        self.providers =
            resolve_provider_tags(&self.registry, &self.set_tags, "resp_ip", &self.tag)?;
        Ok(())
    }
}

impl Matcher for RespIpMatcher {
    fn is_match(&self, context: &mut DnsContext) -> bool {
        let Some(response) = context.response.as_ref() else {
            return false;
        };

        response_records(response).any(|record| {
            rr_to_ip(record).is_some_and(|ip| {
                self.nets.contains(ip) || self.providers.iter().any(|set| set.contains_ip(ip))
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{Message, Query};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record, RecordType};
    use std::net::Ipv4Addr;

    fn make_context(answer_ip: Option<Ipv4Addr>) -> DnsContext {
        let mut request = Message::new();
        request.add_query(Query::query(
            Name::from_ascii("example.com.").unwrap(),
            RecordType::A,
        ));
        let mut ctx = DnsContext::new("127.0.0.1:5353".parse().unwrap(), request);

        if let Some(ip) = answer_ip {
            let mut response = Message::new();
            response.add_answer(Record::from_rdata(
                Name::from_ascii("example.com.").unwrap(),
                60,
                RData::A(A(ip)),
            ));
            ctx.set_response(response);
        }
        ctx
    }

    fn matcher(rules: Vec<&str>) -> RespIpMatcher {
        let rules = rules.into_iter().map(str::to_string).collect();
        let (nets, set_tags) = parse_resp_ip_rules(rules).unwrap();
        RespIpMatcher {
            tag: "resp_ip".into(),
            nets,
            set_tags,
            providers: Vec::new(),
            registry: Arc::new(PluginRegistry::new()),
        }
    }

    #[test]
    fn test_matches_answer_in_net() {
        let m = matcher(vec!["8.8.8.0/24"]);
        assert!(m.is_match(&mut make_context(Some(Ipv4Addr::new(8, 8, 8, 8)))));
        assert!(!m.is_match(&mut make_context(Some(Ipv4Addr::new(1, 1, 1, 8)))));
    }

    #[test]
    fn test_no_response_is_no_match() {
        let m = matcher(vec!["8.8.8.0/24"]);
        assert!(!m.is_match(&mut make_context(None)));
    }
}
