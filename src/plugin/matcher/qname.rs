/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! `qname` matcher plugin.
//!
//! Matches the request query name against configured domain rules and/or
//! referenced provider sets.

use crate::config::types::PluginConfig;
use crate::core::context::DnsContext;
use crate::core::error::{DnsError, Result as DnsResult};
use crate::core::rule_matcher::MixMatcher;
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
pub struct QnameFactory;

impl PluginFactory for QnameFactory {
    fn validate_config(&self, plugin_config: &PluginConfig) -> DnsResult<()> {
        let rules = parse_rules_from_value(plugin_config.args.clone())?;
        let (domains, set_tags) = parse_qname_rules(rules)?;
        validate_non_empty(&domains, &set_tags)
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
        build_qname_matcher(plugin_config.tag.clone(), rules, registry)
    }

    fn quick_setup(
        &self,
        tag: &str,
        param: Option<String>,
        registry: Arc<PluginRegistry>,
    ) -> DnsResult<UninitializedPlugin> {
        let rules = parse_quick_setup_rules(param)?;
        build_qname_matcher(tag.to_string(), rules, registry)
    }
}

fn build_qname_matcher(
    tag: String,
    rules: Vec<String>,
    registry: Arc<PluginRegistry>,
) -> DnsResult<UninitializedPlugin> {
    let (domains, set_tags) = parse_qname_rules(rules)?;
    validate_non_empty(&domains, &set_tags)?;

    Ok(UninitializedPlugin::Matcher(Box::new(QnameMatcher {
        tag,
        domains,
        set_tags,
        providers: Vec::new(),
        registry,
    })))
}

fn parse_qname_rules(rules: Vec<String>) -> DnsResult<(MixMatcher<()>, Vec<String>)> {
    let (mut inline_rules, set_tags, files) = split_rule_sources(rules);
    inline_rules.extend(load_rules_from_files(&files, "qname")?);

    let mut domains = MixMatcher::default();
    for (idx, rule) in inline_rules.iter().enumerate() {
        domains
            .add(rule, ())
            .map_err(|e| DnsError::plugin(format!("qname rule[{}]: {}", idx, e)))?;
    }
    domains.finalize().map_err(DnsError::plugin)?;
    Ok((domains, set_tags))
}

fn validate_non_empty(domains: &MixMatcher<()>, set_tags: &[String]) -> DnsResult<()> {
    if domains.is_empty() && set_tags.is_empty() {
        return Err(DnsError::plugin(
            "qname matcher requires at least one domain rule or provider tag",
        ));
    }
    Ok(())
}

#[derive(Debug)]
struct QnameMatcher {
    tag: String,
    domains: MixMatcher<()>,
    set_tags: Vec<String>,
    providers: Vec<Arc<dyn Provider>>,
    registry: Arc<PluginRegistry>,
}

#[async_trait]
impl Plugin for QnameMatcher {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn init(&mut self) -> DnsResult<()> {
        self.providers =
            resolve_provider_tags(&self.registry, &self.set_tags, "qname", &self.tag)?;
        Ok(())
    }
}

impl Matcher for QnameMatcher {
    fn is_match(&self, context: &mut DnsContext) -> bool {
        let Some(query) = context.request.query() else {
            return false;
        };
        let name = query.name().to_utf8();

        self.domains.is_match(&name)
            || self
                .providers
                .iter()
                .any(|provider| provider.contains_domain(&name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{Message, Query};
    use hickory_proto::rr::{Name, RecordType};

    fn make_context(qname: &str) -> DnsContext {
        let mut request = Message::new();
        request.add_query(Query::query(
            Name::from_ascii(qname).unwrap(),
            RecordType::A,
        ));
        DnsContext::new("127.0.0.1:53".parse().unwrap(), request)
    }

    fn matcher(rules: Vec<&str>) -> QnameMatcher {
        let rules = rules.into_iter().map(str::to_string).collect();
        let (domains, set_tags) = parse_qname_rules(rules).unwrap();
        QnameMatcher {
            tag: "qname".into(),
            domains,
            set_tags,
            providers: Vec::new(),
            registry: Arc::new(PluginRegistry::new()),
        }
    }

    #[test]
    fn test_qname_match() {
        let m = matcher(vec!["domain:example.com", "full:printer.lan"]);

        assert!(m.is_match(&mut make_context("www.example.com.")));
        assert!(m.is_match(&mut make_context("printer.lan.")));
        assert!(!m.is_match(&mut make_context("sub.printer.lan.")));
        assert!(!m.is_match(&mut make_context("other.org.")));
    }

    #[test]
    fn test_empty_rules_rejected() {
        let (domains, set_tags) = parse_qname_rules(Vec::new()).unwrap();
        assert!(validate_non_empty(&domains, &set_tags).is_err());
    }
}
