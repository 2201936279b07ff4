/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! The `sequence` plugin: an ordered list of matcher-gated steps walked for
//! every query.

pub mod chain;
pub mod control_flow;

use crate::config::types::PluginConfig;
use crate::continue_next;
use crate::core::context::{DnsContext, ExecFlowState};
use crate::core::error::{DnsError, Result};
use crate::plugin::executor::sequence::chain::{ChainBuilder, ChainNode};
use crate::plugin::executor::{ExecResult, Executor};
use crate::plugin::{Plugin, PluginFactory, PluginRegistry, UninitializedPlugin};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

/// Resolve a `$tag` plugin reference. Returns `None` for builtin syntax.
pub(crate) fn parse_plugin_ref(raw: &str) -> Result<Option<String>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(DnsError::plugin("invalid empty plugin reference"));
    }
    if let Some(tag) = raw.strip_prefix('$') {
        let tag = tag.trim();
        if tag.is_empty() {
            return Err(DnsError::plugin(format!("invalid plugin reference: '{}'", raw)));
        }
        return Ok(Some(tag.to_string()));
    }
    Ok(None)
}

#[derive(Debug, Deserialize, Clone)]
pub struct Rule {
    #[serde(default)]
    pub matches: Option<Vec<String>>,
    pub exec: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SequenceFactory;

impl PluginFactory for SequenceFactory {
    fn validate_config(&self, plugin_config: &PluginConfig) -> Result<()> {
        let rules = parse_rules(plugin_config)?;
        if rules.is_empty() {
            return Err(DnsError::plugin("sequence requires at least one rule"));
        }
        for rule in &rules {
            if rule.exec.as_deref().map(str::trim).unwrap_or("").is_empty() {
                return Err(DnsError::plugin("sequence rule must have an 'exec' field"));
            }
        }
        Ok(())
    }

    fn get_dependencies(&self, plugin_config: &PluginConfig) -> Vec<String> {
        let Ok(rules) = parse_rules(plugin_config) else {
            return Vec::new();
        };

        // Every `$tag` token anywhere in the rule is a dependency; this also
        // covers `jump $sub` targets and provider refs inside quick-setup
        // matcher expressions. Referencing sequences this way makes the
        // composition graph a DAG: cycles fail dependency resolution.
        let mut deps = Vec::new();
        let mut collect = |raw: &str| {
            for token in raw.split_whitespace() {
                if let Some(tag) = token.strip_prefix('$') {
                    if !tag.is_empty() {
                        deps.push(tag.to_string());
                    }
                }
            }
        };
        for rule in &rules {
            if let Some(matches) = &rule.matches {
                for m in matches {
                    collect(m);
                }
            }
            if let Some(exec) = &rule.exec {
                collect(exec);
            }
        }
        deps
    }

    fn create(
        &self,
        plugin_config: &PluginConfig,
        registry: Arc<PluginRegistry>,
    ) -> Result<UninitializedPlugin> {
        let rules = parse_rules(plugin_config)?;
        let tag = plugin_config.tag.clone();

        Ok(UninitializedPlugin::Executor(Box::new(Sequence {
            tag,
            rules,
            registry,
            built: None,
        })))
    }
}

/// Sequence plugin. The chain is built during async `init`, after the
/// plugins it references exist.
#[derive(Debug)]
pub struct Sequence {
    tag: String,
    rules: Vec<Rule>,
    registry: Arc<PluginRegistry>,
    built: Option<Arc<dyn ChainNode>>,
}

#[async_trait]
impl Plugin for Sequence {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn init(&mut self) -> Result<()> {
        let mut builder = ChainBuilder::new(self.registry.clone());
        for rule in &self.rules {
            builder.append_node(rule).await?;
        }
        let head = builder
            .build()
            .ok_or_else(|| DnsError::plugin("sequence requires at least one rule"))?;
        self.built = Some(head);
        Ok(())
    }
}

#[async_trait]
impl Executor for Sequence {
    async fn execute(
        &self,
        context: &mut DnsContext,
        next: Option<&Arc<dyn ChainNode>>,
    ) -> ExecResult {
        let head = self
            .built
            .as_ref()
            .ok_or_else(|| DnsError::plugin(format!("sequence '{}' not initialized", self.tag)))?;

        head.next(context).await?;
        if context.exec_flow_state == ExecFlowState::Broken {
            return Ok(());
        }
        if next.is_some() && context.exec_flow_state == ExecFlowState::ReachedTail {
            context.exec_flow_state = ExecFlowState::Running;
        }
        continue_next!(next, context)
    }
}

fn parse_rules(plugin_config: &PluginConfig) -> Result<Vec<Rule>> {
    let args = plugin_config
        .args
        .clone()
        .ok_or_else(|| DnsError::plugin("sequence requires configuration arguments"))?;
    serde_yml::from_value::<Vec<Rule>>(args)
        .map_err(|e| DnsError::plugin(format!("sequence config parsing failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::matcher::Matcher;
    use crate::plugin::{PluginInfo, PluginKind};
    use hickory_proto::op::{Message, Query};
    use hickory_proto::rr::{Name, RecordType};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn make_context() -> DnsContext {
        let mut request = Message::new();
        request.set_id(7);
        request.add_query(Query::query(
            Name::from_ascii("example.com.").unwrap(),
            RecordType::A,
        ));
        DnsContext::new("127.0.0.1:53".parse().unwrap(), request)
    }

    #[derive(Debug)]
    struct Probe {
        tag: String,
        hits: Arc<AtomicUsize>,
        set_response: bool,
    }

    #[async_trait]
    impl Plugin for Probe {
        fn tag(&self) -> &str {
            &self.tag
        }
    }

    #[async_trait]
    impl Executor for Probe {
        async fn execute(
            &self,
            context: &mut DnsContext,
            next: Option<&Arc<dyn ChainNode>>,
        ) -> ExecResult {
            self.hits.fetch_add(1, Ordering::SeqCst);
            if self.set_response {
                let response = crate::core::dns_utils::build_response_from_request(
                    &context.request,
                    hickory_proto::op::ResponseCode::NoError,
                );
                context.set_response(response);
            }
            continue_next!(next, context)
        }
    }

    #[derive(Debug)]
    struct FixedMatcher {
        tag: String,
        verdict: bool,
    }

    #[async_trait]
    impl Plugin for FixedMatcher {
        fn tag(&self) -> &str {
            &self.tag
        }
    }

    impl Matcher for FixedMatcher {
        fn is_match(&self, _context: &mut DnsContext) -> bool {
            self.verdict
        }
    }

    fn registry_with(plugins: Vec<(&str, PluginKind)>) -> Arc<PluginRegistry> {
        let registry = Arc::new(PluginRegistry::new());
        for (tag, kind) in plugins {
            registry.set_plugin(Arc::new(PluginInfo {
                tag: tag.to_string(),
                kind,
            }));
        }
        registry
    }

    fn probe(tag: &str, hits: &Arc<AtomicUsize>, set_response: bool) -> PluginKind {
        PluginKind::Executor(Arc::new(Probe {
            tag: tag.to_string(),
            hits: hits.clone(),
            set_response,
        }))
    }

    async fn build_chain(registry: &Arc<PluginRegistry>, rules: &[Rule]) -> Arc<dyn ChainNode> {
        let mut builder = ChainBuilder::new(registry.clone());
        for rule in rules {
            builder.append_node(rule).await.unwrap();
        }
        builder.build().unwrap()
    }

    fn rule(matches: Option<Vec<&str>>, exec: &str) -> Rule {
        Rule {
            matches: matches.map(|m| m.iter().map(|s| s.to_string()).collect()),
            exec: Some(exec.to_string()),
        }
    }

    #[tokio::test]
    async fn test_steps_run_in_order_and_response_does_not_terminate() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let registry = registry_with(vec![
            ("first", probe("first", &first, true)),
            ("second", probe("second", &second, false)),
        ]);

        let head = build_chain(
            &registry,
            &[rule(None, "$first"), rule(None, "$second")],
        )
        .await;

        let mut ctx = make_context();
        head.next(&mut ctx).await.unwrap();

        // A set response does not short-circuit: later steps still observe it.
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert!(ctx.response.is_some());
        assert_eq!(ctx.exec_flow_state, ExecFlowState::ReachedTail);
    }

    #[tokio::test]
    async fn test_failed_gate_skips_step_but_not_chain() {
        let gated = Arc::new(AtomicUsize::new(0));
        let tail = Arc::new(AtomicUsize::new(0));
        let registry = registry_with(vec![
            ("gated", probe("gated", &gated, false)),
            ("tail", probe("tail", &tail, false)),
            (
                "no",
                PluginKind::Matcher(Arc::new(FixedMatcher {
                    tag: "no".into(),
                    verdict: false,
                })),
            ),
        ]);

        let head = build_chain(
            &registry,
            &[rule(Some(vec!["$no"]), "$gated"), rule(None, "$tail")],
        )
        .await;

        let mut ctx = make_context();
        head.next(&mut ctx).await.unwrap();

        assert_eq!(gated.load(Ordering::SeqCst), 0);
        assert_eq!(tail.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_all_gates_must_match() {
        let gated = Arc::new(AtomicUsize::new(0));
        let registry = registry_with(vec![
            ("gated", probe("gated", &gated, false)),
            (
                "yes",
                PluginKind::Matcher(Arc::new(FixedMatcher {
                    tag: "yes".into(),
                    verdict: true,
                })),
            ),
            (
                "no",
                PluginKind::Matcher(Arc::new(FixedMatcher {
                    tag: "no".into(),
                    verdict: false,
                })),
            ),
        ]);

        let head = build_chain(&registry, &[rule(Some(vec!["$yes", "$no"]), "$gated")]).await;
        let mut ctx = make_context();
        head.next(&mut ctx).await.unwrap();
        assert_eq!(gated.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_accept_breaks_walk() {
        let tail = Arc::new(AtomicUsize::new(0));
        let registry = registry_with(vec![("tail", probe("tail", &tail, false))]);

        let head = build_chain(&registry, &[rule(None, "accept"), rule(None, "$tail")]).await;
        let mut ctx = make_context();
        head.next(&mut ctx).await.unwrap();

        assert_eq!(tail.load(Ordering::SeqCst), 0);
        assert_eq!(ctx.exec_flow_state, ExecFlowState::Broken);
    }

    #[tokio::test]
    async fn test_jump_returns_to_caller() {
        let inner = Arc::new(AtomicUsize::new(0));
        let after = Arc::new(AtomicUsize::new(0));
        let registry = registry_with(vec![
            ("inner", probe("inner", &inner, false)),
            ("after", probe("after", &after, false)),
        ]);

        // Build the inner sequence: run `inner`, then `return`.
        let sub_head = build_chain(
            &registry,
            &[rule(None, "$inner"), rule(None, "return")],
        )
        .await;
        registry.set_plugin(Arc::new(PluginInfo {
            tag: "sub".to_string(),
            kind: PluginKind::Executor(Arc::new(Sequence {
                tag: "sub".to_string(),
                rules: Vec::new(),
                registry: registry.clone(),
                built: Some(sub_head),
            })),
        }));

        let head = build_chain(
            &registry,
            &[rule(None, "jump $sub"), rule(None, "$after")],
        )
        .await;

        let mut ctx = make_context();
        head.next(&mut ctx).await.unwrap();

        assert_eq!(inner.load(Ordering::SeqCst), 1);
        assert_eq!(after.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reject_sets_rcode_and_breaks() {
        let registry = registry_with(vec![]);
        let head = build_chain(&registry, &[rule(None, "reject SERVFAIL")]).await;

        let mut ctx = make_context();
        head.next(&mut ctx).await.unwrap();

        assert_eq!(ctx.exec_flow_state, ExecFlowState::Broken);
        let response = ctx.response.as_ref().unwrap();
        assert_eq!(
            response.response_code(),
            hickory_proto::op::ResponseCode::ServFail
        );
        assert_eq!(response.id(), 7);
    }

    #[test]
    fn test_parse_plugin_ref() {
        assert_eq!(parse_plugin_ref("forward").unwrap(), None);
        assert_eq!(parse_plugin_ref("$fwd").unwrap(), Some("fwd".into()));
        assert!(parse_plugin_ref("$").is_err());
        assert!(parse_plugin_ref("   ").is_err());
    }

    #[test]
    fn test_dependencies_include_jump_targets() {
        let factory = SequenceFactory;
        let raw = r#"
- matches: ["$m1"]
  exec: $exec1
- exec: jump $sub
- exec: black_hole 0.0.0.0
"#;
        let config = PluginConfig {
            tag: "seq".into(),
            plugin_type: "sequence".into(),
            args: Some(serde_yml::from_str(raw).unwrap()),
        };
        let deps = factory.get_dependencies(&config);
        assert_eq!(deps, vec!["m1", "exec1", "sub"]);
    }
}
