/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Chain nodes: the walkable representation of a built sequence.

use crate::continue_next;
use crate::core::context::DnsContext;
use crate::core::error::{DnsError, Result};
use crate::plugin::PluginRegistry;
use crate::plugin::executor::sequence::control_flow::{self, ControlFlowBuiltin};
use crate::plugin::executor::sequence::{Rule, parse_plugin_ref};
use crate::plugin::executor::{ExecResult, Executor};
use crate::plugin::matcher::Matcher;
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::debug;

/// One link of a built sequence. `next` runs this node (respecting its
/// gates) and hands the remainder of the chain to the bound executor.
#[async_trait]
pub trait ChainNode: Debug + Send + Sync + 'static {
    async fn next(&self, context: &mut DnsContext) -> ExecResult;

    fn set_next(&mut self, next: Option<Arc<dyn ChainNode>>);
}

/// Node running an executor plugin, optionally gated by matchers.
#[derive(Debug)]
pub struct ExecChainNode {
    matchers: Vec<Arc<dyn Matcher>>,
    executor: Arc<dyn Executor>,
    next: Option<Arc<dyn ChainNode>>,
}

#[async_trait]
impl ChainNode for ExecChainNode {
    async fn next(&self, context: &mut DnsContext) -> ExecResult {
        for matcher in &self.matchers {
            if !matcher.is_match(context) {
                debug!(matcher = matcher.tag(), "gate did not match, skipping step");
                return continue_next!(self.next.as_ref(), context);
            }
        }
        self.executor.execute(context, self.next.as_ref()).await
    }

    fn set_next(&mut self, next: Option<Arc<dyn ChainNode>>) {
        self.next = next;
    }
}

/// Node running a built-in control action (`accept`, `return`, `reject`,
/// `jump`, `goto`), optionally gated by matchers.
#[derive(Debug)]
pub struct ControlChainNode {
    matchers: Vec<Arc<dyn Matcher>>,
    builtin: Box<dyn ControlFlowBuiltin>,
    next: Option<Arc<dyn ChainNode>>,
}

#[async_trait]
impl ChainNode for ControlChainNode {
    async fn next(&self, context: &mut DnsContext) -> ExecResult {
        for matcher in &self.matchers {
            if !matcher.is_match(context) {
                return continue_next!(self.next.as_ref(), context);
            }
        }
        self.builtin.run(context, self.next.as_ref()).await
    }

    fn set_next(&mut self, next: Option<Arc<dyn ChainNode>>) {
        self.next = next;
    }
}

pub struct ChainBuilder {
    nodes: Vec<Box<dyn ChainNode>>,
    registry: Arc<PluginRegistry>,
}

impl ChainBuilder {
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        ChainBuilder {
            nodes: Vec::new(),
            registry,
        }
    }

    pub async fn append_node(&mut self, rule: &Rule) -> Result<()> {
        let node = self.create_chain_node(rule).await?;
        self.nodes.push(node);
        Ok(())
    }

    /// Link nodes back to front and return the head.
    pub fn build(self) -> Option<Arc<dyn ChainNode>> {
        let mut next: Option<Arc<dyn ChainNode>> = None;
        for mut node in self.nodes.into_iter().rev() {
            node.set_next(next.clone());
            next = Some(Arc::from(node));
        }
        next
    }

    async fn create_chain_node(&self, rule: &Rule) -> Result<Box<dyn ChainNode>> {
        let exec = rule
            .exec
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| DnsError::plugin("sequence rule must have an 'exec' field"))?;

        let matchers = self.resolve_matchers(rule).await?;

        if let Some(builtin) = control_flow::parse_builtin(exec, &self.registry)? {
            return Ok(Box::new(ControlChainNode {
                matchers,
                builtin,
                next: None,
            }));
        }

        let executor = self.resolve_executor(exec).await?;
        Ok(Box::new(ExecChainNode {
            matchers,
            executor,
            next: None,
        }))
    }

    async fn resolve_executor(&self, exec: &str) -> Result<Arc<dyn Executor>> {
        if let Some(tag) = parse_plugin_ref(exec)? {
            let plugin = self
                .registry
                .get_plugin(&tag)
                .ok_or_else(|| DnsError::plugin(format!("plugin does not exist: {}", tag)))?;
            return plugin.to_executor();
        }
        // Inline quick-setup form, e.g. `black_hole 0.0.0.0`.
        self.registry.quick_setup(exec).await?.to_executor()
    }

    async fn resolve_matchers(&self, rule: &Rule) -> Result<Vec<Arc<dyn Matcher>>> {
        let Some(matches) = &rule.matches else {
            return Ok(Vec::new());
        };

        let mut matchers = Vec::with_capacity(matches.len());
        for expr in matches {
            let expr = expr.trim();
            if expr.is_empty() {
                continue;
            }
            let matcher = if let Some(tag) = parse_plugin_ref(expr)? {
                let plugin = self.registry.get_plugin(&tag).ok_or_else(|| {
                    DnsError::plugin(format!("matcher plugin does not exist: {}", tag))
                })?;
                plugin.to_matcher()?
            } else {
                self.registry.quick_setup(expr).await?.to_matcher()?
            };
            matchers.push(matcher);
        }
        Ok(matchers)
    }
}
