/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Built-in sequence control actions.

use crate::continue_next;
use crate::core::context::{DnsContext, ExecFlowState};
use crate::core::dns_utils::{build_response_from_request, parse_named_response_code};
use crate::core::error::{DnsError, Result};
use crate::plugin::PluginRegistry;
use crate::plugin::executor::sequence::chain::ChainNode;
use crate::plugin::executor::sequence::parse_plugin_ref;
use crate::plugin::executor::{ExecResult, Executor};
use async_trait::async_trait;
use hickory_proto::op::ResponseCode;
use std::fmt::Debug;
use std::sync::Arc;

#[async_trait]
pub trait ControlFlowBuiltin: Debug + Send + Sync + 'static {
    async fn run(&self, context: &mut DnsContext, next: Option<&Arc<dyn ChainNode>>) -> ExecResult;
}

/// `accept`: stop the whole walk, including any enclosing sequence.
#[derive(Debug)]
pub struct AcceptControl;

#[async_trait]
impl ControlFlowBuiltin for AcceptControl {
    async fn run(
        &self,
        context: &mut DnsContext,
        _next: Option<&Arc<dyn ChainNode>>,
    ) -> ExecResult {
        context.exec_flow_state = ExecFlowState::Broken;
        Ok(())
    }
}

/// `return`: end the current sequence; an enclosing `jump` resumes.
#[derive(Debug)]
pub struct ReturnControl;

#[async_trait]
impl ControlFlowBuiltin for ReturnControl {
    async fn run(
        &self,
        _context: &mut DnsContext,
        _next: Option<&Arc<dyn ChainNode>>,
    ) -> ExecResult {
        Ok(())
    }
}

/// `reject [rcode]`: answer with an error code and stop the walk.
#[derive(Debug)]
pub struct RejectControl {
    rcode: ResponseCode,
}

#[async_trait]
impl ControlFlowBuiltin for RejectControl {
    async fn run(
        &self,
        context: &mut DnsContext,
        _next: Option<&Arc<dyn ChainNode>>,
    ) -> ExecResult {
        let response = build_response_from_request(&context.request, self.rcode);
        context.set_response(response);
        context.exec_flow_state = ExecFlowState::Broken;
        Ok(())
    }
}

/// `jump $tag`: run another sequence, then resume the current one unless the
/// walk was broken.
#[derive(Debug)]
pub struct JumpControl {
    executor: Arc<dyn Executor>,
}

#[async_trait]
impl ControlFlowBuiltin for JumpControl {
    async fn run(&self, context: &mut DnsContext, next: Option<&Arc<dyn ChainNode>>) -> ExecResult {
        self.executor.execute(context, None).await?;
        if context.exec_flow_state == ExecFlowState::Broken {
            return Ok(());
        }
        if next.is_some() && context.exec_flow_state == ExecFlowState::ReachedTail {
            context.exec_flow_state = ExecFlowState::Running;
        }
        continue_next!(next, context)
    }
}

/// `goto $tag`: tail-call another sequence; the current remainder is dropped.
#[derive(Debug)]
pub struct GotoControl {
    executor: Arc<dyn Executor>,
}

#[async_trait]
impl ControlFlowBuiltin for GotoControl {
    async fn run(
        &self,
        context: &mut DnsContext,
        _next: Option<&Arc<dyn ChainNode>>,
    ) -> ExecResult {
        self.executor.execute(context, None).await
    }
}

/// Recognize a built-in control expression. Returns `None` for plugin
/// references and quick-setup forms.
pub fn parse_builtin(
    expr: &str,
    registry: &Arc<PluginRegistry>,
) -> Result<Option<Box<dyn ControlFlowBuiltin>>> {
    let mut split = expr.trim().splitn(2, char::is_whitespace);
    let op = split.next().unwrap_or_default();
    let arg = split.next().map(str::trim).filter(|s| !s.is_empty());

    match op {
        "accept" => Ok(Some(Box::new(AcceptControl))),
        "return" => Ok(Some(Box::new(ReturnControl))),
        "reject" => {
            let rcode = match arg {
                None => ResponseCode::Refused,
                Some(raw) => parse_named_response_code(raw)
                    .ok_or_else(|| DnsError::plugin(format!("invalid reject rcode: {}", raw)))?,
            };
            Ok(Some(Box::new(RejectControl { rcode })))
        }
        "jump" => Ok(Some(Box::new(JumpControl {
            executor: resolve_target("jump", arg, registry)?,
        }))),
        "goto" => Ok(Some(Box::new(GotoControl {
            executor: resolve_target("goto", arg, registry)?,
        }))),
        _ => Ok(None),
    }
}

fn resolve_target(
    op: &str,
    arg: Option<&str>,
    registry: &Arc<PluginRegistry>,
) -> Result<Arc<dyn Executor>> {
    let raw = arg.ok_or_else(|| DnsError::plugin(format!("{} requires a sequence tag", op)))?;
    let tag = parse_plugin_ref(raw)?.ok_or_else(|| {
        DnsError::plugin(format!("{} target must be a plugin reference ($tag)", op))
    })?;

    let plugin = registry
        .get_plugin(&tag)
        .ok_or_else(|| DnsError::plugin(format!("plugin does not exist: {}", tag)))?;
    plugin.to_executor()
}
