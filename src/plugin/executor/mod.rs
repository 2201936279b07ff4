/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

use async_trait::async_trait;
use std::sync::Arc;

use crate::core::error::Result;
use crate::plugin::executor::sequence::chain::ChainNode;
use crate::plugin::registry::PluginRegistry;
use crate::{core::context::DnsContext, plugin::Plugin};

pub type ExecResult = Result<()>;

/// Continue to the next chain node if present; otherwise mark the walk as
/// having reached the tail of the current chain.
#[macro_export]
macro_rules! continue_next {
    ($next:expr, $ctx:expr) => {{
        match $next {
            Some(next) => next.next($ctx).await,
            None => {
                if $ctx.exec_flow_state == $crate::core::context::ExecFlowState::Running {
                    $ctx.exec_flow_state = $crate::core::context::ExecFlowState::ReachedTail;
                }
                Ok(())
            }
        }
    }};
}

pub mod black_hole;
pub mod cache;
pub mod dnsmasq_dhcp_leases;
pub mod dual_stack_ecs;
pub mod forward;
pub mod network_interface;
pub mod query_from_shell;
pub mod resp_match_black_hole;
pub mod reverse_lookup;
pub mod reverse_lookup_cache;
pub mod sequence;

/// Executable plugin step.
///
/// `next` is the remainder of the current chain. Plain executables finish
/// with `continue_next!(next, context)`; recursive executables (caches, ECS
/// handlers) run their own work around one or more `next` invocations, and
/// may clone the `Arc` into a detached task.
#[async_trait]
pub trait Executor: Plugin {
    async fn execute(
        &self,
        context: &mut DnsContext,
        next: Option<&Arc<dyn ChainNode>>,
    ) -> ExecResult;
}

pub fn install_factories(registry: &mut PluginRegistry) {
    registry.register_factory("sequence", Box::new(sequence::SequenceFactory));
    registry.register_factory("forward", Box::new(forward::ForwardFactory));
    registry.register_factory("memory_cache", Box::new(cache::MemoryCacheFactory));
    registry.register_factory("redis_cache", Box::new(cache::RedisCacheFactory));
    registry.register_factory(
        "reverse_lookup_redis_cache",
        Box::new(reverse_lookup_cache::ReverseLookupRedisCacheFactory),
    );
    registry.register_factory(
        "redis_reverse_lookup",
        Box::new(reverse_lookup::RedisReverseLookupFactory),
    );
    registry.register_factory("black_hole", Box::new(black_hole::BlackHoleFactory));
    registry.register_factory(
        "resp_match_black_hole",
        Box::new(resp_match_black_hole::RespMatchBlackHoleFactory),
    );
    registry.register_factory(
        "dnsmasq_dhcp_leases",
        Box::new(dnsmasq_dhcp_leases::DhcpLeasesFactory),
    );
    registry.register_factory(
        "network_interface",
        Box::new(network_interface::NetworkInterfaceFactory),
    );
    registry.register_factory(
        "dual_stack_ecs_handler",
        Box::new(dual_stack_ecs::DualStackEcsFactory),
    );
    registry.register_factory("clean_up_ecs", Box::new(dual_stack_ecs::CleanUpEcsFactory));
    registry.register_factory(
        "query_from_shell",
        Box::new(query_from_shell::QueryFromShellFactory),
    );
}
