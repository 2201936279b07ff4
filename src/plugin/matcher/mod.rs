/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

use crate::plugin::registry::PluginRegistry;
use crate::{core::context::DnsContext, plugin::Plugin};

pub mod has_resp;
pub mod matcher_utils;
pub mod qname;
pub mod resp_ip;

/// Predicate over the query context, used to gate sequence steps.
///
/// Matchers are pure and never suspend: they may inspect the context but
/// must not modify it.
pub trait Matcher: Plugin {
    fn is_match(&self, context: &mut DnsContext) -> bool;
}

pub fn install_factories(registry: &mut PluginRegistry) {
    registry.register_factory("qname", Box::new(qname::QnameFactory));
    registry.register_factory("resp_ip", Box::new(resp_ip::RespIpFactory));
    registry.register_factory("has_resp", Box::new(has_resp::HasRespFactory));
}
