/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! EDNS Client Subnet handling.
//!
//! `dual_stack_ecs_handler` appends a subnet option with a configured IPv4
//! or IPv6 prefix before forwarding: A queries get the v4 prefix, AAAA the
//! v6 prefix, and every other qtype both. `clean_up_ecs` strips all subnet
//! options from the outbound query.

use crate::config::types::PluginConfig;
use crate::continue_next;
use crate::core::context::DnsContext;
use crate::core::dns_utils::ensure_opt_record;
use crate::core::error::{DnsError, Result};
use crate::plugin::executor::sequence::chain::ChainNode;
use crate::plugin::executor::{ExecResult, Executor};
use crate::plugin::{Plugin, PluginFactory, PluginRegistry, UninitializedPlugin};
use async_trait::async_trait;
use hickory_proto::op::Message;

use hickory_proto::rr::rdata::opt::{ClientSubnet, EdnsCode, EdnsOption};
use hickory_proto::rr::{DNSClass, RData, RecordType};
use ipnet::{Ipv4Net, Ipv6Net};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

const DEFAULT_MASK4: u8 = 24;
const DEFAULT_MASK6: u8 = 48;

#[derive(Debug, Clone, Deserialize)]
struct DualStackEcsArgs {
    ipv4: String,
    ipv6: String,
    mask4: Option<u8>,
    mask6: Option<u8>,
}

#[derive(Debug)]
struct DualStackEcs {
    tag: String,
    /// Presets already masked to their prefix network address.
    ipv4: Ipv4Addr,
    ipv6: Ipv6Addr,
    mask4: u8,
    mask6: u8,
}

impl DualStackEcs {
    fn v4_option(&self) -> EdnsOption {
        EdnsOption::Subnet(ClientSubnet::new(IpAddr::V4(self.ipv4), self.mask4, 0))
    }

    fn v6_option(&self) -> EdnsOption {
        EdnsOption::Subnet(ClientSubnet::new(IpAddr::V6(self.ipv6), self.mask6, 0))
    }

    fn add_ecs(&self, request: &mut Message) {
        // A query-supplied subnet option always wins.
        if request_has_ecs(request) {
            return;
        }
        let Some(query) = request.query() else {
            return;
        };
        // ECS is only defined for class IN (RFC 7871, section 5).
        if query.query_class() != DNSClass::IN {
            return;
        }

        let qtype = query.query_type();
        let opt = ensure_opt_record(request);
        match qtype {
            RecordType::A => opt.insert(self.v4_option()),
            RecordType::AAAA => opt.insert(self.v6_option()),
            _ => {
                opt.insert(self.v4_option());
                opt.insert(self.v6_option());
            }
        }
    }
}

#[async_trait]
impl Plugin for DualStackEcs {
    fn tag(&self) -> &str {
        &self.tag
    }
}

#[async_trait]
impl Executor for DualStackEcs {
    async fn execute(
        &self,
        context: &mut DnsContext,
        next: Option<&Arc<dyn ChainNode>>,
    ) -> ExecResult {
        self.add_ecs(&mut context.request);
        continue_next!(next, context)
    }
}

#[derive(Debug, Clone)]
pub struct DualStackEcsFactory;

impl PluginFactory for DualStackEcsFactory {
    fn validate_config(&self, plugin_config: &PluginConfig) -> Result<()> {
        build_handler(&plugin_config.tag, plugin_config.args.clone())?;
        Ok(())
    }

    fn create(
        &self,
        plugin_config: &PluginConfig,
        _registry: Arc<PluginRegistry>,
    ) -> Result<UninitializedPlugin> {
        let handler = build_handler(&plugin_config.tag, plugin_config.args.clone())?;
        Ok(UninitializedPlugin::Executor(Box::new(handler)))
    }
}

fn build_handler(tag: &str, args: Option<serde_yml::Value>) -> Result<DualStackEcs> {
    let args = args.ok_or_else(|| DnsError::plugin("dual_stack_ecs_handler requires args"))?;
    let args: DualStackEcsArgs = serde_yml::from_value(args).map_err(|e| {
        DnsError::plugin(format!("failed to parse dual_stack_ecs_handler config: {}", e))
    })?;

    let mask4 = args.mask4.filter(|m| *m != 0).unwrap_or(DEFAULT_MASK4);
    let mask6 = args.mask6.filter(|m| *m != 0).unwrap_or(DEFAULT_MASK6);
    if mask4 > 32 {
        return Err(DnsError::plugin("dual_stack_ecs_handler mask4 must be 0..=32"));
    }
    if mask6 > 128 {
        return Err(DnsError::plugin("dual_stack_ecs_handler mask6 must be 0..=128"));
    }

    let ipv4 = args
        .ipv4
        .parse::<Ipv4Addr>()
        .map_err(|e| DnsError::plugin(format!("invalid ipv4 preset '{}': {}", args.ipv4, e)))?;
    let ipv6 = args
        .ipv6
        .parse::<Ipv6Addr>()
        .map_err(|e| DnsError::plugin(format!("invalid ipv6 preset '{}': {}", args.ipv6, e)))?;

    // Queries must carry the network address of the prefix, not the host.
    let ipv4 = Ipv4Net::new(ipv4, mask4)
        .map_err(|e| DnsError::plugin(format!("bad mask4: {}", e)))?
        .trunc()
        .network();
    let ipv6 = Ipv6Net::new(ipv6, mask6)
        .map_err(|e| DnsError::plugin(format!("bad mask6: {}", e)))?
        .trunc()
        .network();

    Ok(DualStackEcs {
        tag: tag.to_string(),
        ipv4,
        ipv6,
        mask4,
        mask6,
    })
}

/// `clean_up_ecs`: strip every subnet option from the outbound query.
#[derive(Debug)]
struct CleanUpEcs {
    tag: String,
}

#[async_trait]
impl Plugin for CleanUpEcs {
    fn tag(&self) -> &str {
        &self.tag
    }
}

#[async_trait]
impl Executor for CleanUpEcs {
    async fn execute(
        &self,
        context: &mut DnsContext,
        next: Option<&Arc<dyn ChainNode>>,
    ) -> ExecResult {
        strip_ecs_from_message(&mut context.request);
        continue_next!(next, context)
    }
}

#[derive(Debug, Clone)]
pub struct CleanUpEcsFactory;

impl PluginFactory for CleanUpEcsFactory {
    fn create(
        &self,
        plugin_config: &PluginConfig,
        _registry: Arc<PluginRegistry>,
    ) -> Result<UninitializedPlugin> {
        Ok(UninitializedPlugin::Executor(Box::new(CleanUpEcs {
            tag: plugin_config.tag.clone(),
        })))
    }

    fn quick_setup(
        &self,
        tag: &str,
        _param: Option<String>,
        _registry: Arc<PluginRegistry>,
    ) -> Result<UninitializedPlugin> {
        Ok(UninitializedPlugin::Executor(Box::new(CleanUpEcs {
            tag: tag.to_string(),
        })))
    }
}

pub(crate) fn request_has_ecs(message: &Message) -> bool {
    for record in message.additionals() {
        let RData::OPT(opt) = record.data() else {
            continue;
        };
        if opt.get(EdnsCode::Subnet).is_some() {
            return true;
        }
    }
    false
}

pub(crate) fn strip_ecs_from_message(message: &mut Message) {
    for record in message.additionals_mut() {
        let RData::OPT(opt) = record.data_mut() else {
            continue;
        };
        opt.remove(EdnsCode::Subnet);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::Query;
    use hickory_proto::rr::Name;

    fn handler() -> DualStackEcs {
        let raw = r#"
ipv4: 203.0.113.77
ipv6: 2001:db8::77
"#;
        build_handler("ecs", Some(serde_yml::from_str(raw).unwrap())).unwrap()
    }

    fn request(qtype: RecordType) -> Message {
        let mut q = Message::new();
        q.add_query(Query::query(
            Name::from_ascii("example.com.").unwrap(),
            qtype,
        ));
        q
    }

    fn subnet_options(message: &Message) -> Vec<ClientSubnet> {
        let mut out = Vec::new();
        for record in message.additionals() {
            if let RData::OPT(opt) = record.data() {
                if let Some(EdnsOption::Subnet(subnet)) = opt.get(EdnsCode::Subnet) {
                    out.push(subnet.clone());
                }
            }
        }
        out
    }

    #[test]
    fn test_a_query_gets_masked_v4_prefix() {
        let handler = handler();
        let mut q = request(RecordType::A);
        handler.add_ecs(&mut q);

        let subnets = subnet_options(&q);
        assert_eq!(subnets.len(), 1);
        // Host bits are cleared to the /24 network address.
        assert_eq!(
            subnets[0],
            ClientSubnet::new("203.0.113.0".parse().unwrap(), 24, 0)
        );
    }

    #[test]
    fn test_aaaa_query_gets_v6_prefix() {
        let handler = handler();
        let mut q = request(RecordType::AAAA);
        handler.add_ecs(&mut q);

        let subnets = subnet_options(&q);
        assert_eq!(subnets.len(), 1);
        assert_eq!(
            subnets[0],
            ClientSubnet::new("2001:db8::".parse().unwrap(), 48, 0)
        );
    }

    #[test]
    fn test_existing_subnet_option_is_kept() {
        let handler = handler();
        let mut q = request(RecordType::A);
        let client = ClientSubnet::new("198.51.100.0".parse().unwrap(), 24, 0);
        ensure_opt_record(&mut q).insert(EdnsOption::Subnet(client.clone()));

        handler.add_ecs(&mut q);

        let subnets = subnet_options(&q);
        assert_eq!(subnets, vec![client]);
    }

    #[test]
    fn test_non_in_class_skipped() {
        let handler = handler();
        let mut q = Message::new();
        let mut query = Query::query(Name::from_ascii("example.com.").unwrap(), RecordType::A);
        query.set_query_class(DNSClass::CH);
        q.add_query(query);

        handler.add_ecs(&mut q);
        assert!(subnet_options(&q).is_empty());
    }

    #[test]
    fn test_clean_up_strips_subnet() {
        let mut q = request(RecordType::A);
        handler().add_ecs(&mut q);
        assert!(!subnet_options(&q).is_empty());

        strip_ecs_from_message(&mut q);
        assert!(subnet_options(&q).is_empty());
    }
}
