/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! `network_interface` executor plugin.
//!
//! Answers A/AAAA queries with the host addresses of a named interface.
//! Addresses are read per query; the lookup is cheap and never cached.

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
use std::net::IpAddr;
use std::sync::Arc;

const ANSWER_TTL: u32 = 300;

#[derive(Debug, Clone, Deserialize)]
struct NetworkInterfaceArgs {
    interface: String,
}

#[derive(Debug)]
struct NetworkInterface {
    tag: String,
    interface: String,
}

impl NetworkInterface {
    fn interface_addrs(&self) -> (Vec<std::net::Ipv4Addr>, Vec<std::net::Ipv6Addr>) {
        let mut ipv4 = Vec::new();
        let mut ipv6 = Vec::new();

        let Ok(addrs) = if_addrs::get_if_addrs() else {
            return (ipv4, ipv6);
        };
        for iface in addrs {
            if iface.name != self.interface {
                continue;
            }
            match iface.ip() {
                IpAddr::V4(v4) => ipv4.push(v4),
                IpAddr::V6(v6) => ipv6.push(v6),
            }
        }
        (ipv4, ipv6)
    }

    fn response(&self, q: &Message) -> Option<Message> {
        if q.queries().len() != 1 {
            return None;
        }
        let query = q.queries().first()?;
        let qname = query.name().clone();
        let (ipv4, ipv6) = self.interface_addrs();

        match query.query_type() {
            RecordType::A if !ipv4.is_empty() => {
                let mut r = build_response_from_request(q, ResponseCode::NoError);
                for ip in ipv4 {
                    r.add_answer(Record::from_rdata(qname.clone(), ANSWER_TTL, RData::A(A(ip))));
                }
                Some(r)
            }
            RecordType::AAAA if !ipv6.is_empty() => {
                let mut r = build_response_from_request(q, ResponseCode::NoError);
                for ip in ipv6 {
                    r.add_answer(Record::from_rdata(
                        qname.clone(),
                        ANSWER_TTL,
                        RData::AAAA(AAAA(ip)),
                    ));
                }
                Some(r)
            }
            _ => None,
        }
    }
}

#[async_trait]
impl Plugin for NetworkInterface {
    fn tag(&self) -> &str {
        &self.tag
    }
}

#[async_trait]
impl Executor for NetworkInterface {
    async fn execute(
        &self,
        context: &mut DnsContext,
        next: Option<&Arc<dyn ChainNode>>,
    ) -> ExecResult {
        if let Some(r) = self.response(&context.request) {
            context.set_response(r);
        }
        continue_next!(next, context)
    }
}

#[derive(Debug, Clone)]
pub struct NetworkInterfaceFactory;

impl PluginFactory for NetworkInterfaceFactory {
    fn create(
        &self,
        plugin_config: &PluginConfig,
        _registry: Arc<PluginRegistry>,
    ) -> Result<UninitializedPlugin> {
        let args = plugin_config
            .args
            .clone()
            .ok_or_else(|| DnsError::plugin("network_interface requires args"))?;
        let args: NetworkInterfaceArgs = serde_yml::from_value(args).map_err(|e| {
            DnsError::plugin(format!("failed to parse network_interface config: {}", e))
        })?;

        Ok(UninitializedPlugin::Executor(Box::new(NetworkInterface {
            tag: plugin_config.tag.clone(),
            interface: args.interface,
        })))
    }

    fn quick_setup(
        &self,
        tag: &str,
        param: Option<String>,
        _registry: Arc<PluginRegistry>,
    ) -> Result<UninitializedPlugin> {
        let interface = param
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| DnsError::plugin("network_interface quick setup requires a name"))?;

        Ok(UninitializedPlugin::Executor(Box::new(NetworkInterface {
            tag: tag.to_string(),
            interface,
        })))
    }
}
