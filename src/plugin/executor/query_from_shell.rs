/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! `query_from_shell` executor plugin.
//!
//! Runs a shell command whose stdout is line-separated IP addresses and
//! answers A/AAAA queries with them.

use crate::config::types::PluginConfig;
use crate::continue_next;
use crate::core::context::DnsContext;
use crate::core::dns_utils::{build_response_from_request, fake_soa};
use crate::core::error::{DnsError, Result};
use crate::plugin::executor::sequence::chain::ChainNode;
use crate::plugin::executor::{ExecResult, Executor};
use crate::plugin::{Plugin, PluginFactory, PluginRegistry, UninitializedPlugin};
use async_trait::async_trait;
use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{DNSClass, RData, Record, RecordType};
use serde::Deserialize;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::warn;

const ANSWER_TTL: u32 = 10;

#[derive(Debug, Clone, Deserialize)]
struct QueryFromShellArgs {
    cmd: String,
}

#[derive(Debug)]
struct QueryFromShell {
    tag: String,
    cmd: String,
}

impl QueryFromShell {
    async fn run_command(&self) -> Option<Vec<IpAddr>> {
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.cmd)
            .output()
            .await;

        let output = match output {
            Ok(output) if output.status.success() => output,
            Ok(output) => {
                warn!(tag = %self.tag, status = %output.status, "shell command failed");
                return None;
            }
            Err(e) => {
                warn!(tag = %self.tag, error = %e, "failed to spawn shell command");
                return None;
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        Some(
            stdout
                .lines()
                .filter_map(|line| line.trim().parse::<IpAddr>().ok())
                .collect(),
        )
    }

    async fn response(&self, q: &Message) -> Option<Message> {
        if q.queries().len() != 1 {
            return None;
        }
        let query = q.queries().first()?;
        let qtype = query.query_type();
        if query.query_class() != DNSClass::IN
            || (qtype != RecordType::A && qtype != RecordType::AAAA)
        {
            return None;
        }

        let ips = self.run_command().await?;
        let qname = query.name().clone();
        let mut r = build_response_from_request(q, ResponseCode::NoError);
        match qtype {
            RecordType::A => {
                for ip in ips {
                    if let IpAddr::V4(v4) = ip {
                        r.add_answer(Record::from_rdata(
                            qname.clone(),
                            ANSWER_TTL,
                            RData::A(A(v4)),
                        ));
                    }
                }
            }
            RecordType::AAAA => {
                for ip in ips {
                    if let IpAddr::V6(v6) = ip {
                        r.add_answer(Record::from_rdata(
                            qname.clone(),
                            ANSWER_TTL,
                            RData::AAAA(AAAA(v6)),
                        ));
                    }
                }
            }
            _ => unreachable!(),
        }

        if r.answers().is_empty() {
            r.add_name_server(fake_soa(&qname));
        }
        Some(r)
    }
}

#[async_trait]
impl Plugin for QueryFromShell {
    fn tag(&self) -> &str {
        &self.tag
    }
}

#[async_trait]
impl Executor for QueryFromShell {
    async fn execute(
        &self,
        context: &mut DnsContext,
        next: Option<&Arc<dyn ChainNode>>,
    ) -> ExecResult {
        if let Some(r) = self.response(&context.request).await {
            context.set_response(r);
        }
        continue_next!(next, context)
    }
}

#[derive(Debug, Clone)]
pub struct QueryFromShellFactory;

impl PluginFactory for QueryFromShellFactory {
    fn create(
        &self,
        plugin_config: &PluginConfig,
        _registry: Arc<PluginRegistry>,
    ) -> Result<UninitializedPlugin> {
        let args = plugin_config
            .args
            .clone()
            .ok_or_else(|| DnsError::plugin("query_from_shell requires args"))?;
        let args: QueryFromShellArgs = serde_yml::from_value(args).map_err(|e| {
            DnsError::plugin(format!("failed to parse query_from_shell config: {}", e))
        })?;

        Ok(UninitializedPlugin::Executor(Box::new(QueryFromShell {
            tag: plugin_config.tag.clone(),
            cmd: args.cmd,
        })))
    }

    fn quick_setup(
        &self,
        tag: &str,
        param: Option<String>,
        _registry: Arc<PluginRegistry>,
    ) -> Result<UninitializedPlugin> {
        let cmd = param
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| DnsError::plugin("query_from_shell quick setup requires a command"))?;

        Ok(UninitializedPlugin::Executor(Box::new(QueryFromShell {
            tag: tag.to_string(),
            cmd,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::Query;
    use hickory_proto::rr::Name;

    fn query(qtype: RecordType) -> Message {
        let mut q = Message::new();
        q.add_query(Query::query(
            Name::from_ascii("router.lan.").unwrap(),
            qtype,
        ));
        q
    }

    fn shell(cmd: &str) -> QueryFromShell {
        QueryFromShell {
            tag: "shell".into(),
            cmd: cmd.to_string(),
        }
    }

    #[tokio::test]
    async fn test_stdout_lines_become_answers() {
        let plugin = shell("printf '192.0.2.1\\n192.0.2.2\\nfd00::1\\n'");

        let r = plugin.response(&query(RecordType::A)).await.unwrap();
        assert_eq!(r.answers().len(), 2);
        assert!(r.answers().iter().all(|rr| rr.ttl() == ANSWER_TTL));

        let r = plugin.response(&query(RecordType::AAAA)).await.unwrap();
        assert_eq!(r.answers().len(), 1);
    }

    #[tokio::test]
    async fn test_no_matching_family_gets_fake_soa() {
        let plugin = shell("printf 'fd00::1\\n'");
        let r = plugin.response(&query(RecordType::A)).await.unwrap();
        assert!(r.answers().is_empty());
        assert_eq!(r.name_servers().len(), 1);
    }

    #[tokio::test]
    async fn test_failing_command_passes_through() {
        let plugin = shell("exit 3");
        assert!(plugin.response(&query(RecordType::A)).await.is_none());
    }

    #[tokio::test]
    async fn test_non_address_output_ignored() {
        let plugin = shell("printf 'hello\\n192.0.2.9\\n'");
        let r = plugin.response(&query(RecordType::A)).await.unwrap();
        assert_eq!(r.answers().len(), 1);
    }
}
