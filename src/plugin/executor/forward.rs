/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! `forward` executor plugin.
//!
//! Forwards the (possibly rewritten) query message to a single UDP upstream
//! and installs the upstream answer as the context response. Failures are
//! logged and leave the response empty; the listener answers SERVFAIL.

use crate::config::types::PluginConfig;
use crate::continue_next;
use crate::core::context::DnsContext;
use crate::core::error::{DnsError, Result};
use crate::plugin::executor::sequence::chain::ChainNode;
use crate::plugin::executor::{ExecResult, Executor};
use crate::plugin::{Plugin, PluginFactory, PluginRegistry, UninitializedPlugin};
use async_trait::async_trait;
use hickory_client::client::Client;
use hickory_client::proto::runtime::TokioRuntimeProvider;
use hickory_client::proto::udp::UdpClientStream;
use hickory_client::proto::xfer::{DnsHandle, DnsRequest, DnsRequestOptions, FirstAnswer};
use hickory_proto::op::Message;
use serde::Deserialize;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Deserialize)]
struct ForwardArgs {
    upstream: String,
    /// Query timeout in seconds.
    timeout: Option<u64>,
}

struct Forward {
    tag: String,
    upstream: SocketAddr,
    timeout: Duration,
    client: Mutex<Option<Client>>,
}

impl std::fmt::Debug for Forward {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forward")
            .field("tag", &self.tag)
            .field("upstream", &self.upstream)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Forward {
    async fn query_upstream(&self, request: Message, deadline: Instant) -> Result<Message> {
        let Some(mut client) = self.client.lock().unwrap().clone() else {
            return Err(DnsError::plugin(format!(
                "forward '{}' has no connected client",
                self.tag
            )));
        };

        let budget = self
            .timeout
            .min(deadline.saturating_duration_since(Instant::now()));
        let request = DnsRequest::new(request, DnsRequestOptions::default());

        let response = tokio::time::timeout(budget, client.send(request).first_answer())
            .await
            .map_err(|_| DnsError::plugin(format!("upstream {} timed out", self.upstream)))??;
        Ok(Message::from(response))
    }
}

#[async_trait]
impl Plugin for Forward {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn init(&mut self) -> Result<()> {
        let conn =
            UdpClientStream::builder(self.upstream, TokioRuntimeProvider::default()).build();
        let (client, bg) = Client::connect(conn).await?;
        tokio::spawn(bg);

        *self.client.lock().unwrap() = Some(client);
        info!(tag = %self.tag, upstream = %self.upstream, "forward upstream connected");
        Ok(())
    }
}

#[async_trait]
impl Executor for Forward {
    async fn execute(
        &self,
        context: &mut DnsContext,
        next: Option<&Arc<dyn ChainNode>>,
    ) -> ExecResult {
        match self
            .query_upstream(context.request.clone(), context.deadline)
            .await
        {
            Ok(mut response) => {
                response.set_id(context.request.id());
                context.set_response(response);
            }
            Err(e) => {
                warn!(
                    tag = %self.tag,
                    upstream = %self.upstream,
                    query = %context.request.queries().first().map(|q| q.name().to_utf8()).unwrap_or_default(),
                    error = %e,
                    "upstream query failed"
                );
            }
        }
        continue_next!(next, context)
    }
}

#[derive(Debug, Clone)]
pub struct ForwardFactory;

impl PluginFactory for ForwardFactory {
    fn validate_config(&self, plugin_config: &PluginConfig) -> Result<()> {
        let args = parse_args(plugin_config)?;
        parse_upstream(&args.upstream)?;
        Ok(())
    }

    fn create(
        &self,
        plugin_config: &PluginConfig,
        _registry: Arc<PluginRegistry>,
    ) -> Result<UninitializedPlugin> {
        let args = parse_args(plugin_config)?;
        Ok(UninitializedPlugin::Executor(Box::new(Forward {
            tag: plugin_config.tag.clone(),
            upstream: parse_upstream(&args.upstream)?,
            timeout: args.timeout.map(Duration::from_secs).unwrap_or(DEFAULT_TIMEOUT),
            client: Mutex::new(None),
        })))
    }

    fn quick_setup(
        &self,
        tag: &str,
        param: Option<String>,
        _registry: Arc<PluginRegistry>,
    ) -> Result<UninitializedPlugin> {
        let upstream = param
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| DnsError::plugin("forward quick setup requires an upstream address"))?;

        Ok(UninitializedPlugin::Executor(Box::new(Forward {
            tag: tag.to_string(),
            upstream: parse_upstream(upstream.trim())?,
            timeout: DEFAULT_TIMEOUT,
            client: Mutex::new(None),
        })))
    }
}

fn parse_args(plugin_config: &PluginConfig) -> Result<ForwardArgs> {
    let args = plugin_config
        .args
        .clone()
        .ok_or_else(|| DnsError::plugin("forward requires args"))?;
    serde_yml::from_value(args)
        .map_err(|e| DnsError::plugin(format!("failed to parse forward config: {}", e)))
}

/// Accept `ip:port` or a bare IP (defaulting to port 53).
fn parse_upstream(raw: &str) -> Result<SocketAddr> {
    if let Ok(addr) = SocketAddr::from_str(raw) {
        return Ok(addr);
    }
    let ip = std::net::IpAddr::from_str(raw)
        .map_err(|_| DnsError::config(format!("invalid upstream address '{}'", raw)))?;
    Ok(SocketAddr::new(ip, 53))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_upstream() {
        assert_eq!(
            parse_upstream("9.9.9.9").unwrap(),
            "9.9.9.9:53".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_upstream("1.1.1.1:5353").unwrap(),
            "1.1.1.1:5353".parse::<SocketAddr>().unwrap()
        );
        assert!(parse_upstream("dns.example").is_err());
    }
}
