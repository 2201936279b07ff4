/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! `udp_server` plugin.
//!
//! Listens for DNS queries over UDP (or a Unix datagram socket when the
//! listen address starts with `@` or `/`) and runs each one through the
//! configured entry executor. Every inbound packet is handled in its own
//! task; executor failures answer SERVFAIL. Fatal listener errors go to the
//! registry's close channel and terminate the process.

use crate::config::types::PluginConfig;
use crate::core::context::DnsContext;
use crate::core::dns_utils::build_response_from_request;
use crate::core::error::{DnsError, Result};
use crate::plugin::executor::Executor;
use crate::plugin::{Plugin, PluginFactory, PluginRegistry, UninitializedPlugin};
use async_trait::async_trait;
use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use serde::Deserialize;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use tokio::net::{UdpSocket, UnixDatagram};
use tracing::{debug, error, info, warn};

const MAX_DATAGRAM: usize = 65_535;

#[derive(Debug, Clone, Deserialize)]
struct UdpServerArgs {
    /// Entry executor plugin tag.
    entry: String,
    /// `host:port`, or a Unix socket path starting with `@` or `/`.
    #[serde(default = "default_listen")]
    listen: String,
}

fn default_listen() -> String {
    "127.0.0.1:53".to_string()
}

#[derive(Debug)]
pub struct UdpServer {
    tag: String,
    entry_tag: String,
    listen: String,
    registry: Arc<PluginRegistry>,
}

#[async_trait]
impl Plugin for UdpServer {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn init(&mut self) -> Result<()> {
        let entry = self
            .registry
            .get_plugin(&self.entry_tag)
            .ok_or_else(|| {
                DnsError::plugin(format!(
                    "udp_server '{}': entry plugin '{}' does not exist",
                    self.tag, self.entry_tag
                ))
            })?
            .to_executor()?;

        let close_tx = self.registry.close_sender();
        let tag = self.tag.clone();

        if is_unix_listen(&self.listen) {
            let path = self.listen.clone();
            // Replace a stale socket file from a previous run.
            let _ = std::fs::remove_file(&path);
            let socket = UnixDatagram::bind(&path)
                .map_err(|e| DnsError::plugin(format!("failed to bind '{}': {}", path, e)))?;
            info!(tag = %tag, path = %path, "unix datagram server started");

            tokio::spawn(async move {
                let err = serve_unix(Arc::new(socket), entry).await;
                let _ = close_tx.send(DnsError::plugin(format!(
                    "udp_server '{}' stopped: {}",
                    tag, err
                )));
            });
        } else {
            let addr = SocketAddr::from_str(&self.listen).map_err(|e| {
                DnsError::config(format!("invalid listen address '{}': {}", self.listen, e))
            })?;
            let socket = build_udp_socket(addr)?;
            info!(tag = %tag, addr = %addr, "udp server started");

            tokio::spawn(async move {
                let err = serve_udp(Arc::new(socket), entry).await;
                let _ = close_tx.send(DnsError::plugin(format!(
                    "udp_server '{}' stopped: {}",
                    tag, err
                )));
            });
        }
        Ok(())
    }

    async fn destroy(&self) {
        if is_unix_listen(&self.listen) {
            let _ = std::fs::remove_file(&self.listen);
        }
    }
}

fn is_unix_listen(listen: &str) -> bool {
    listen.starts_with('@') || listen.starts_with('/')
}

/// Bind with address and port reuse so multiple workers can share a port.
fn build_udp_socket(addr: SocketAddr) -> Result<UdpSocket> {
    let sock = if addr.is_ipv4() {
        Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?
    } else {
        Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?
    };

    sock.set_nonblocking(true)?;
    sock.set_reuse_address(true)?;
    #[cfg(not(target_os = "windows"))]
    let _ = sock.set_reuse_port(true);

    sock.bind(&addr.into())?;
    Ok(UdpSocket::from_std(sock.into())?)
}

async fn serve_udp(socket: Arc<UdpSocket>, entry: Arc<dyn Executor>) -> DnsError {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, src_addr) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => return e.into(),
        };
        let packet = buf[..len].to_vec();
        let socket = socket.clone();
        let entry = entry.clone();

        tokio::spawn(async move {
            if let Some(response) = handle_packet(&packet, src_addr, entry).await {
                if let Err(e) = socket.send_to(&response, src_addr).await {
                    warn!(src = %src_addr, error = %e, "failed to send response");
                }
            }
        });
    }
}

async fn serve_unix(socket: Arc<UnixDatagram>, entry: Arc<dyn Executor>) -> DnsError {
    // Unix datagram peers are only reachable when they bound a path
    // themselves, so replies go back synchronously per packet.
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let placeholder: SocketAddr = "127.0.0.1:0".parse().expect("static addr");
    loop {
        let (len, src_addr) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => return e.into(),
        };

        if let Some(response) = handle_packet(&buf[..len], placeholder, entry.clone()).await {
            let Some(path) = src_addr.as_pathname() else {
                debug!("dropping reply to unnamed unix peer");
                continue;
            };
            if let Err(e) = socket.send_to(&response, path).await {
                warn!(error = %e, "failed to send unix response");
            }
        }
    }
}

/// Decode one query, run the entry executor, and serialize the reply.
async fn handle_packet(
    packet: &[u8],
    src_addr: SocketAddr,
    entry: Arc<dyn Executor>,
) -> Option<Vec<u8>> {
    let request = match Message::from_bytes(packet) {
        Ok(message) => message,
        Err(e) => {
            debug!(src = %src_addr, error = %e, "dropping undecodable packet");
            return None;
        }
    };

    let request_id = request.id();
    let mut context = DnsContext::new(src_addr, request);

    let mut response = match entry.execute(&mut context, None).await {
        Ok(()) => match context.response.take() {
            Some(response) => response,
            None => build_response_from_request(&context.request, ResponseCode::ServFail),
        },
        Err(e) => {
            error!(src = %src_addr, error = %e, "entry executor failed");
            build_response_from_request(&context.request, ResponseCode::ServFail)
        }
    };

    response.set_id(request_id);
    match response.to_bytes() {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            error!(src = %src_addr, error = %e, "failed to encode response");
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct UdpServerFactory;

impl PluginFactory for UdpServerFactory {
    fn validate_config(&self, plugin_config: &PluginConfig) -> Result<()> {
        let args = parse_args(plugin_config)?;
        if !is_unix_listen(&args.listen) && SocketAddr::from_str(&args.listen).is_err() {
            return Err(DnsError::config(format!(
                "invalid listen address '{}'",
                args.listen
            )));
        }
        Ok(())
    }

    fn get_dependencies(&self, plugin_config: &PluginConfig) -> Vec<String> {
        parse_args(plugin_config)
            .map(|args| vec![args.entry])
            .unwrap_or_default()
    }

    fn create(
        &self,
        plugin_config: &PluginConfig,
        registry: Arc<PluginRegistry>,
    ) -> Result<UninitializedPlugin> {
        let args = parse_args(plugin_config)?;
        Ok(UninitializedPlugin::Server(Box::new(UdpServer {
            tag: plugin_config.tag.clone(),
            entry_tag: args.entry,
            listen: args.listen,
            registry,
        })))
    }
}

fn parse_args(plugin_config: &PluginConfig) -> Result<UdpServerArgs> {
    let args = plugin_config
        .args
        .clone()
        .ok_or_else(|| DnsError::plugin("udp_server requires 'entry' and 'listen'"))?;
    serde_yml::from_value(args)
        .map_err(|e| DnsError::plugin(format!("failed to parse udp_server config: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::continue_next;
    use crate::plugin::executor::ExecResult;
    use crate::plugin::executor::sequence::chain::ChainNode;
    use hickory_proto::op::Query;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record, RecordType};
    use std::net::Ipv4Addr;

    #[derive(Debug)]
    struct StaticAnswer {
        fail: bool,
    }

    #[async_trait]
    impl Plugin for StaticAnswer {
        fn tag(&self) -> &str {
            "static"
        }
    }

    #[async_trait]
    impl Executor for StaticAnswer {
        async fn execute(
            &self,
            context: &mut DnsContext,
            next: Option<&Arc<dyn ChainNode>>,
        ) -> ExecResult {
            if self.fail {
                return Err(DnsError::plugin("boom"));
            }
            let mut r =
                build_response_from_request(&context.request, ResponseCode::NoError);
            let qname = context.request.queries()[0].name().clone();
            r.add_answer(Record::from_rdata(
                qname,
                60,
                RData::A(A(Ipv4Addr::new(192, 0, 2, 1))),
            ));
            // Deliberately wrong id: the listener must restore the query id.
            r.set_id(0xdead);
            context.set_response(r);
            continue_next!(next, context)
        }
    }

    fn query_bytes() -> Vec<u8> {
        let mut q = Message::new();
        q.set_id(0x1020);
        q.add_query(Query::query(
            Name::from_ascii("example.com.").unwrap(),
            RecordType::A,
        ));
        q.to_bytes().unwrap()
    }

    #[tokio::test]
    async fn test_handle_packet_preserves_query_id() {
        let entry: Arc<dyn Executor> = Arc::new(StaticAnswer { fail: false });
        let bytes = handle_packet(&query_bytes(), "127.0.0.1:9999".parse().unwrap(), entry)
            .await
            .unwrap();

        let response = Message::from_bytes(&bytes).unwrap();
        assert_eq!(response.id(), 0x1020);
        assert_eq!(response.answers().len(), 1);
    }

    #[tokio::test]
    async fn test_executor_error_yields_servfail() {
        let entry: Arc<dyn Executor> = Arc::new(StaticAnswer { fail: true });
        let bytes = handle_packet(&query_bytes(), "127.0.0.1:9999".parse().unwrap(), entry)
            .await
            .unwrap();

        let response = Message::from_bytes(&bytes).unwrap();
        assert_eq!(response.response_code(), ResponseCode::ServFail);
        assert_eq!(response.id(), 0x1020);
    }

    #[tokio::test]
    async fn test_garbage_packet_is_dropped() {
        let entry: Arc<dyn Executor> = Arc::new(StaticAnswer { fail: false });
        assert!(
            handle_packet(&[0x01, 0x02], "127.0.0.1:9999".parse().unwrap(), entry)
                .await
                .is_none()
        );
    }

    #[test]
    fn test_unix_listen_detection() {
        assert!(is_unix_listen("/run/seqdns.sock"));
        assert!(is_unix_listen("@seqdns"));
        assert!(!is_unix_listen("0.0.0.0:53"));
    }
}
