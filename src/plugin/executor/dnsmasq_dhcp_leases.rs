/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! `dnsmasq_dhcp_leases` executor plugin.
//!
//! Answers A/AAAA/PTR queries for hosts found in a dnsmasq leases file. The
//! file is watched for changes; each rebuild publishes a new lookup table by
//! atomic swap and optionally pre-warms a cache plugin referenced by
//! `cache_tag`. Answer TTLs follow the remaining lease time.

use crate::config::types::PluginConfig;
use crate::continue_next;
use crate::core::context::DnsContext;
use crate::core::dns_utils::{build_response_from_request, fake_soa, ip_to_ptr_fqdn, parse_ptr_name};
use crate::core::error::{DnsError, Result};
use crate::core::rule_matcher::{DomainRuleKind, MixMatcher};
use crate::plugin::executor::sequence::chain::ChainNode;
use crate::plugin::executor::{ExecResult, Executor};
use crate::plugin::{
    DnsStore, DnsStoreHandle, Plugin, PluginFactory, PluginRegistry, UninitializedPlugin,
};
use ahash::AHashMap;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use hickory_proto::op::{Message, Query, ResponseCode};
use hickory_proto::rr::rdata::name::PTR;
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use serde::Deserialize;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

const WATCH_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub(crate) struct Lease {
    hostname: String,
    ip: IpAddr,
    /// Lease expiry, unix seconds.
    expires: i64,
}

impl Lease {
    fn remaining_ttl(&self, now: i64) -> u32 {
        (self.expires - now).max(0) as u32
    }
}

#[derive(Debug, Default)]
struct LeaseGroup {
    ipv4: Vec<Lease>,
    ipv6: Vec<Lease>,
}

#[derive(Debug)]
struct LeaseTable {
    matcher: MixMatcher<Arc<LeaseGroup>>,
    /// Every registered fqdn key, for cache pre-warming.
    fqdns: Vec<String>,
    ipv4: Vec<Lease>,
    ipv6: Vec<Lease>,
}

impl LeaseTable {
    fn empty() -> LeaseTable {
        LeaseTable {
            matcher: MixMatcher::with_default_kind(DomainRuleKind::Full),
            fqdns: Vec::new(),
            ipv4: Vec::new(),
            ipv6: Vec::new(),
        }
    }
}

/// Parse dnsmasq leases text: `expiry mac ip hostname client-id` per line.
pub(crate) fn parse_leases(text: &str) -> Vec<Lease> {
    let mut leases = Vec::new();
    for line in text.lines() {
        let mut fields = line.split_whitespace();
        let (Some(expiry), Some(_mac), Some(ip), Some(hostname)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        let Ok(expires) = expiry.parse::<i64>() else {
            continue;
        };
        let Ok(ip) = ip.parse::<IpAddr>() else {
            continue;
        };
        leases.push(Lease {
            hostname: hostname.to_string(),
            ip,
            expires,
        });
    }
    leases
}

fn build_table(leases: &[Lease], suffixes: &[String]) -> Result<LeaseTable> {
    let mut groups: AHashMap<String, LeaseGroup> = AHashMap::new();
    let mut ipv4 = Vec::new();
    let mut ipv6 = Vec::new();

    for lease in leases {
        // Clients without a reported hostname show up as `*`.
        if lease.hostname == "*" {
            continue;
        }
        let key = format!("{}.", lease.hostname);
        let group = groups.entry(key).or_default();
        match lease.ip {
            IpAddr::V4(_) => {
                group.ipv4.push(lease.clone());
                ipv4.push(lease.clone());
            }
            IpAddr::V6(_) => {
                group.ipv6.push(lease.clone());
                ipv6.push(lease.clone());
            }
        }
    }

    let mut matcher = MixMatcher::with_default_kind(DomainRuleKind::Full);
    let mut fqdns = Vec::new();
    for (key, group) in groups {
        let group = Arc::new(group);
        matcher.add(&key, group.clone()).map_err(DnsError::plugin)?;
        fqdns.push(key.clone());
        for suffix in suffixes {
            let suffixed = format!("{}{}.", key, suffix.trim_matches('.'));
            matcher.add(&suffixed, group.clone()).map_err(DnsError::plugin)?;
            fqdns.push(suffixed);
        }
    }
    matcher.finalize().map_err(DnsError::plugin)?;

    Ok(LeaseTable {
        matcher,
        fqdns,
        ipv4,
        ipv6,
    })
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[derive(Debug)]
pub struct DhcpLeases {
    tag: String,
    file: String,
    suffixes: Vec<String>,
    cache_tag: Option<String>,
    table: Arc<ArcSwap<LeaseTable>>,
    store: Option<Arc<dyn DnsStore>>,
    registry: Arc<PluginRegistry>,
}

fn response_query_from(table: &LeaseTable, q: &Message, now: i64) -> Option<Message> {
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

    let fqdn = query.name().to_string();
    let group = table.matcher.lookup(&fqdn)?;

    let mut r = build_response_from_request(q, ResponseCode::NoError);
    let qname = query.name().clone();
    match qtype {
        RecordType::A => {
            for lease in &group.ipv4 {
                if let IpAddr::V4(v4) = lease.ip {
                    r.add_answer(Record::from_rdata(
                        qname.clone(),
                        lease.remaining_ttl(now),
                        RData::A(A(v4)),
                    ));
                }
            }
        }
        RecordType::AAAA => {
            for lease in &group.ipv6 {
                if let IpAddr::V6(v6) = lease.ip {
                    r.add_answer(Record::from_rdata(
                        qname.clone(),
                        lease.remaining_ttl(now),
                        RData::AAAA(AAAA(v6)),
                    ));
                }
            }
        }
        _ => unreachable!(),
    }

    if r.answers().is_empty() {
        // Known host, wrong family: negative answer with a fake SOA.
        r.add_name_server(fake_soa(&qname));
    } else {
        r.set_authoritative(true);
    }
    Some(r)
}

fn response_ptr_from(table: &LeaseTable, q: &Message, now: i64) -> Option<Message> {
    if q.queries().len() != 1 {
        return None;
    }
    let query = q.queries().first()?;
    if query.query_class() != DNSClass::IN || query.query_type() != RecordType::PTR {
        return None;
    }
    let addr = parse_ptr_name(query.name())?;

    let leases = if addr.is_ipv4() { &table.ipv4 } else { &table.ipv6 };
    let lease = leases.iter().find(|lease| lease.ip == addr)?;

    let target = Name::from_ascii(format!("{}.", lease.hostname)).ok()?;
    let mut r = build_response_from_request(q, ResponseCode::NoError);
    r.set_authoritative(true);
    r.add_answer(Record::from_rdata(
        query.name().clone(),
        lease.remaining_ttl(now),
        RData::PTR(PTR(target)),
    ));
    Some(r)
}

/// Push every lease answer of `table` into the cache.
async fn prewarm_cache(table: &LeaseTable, store: &Arc<dyn DnsStore>) {
    store.clean().await;

    let now = now_unix();
    for fqdn in &table.fqdns {
        for qtype in [RecordType::A, RecordType::AAAA] {
            let Ok(name) = Name::from_ascii(fqdn) else {
                continue;
            };
            let mut q = Message::new();
            q.add_query(Query::query(name, qtype));
            if let Some(r) = response_query_from(table, &q, now) {
                if !r.answers().is_empty() {
                    store.store_dns(&q, &r).await;
                }
            }
        }
    }
    for lease in table.ipv4.iter().chain(table.ipv6.iter()) {
        let fqdn = ip_to_ptr_fqdn(lease.ip);
        let Ok(name) = Name::from_ascii(&fqdn) else {
            continue;
        };
        let mut q = Message::new();
        q.add_query(Query::query(name, RecordType::PTR));
        if let Some(r) = response_ptr_from(table, &q, now) {
            store.store_dns(&q, &r).await;
        }
    }
}

impl DhcpLeases {
    fn response_query_at(&self, q: &Message, now: i64) -> Option<Message> {
        response_query_from(&self.table.load(), q, now)
    }

    fn response_ptr_at(&self, q: &Message, now: i64) -> Option<Message> {
        response_ptr_from(&self.table.load(), q, now)
    }

    async fn rebuild(&self) -> Result<()> {
        let text = std::fs::read_to_string(&self.file)
            .map_err(|e| DnsError::plugin(format!("failed to read leases '{}': {}", self.file, e)))?;
        let leases = parse_leases(&text);
        let table = Arc::new(build_table(&leases, &self.suffixes)?);
        info!(
            tag = %self.tag,
            leases = leases.len(),
            names = table.fqdns.len(),
            "dhcp lease table rebuilt"
        );
        self.table.store(table.clone());
        if let Some(store) = self.store.as_ref() {
            prewarm_cache(&table, store).await;
        }
        Ok(())
    }

    fn spawn_watcher(&self) {
        let tag = self.tag.clone();
        let file = self.file.clone();
        let suffixes = self.suffixes.clone();
        let table = self.table.clone();
        let store = self.store.clone();

        tokio::spawn(async move {
            let mut last_modified = std::fs::metadata(&file).and_then(|m| m.modified()).ok();
            loop {
                tokio::time::sleep(WATCH_INTERVAL).await;
                let modified = match std::fs::metadata(&file).and_then(|m| m.modified()) {
                    Ok(m) => m,
                    Err(e) => {
                        debug!(tag = %tag, error = %e, "leases file not readable");
                        continue;
                    }
                };
                if last_modified == Some(modified) {
                    continue;
                }
                last_modified = Some(modified);

                match std::fs::read_to_string(&file)
                    .map_err(|e| DnsError::plugin(e.to_string()))
                    .and_then(|text| build_table(&parse_leases(&text), &suffixes))
                {
                    Ok(new_table) => {
                        let new_table = Arc::new(new_table);
                        info!(tag = %tag, names = new_table.fqdns.len(), "dhcp leases reloaded");
                        table.store(new_table.clone());
                        if let Some(store) = store.as_ref() {
                            prewarm_cache(&new_table, store).await;
                        }
                    }
                    Err(e) => warn!(tag = %tag, error = %e, "failed to reload leases"),
                }
            }
        });
    }
}

#[async_trait]
impl Plugin for DhcpLeases {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn init(&mut self) -> Result<()> {
        if let Some(cache_tag) = &self.cache_tag {
            let handle = self
                .registry
                .get_shared::<DnsStoreHandle>(cache_tag)
                .ok_or_else(|| {
                    DnsError::plugin(format!(
                        "dnsmasq_dhcp_leases '{}': cache_tag '{}' is not a cache plugin",
                        self.tag, cache_tag
                    ))
                })?;
            self.store = Some(handle.0.clone());
        }
        self.rebuild().await?;
        self.spawn_watcher();
        Ok(())
    }
}

#[async_trait]
impl Executor for DhcpLeases {
    async fn execute(
        &self,
        context: &mut DnsContext,
        next: Option<&Arc<dyn ChainNode>>,
    ) -> ExecResult {
        let now = now_unix();
        if context.response.is_none() {
            if let Some(mut r) = self.response_ptr_at(&context.request, now) {
                debug!(tag = %self.tag, "dhcp ptr answer");
                r.set_id(context.request.id());
                context.set_response(r);
            }
        }
        if context.response.is_none() {
            if let Some(mut r) = self.response_query_at(&context.request, now) {
                debug!(tag = %self.tag, "dhcp lease answer");
                r.set_id(context.request.id());
                context.set_response(r);
            }
        }
        continue_next!(next, context)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct DhcpLeasesArgs {
    file: String,
    #[serde(default)]
    suffix: Vec<String>,
    cache_tag: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DhcpLeasesFactory;

impl PluginFactory for DhcpLeasesFactory {
    fn validate_config(&self, plugin_config: &PluginConfig) -> Result<()> {
        parse_args(plugin_config)?;
        Ok(())
    }

    fn get_dependencies(&self, plugin_config: &PluginConfig) -> Vec<String> {
        parse_args(plugin_config)
            .ok()
            .and_then(|args| args.cache_tag)
            .map(|tag| vec![tag])
            .unwrap_or_default()
    }

    fn create(
        &self,
        plugin_config: &PluginConfig,
        registry: Arc<PluginRegistry>,
    ) -> Result<UninitializedPlugin> {
        let args = parse_args(plugin_config)?;

        Ok(UninitializedPlugin::Executor(Box::new(DhcpLeases {
            tag: plugin_config.tag.clone(),
            file: args.file,
            suffixes: args.suffix,
            cache_tag: args.cache_tag,
            table: Arc::new(ArcSwap::from_pointee(LeaseTable::empty())),
            store: None,
            registry,
        })))
    }
}

fn parse_args(plugin_config: &PluginConfig) -> Result<DhcpLeasesArgs> {
    let args = plugin_config
        .args
        .clone()
        .ok_or_else(|| DnsError::plugin("dnsmasq_dhcp_leases requires args"))?;
    serde_yml::from_value(args)
        .map_err(|e| DnsError::plugin(format!("failed to parse dnsmasq_dhcp_leases config: {}", e)))
}
