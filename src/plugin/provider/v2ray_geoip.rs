/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! `v2ray_geoip` provider plugin.
//!
//! Loads whole geoip files and keeps the entries whose country codes are
//! listed in `codes`; `sets` pull in other IP providers.

use crate::config::types::PluginConfig;
use crate::core::error::{DnsError, Result};
use crate::core::netlist::NetList;
use crate::pkg::geofile;
use crate::plugin::provider::Provider;
use crate::plugin::{Plugin, PluginFactory, PluginRegistry, UninitializedPlugin};
use ahash::AHashSet;
use async_trait::async_trait;
use serde::Deserialize;
use std::any::Any;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Deserialize, Default)]
struct V2rayGeoIpArgs {
    #[serde(default)]
    files: Vec<String>,
    /// Referenced IP provider tags.
    #[serde(default)]
    sets: Vec<String>,
    /// Country codes selecting entries across all files.
    #[serde(default)]
    codes: Vec<String>,
}

#[derive(Debug)]
pub struct V2rayGeoIp {
    tag: String,
    nets: NetList,
    set_tags: Vec<String>,
    providers: Vec<Arc<dyn Provider>>,
    registry: Arc<PluginRegistry>,
}

#[async_trait]
impl Plugin for V2rayGeoIp {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn init(&mut self) -> Result<()> {
        for tag in &self.set_tags {
            let plugin = self.registry.get_plugin(tag).ok_or_else(|| {
                DnsError::plugin(format!(
                    "v2ray_geoip '{}' references missing set '{}'",
                    self.tag, tag
                ))
            })?;
            self.providers.push(plugin.to_provider()?);
        }
        Ok(())
    }
}

impl Provider for V2rayGeoIp {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn contains_ip(&self, ip: IpAddr) -> bool {
        self.nets.contains(ip) || self.providers.iter().any(|p| p.contains_ip(ip))
    }
}

#[derive(Debug, Clone)]
pub struct V2rayGeoIpFactory;

impl PluginFactory for V2rayGeoIpFactory {
    fn get_dependencies(&self, plugin_config: &PluginConfig) -> Vec<String> {
        plugin_config
            .args
            .clone()
            .and_then(|args| serde_yml::from_value::<V2rayGeoIpArgs>(args).ok())
            .map(|args| args.sets)
            .unwrap_or_default()
    }

    fn create(
        &self,
        plugin_config: &PluginConfig,
        registry: Arc<PluginRegistry>,
    ) -> Result<UninitializedPlugin> {
        let args = plugin_config
            .args
            .clone()
            .map(serde_yml::from_value::<V2rayGeoIpArgs>)
            .transpose()
            .map_err(|e| DnsError::plugin(format!("failed to parse v2ray_geoip config: {}", e)))?
            .unwrap_or_default();

        let codes: AHashSet<String> = args
            .codes
            .iter()
            .map(|c| c.trim().to_ascii_uppercase())
            .filter(|c| !c.is_empty())
            .collect();

        let mut nets = NetList::new();
        for file in &args.files {
            let entries = geofile::load_ip_entries(file)?;
            for entry in entries.iter() {
                if !codes.contains(&entry.code.to_ascii_uppercase()) {
                    continue;
                }
                for prefix in &entry.prefixes {
                    nets.append(*prefix);
                }
            }
        }
        nets.sort();

        info!(
            tag = %plugin_config.tag,
            prefixes = nets.len(),
            sets = args.sets.len(),
            "v2ray_geoip provider loaded"
        );
        Ok(UninitializedPlugin::Provider(Box::new(V2rayGeoIp {
            tag: plugin_config.tag.clone(),
            nets,
            set_tags: args.sets,
            providers: Vec::new(),
            registry,
        })))
    }
}
