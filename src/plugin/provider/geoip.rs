/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! `geoip` provider plugin.
//!
//! Builds an IP prefix set from geoip file entries (`path:code` specs) and
//! inline CIDR expressions.

use crate::config::types::PluginConfig;
use crate::core::error::{DnsError, Result};
use crate::core::netlist::{NetList, parse_net_token};
use crate::pkg::geofile;
use crate::plugin::provider::{Provider, split_file_spec};
use crate::plugin::{Plugin, PluginFactory, PluginRegistry, UninitializedPlugin};
use async_trait::async_trait;
use serde::Deserialize;
use std::any::Any;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Deserialize, Default)]
struct GeoIpArgs {
    /// `path:code` file specs.
    #[serde(default)]
    files: Vec<String>,
    /// Inline IP/CIDR expressions.
    #[serde(default)]
    ips: Vec<String>,
}

#[derive(Debug)]
pub struct GeoIp {
    tag: String,
    nets: NetList,
}

#[async_trait]
impl Plugin for GeoIp {
    fn tag(&self) -> &str {
        &self.tag
    }
}

impl Provider for GeoIp {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn contains_ip(&self, ip: IpAddr) -> bool {
        self.nets.contains(ip)
    }
}

#[derive(Debug, Clone)]
pub struct GeoIpFactory;

impl PluginFactory for GeoIpFactory {
    fn create(
        &self,
        plugin_config: &PluginConfig,
        _registry: Arc<PluginRegistry>,
    ) -> Result<UninitializedPlugin> {
        let args = plugin_config
            .args
            .clone()
            .map(serde_yml::from_value::<GeoIpArgs>)
            .transpose()
            .map_err(|e| DnsError::plugin(format!("failed to parse geoip config: {}", e)))?
            .unwrap_or_default();

        let mut nets = NetList::new();
        for spec in &args.files {
            let (path, code) = split_file_spec(spec).ok_or_else(|| {
                DnsError::config(format!("geoip file spec '{}' is not 'path:code'", spec))
            })?;
            let prefixes = geofile::load_ip(path, code)?;
            for prefix in prefixes.iter() {
                nets.append(*prefix);
            }
        }
        for ip in &args.ips {
            nets.append(parse_net_token(ip).map_err(DnsError::config)?);
        }
        nets.sort();

        info!(tag = %plugin_config.tag, prefixes = nets.len(), "geoip provider loaded");
        Ok(UninitializedPlugin::Provider(Box::new(GeoIp {
            tag: plugin_config.tag.clone(),
            nets,
        })))
    }
}
