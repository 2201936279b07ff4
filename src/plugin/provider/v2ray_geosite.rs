/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! `v2ray_geosite` provider plugin.
//!
//! Loads whole geosite files and keeps the entries whose country codes are
//! listed in `codes`; `sets` pull in other domain providers.

use crate::config::types::PluginConfig;
use crate::core::error::{DnsError, Result};
use crate::core::rule_matcher::MixMatcher;
use crate::pkg::geofile;
use crate::plugin::provider::Provider;
use crate::plugin::{Plugin, PluginFactory, PluginRegistry, UninitializedPlugin};
use ahash::AHashSet;
use async_trait::async_trait;
use serde::Deserialize;
use std::any::Any;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Deserialize, Default)]
struct V2rayGeoSiteArgs {
    #[serde(default)]
    files: Vec<String>,
    /// Referenced domain provider tags.
    #[serde(default)]
    sets: Vec<String>,
    /// Country codes selecting entries across all files.
    #[serde(default)]
    codes: Vec<String>,
}

#[derive(Debug)]
pub struct V2rayGeoSite {
    tag: String,
    domains: MixMatcher<()>,
    set_tags: Vec<String>,
    providers: Vec<Arc<dyn Provider>>,
    registry: Arc<PluginRegistry>,
}

#[async_trait]
impl Plugin for V2rayGeoSite {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn init(&mut self) -> Result<()> {
        for tag in &self.set_tags {
            let plugin = self.registry.get_plugin(tag).ok_or_else(|| {
                DnsError::plugin(format!(
                    "v2ray_geosite '{}' references missing set '{}'",
                    self.tag, tag
                ))
            })?;
            self.providers.push(plugin.to_provider()?);
        }
        Ok(())
    }
}

impl Provider for V2rayGeoSite {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn contains_domain(&self, domain: &str) -> bool {
        self.domains.is_match(domain) || self.providers.iter().any(|p| p.contains_domain(domain))
    }
}

#[derive(Debug, Clone)]
pub struct V2rayGeoSiteFactory;

impl PluginFactory for V2rayGeoSiteFactory {
    fn get_dependencies(&self, plugin_config: &PluginConfig) -> Vec<String> {
        plugin_config
            .args
            .clone()
            .and_then(|args| serde_yml::from_value::<V2rayGeoSiteArgs>(args).ok())
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
            .map(serde_yml::from_value::<V2rayGeoSiteArgs>)
            .transpose()
            .map_err(|e| DnsError::plugin(format!("failed to parse v2ray_geosite config: {}", e)))?
            .unwrap_or_default();

        let codes: AHashSet<String> = args
            .codes
            .iter()
            .map(|c| c.trim().to_ascii_uppercase())
            .filter(|c| !c.is_empty())
            .collect();

        let mut domains = MixMatcher::default();
        for file in &args.files {
            let entries = geofile::load_site_entries(file)?;
            for entry in entries.iter() {
                if !codes.contains(&entry.code.to_ascii_uppercase()) {
                    continue;
                }
                for domain in &entry.domains {
                    let exp = format!("{}:{}", domain.kind.rule_prefix(), domain.value);
                    domains.add(&exp, ()).map_err(|e| {
                        DnsError::config(format!(
                            "bad entry for code '{}' in '{}': {}",
                            entry.code, file, e
                        ))
                    })?;
                }
            }
        }
        domains.finalize().map_err(DnsError::config)?;

        info!(
            tag = %plugin_config.tag,
            rules = domains.len(),
            sets = args.sets.len(),
            "v2ray_geosite provider loaded"
        );
        Ok(UninitializedPlugin::Provider(Box::new(V2rayGeoSite {
            tag: plugin_config.tag.clone(),
            domains,
            set_tags: args.sets,
            providers: Vec::new(),
            registry,
        })))
    }
}
