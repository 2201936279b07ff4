/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! `geosite` provider plugin.
//!
//! Builds a domain matcher from geosite file entries (`path:code` specs) and
//! inline domain expressions.

use crate::config::types::PluginConfig;
use crate::core::error::{DnsError, Result};
use crate::core::rule_matcher::MixMatcher;
use crate::pkg::geofile;
use crate::plugin::provider::{Provider, split_file_spec};
use crate::plugin::{Plugin, PluginFactory, PluginRegistry, UninitializedPlugin};
use async_trait::async_trait;
use serde::Deserialize;
use std::any::Any;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Deserialize, Default)]
struct GeoSiteArgs {
    /// `path:code` file specs.
    #[serde(default)]
    files: Vec<String>,
    /// Inline domain expressions.
    #[serde(default)]
    domains: Vec<String>,
}

#[derive(Debug)]
pub struct GeoSite {
    tag: String,
    domains: MixMatcher<()>,
}

#[async_trait]
impl Plugin for GeoSite {
    fn tag(&self) -> &str {
        &self.tag
    }
}

impl Provider for GeoSite {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn contains_domain(&self, domain: &str) -> bool {
        self.domains.is_match(domain)
    }
}

#[derive(Debug, Clone)]
pub struct GeoSiteFactory;

impl PluginFactory for GeoSiteFactory {
    fn create(
        &self,
        plugin_config: &PluginConfig,
        _registry: Arc<PluginRegistry>,
    ) -> Result<UninitializedPlugin> {
        let args = plugin_config
            .args
            .clone()
            .map(serde_yml::from_value::<GeoSiteArgs>)
            .transpose()
            .map_err(|e| DnsError::plugin(format!("failed to parse geosite config: {}", e)))?
            .unwrap_or_default();

        let mut domains = MixMatcher::default();
        for spec in &args.files {
            let (path, code) = split_file_spec(spec).ok_or_else(|| {
                DnsError::config(format!("geosite file spec '{}' is not 'path:code'", spec))
            })?;
            let entries = geofile::load_site(path, code)?;
            for entry in entries.iter() {
                let exp = format!("{}:{}", entry.kind.rule_prefix(), entry.value);
                domains.add(&exp, ()).map_err(|e| {
                    DnsError::config(format!("bad entry in '{}' code '{}': {}", path, code, e))
                })?;
            }
        }
        for exp in &args.domains {
            domains.add(exp, ()).map_err(DnsError::config)?;
        }
        domains.finalize().map_err(DnsError::config)?;

        info!(tag = %plugin_config.tag, rules = domains.len(), "geosite provider loaded");
        Ok(UninitializedPlugin::Provider(Box::new(GeoSite {
            tag: plugin_config.tag.clone(),
            domains,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkg::geofile::{GeoDomain, GeoDomainKind};

    fn build_matcher(entries: &[GeoDomain]) -> MixMatcher<()> {
        let mut m = MixMatcher::default();
        for entry in entries {
            let exp = format!("{}:{}", entry.kind.rule_prefix(), entry.value);
            m.add(&exp, ()).unwrap();
        }
        m.finalize().unwrap();
        m
    }

    #[test]
    fn test_entry_kinds_map_to_matcher_kinds() {
        let m = build_matcher(&[
            GeoDomain {
                kind: GeoDomainKind::Full,
                value: "exact.cn".into(),
            },
            GeoDomain {
                kind: GeoDomainKind::RootDomain,
                value: "root.cn".into(),
            },
            GeoDomain {
                kind: GeoDomainKind::Plain,
                value: "tracker".into(),
            },
        ]);

        assert!(m.is_match("exact.cn"));
        assert!(!m.is_match("sub.exact.cn"));
        assert!(m.is_match("sub.root.cn"));
        assert!(m.is_match("ad.tracker.example"));
        assert!(!m.is_match("other.us"));
    }
}
