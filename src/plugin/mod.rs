/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Plugin framework.
//!
//! Every behavior of the server is a plugin created by a factory from its
//! YAML config block. Plugins are initialized in dependency order by the
//! [`registry::PluginRegistry`] and looked up by tag at sequence build time.

use crate::config::types::PluginConfig;
use crate::core::error::{DnsError, Result};
use crate::plugin::executor::Executor;
use crate::plugin::matcher::Matcher;
use crate::plugin::provider::Provider;
use async_trait::async_trait;
use hickory_proto::op::Message;
use std::fmt::Debug;
use std::sync::Arc;

pub mod dependency;
pub mod executor;
pub mod matcher;
pub mod provider;
pub mod registry;
pub mod server;

pub use registry::PluginRegistry;

/// Common plugin lifecycle.
#[async_trait]
pub trait Plugin: Debug + Send + Sync + 'static {
    fn tag(&self) -> &str;

    async fn init(&mut self) -> Result<()> {
        Ok(())
    }

    async fn destroy(&self) {}
}

/// Plugin constructor, one per plugin type.
pub trait PluginFactory: Debug + Send + Sync + 'static {
    /// Cheap config validation before any plugin is created.
    fn validate_config(&self, plugin_config: &PluginConfig) -> Result<()> {
        let _ = plugin_config;
        Ok(())
    }

    /// Tags of plugins that must be initialized before this one.
    fn get_dependencies(&self, plugin_config: &PluginConfig) -> Vec<String> {
        let _ = plugin_config;
        Vec::new()
    }

    fn create(
        &self,
        plugin_config: &PluginConfig,
        registry: Arc<PluginRegistry>,
    ) -> Result<UninitializedPlugin>;

    /// Build an anonymous plugin from inline sequence syntax
    /// (e.g. `black_hole 0.0.0.0`).
    fn quick_setup(
        &self,
        tag: &str,
        param: Option<String>,
        registry: Arc<PluginRegistry>,
    ) -> Result<UninitializedPlugin> {
        let _ = (param, registry);
        Err(DnsError::plugin(format!(
            "plugin '{}' does not support quick setup",
            tag
        )))
    }
}

/// Freshly created plugin, waiting for `init`.
#[derive(Debug)]
pub enum UninitializedPlugin {
    Executor(Box<dyn Executor>),
    Matcher(Box<dyn Matcher>),
    Provider(Box<dyn Provider>),
    Server(Box<dyn Plugin>),
}

impl UninitializedPlugin {
    pub async fn init_and_wrap(self) -> Result<PluginKind> {
        Ok(match self {
            UninitializedPlugin::Executor(mut p) => {
                p.init().await?;
                PluginKind::Executor(Arc::from(p))
            }
            UninitializedPlugin::Matcher(mut p) => {
                p.init().await?;
                PluginKind::Matcher(Arc::from(p))
            }
            UninitializedPlugin::Provider(mut p) => {
                p.init().await?;
                PluginKind::Provider(Arc::from(p))
            }
            UninitializedPlugin::Server(mut p) => {
                p.init().await?;
                PluginKind::Server(Arc::from(p))
            }
        })
    }
}

/// Initialized plugin behind its behavioral interface.
#[derive(Debug, Clone)]
pub enum PluginKind {
    Executor(Arc<dyn Executor>),
    Matcher(Arc<dyn Matcher>),
    Provider(Arc<dyn Provider>),
    Server(Arc<dyn Plugin>),
}

impl PluginKind {
    pub fn kind_name(&self) -> &'static str {
        match self {
            PluginKind::Executor(_) => "executor",
            PluginKind::Matcher(_) => "matcher",
            PluginKind::Provider(_) => "provider",
            PluginKind::Server(_) => "server",
        }
    }

    fn as_plugin(&self) -> &dyn Plugin {
        match self {
            PluginKind::Executor(p) => p.as_ref(),
            PluginKind::Matcher(p) => p.as_ref(),
            PluginKind::Provider(p) => p.as_ref(),
            PluginKind::Server(p) => p.as_ref(),
        }
    }
}

/// Registered plugin instance.
#[derive(Debug)]
pub struct PluginInfo {
    pub tag: String,
    pub kind: PluginKind,
}

impl PluginInfo {
    pub fn to_executor(&self) -> Result<Arc<dyn Executor>> {
        match &self.kind {
            PluginKind::Executor(p) => Ok(p.clone()),
            other => Err(DnsError::plugin(format!(
                "plugin '{}' is a {}, not an executor",
                self.tag,
                other.kind_name()
            ))),
        }
    }

    pub fn to_matcher(&self) -> Result<Arc<dyn Matcher>> {
        match &self.kind {
            PluginKind::Matcher(p) => Ok(p.clone()),
            other => Err(DnsError::plugin(format!(
                "plugin '{}' is a {}, not a matcher",
                self.tag,
                other.kind_name()
            ))),
        }
    }

    pub fn to_provider(&self) -> Result<Arc<dyn Provider>> {
        match &self.kind {
            PluginKind::Provider(p) => Ok(p.clone()),
            other => Err(DnsError::plugin(format!(
                "plugin '{}' is a {}, not a provider",
                self.tag,
                other.kind_name()
            ))),
        }
    }

    pub async fn destroy(&self) {
        self.kind.as_plugin().destroy().await;
    }
}

/// Message-level cache interface exposed by the cache plugins to plugins
/// that pre-warm or consult a cache by tag (`cache_tag` config options).
#[async_trait]
pub trait DnsStore: Debug + Send + Sync + 'static {
    /// Look the query up; the returned message is a ready response.
    async fn query_dns(&self, q: &Message) -> Option<Message>;

    /// Store a response for the query.
    async fn store_dns(&self, q: &Message, r: &Message);

    /// Drop every entry written under this store's prefix.
    async fn clean(&self);
}

/// Concrete wrapper so a `dyn DnsStore` can live in the registry's shared
/// value map.
#[derive(Debug, Clone)]
pub struct DnsStoreHandle(pub Arc<dyn DnsStore>);
