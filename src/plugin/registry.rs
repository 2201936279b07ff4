/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Plugin registry.
//!
//! Holds the factory table and every initialized plugin instance, resolves
//! init order from declared dependencies, and carries the shared close
//! channel listeners use to report fatal errors.

use crate::config::types::PluginConfig;
use crate::core::error::{DnsError, Result};
use crate::plugin::{PluginFactory, PluginInfo, dependency};
use dashmap::DashMap;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info};

pub struct PluginRegistry {
    /// Plugin type name -> factory.
    factories: HashMap<String, Box<dyn PluginFactory>>,

    /// Plugin tag -> initialized instance.
    plugins: DashMap<String, Arc<PluginInfo>>,

    /// Cross-plugin shared values (cache stores, black-hole address sets)
    /// registered by factories under their plugin tag.
    shared: DashMap<String, Arc<dyn Any + Send + Sync>>,

    /// Counter for anonymous quick-setup plugin tags.
    anon_counter: AtomicU64,

    close_tx: mpsc::UnboundedSender<DnsError>,
    close_rx: Mutex<Option<mpsc::UnboundedReceiver<DnsError>>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        let (close_tx, close_rx) = mpsc::unbounded_channel();
        PluginRegistry {
            factories: HashMap::new(),
            plugins: DashMap::new(),
            shared: DashMap::new(),
            anon_counter: AtomicU64::new(0),
            close_tx,
            close_rx: Mutex::new(Some(close_rx)),
        }
    }

    /// Registry preloaded with every built-in plugin factory.
    pub fn with_default_factories() -> Self {
        let mut registry = Self::new();
        crate::plugin::executor::install_factories(&mut registry);
        crate::plugin::matcher::install_factories(&mut registry);
        crate::plugin::provider::install_factories(&mut registry);
        crate::plugin::server::install_factories(&mut registry);
        registry
    }

    pub fn register_factory(&mut self, plugin_type: &str, factory: Box<dyn PluginFactory>) {
        self.factories.insert(plugin_type.to_string(), factory);
    }

    /// Initialize all plugins from configuration in dependency order.
    pub async fn init_plugins(self: &Arc<Self>, configs: Vec<PluginConfig>) -> Result<()> {
        for config in &configs {
            let factory = self.factory(&config.plugin_type)?;
            factory.validate_config(config)?;
        }

        let get_deps = |config: &PluginConfig| {
            self.factories
                .get(&config.plugin_type)
                .map(|f| f.get_dependencies(config))
                .unwrap_or_default()
        };
        let sorted = dependency::resolve_dependencies(configs, &get_deps)?;

        info!(count = sorted.len(), "initializing plugins in dependency order");
        for (idx, config) in sorted.iter().enumerate() {
            debug!(
                step = idx + 1,
                total = sorted.len(),
                tag = %config.tag,
                plugin_type = %config.plugin_type,
                "initializing plugin"
            );

            let factory = self.factory(&config.plugin_type)?;
            let kind = factory.create(config, self.clone())?.init_and_wrap().await?;
            self.plugins.insert(
                config.tag.clone(),
                Arc::new(PluginInfo {
                    tag: config.tag.clone(),
                    kind,
                }),
            );
        }

        info!("all plugins initialized");
        Ok(())
    }

    /// Create an anonymous plugin from inline `type args...` syntax.
    pub async fn quick_setup(self: &Arc<Self>, expr: &str) -> Result<Arc<PluginInfo>> {
        let expr = expr.trim();
        let mut split = expr.splitn(2, char::is_whitespace);
        let plugin_type = split.next().unwrap_or_default();
        let param = split
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        let factory = self.factory(plugin_type)?;
        let n = self.anon_counter.fetch_add(1, Ordering::Relaxed);
        let tag = format!("{}@quick{}", plugin_type, n);

        let kind = factory
            .quick_setup(&tag, param, self.clone())?
            .init_and_wrap()
            .await?;
        let info = Arc::new(PluginInfo {
            tag: tag.clone(),
            kind,
        });
        self.plugins.insert(tag, info.clone());
        Ok(info)
    }

    pub fn get_plugin(&self, tag: &str) -> Option<Arc<PluginInfo>> {
        self.plugins.get(tag).map(|entry| entry.clone())
    }

    /// Register an already-initialized plugin instance under its tag.
    pub fn set_plugin(&self, info: Arc<PluginInfo>) {
        self.plugins.insert(info.tag.clone(), info);
    }

    pub fn plugin_count(&self) -> usize {
        self.plugins.len()
    }

    /// Publish a shared value under a plugin tag.
    pub fn register_shared<T: Any + Send + Sync>(&self, tag: &str, value: Arc<T>) {
        self.shared.insert(tag.to_string(), value);
    }

    pub fn get_shared<T: Any + Send + Sync>(&self, tag: &str) -> Option<Arc<T>> {
        let value = self.shared.get(tag)?.clone();
        value.downcast::<T>().ok()
    }

    /// Sender half of the fatal-error channel handed to listeners.
    pub fn close_sender(&self) -> mpsc::UnboundedSender<DnsError> {
        self.close_tx.clone()
    }

    /// Receiver half; the main task owns it. Can be taken once.
    pub fn take_close_receiver(&self) -> Option<mpsc::UnboundedReceiver<DnsError>> {
        self.close_rx.lock().unwrap().take()
    }

    /// Tear every plugin down and purge process-wide caches.
    pub async fn shutdown(&self) {
        let infos: Vec<Arc<PluginInfo>> =
            self.plugins.iter().map(|entry| entry.clone()).collect();
        for info in infos {
            info.destroy().await;
        }
        self.plugins.clear();
        self.shared.clear();
        crate::pkg::geofile::purge();
    }

    fn factory(&self, plugin_type: &str) -> Result<&dyn PluginFactory> {
        self.factories
            .get(plugin_type)
            .map(|f| f.as_ref())
            .ok_or_else(|| DnsError::config(format!("unknown plugin type: {}", plugin_type)))
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("factories", &self.factories.len())
            .field("plugins", &self.plugins.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_registry() {
        let registry = PluginRegistry::new();
        assert_eq!(registry.plugin_count(), 0);
        assert!(registry.get_plugin("missing").is_none());
    }

    #[test]
    fn test_shared_value_roundtrip() {
        let registry = PluginRegistry::new();
        registry.register_shared("tag", Arc::new(42u32));

        assert_eq!(registry.get_shared::<u32>("tag").as_deref(), Some(&42));
        assert!(registry.get_shared::<String>("tag").is_none());
        assert!(registry.get_shared::<u32>("other").is_none());
    }

    #[test]
    fn test_close_receiver_taken_once() {
        let registry = PluginRegistry::new();
        assert!(registry.take_close_receiver().is_some());
        assert!(registry.take_close_receiver().is_none());
    }

    #[tokio::test]
    async fn test_unknown_plugin_type_fails_init() {
        let registry = Arc::new(PluginRegistry::new());
        let configs = vec![PluginConfig {
            tag: "x".into(),
            plugin_type: "does_not_exist".into(),
            args: None,
        }];
        assert!(registry.init_plugins(configs).await.is_err());
    }
}
