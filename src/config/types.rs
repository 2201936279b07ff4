/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Configuration structure definitions
//!
//! Defines the schema for SeqDNS configuration files (YAML format).

use serde::Deserialize;
use serde_yml::Value;
use thiserror::Error;

/// Configuration validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Plugin tag cannot be empty")]
    EmptyPluginTag,

    #[error("Duplicate plugin tag: {0}")]
    DuplicatePluginTag(String),

    #[error("Invalid log level: {0}")]
    InvalidLogLevel(String),

    #[error("Plugin type cannot be empty")]
    EmptyPluginType,
}

/// Main server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging configuration (level, file output)
    #[serde(default)]
    pub log: LogConfig,

    /// List of plugins to load and their configurations
    pub plugins: Vec<PluginConfig>,
}

impl Config {
    /// Validate configuration structure (log level, plugin tags/types).
    ///
    /// Plugin-specific validation (listen addresses, rule syntax, files) is
    /// delegated to each plugin factory during initialization.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.log.level.to_lowercase().as_str() {
            "off" | "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => return Err(ConfigError::InvalidLogLevel(self.log.level.clone())),
        }

        let mut seen = std::collections::HashSet::new();
        for plugin in &self.plugins {
            if plugin.tag.is_empty() {
                return Err(ConfigError::EmptyPluginTag);
            }
            if plugin.plugin_type.is_empty() {
                return Err(ConfigError::EmptyPluginType);
            }
            if !seen.insert(plugin.tag.as_str()) {
                return Err(ConfigError::DuplicatePluginTag(plugin.tag.clone()));
            }
        }

        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Log level: off, trace, debug, info, warn, error
    #[serde(default = "default_level")]
    pub level: String,

    /// Optional file path for log output (in addition to console)
    pub file: Option<String>,
}

impl Default for LogConfig {
    fn default() -> LogConfig {
        LogConfig {
            level: default_level(),
            file: None,
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

/// Plugin configuration entry
#[derive(Debug, Clone, Deserialize)]
pub struct PluginConfig {
    /// Unique identifier for this plugin instance
    pub tag: String,

    /// Plugin type (e.g., "udp_server", "redis_cache")
    #[serde(rename = "type")]
    pub plugin_type: String,

    /// Plugin-specific arguments (parsed by the plugin factory)
    pub args: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_parses() {
        let raw = r#"
log:
  level: debug
plugins:
  - tag: main
    type: sequence
    args:
      - exec: accept
"#;
        let config: Config = serde_yml::from_str(raw).unwrap();
        config.validate().unwrap();
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.plugins.len(), 1);
        assert_eq!(config.plugins[0].plugin_type, "sequence");
    }

    #[test]
    fn test_duplicate_tag_rejected() {
        let raw = r#"
plugins:
  - tag: a
    type: sequence
  - tag: a
    type: black_hole
"#;
        let config: Config = serde_yml::from_str(raw).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicatePluginTag(_))
        ));
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let raw = "log:\n  level: noisy\nplugins: []\n";
        let config: Config = serde_yml::from_str(raw).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel(_))
        ));
    }
}
