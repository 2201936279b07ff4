/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! `has_resp` matcher plugin: true once any plugin produced a response.

use crate::config::types::PluginConfig;
use crate::core::context::DnsContext;
use crate::core::error::Result as DnsResult;
use crate::plugin::matcher::Matcher;
use crate::plugin::{Plugin, PluginFactory, PluginRegistry, UninitializedPlugin};
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Debug)]
struct HasResp {
    tag: String,
}

#[async_trait]
impl Plugin for HasResp {
    fn tag(&self) -> &str {
        &self.tag
    }
}

impl Matcher for HasResp {
    fn is_match(&self, context: &mut DnsContext) -> bool {
        context.response.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct HasRespFactory;

impl PluginFactory for HasRespFactory {
    fn create(
        &self,
        plugin_config: &PluginConfig,
        _registry: Arc<PluginRegistry>,
    ) -> DnsResult<UninitializedPlugin> {
        Ok(UninitializedPlugin::Matcher(Box::new(HasResp {
            tag: plugin_config.tag.clone(),
        })))
    }

    fn quick_setup(
        &self,
        tag: &str,
        _param: Option<String>,
        _registry: Arc<PluginRegistry>,
    ) -> DnsResult<UninitializedPlugin> {
        Ok(UninitializedPlugin::Matcher(Box::new(HasResp {
            tag: tag.to_string(),
        })))
    }
}
