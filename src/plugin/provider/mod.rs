/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

use crate::plugin::Plugin;
use crate::plugin::registry::PluginRegistry;
use std::any::Any;
use std::net::IpAddr;

pub mod geoip;
pub mod geosite;
pub mod v2ray_geoip;
pub mod v2ray_geosite;

/// Data-providing plugin: a named set of domains and/or IP prefixes other
/// plugins reference by tag.
pub trait Provider: Plugin {
    /// Type-erased view for provider-specific downcasting.
    fn as_any(&self) -> &dyn Any;

    fn contains_domain(&self, _domain: &str) -> bool {
        false
    }

    fn contains_ip(&self, _ip: IpAddr) -> bool {
        false
    }
}

pub fn install_factories(registry: &mut PluginRegistry) {
    registry.register_factory("geoip", Box::new(geoip::GeoIpFactory));
    registry.register_factory("geosite", Box::new(geosite::GeoSiteFactory));
    registry.register_factory("v2ray_geoip", Box::new(v2ray_geoip::V2rayGeoIpFactory));
    registry.register_factory("v2ray_geosite", Box::new(v2ray_geosite::V2rayGeoSiteFactory));
}

/// Split a `path:code` file spec.
pub(crate) fn split_file_spec(spec: &str) -> Option<(&str, &str)> {
    let (path, code) = spec.rsplit_once(':')?;
    let path = path.trim();
    let code = code.trim();
    if path.is_empty() || code.is_empty() {
        return None;
    }
    Some((path, code))
}
