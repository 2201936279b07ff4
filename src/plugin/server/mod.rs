/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

use crate::plugin::registry::PluginRegistry;

pub mod udp;

pub fn install_factories(registry: &mut PluginRegistry) {
    registry.register_factory("udp_server", Box::new(udp::UdpServerFactory));
}
