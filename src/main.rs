/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

use crate::core::error::{DnsError, Result};
use crate::plugin::registry::PluginRegistry;
use std::sync::Arc;
use tracing::{error, info};

mod config;
mod core;
mod pkg;
mod plugin;

fn main() {
    let options = core::parse_options();

    let config = match config::init(&options.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load config '{}': {}", options.config.display(), e);
            std::process::exit(1);
        }
    };

    let mut log_config = config.log.clone();
    if let Some(level) = &options.log_level {
        log_config.level = level.clone();
    }
    let _log_guard = core::init_log(&log_config);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("seqdns-worker")
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to initialize tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(config)) {
        error!(error = %e, "fatal error");
        std::process::exit(1);
    }
}

async fn run(config: config::types::Config) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "seqdns starting");

    let registry = Arc::new(PluginRegistry::with_default_factories());
    let mut close_rx = registry
        .take_close_receiver()
        .ok_or_else(|| DnsError::plugin("close channel already taken"))?;

    registry.init_plugins(config.plugins).await?;

    tokio::select! {
        err = close_rx.recv() => {
            let err = err.unwrap_or_else(|| DnsError::plugin("close channel dropped"));
            registry.shutdown().await;
            Err(err)
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            registry.shutdown().await;
            Ok(())
        }
    }
}
