/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Core functionality module
//!
//! Provides essential infrastructure:
//! - Command-line argument parsing
//! - Logging setup with a custom formatter
//! - Per-query context and shared DNS helpers
//! - Domain and CIDR rule matchers

use crate::config::types::LogConfig;
use crate::core::log::SeqDnsLogFormatter;
use clap::Parser;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, fmt};

pub mod context;
pub mod dns_utils;
pub mod error;
pub mod netlist;
pub mod rule_matcher;

mod log;

/// Command-line options
#[derive(Debug, Parser)]
#[command(name = "seqdns", about = "Programmable recursive DNS forwarder")]
pub struct Options {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    pub config: PathBuf,

    /// Override the configured log level
    #[arg(short, long)]
    pub log_level: Option<String>,
}

pub fn parse_options() -> Options {
    Options::parse()
}

/// Initialize the logging system with console and optional file output.
///
/// Returns a WorkerGuard that must be kept alive to ensure log flushing.
pub fn init_log(log: &LogConfig) -> WorkerGuard {
    let (file_writer, guard) = if let Some(ref file_path) = log.file {
        let path = std::path::Path::new(file_path);
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
        let file_appender = tracing_appender::rolling::never(
            dir.unwrap_or_else(|| std::path::Path::new(".")),
            path.file_name().unwrap_or_else(|| "seqdns.log".as_ref()),
        );
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        (Some(non_blocking), Some(guard))
    } else {
        (None, None)
    };

    let console_layer = fmt::layer()
        .event_format(SeqDnsLogFormatter)
        .with_writer(std::io::stdout);

    let file_layer = file_writer.map(|writer| {
        fmt::layer()
            .event_format(SeqDnsLogFormatter)
            .with_writer(writer)
    });

    let filter = EnvFilter::try_new(&log.level).unwrap_or_else(|_| {
        eprintln!("Invalid log level '{}', defaulting to 'info'", log.level);
        EnvFilter::new("info")
    });

    let subscriber = Registry::default().with(filter).with(console_layer);
    if let Some(file_layer) = file_layer {
        subscriber.with(file_layer).init();
    } else {
        subscriber.init();
    }

    guard.unwrap_or_else(|| tracing_appender::non_blocking(std::io::sink()).1)
}
