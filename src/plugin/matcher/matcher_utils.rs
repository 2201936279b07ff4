/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Shared helpers for matcher plugins.

use crate::core::error::{DnsError, Result as DnsResult};
use crate::plugin::provider::Provider;
use crate::plugin::registry::PluginRegistry;
use serde_yml::Value;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::sync::Arc;

/// Parse matcher args into a flat token list; accepts a string or a string
/// sequence, splitting on commas and whitespace.
pub(crate) fn parse_rules_from_value(args: Option<Value>) -> DnsResult<Vec<String>> {
    let args = args.ok_or_else(|| DnsError::plugin("matcher requires args"))?;
    match args {
        Value::String(s) => Ok(split_rule_tokens(&s)),
        Value::Sequence(seq) => {
            let mut out = Vec::with_capacity(seq.len());
            for item in seq {
                match item {
                    Value::String(s) => out.extend(split_rule_tokens(&s)),
                    other => {
                        return Err(DnsError::plugin(format!(
                            "matcher args must be a string list, got {:?}",
                            other
                        )));
                    }
                }
            }
            Ok(out)
        }
        other => Err(DnsError::plugin(format!(
            "matcher args must be a string or string array, got {:?}",
            other
        ))),
    }
}

pub(crate) fn parse_quick_setup_rules(param: Option<String>) -> DnsResult<Vec<String>> {
    let raw = param.ok_or_else(|| DnsError::plugin("quick setup requires matcher parameter"))?;
    let rules = split_rule_tokens(&raw);
    if rules.is_empty() {
        return Err(DnsError::plugin(
            "quick setup requires non-empty matcher parameter",
        ));
    }
    Ok(rules)
}

/// Split rule tokens into inline rules, `$set` tags and `&file` paths.
pub(crate) fn split_rule_sources(
    raw_rules: Vec<String>,
) -> (Vec<String>, Vec<String>, Vec<String>) {
    let mut inline_rules = Vec::new();
    let mut set_tags = Vec::new();
    let mut files = Vec::new();

    for raw in raw_rules {
        let token = raw.trim();
        if token.is_empty() {
            continue;
        }
        if let Some(tag) = token.strip_prefix('$') {
            if !tag.trim().is_empty() {
                set_tags.push(tag.trim().to_string());
            }
        } else if let Some(path) = token.strip_prefix('&') {
            if !path.trim().is_empty() {
                files.push(path.trim().to_string());
            }
        } else {
            inline_rules.push(token.to_string());
        }
    }

    (inline_rules, set_tags, files)
}

/// Load rule tokens from list files, skipping comments and blank lines.
pub(crate) fn load_rules_from_files(files: &[String], field: &str) -> DnsResult<Vec<String>> {
    let mut rules = Vec::new();
    for path in files {
        if path.trim().is_empty() {
            continue;
        }
        let file = File::open(path).map_err(|e| {
            DnsError::plugin(format!("failed to open {} file '{}': {}", field, path, e))
        })?;
        let reader = BufReader::new(file);
        for (idx, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| {
                DnsError::plugin(format!(
                    "failed to read {} file '{}' at line {}: {}",
                    field,
                    path,
                    idx + 1,
                    e
                ))
            })?;
            let raw = line.split('#').next().unwrap_or_default().trim();
            if raw.is_empty() {
                continue;
            }
            rules.extend(split_rule_tokens(raw));
        }
    }
    Ok(rules)
}

pub(crate) fn resolve_provider_tags(
    registry: &PluginRegistry,
    tags: &[String],
    matcher_name: &str,
    matcher_tag: &str,
) -> DnsResult<Vec<Arc<dyn Provider>>> {
    let mut providers = Vec::with_capacity(tags.len());
    for tag in tags {
        let plugin = registry.get_plugin(tag).ok_or_else(|| {
            DnsError::plugin(format!(
                "{} matcher '{}' depends on missing provider '{}'",
                matcher_name, matcher_tag, tag
            ))
        })?;
        providers.push(plugin.to_provider()?);
    }
    Ok(providers)
}

fn split_rule_tokens(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c.is_ascii_whitespace())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_rule_sources() {
        let rules = vec![
            "$set1".to_string(),
            "&/tmp/list.txt".to_string(),
            "full:example.com".to_string(),
            " ".to_string(),
        ];
        let (inline, sets, files) = split_rule_sources(rules);
        assert_eq!(inline, vec!["full:example.com"]);
        assert_eq!(sets, vec!["set1"]);
        assert_eq!(files, vec!["/tmp/list.txt"]);
    }

    #[test]
    fn test_rules_from_string_value() {
        let value = Value::String("a.com, b.com\tc.com".to_string());
        let rules = parse_rules_from_value(Some(value)).unwrap();
        assert_eq!(rules, vec!["a.com", "b.com", "c.com"]);
    }
}
