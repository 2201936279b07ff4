/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Plugin dependency resolution.
//!
//! Orders plugin configs so every plugin is initialized after the plugins it
//! references. Reference cycles (e.g. two sequences jumping into each other)
//! are a startup error.

use crate::config::types::PluginConfig;
use crate::core::error::{DnsError, Result};
use std::collections::{HashMap, VecDeque};

/// Topologically sort `configs` using `get_deps` for edge discovery.
///
/// Dependencies on unknown tags are ignored here; the factory that needs the
/// missing plugin reports the precise error during creation.
pub fn resolve_dependencies(
    configs: Vec<PluginConfig>,
    get_deps: &dyn Fn(&PluginConfig) -> Vec<String>,
) -> Result<Vec<PluginConfig>> {
    let index_by_tag: HashMap<&str, usize> = configs
        .iter()
        .enumerate()
        .map(|(idx, c)| (c.tag.as_str(), idx))
        .collect();

    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); configs.len()];
    let mut indegree: Vec<usize> = vec![0; configs.len()];

    for (idx, config) in configs.iter().enumerate() {
        for dep in get_deps(config) {
            if let Some(&dep_idx) = index_by_tag.get(dep.as_str()) {
                if dep_idx == idx {
                    return Err(DnsError::dependency(format!(
                        "plugin '{}' depends on itself",
                        config.tag
                    )));
                }
                dependents[dep_idx].push(idx);
                indegree[idx] += 1;
            }
        }
    }

    let mut queue: VecDeque<usize> = indegree
        .iter()
        .enumerate()
        .filter(|(_, deg)| **deg == 0)
        .map(|(idx, _)| idx)
        .collect();

    let mut order = Vec::with_capacity(configs.len());
    while let Some(idx) = queue.pop_front() {
        order.push(idx);
        for &dependent in &dependents[idx] {
            indegree[dependent] -= 1;
            if indegree[dependent] == 0 {
                queue.push_back(dependent);
            }
        }
    }

    if order.len() != configs.len() {
        let cyclic: Vec<&str> = indegree
            .iter()
            .enumerate()
            .filter(|(_, deg)| **deg > 0)
            .map(|(idx, _)| configs[idx].tag.as_str())
            .collect();
        return Err(DnsError::dependency(format!(
            "cyclic plugin references involving: {}",
            cyclic.join(", ")
        )));
    }

    let mut configs: Vec<Option<PluginConfig>> = configs.into_iter().map(Some).collect();
    Ok(order
        .into_iter()
        .map(|idx| configs[idx].take().expect("each index appears once"))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(tag: &str) -> PluginConfig {
        PluginConfig {
            tag: tag.to_string(),
            plugin_type: "sequence".to_string(),
            args: None,
        }
    }

    fn deps_of<'a>(
        edges: &'a [(&'a str, &'a str)],
    ) -> impl Fn(&PluginConfig) -> Vec<String> + 'a {
        move |c: &PluginConfig| {
            edges
                .iter()
                .filter(|(from, _)| *from == c.tag)
                .map(|(_, to)| to.to_string())
                .collect()
        }
    }

    #[test]
    fn test_orders_dependencies_first() {
        let configs = vec![config("server"), config("main"), config("cache")];
        let edges = [("server", "main"), ("main", "cache")];

        let sorted = resolve_dependencies(configs, &deps_of(&edges)).unwrap();
        let tags: Vec<&str> = sorted.iter().map(|c| c.tag.as_str()).collect();
        assert_eq!(tags, vec!["cache", "main", "server"]);
    }

    #[test]
    fn test_cycle_is_rejected() {
        let configs = vec![config("a"), config("b")];
        let edges = [("a", "b"), ("b", "a")];

        let err = resolve_dependencies(configs, &deps_of(&edges)).unwrap_err();
        assert!(matches!(err, DnsError::Dependency(_)));
    }

    #[test]
    fn test_self_reference_is_rejected() {
        let configs = vec![config("a")];
        let edges = [("a", "a")];
        assert!(resolve_dependencies(configs, &deps_of(&edges)).is_err());
    }

    #[test]
    fn test_unknown_dependency_is_ignored() {
        let configs = vec![config("a")];
        let edges = [("a", "missing")];
        let sorted = resolve_dependencies(configs, &deps_of(&edges)).unwrap();
        assert_eq!(sorted.len(), 1);
    }
}
