/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Shared domain rule matchers used by providers, gate matchers and the
//! synthesis plugins.
//!
//! [`MixMatcher`] combines four sub-matchers keyed by pattern kind
//! (`full:`, `domain:`, `keyword:`, `regexp:`). Each pattern carries a
//! payload; lookup order is full -> domain -> regexp -> keyword and the
//! first match wins.

use ahash::AHashMap;
use regex::{RegexBuilder, RegexSet, RegexSetBuilder};
use smallvec::SmallVec;
use std::borrow::Cow;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DomainRuleKind {
    Full,
    Domain,
    Keyword,
    Regexp,
}

/// Split a rule expression into its kind prefix and the bare pattern.
/// A token without prefix falls back to `default`.
#[inline]
pub fn split_domain_rule_expression(exp: &str, default: DomainRuleKind) -> (DomainRuleKind, &str) {
    if let Some(v) = exp.strip_prefix("full:") {
        (DomainRuleKind::Full, v)
    } else if let Some(v) = exp.strip_prefix("domain:") {
        (DomainRuleKind::Domain, v)
    } else if let Some(v) = exp.strip_prefix("keyword:") {
        (DomainRuleKind::Keyword, v)
    } else if let Some(v) = exp.strip_prefix("regexp:") {
        (DomainRuleKind::Regexp, v)
    } else {
        (default, exp)
    }
}

const NO_VALUE: u32 = u32::MAX;

#[derive(Debug)]
struct DomainTrieNode {
    children: AHashMap<Box<str>, u32>,
    value: u32,
}

impl Default for DomainTrieNode {
    fn default() -> Self {
        Self {
            children: AHashMap::new(),
            value: NO_VALUE,
        }
    }
}

/// Label-suffix trie keyed by reversed labels in a flat arena.
#[derive(Debug)]
struct DomainTrie {
    nodes: Vec<DomainTrieNode>,
    rule_count: usize,
}

impl Default for DomainTrie {
    fn default() -> Self {
        Self {
            nodes: vec![DomainTrieNode::default()],
            rule_count: 0,
        }
    }
}

impl DomainTrie {
    /// Insert a domain rule by reversed labels, e.g. `google.com` =>
    /// `com -> google`. Keeps the first payload for a repeated suffix.
    fn insert(&mut self, domain: &str, value_idx: u32) {
        let mut cursor = 0u32;
        for label in domain.rsplit('.') {
            if label.is_empty() {
                continue;
            }

            let next = if let Some(next) = self.nodes[cursor as usize].children.get(label) {
                *next
            } else {
                let idx = self.nodes.len() as u32;
                self.nodes.push(DomainTrieNode::default());
                self.nodes[cursor as usize]
                    .children
                    .insert(label.to_owned().into_boxed_str(), idx);
                idx
            };
            cursor = next;
        }

        let node = &mut self.nodes[cursor as usize];
        if node.value == NO_VALUE {
            node.value = value_idx;
            self.rule_count += 1;
        }
    }

    /// Match a reversed label slice against suffix rules. The shortest
    /// registered suffix on the path wins.
    #[inline]
    fn lookup(&self, labels_rev: &[&str]) -> Option<u32> {
        let mut cursor = 0u32;
        if self.nodes[0].value != NO_VALUE {
            return Some(self.nodes[0].value);
        }
        for label in labels_rev {
            let next = self.nodes[cursor as usize].children.get(*label)?;
            cursor = *next;
            let value = self.nodes[cursor as usize].value;
            if value != NO_VALUE {
                return Some(value);
            }
        }
        None
    }
}

/// Combined matcher dispatching by pattern kind, with a payload per pattern.
#[derive(Debug)]
pub struct MixMatcher<T> {
    default_kind: DomainRuleKind,

    full: AHashMap<Box<str>, u32>,
    trie: DomainTrie,
    keyword: Vec<(Box<str>, u32)>,

    regexp_pending: Vec<String>,
    regexp_values: Vec<u32>,
    regexp: Option<RegexSet>,

    values: Vec<T>,
}

impl<T> Default for MixMatcher<T> {
    fn default() -> Self {
        Self::with_default_kind(DomainRuleKind::Domain)
    }
}

impl<T> MixMatcher<T> {
    pub fn with_default_kind(default_kind: DomainRuleKind) -> Self {
        MixMatcher {
            default_kind,
            full: AHashMap::new(),
            trie: DomainTrie::default(),
            keyword: Vec::new(),
            regexp_pending: Vec::new(),
            regexp_values: Vec::new(),
            regexp: None,
            values: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.full.len() + self.trie.rule_count + self.keyword.len() + self.regexp_values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Parse and load one expression with its payload.
    pub fn add(&mut self, exp: &str, value: T) -> Result<(), String> {
        let exp = exp.trim();
        if exp.is_empty() {
            return Err("empty domain expression".to_string());
        }

        let (kind, pattern) = split_domain_rule_expression(exp, self.default_kind);
        if kind == DomainRuleKind::Regexp {
            let pattern = pattern.trim();
            if pattern.is_empty() {
                return Err("empty regexp expression".to_string());
            }
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|e| format!("invalid regexp '{}': {}", pattern, e))?;
            let value_idx = self.push_value(value);
            self.regexp_pending.push(pattern.to_owned());
            self.regexp_values.push(value_idx);
            // Invalidate a previously built set until the next finalize().
            self.regexp = None;
            return Ok(());
        }

        let normalized = normalize_domain_cow(pattern);
        if normalized.is_empty() {
            return Err("empty domain expression".to_string());
        }
        let value_idx = self.push_value(value);
        match kind {
            DomainRuleKind::Full => {
                self.full
                    .entry(normalized.as_ref().to_owned().into_boxed_str())
                    .or_insert(value_idx);
            }
            DomainRuleKind::Domain => {
                self.trie.insert(normalized.as_ref(), value_idx);
            }
            DomainRuleKind::Keyword => {
                self.keyword
                    .push((normalized.as_ref().to_owned().into_boxed_str(), value_idx));
            }
            DomainRuleKind::Regexp => unreachable!(),
        }
        Ok(())
    }

    /// Build the compiled regexp set. Must be called after the last `add`.
    pub fn finalize(&mut self) -> Result<(), String> {
        if self.regexp_pending.is_empty() {
            return Ok(());
        }
        let set = RegexSetBuilder::new(&self.regexp_pending)
            .case_insensitive(true)
            .build()
            .map_err(|e| format!("failed to build regex set: {}", e))?;
        self.regexp = Some(set);
        Ok(())
    }

    /// Match a query name, returning the payload of the first matching rule.
    pub fn lookup(&self, domain: &str) -> Option<&T> {
        let normalized = normalize_domain_cow(domain);
        let domain = normalized.as_ref();
        if domain.is_empty() {
            return None;
        }
        let mut labels = SmallVec::<[&str; 8]>::new();
        split_labels_rev(domain, &mut labels);
        self.lookup_normalized(domain, &labels)
    }

    /// Match with a pre-normalized name and pre-split reversed labels.
    pub fn lookup_normalized(&self, domain: &str, labels_rev: &[&str]) -> Option<&T> {
        if let Some(idx) = self.full.get(domain) {
            return self.values.get(*idx as usize);
        }
        if let Some(idx) = self.trie.lookup(labels_rev) {
            return self.values.get(idx as usize);
        }
        if let Some(set) = &self.regexp {
            // The lowest pattern index is the earliest inserted rule.
            if let Some(pattern_idx) = set.matches(domain).iter().next() {
                let idx = self.regexp_values[pattern_idx];
                return self.values.get(idx as usize);
            }
        }
        for (needle, idx) in &self.keyword {
            if domain.contains(needle.as_ref()) {
                return self.values.get(*idx as usize);
            }
        }
        None
    }

    #[inline]
    pub fn is_match(&self, domain: &str) -> bool {
        self.lookup(domain).is_some()
    }

    fn push_value(&mut self, value: T) -> u32 {
        let idx = self.values.len() as u32;
        self.values.push(value);
        idx
    }
}

/// Lowercase and strip whitespace plus trailing dots, borrowing when the
/// input is already normalized.
#[inline]
pub fn normalize_domain_cow(domain: &str) -> Cow<'_, str> {
    let trimmed = domain.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        return Cow::Borrowed("");
    }
    if trimmed.bytes().any(|b| b.is_ascii_uppercase()) {
        Cow::Owned(trimmed.to_ascii_lowercase())
    } else {
        Cow::Borrowed(trimmed)
    }
}

#[inline]
pub fn split_labels_rev<'a>(domain: &'a str, labels: &mut SmallVec<[&'a str; 8]>) {
    labels.clear();
    labels.extend(domain.rsplit('.').filter(|label| !label.is_empty()));
}
