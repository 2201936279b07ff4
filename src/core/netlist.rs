/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Sorted CIDR list with merge and binary-search membership.
//!
//! Lists are built once at plugin initialization, then `sort()`ed before the
//! first query. After sorting, no stored prefix is contained in another and
//! `contains()` is a binary search over the non-overlapping intervals.

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use std::net::IpAddr;
use std::str::FromStr;

#[derive(Debug, Default, Clone)]
pub struct NetList {
    v4: Vec<Ipv4Net>,
    v6: Vec<Ipv6Net>,
    sorted: bool,
}

impl NetList {
    pub fn new() -> Self {
        NetList::default()
    }

    pub fn len(&self) -> usize {
        self.v4.len() + self.v6.len()
    }

    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }

    /// Append a prefix. The list becomes unsorted.
    pub fn append(&mut self, net: IpNet) {
        match net {
            IpNet::V4(n) => self.v4.push(n.trunc()),
            IpNet::V6(n) => self.v6.push(n.trunc()),
        }
        self.sorted = false;
    }

    /// Sort prefixes by base address and drop entries covered by a broader
    /// preceding prefix. Must be called before the first `contains()`.
    pub fn sort(&mut self) {
        sort_and_merge_v4(&mut self.v4);
        sort_and_merge_v6(&mut self.v6);
        self.sorted = true;
    }

    /// Membership test by binary search. The list must be sorted.
    pub fn contains(&self, ip: IpAddr) -> bool {
        debug_assert!(self.sorted, "NetList queried before sort()");
        match ip {
            IpAddr::V4(addr) => {
                contains_sorted(&self.v4, |net| net.network() <= addr, |net| net.contains(&addr))
            }
            IpAddr::V6(addr) => {
                contains_sorted(&self.v6, |net| net.network() <= addr, |net| net.contains(&addr))
            }
        }
    }
}

fn sort_and_merge_v4(v4: &mut Vec<Ipv4Net>) {
    // Derived ordering sorts by base address, then prefix length, so at any
    // base the broadest prefix comes first and covered entries follow it.
    v4.sort_unstable();
    v4.dedup();
    let mut kept: Vec<Ipv4Net> = Vec::with_capacity(v4.len());
    for net in v4.drain(..) {
        match kept.last() {
            Some(last) if last.contains(&net) => {}
            _ => kept.push(net),
        }
    }
    *v4 = kept;
}

fn sort_and_merge_v6(v6: &mut Vec<Ipv6Net>) {
    v6.sort_unstable();
    v6.dedup();
    let mut kept: Vec<Ipv6Net> = Vec::with_capacity(v6.len());
    for net in v6.drain(..) {
        match kept.last() {
            Some(last) if last.contains(&net) => {}
            _ => kept.push(net),
        }
    }
    *v6 = kept;
}

fn contains_sorted<N>(nets: &[N], below: impl Fn(&N) -> bool, hit: impl Fn(&N) -> bool) -> bool {
    // Last entry whose base address is <= addr is the only candidate.
    let idx = nets.partition_point(below);
    if idx == 0 {
        return false;
    }
    hit(&nets[idx - 1])
}

/// Parse one IP/CIDR token. Bare addresses become host prefixes.
pub fn parse_net_token(raw: &str) -> Result<IpNet, String> {
    let token = raw.trim();
    if token.contains('/') {
        IpNet::from_str(token).map_err(|e| format!("invalid cidr '{}': {}", token, e))
    } else {
        let ip = IpAddr::from_str(token).map_err(|e| format!("invalid ip '{}': {}", token, e))?;
        Ok(IpNet::from(ip))
    }
}

/// Load prefixes from list text: one address or CIDR per line, `#` and
/// whitespace introduce comments. The list becomes unsorted.
pub fn load_from_text(list: &mut NetList, text: &str) -> Result<(), String> {
    for (idx, line) in text.lines().enumerate() {
        let data = line.split('#').next().unwrap_or_default();
        let Some(token) = data.split_whitespace().next() else {
            continue;
        };
        let net =
            parse_net_token(token).map_err(|e| format!("line {}: {}", idx + 1, e))?;
        list.append(net);
    }
    Ok(())
}
