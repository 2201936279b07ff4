/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Keyed single-flight guard.
//!
//! Collapses duplicate concurrent work per key: the first caller acquires a
//! guard and runs, later callers get `None` until the guard is dropped.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct SingleFlight {
    inflight: Arc<DashMap<String, ()>>,
}

impl SingleFlight {
    pub fn new() -> Self {
        SingleFlight::default()
    }

    /// Try to become the flight owner for `key`.
    ///
    /// Returns `None` while another owner holds the key. The returned guard
    /// releases the key on drop.
    pub fn try_acquire(&self, key: &str) -> Option<FlightGuard> {
        match self.inflight.entry(key.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(vacant) => {
                vacant.insert(());
                Some(FlightGuard {
                    inflight: self.inflight.clone(),
                    key: key.to_string(),
                })
            }
        }
    }

    #[cfg(test)]
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }
}

#[derive(Debug)]
pub struct FlightGuard {
    inflight: Arc<DashMap<String, ()>>,
    key: String,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.inflight.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_acquire_collapses() {
        let sf = SingleFlight::new();

        let guard = sf.try_acquire("k").expect("first acquire succeeds");
        assert!(sf.try_acquire("k").is_none());
        assert!(sf.try_acquire("other").is_some());

        drop(guard);
        assert!(sf.try_acquire("k").is_some());
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let sf = SingleFlight::new();
        {
            let _guard = sf.try_acquire("k").unwrap();
            assert_eq!(sf.in_flight(), 1);
        }
        assert_eq!(sf.in_flight(), 0);
    }
}
