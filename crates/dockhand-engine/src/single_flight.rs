// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-key in-flight tracking.
//!
//! At most one guard per key exists at a time. The key is released when the
//! guard is dropped, including on early return and panic unwinding.

use std::collections::HashSet;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

/// Set of keys currently being processed.
#[derive(Debug)]
pub struct SingleFlight<K: Eq + Hash + Clone> {
    in_flight: Arc<Mutex<HashSet<K>>>,
}

impl<K: Eq + Hash + Clone> Default for SingleFlight<K> {
    fn default() -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }
}

impl<K: Eq + Hash + Clone> Clone for SingleFlight<K> {
    fn clone(&self) -> Self {
        Self {
            in_flight: self.in_flight.clone(),
        }
    }
}

impl<K: Eq + Hash + Clone> SingleFlight<K> {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `key` as in flight. `None` if it already is.
    pub fn try_acquire(&self, key: K) -> Option<FlightGuard<K>> {
        let mut set = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !set.insert(key.clone()) {
            return None;
        }
        Some(FlightGuard {
            in_flight: self.in_flight.clone(),
            key,
        })
    }

    /// Whether `key` is in flight.
    pub fn contains(&self, key: &K) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(key)
    }

    /// Number of keys in flight.
    pub fn len(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Whether nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Releases its key on drop.
#[derive(Debug)]
pub struct FlightGuard<K: Eq + Hash + Clone> {
    in_flight: Arc<Mutex<HashSet<K>>>,
    key: K,
}

impl<K: Eq + Hash + Clone> FlightGuard<K> {
    /// The guarded key.
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K: Eq + Hash + Clone> Drop for FlightGuard<K> {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.key);
    }
}
