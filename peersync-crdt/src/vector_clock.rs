//! Vector Clock for causality tracking.
//!
//! A vector clock tracks logical time across multiple devices, enabling
//! determination of causality (happens-before relationships) between events.
//!
//! Use cases:
//! - Detecting concurrent writes to the same field
//! - Bounding how much history two replicas must exchange
//! - Detecting dominance between document replicas

use peersync_types::DeviceId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Causality relationship between two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CausalOrder {
    /// First clock happened before second.
    Before,
    /// First clock happened after second.
    After,
    /// Clocks are concurrent (neither happened before the other).
    Concurrent,
    /// Clocks are identical.
    Equal,
}

/// A Vector Clock for tracking causality across devices.
///
/// Each device has a counter that only it increments. Entries never
/// decrease; a missing entry reads as zero.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    clocks: BTreeMap<DeviceId, u64>,
}

impl VectorClock {
    /// Creates a new empty vector clock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            clocks: BTreeMap::new(),
        }
    }

    /// Returns the counter for a device (0 if not present).
    #[must_use]
    pub fn get(&self, device_id: &DeviceId) -> u64 {
        self.clocks.get(device_id).copied().unwrap_or(0)
    }

    /// Returns all devices and their counters, in device order.
    pub fn entries(&self) -> impl Iterator<Item = (&DeviceId, &u64)> {
        self.clocks.iter()
    }

    /// Returns the number of devices in the clock.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clocks.len()
    }

    /// Returns true if the clock has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clocks.is_empty()
    }

    /// Increments the caller's own entry and returns the new value.
    pub fn tick_node(&mut self, device_id: &DeviceId) -> u64 {
        let entry = self.clocks.entry(device_id.clone()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Sets a device's entry to `max(current, value)`.
    pub fn update_node(&mut self, device_id: &DeviceId, value: u64) {
        let entry = self.clocks.entry(device_id.clone()).or_insert(0);
        if value > *entry {
            *entry = value;
        }
    }

    /// Merges another vector clock into this one (entrywise maximum).
    pub fn merge(&mut self, other: &Self) {
        for (device_id, &value) in &other.clocks {
            self.update_node(device_id, value);
        }
    }

    /// Creates a new clock that is the merge of this and another.
    #[must_use]
    pub fn merged(&self, other: &Self) -> Self {
        let mut result = self.clone();
        result.merge(other);
        result
    }

    /// Compares this clock with another to determine causal ordering.
    #[must_use]
    pub fn compare(&self, other: &Self) -> CausalOrder {
        let mut self_ge = true;
        let mut other_ge = true;

        for device_id in self.clocks.keys().chain(other.clocks.keys()) {
            let mine = self.get(device_id);
            let theirs = other.get(device_id);
            if mine < theirs {
                self_ge = false;
            }
            if theirs < mine {
                other_ge = false;
            }
        }

        match (self_ge, other_ge) {
            (true, true) => CausalOrder::Equal,
            (true, false) => CausalOrder::After,
            (false, true) => CausalOrder::Before,
            (false, false) => CausalOrder::Concurrent,
        }
    }

    /// Returns true if this clock is causally before the other.
    #[must_use]
    pub fn is_before(&self, other: &Self) -> bool {
        self.compare(other) == CausalOrder::Before
    }

    /// Returns true if this clock is causally after the other.
    #[must_use]
    pub fn is_after(&self, other: &Self) -> bool {
        self.compare(other) == CausalOrder::After
    }

    /// Returns true if neither clock dominates the other.
    #[must_use]
    pub fn concurrent_with(&self, other: &Self) -> bool {
        self.compare(other) == CausalOrder::Concurrent
    }

    /// Returns true if this clock is >= the other for every device.
    #[must_use]
    pub fn dominates(&self, other: &Self) -> bool {
        matches!(self.compare(other), CausalOrder::After | CausalOrder::Equal)
    }
}

impl PartialEq for VectorClock {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == CausalOrder::Equal
    }
}

impl Eq for VectorClock {}
