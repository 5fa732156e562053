//! Hybrid Logical Clock implementation for causal ordering.
//!
//! Combines physical time with a logical counter to ensure:
//! - Monotonicity (a clock never issues the same or a smaller timestamp twice)
//! - Causality (a timestamp issued after receiving `r` is greater than `r`)
//! - Bounded drift from physical time
//!
//! Based on the HLC algorithm from "Logical Physical Clocks" (Kulkarni et al.).

use crate::DeviceId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch according to the system clock.
fn wall_clock_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A Hybrid Logical Clock timestamp.
///
/// Totally ordered by `wall_clock_millis`, then `logical_counter`, then
/// `device_id`. The device component only makes the order deterministic;
/// two timestamps from different devices are not causally related just
/// because one sorts before the other.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HybridTimestamp {
    /// Logical counter for ordering events at the same wall time.
    logical_counter: u32,
    /// Physical time component (milliseconds since Unix epoch).
    wall_clock_millis: u64,
    /// Device that issued the timestamp.
    device_id: DeviceId,
}

impl HybridTimestamp {
    /// Creates a timestamp from components.
    #[must_use]
    pub fn new(wall_clock_millis: u64, logical_counter: u32, device_id: DeviceId) -> Self {
        Self {
            logical_counter,
            wall_clock_millis,
            device_id,
        }
    }

    /// Returns the wall time component.
    #[must_use]
    pub const fn wall_clock_millis(&self) -> u64 {
        self.wall_clock_millis
    }

    /// Returns the logical counter.
    #[must_use]
    pub const fn logical_counter(&self) -> u32 {
        self.logical_counter
    }

    /// Returns the issuing device.
    #[must_use]
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Returns true if this timestamp orders before `other`.
    #[must_use]
    pub fn happens_before(&self, other: &Self) -> bool {
        self < other
    }

    /// Returns true if this timestamp orders after `other`.
    #[must_use]
    pub fn happens_after(&self, other: &Self) -> bool {
        self > other
    }

    /// Compares only the physical and logical components, ignoring the device.
    #[must_use]
    pub fn cmp_clock(&self, other: &Self) -> Ordering {
        self.wall_clock_millis
            .cmp(&other.wall_clock_millis)
            .then(self.logical_counter.cmp(&other.logical_counter))
    }
}

impl PartialOrd for HybridTimestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HybridTimestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp_clock(other)
            .then_with(|| self.device_id.cmp(&other.device_id))
    }
}

/// A per-device Hybrid Logical Clock.
///
/// Not synchronized internally: the owner (the sync engine) serializes
/// access to it together with the rest of its state.
#[derive(Debug, Clone)]
pub struct HybridLogicalClock {
    device_id: DeviceId,
    wall_clock_millis: u64,
    logical_counter: u32,
}

impl HybridLogicalClock {
    /// Creates a clock for `device_id` that has not issued anything yet.
    #[must_use]
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            wall_clock_millis: 0,
            logical_counter: 0,
        }
    }

    /// Returns the device this clock belongs to.
    #[must_use]
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Returns the most recent timestamp issued (or observed) by this clock.
    #[must_use]
    pub fn last(&self) -> HybridTimestamp {
        HybridTimestamp::new(
            self.wall_clock_millis,
            self.logical_counter,
            self.device_id.clone(),
        )
    }

    /// Issues a timestamp for a new local event.
    pub fn tick(&mut self) -> HybridTimestamp {
        self.tick_at(wall_clock_now())
    }

    /// Issues a timestamp for a new local event, given the current wall time.
    ///
    /// The result is strictly greater than every timestamp previously issued
    /// by this clock, even when `now` stands still or moves backwards.
    pub fn tick_at(&mut self, now: u64) -> HybridTimestamp {
        if now > self.wall_clock_millis {
            self.wall_clock_millis = now;
            self.logical_counter = 0;
        } else {
            self.advance_logical();
        }
        self.last()
    }

    /// Merges a received timestamp into the clock.
    pub fn update(&mut self, remote: &HybridTimestamp) -> HybridTimestamp {
        self.update_at(remote, wall_clock_now())
    }

    /// Merges a received timestamp into the clock, given the current wall time.
    ///
    /// Afterwards the clock is causally after both its previous state and
    /// `remote`; it never regresses.
    pub fn update_at(&mut self, remote: &HybridTimestamp, now: u64) -> HybridTimestamp {
        let local_wall = self.wall_clock_millis;
        let remote_wall = remote.wall_clock_millis;
        let max_wall = now.max(local_wall).max(remote_wall);

        if max_wall == local_wall && max_wall == remote_wall {
            self.logical_counter = self.logical_counter.max(remote.logical_counter);
            self.advance_logical();
        } else if max_wall == local_wall {
            self.advance_logical();
        } else if max_wall == remote_wall {
            self.wall_clock_millis = remote_wall;
            self.logical_counter = remote.logical_counter;
            self.advance_logical();
        } else {
            self.wall_clock_millis = max_wall;
            self.logical_counter = 0;
        }
        self.last()
    }

    fn advance_logical(&mut self) {
        match self.logical_counter.checked_add(1) {
            Some(next) => self.logical_counter = next,
            None => {
                // Counter exhausted: borrow a millisecond rather than repeat.
                self.wall_clock_millis += 1;
                self.logical_counter = 0;
            }
        }
    }
}
