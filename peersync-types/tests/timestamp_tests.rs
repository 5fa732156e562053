use peersync_types::{DeviceId, HybridLogicalClock, HybridTimestamp};
use proptest::prelude::*;

fn device(name: &str) -> DeviceId {
    DeviceId::new(name).unwrap()
}

// ── Ordering ─────────────────────────────────────────────────────

#[test]
fn ordering_by_wall_time() {
    let a = HybridTimestamp::new(100, 9, device("zulu"));
    let b = HybridTimestamp::new(200, 0, device("alpha"));
    assert!(a < b);
    assert!(a.happens_before(&b));
    assert!(b.happens_after(&a));
}

#[test]
fn ordering_by_logical_when_wall_time_equal() {
    let a = HybridTimestamp::new(100, 0, device("zulu"));
    let b = HybridTimestamp::new(100, 1, device("alpha"));
    assert!(a < b);
}

#[test]
fn device_breaks_ties() {
    let a = HybridTimestamp::new(100, 1, device("alpha"));
    let b = HybridTimestamp::new(100, 1, device("bravo"));
    assert!(a.happens_before(&b));
    assert_eq!(a.cmp_clock(&b), std::cmp::Ordering::Equal);
}

#[test]
fn equal_timestamps() {
    let a = HybridTimestamp::new(100, 5, device("alpha"));
    let b = HybridTimestamp::new(100, 5, device("alpha"));
    assert_eq!(a, b);
    assert!(!a.happens_before(&b));
    assert!(!a.happens_after(&b));
}

// ── Wire format ──────────────────────────────────────────────────

#[test]
fn serializes_with_camel_case_fields() {
    let ts = HybridTimestamp::new(1_700_000_000_000, 3, device("alpha"));
    let json = serde_json::to_value(&ts).unwrap();
    assert_eq!(json["logicalCounter"], 3);
    assert_eq!(json["wallClockMillis"], 1_700_000_000_000u64);
    assert_eq!(json["deviceId"], "alpha");

    let back: HybridTimestamp = serde_json::from_value(json).unwrap();
    assert_eq!(back, ts);
}

// ── Clock: tick ──────────────────────────────────────────────────

#[test]
fn tick_uses_wall_time_when_it_advances() {
    let mut clock = HybridLogicalClock::new(device("alpha"));
    let ts = clock.tick_at(1_000);
    assert_eq!(ts.wall_clock_millis(), 1_000);
    assert_eq!(ts.logical_counter(), 0);
    assert_eq!(ts.device_id().as_str(), "alpha");
}

#[test]
fn tick_within_same_millisecond_increments_logical() {
    let mut clock = HybridLogicalClock::new(device("alpha"));
    let a = clock.tick_at(1_000);
    let b = clock.tick_at(1_000);
    let c = clock.tick_at(1_000);
    assert!(a < b && b < c);
    assert_eq!(c.wall_clock_millis(), 1_000);
    assert_eq!(c.logical_counter(), 2);
}

#[test]
fn tick_survives_wall_clock_going_backwards() {
    let mut clock = HybridLogicalClock::new(device("alpha"));
    let a = clock.tick_at(5_000);
    let b = clock.tick_at(4_000);
    assert!(b > a);
    assert_eq!(b.wall_clock_millis(), 5_000);
}

#[test]
fn tick_with_system_clock_is_strictly_increasing() {
    let mut clock = HybridLogicalClock::new(device("alpha"));
    let mut previous = clock.tick();
    for _ in 0..10_000 {
        let next = clock.tick();
        assert!(next > previous);
        previous = next;
    }
}

// ── Clock: update ────────────────────────────────────────────────

#[test]
fn update_moves_past_remote_in_the_future() {
    let mut clock = HybridLogicalClock::new(device("alpha"));
    clock.tick_at(1_000);
    let remote = HybridTimestamp::new(9_000, 4, device("bravo"));
    let merged = clock.update_at(&remote, 1_001);
    assert_eq!(merged.wall_clock_millis(), 9_000);
    assert_eq!(merged.logical_counter(), 5);
    assert!(merged.cmp_clock(&remote).is_gt());

    let next = clock.tick_at(1_002);
    assert!(next > merged);
}

#[test]
fn update_with_older_remote_does_not_regress() {
    let mut clock = HybridLogicalClock::new(device("alpha"));
    let issued = clock.tick_at(5_000);
    let remote = HybridTimestamp::new(10, 0, device("bravo"));
    let merged = clock.update_at(&remote, 4_000);
    assert!(merged > issued);
}

#[test]
fn update_with_equal_wall_takes_max_logical() {
    let mut clock = HybridLogicalClock::new(device("alpha"));
    clock.tick_at(7_000);
    let remote = HybridTimestamp::new(7_000, 12, device("bravo"));
    let merged = clock.update_at(&remote, 6_000);
    assert_eq!(merged.wall_clock_millis(), 7_000);
    assert_eq!(merged.logical_counter(), 13);
}

#[test]
fn update_uses_wall_time_when_it_is_newest() {
    let mut clock = HybridLogicalClock::new(device("alpha"));
    clock.tick_at(1_000);
    let remote = HybridTimestamp::new(2_000, 8, device("bravo"));
    let merged = clock.update_at(&remote, 3_000);
    assert_eq!(merged.wall_clock_millis(), 3_000);
    assert_eq!(merged.logical_counter(), 0);
}

#[test]
fn logical_overflow_borrows_a_millisecond() {
    let mut clock = HybridLogicalClock::new(device("alpha"));
    clock.update_at(&HybridTimestamp::new(50, u32::MAX - 1, device("bravo")), 0);
    let next = clock.tick_at(0);
    assert_eq!(next.wall_clock_millis(), 51);
    assert_eq!(next.logical_counter(), 0);
}

proptest! {
    #[test]
    fn issued_timestamps_strictly_increase(
        steps in prop::collection::vec((0u64..5_000, any::<bool>(), 0u64..5_000, 0u32..50), 1..200)
    ) {
        let mut clock = HybridLogicalClock::new(device("alpha"));
        let mut previous: Option<HybridTimestamp> = None;
        for (now, receive, remote_wall, remote_logical) in steps {
            let ts = if receive {
                let remote = HybridTimestamp::new(remote_wall, remote_logical, device("bravo"));
                let ts = clock.update_at(&remote, now);
                prop_assert!(ts.cmp_clock(&remote).is_gt());
                ts
            } else {
                clock.tick_at(now)
            };
            if let Some(prev) = &previous {
                prop_assert!(ts > *prev);
            }
            previous = Some(ts);
        }
    }
}
