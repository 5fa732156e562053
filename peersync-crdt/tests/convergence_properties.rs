//! Property-based tests for replica convergence.
//!
//! A document's materialized state must depend only on the set of
//! operations it holds:
//! - Delivery order does not matter
//! - Re-delivering an operation changes nothing
//! - Operations survive the wire format unchanged

use peersync_crdt::{ConflictPolicy, CrdtDocument, CrdtOperation, OperationDraft, VectorClock};
use peersync_types::{DeviceId, DocumentId, HybridTimestamp};
use proptest::prelude::*;
use serde_json::{Map, Value, json};

const DEVICES: [&str; 3] = ["alpha", "bravo", "charlie"];
const FIELDS: [&str; 2] = ["title", "count"];

// =============================================================================
// HELPER STRATEGIES
// =============================================================================

fn operation_strategy() -> impl Strategy<Value = CrdtOperation> {
    (
        0usize..DEVICES.len(),
        0usize..FIELDS.len(),
        0u8..3,
        any::<i16>(),
        0u64..20,
        prop::array::uniform3(0u64..4),
    )
        .prop_map(|(origin, field, kind, value, wall, seen)| {
            let field = FIELDS[field];
            let draft = match kind {
                0 => OperationDraft::set("doc", "note", field, json!(value)),
                1 => OperationDraft::increment("doc", "note", field, json!(value)),
                _ => OperationDraft::delete_field("doc", "note", field),
            };

            let mut context = VectorClock::new();
            for (name, count) in DEVICES.iter().zip(seen) {
                context.update_node(&DeviceId::new(*name).unwrap(), count);
            }
            let origin = DeviceId::new(DEVICES[origin]).unwrap();
            let own = context.get(&origin);
            context.update_node(&origin, own + 1);

            let ts = HybridTimestamp::new(wall, 0, origin.clone());
            CrdtOperation::from_draft(draft, origin, ts, context)
        })
}

fn operations_with_permutation() -> impl Strategy<Value = (Vec<CrdtOperation>, Vec<usize>)> {
    prop::collection::vec(operation_strategy(), 1..12).prop_flat_map(|ops| {
        let order: Vec<usize> = (0..ops.len()).collect();
        (Just(ops), Just(order).prop_shuffle())
    })
}

fn replay<'a>(ops: impl IntoIterator<Item = &'a CrdtOperation>) -> CrdtDocument {
    let mut document = CrdtDocument::new(DocumentId::from("doc"), "note");
    for op in ops {
        document.apply_operation(op.clone(), op.causal_timestamp.clone());
    }
    document
}

fn state(document: &CrdtDocument, policy: ConflictPolicy) -> Map<String, Value> {
    document.snapshot(policy)
}

// =============================================================================
// CONVERGENCE
// =============================================================================

proptest! {
    /// Two replicas receiving the same operations in different orders agree.
    #[test]
    fn delivery_order_does_not_matter((ops, order) in operations_with_permutation()) {
        let in_order = replay(&ops);
        let shuffled = replay(order.iter().map(|&i| &ops[i]));

        for policy in [ConflictPolicy::HighestDeviceId, ConflictPolicy::LastWriterWins] {
            prop_assert_eq!(state(&in_order, policy), state(&shuffled, policy));
        }
        prop_assert_eq!(in_order.vector_clock(), shuffled.vector_clock());
        prop_assert_eq!(in_order.len(), shuffled.len());
    }

    /// Applying every operation a second time leaves the state untouched.
    #[test]
    fn redelivery_is_idempotent(ops in prop::collection::vec(operation_strategy(), 1..10)) {
        let once = replay(&ops);
        let twice = replay(ops.iter().chain(ops.iter()));

        prop_assert_eq!(once.len(), twice.len());
        prop_assert_eq!(
            state(&once, ConflictPolicy::default()),
            state(&twice, ConflictPolicy::default())
        );
    }

    /// Merging two partial replicas in either direction yields the same state.
    #[test]
    fn merge_is_commutative(
        left in prop::collection::vec(operation_strategy(), 0..8),
        right in prop::collection::vec(operation_strategy(), 0..8),
    ) {
        let left_then_right = replay(left.iter().chain(right.iter()));
        let right_then_left = replay(right.iter().chain(left.iter()));

        prop_assert_eq!(
            state(&left_then_right, ConflictPolicy::default()),
            state(&right_then_left, ConflictPolicy::default())
        );
    }

    /// Operations survive serialization unchanged.
    #[test]
    fn operation_survives_json(op in operation_strategy()) {
        let encoded = serde_json::to_vec(&op).unwrap();
        let decoded: CrdtOperation = serde_json::from_slice(&encoded).unwrap();
        prop_assert_eq!(decoded, op);
    }
}
