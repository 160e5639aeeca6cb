//! Properties of issue deduplication: idempotence and distinctness.

use proptest::prelude::*;

use verdis::dedup::{InsertOutcome, IssueRegistry};
use verdis::response::{InvolvedRow, IssueMsg};
use verdis::{ConditionId, Envelope};

/// One generated issue identity.
#[derive(Clone, Debug, PartialEq)]
struct RawIssue {
    condition: u32,
    description: String,
    rows: Vec<(u8, i64)>,
    envelope: Option<(u8, u8)>,
}

fn arb_issue() -> impl Strategy<Value = RawIssue> {
    (
        0u32..5,
        prop::sample::select(vec!["gap", "overlap", "dangling edge"]),
        prop::collection::vec((0u8..3, 0i64..50), 0..4),
        prop::option::of((0u8..10, 0u8..10)),
    )
        .prop_map(|(condition, description, rows, envelope)| RawIssue {
            condition,
            description: description.to_string(),
            rows,
            envelope,
        })
}

fn to_msg(raw: &RawIssue) -> IssueMsg {
    IssueMsg {
        condition_id: ConditionId(raw.condition),
        description: raw.description.clone(),
        involved_rows: raw
            .rows
            .iter()
            .map(|(table, oid)| InvolvedRow::new(format!("table{}", table), *oid))
            .collect(),
        envelope: raw.envelope.map(|(x, y)| {
            Envelope::new(x as f64, y as f64, x as f64 + 1.0, y as f64 + 1.0)
        }),
    }
}

/// Canonical identity used to predict dedup behavior.
fn identity(raw: &RawIssue) -> (u32, String, Vec<(u8, i64)>, Option<(u8, u8)>) {
    let mut rows = raw.rows.clone();
    rows.sort_unstable();
    (raw.condition, raw.description.clone(), rows, raw.envelope)
}

proptest! {
    /// Submitting the same message any number of times forwards exactly one
    /// issue, regardless of involved-row order.
    #[test]
    fn resubmission_is_idempotent(
        raw in arb_issue(),
        repeats in 1usize..6,
        shuffle_seed in 0u64..u64::MAX,
    ) {
        let mut registry = IssueRegistry::new();
        let mut forwarded = 0;

        for i in 0..repeats {
            let mut msg = to_msg(&raw);
            // Cheap deterministic shuffle of row order per submission.
            if msg.involved_rows.len() > 1 {
                let rotation = ((shuffle_seed as usize).wrapping_add(i)) % msg.involved_rows.len();
                msg.involved_rows.rotate_left(rotation);
            }

            if matches!(registry.insert(msg, "qc"), InsertOutcome::New(_)) {
                forwarded += 1;
            }
        }

        prop_assert_eq!(forwarded, 1);
        prop_assert_eq!(registry.live_count(), 1);
    }

    /// The number of forwarded issues equals the number of distinct
    /// identities; distinct identities are never merged.
    #[test]
    fn forwarding_matches_distinct_identities(
        issues in prop::collection::vec(arb_issue(), 1..40),
    ) {
        let mut registry = IssueRegistry::new();

        let mut distinct = Vec::new();
        for raw in &issues {
            let id = identity(raw);
            if !distinct.contains(&id) {
                distinct.push(id);
            }
        }

        let mut forwarded = 0;
        for raw in &issues {
            if matches!(registry.insert(to_msg(raw), "qc"), InsertOutcome::New(_)) {
                forwarded += 1;
            }
        }

        prop_assert_eq!(forwarded, distinct.len());
        prop_assert_eq!(registry.live_count(), distinct.len());
    }
}
