//! Issue deduplication and spatial completion tracking.
//!
//! # Why
//!
//! The same rule can be independently re-evaluated near a tile boundary and
//! reported by two or more sub-verifications for what is physically one
//! violation. The registry guarantees each violation is forwarded exactly
//! once, and bounds its own memory by evicting issues once every tile that
//! could re-report them has completed.
//!
//! # Identity
//!
//! Two issues are the same violation iff
//! - their condition ids match,
//! - their canonically sorted involved-row sets match, and
//! - their geometry comparison (description + bounding extent) matches,
//!   which disambiguates the rare rule whose violations involve no rows.
//!
//! Hashing is deliberately coarser than equality (condition id + description
//! only): the map tolerates hash collisions, equality decides. Requiring the
//! full row identity prevents false merges of distinct violations that
//! happen to share geometry.
//!
//! # Eviction
//!
//! ```text
//! unit completes
//!   ├── tiled:   issue is gone when EVERY tile intersecting its extent
//!   │            is completed (boundary neighbors included)
//!   └── untiled: issue is gone when its condition's (single) shard is done
//! ```
//!
//! Eviction never races detection: completion is only processed by the
//! coordinator after the unit's stream has fully drained.

use std::collections::HashSet;
use std::hash::{Hash, Hasher};

use crate::geom::{BoxTree, Envelope};
use crate::partition::{SubVerification, SubVerificationId};
use crate::response::{InvolvedRow, IssueMsg};
use crate::spec::ConditionId;

// ============================================================================
// Issue
// ============================================================================

/// One deduplicated, downstream-visible rule violation.
#[derive(Clone, Debug, PartialEq)]
pub struct Issue {
    pub condition_id: ConditionId,
    pub condition_name: String,
    pub description: String,
    /// Canonically sorted by (table, object id).
    pub involved_rows: Vec<InvolvedRow>,
    pub envelope: Option<Envelope>,
}

// ============================================================================
// IssueKey
// ============================================================================

/// Dedup identity of one issue.
#[derive(Clone, Debug)]
struct IssueKey {
    condition_id: ConditionId,
    description: String,
    /// Sorted; see [`sort_involved_rows`].
    involved_rows: Vec<InvolvedRow>,
    envelope: Option<Envelope>,
}

impl PartialEq for IssueKey {
    fn eq(&self, other: &Self) -> bool {
        self.condition_id == other.condition_id
            && self.involved_rows == other.involved_rows
            && self.description == other.description
            && envelopes_equal(&self.envelope, &other.envelope)
    }
}

// Coordinates come from Envelope::new, which rejects NaN, so the f64
// comparison below is a proper equivalence.
impl Eq for IssueKey {}

impl Hash for IssueKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Coarse on purpose: equal keys must hash equally even though
        // equality also inspects rows and geometry.
        self.condition_id.hash(state);
        self.description.hash(state);
    }
}

fn envelopes_equal(a: &Option<Envelope>, b: &Option<Envelope>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => {
            a.x_min == b.x_min && a.y_min == b.y_min && a.x_max == b.x_max && a.y_max == b.y_max
        }
        _ => false,
    }
}

/// Canonical involved-row order: by table name, then object id.
fn sort_involved_rows(rows: &mut [InvolvedRow]) {
    rows.sort_unstable_by(|a, b| {
        a.table
            .cmp(&b.table)
            .then_with(|| a.object_id.cmp(&b.object_id))
    });
}

// ============================================================================
// Registry
// ============================================================================

/// Outcome of inserting one issue message.
#[derive(Debug)]
pub enum InsertOutcome {
    /// First sighting; the issue is live and must be forwarded.
    New(Issue),
    /// An equal issue is already live; discard.
    Duplicate,
}

/// Live-issue registry: dedup map plus tile-completion bookkeeping.
///
/// Owned exclusively by the coordinator; no internal locking.
#[derive(Debug, Default)]
pub struct IssueRegistry {
    known: HashSet<IssueKey, ahash::RandomState>,
    completed_tiles: HashSet<SubVerificationId, ahash::RandomState>,
}

impl IssueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (not yet evicted) issue keys.
    #[inline]
    pub fn live_count(&self) -> usize {
        self.known.len()
    }

    /// Register one issue message drained from a unit's mailbox.
    ///
    /// `condition_name` is resolved by the caller from the owning unit's
    /// group (the message itself only carries the id).
    pub fn insert(&mut self, mut msg: IssueMsg, condition_name: &str) -> InsertOutcome {
        sort_involved_rows(&mut msg.involved_rows);

        let key = IssueKey {
            condition_id: msg.condition_id,
            description: msg.description,
            involved_rows: msg.involved_rows,
            envelope: msg.envelope,
        };

        if self.known.contains(&key) {
            return InsertOutcome::Duplicate;
        }

        let issue = Issue {
            condition_id: key.condition_id,
            condition_name: condition_name.to_string(),
            description: key.description.clone(),
            involved_rows: key.involved_rows.clone(),
            envelope: key.envelope,
        };
        self.known.insert(key);
        InsertOutcome::New(issue)
    }

    /// Process a unit's completion: record it, then drop every live issue
    /// that can no longer be re-reported.
    ///
    /// Returns the number of evicted keys.
    pub fn on_unit_completed(
        &mut self,
        unit: &SubVerification,
        tile_index: &BoxTree<SubVerificationId>,
    ) -> usize {
        debug_assert!(unit.is_completed(), "evicting for a unit that is not completed");

        let before = self.known.len();

        match unit.tile_envelope() {
            Some(_) => {
                self.completed_tiles.insert(unit.id());

                let completed_tiles = &self.completed_tiles;
                self.known.retain(|key| {
                    !Self::is_fully_processed(key, unit, tile_index, completed_tiles)
                });
            }
            None => {
                // Single shard per condition: once it is done, nothing else
                // can re-report its issues.
                self.known
                    .retain(|key| !unit.contains_condition(key.condition_id));
            }
        }

        before - self.known.len()
    }

    /// A tiled issue is fully processed when its condition belongs to the
    /// completed unit and every tile intersecting its extent has completed.
    ///
    /// Issues without an extent are conservatively kept: there is no way to
    /// tell which neighbors might still re-report them.
    fn is_fully_processed(
        key: &IssueKey,
        unit: &SubVerification,
        tile_index: &BoxTree<SubVerificationId>,
        completed_tiles: &HashSet<SubVerificationId, ahash::RandomState>,
    ) -> bool {
        if !unit.contains_condition(key.condition_id) {
            return false;
        }

        let Some(extent) = &key.envelope else {
            return false;
        };

        tile_index
            .search(extent)
            .all(|(_, id)| completed_tiles.contains(id))
    }
}

// ============================================================================
// Tests
// ============================================================================
