//! Verification job model: conditions, condition groups, requests.
//!
//! # Design
//!
//! These types describe WHAT gets verified; they carry no execution logic.
//! Identifiers are small `Copy` newtypes so they pass through the scheduler,
//! dedup map, and statistics without allocation.
//!
//! A job arrives as a [`VerificationRequest`] plus a set of
//! [`QualityConditionGroup`]s produced upstream (the condition assembler is
//! an external collaborator). The partitioner derives one *sub-request* per
//! sub-verification: a clone of the original request restricted to that
//! shard's conditions, with parallelism forced to 1 and result persistence
//! disabled so only the coordinator writes reports.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::geom::Envelope;

// ============================================================================
// Identifiers
// ============================================================================

/// Job-scoped identifier of one quality condition.
///
/// Condition ids must be unique within one verification job; the partitioner
/// validates this (issue eviction for untiled shards keys on the condition id
/// alone).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConditionId(pub u32);

/// Identifier of one verified dataset (table or feature class).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DatasetId(pub u32);

// ============================================================================
// Conditions and tests
// ============================================================================

/// One configured rule check.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityCondition {
    pub id: ConditionId,
    pub name: String,
    /// Rows violating this condition stop further checks on the same row.
    pub stop_on_error: bool,
    /// Whether detected issues are tolerated (soft condition) or make the
    /// condition unfulfilled (hard condition).
    pub allow_errors: bool,
}

impl QualityCondition {
    /// Convenience constructor for a soft condition.
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id: ConditionId(id),
            name: name.into(),
            stop_on_error: false,
            allow_errors: true,
        }
    }
}

/// Opaque executable unit of one condition. Evaluation happens in workers;
/// the scheduler only routes it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionTest {
    pub name: String,
    pub dataset: DatasetId,
}

// ============================================================================
// Condition groups
// ============================================================================

/// Execution class of a condition group, decided upstream.
///
/// Closed set: partitioning branches exhaustively over these variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecType {
    /// Conditions that run outside the tiled container (global checks).
    NonContainer,
    /// Container conditions that must see the full area in one process.
    Container,
    /// Container conditions safe to evaluate tile-by-tile in parallel.
    TileParallel,
    /// Result of re-bucketing container work across sub-verifications.
    Mixed,
}

/// Immutable group of conditions sharing one execution class.
///
/// The condition list preserves upstream order; round-robin partitioning
/// depends on stable iteration.
#[derive(Clone, Debug)]
pub struct QualityConditionGroup {
    exec_type: ExecType,
    conditions: Vec<(QualityCondition, Vec<ConditionTest>)>,
}

impl QualityConditionGroup {
    pub fn new(exec_type: ExecType) -> Self {
        Self {
            exec_type,
            conditions: Vec::new(),
        }
    }

    pub fn with_conditions(
        exec_type: ExecType,
        conditions: Vec<(QualityCondition, Vec<ConditionTest>)>,
    ) -> Self {
        Self {
            exec_type,
            conditions,
        }
    }

    /// Add one condition with its tests.
    pub fn push(&mut self, condition: QualityCondition, tests: Vec<ConditionTest>) {
        self.conditions.push((condition, tests));
    }

    #[inline]
    pub fn exec_type(&self) -> ExecType {
        self.exec_type
    }

    #[inline]
    pub fn condition_count(&self) -> usize {
        self.conditions.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Iterate over `(condition, tests)` entries in upstream order.
    pub fn entries(&self) -> impl Iterator<Item = &(QualityCondition, Vec<ConditionTest>)> {
        self.conditions.iter()
    }

    /// Look up a condition of this group by id.
    pub fn condition(&self, id: ConditionId) -> Option<&QualityCondition> {
        self.conditions
            .iter()
            .find(|(c, _)| c.id == id)
            .map(|(c, _)| c)
    }

    /// Whether this group contains the given condition.
    #[inline]
    pub fn contains_condition(&self, id: ConditionId) -> bool {
        self.condition(id).is_some()
    }

    /// Ids of all conditions in this group, in order.
    pub fn condition_ids(&self) -> impl Iterator<Item = ConditionId> + '_ {
        self.conditions.iter().map(|(c, _)| c.id)
    }
}

// ============================================================================
// Specification
// ============================================================================

/// The full set of conditions a job verifies, independent of grouping.
///
/// Used to compute per-shard exclusion lists and to seed the overall
/// verification record with one entry per condition.
#[derive(Clone, Debug)]
pub struct QualitySpecification {
    pub name: String,
    pub conditions: Vec<QualityCondition>,
}

impl QualitySpecification {
    pub fn new(name: impl Into<String>, conditions: Vec<QualityCondition>) -> Self {
        Self {
            name: name.into(),
            conditions,
        }
    }

    /// Ids of conditions NOT in `included` (the shard's exclusion list).
    pub fn excluded_ids(&self, included: &[ConditionId]) -> Vec<ConditionId> {
        self.conditions
            .iter()
            .map(|c| c.id)
            .filter(|id| !included.contains(id))
            .collect()
    }
}

// ============================================================================
// Requests
// ============================================================================

/// Full description of one verification job.
#[derive(Clone, Debug)]
pub struct VerificationRequest {
    pub specification: Arc<QualitySpecification>,
    /// Area to verify. `None` means the full extent of the data.
    pub perimeter: Option<Envelope>,
    /// Edge length of the container's processing tiles, in map units.
    pub tile_size: f64,
    /// Upper bound on concurrently running sub-verifications.
    pub max_parallelism: usize,
    /// Condition ids excluded from this request (empty on the original
    /// request; populated on sub-requests).
    pub excluded_condition_ids: Vec<ConditionId>,
    /// Whether this request writes reports and persists statistics.
    /// Sub-requests never do; only the coordinator reports.
    pub persist_results: bool,
}

impl VerificationRequest {
    pub fn new(specification: Arc<QualitySpecification>, tile_size: f64) -> Self {
        Self {
            specification,
            perimeter: None,
            tile_size,
            max_parallelism: 2,
            excluded_condition_ids: Vec::new(),
            persist_results: true,
        }
    }

    /// Derive the request for one shard: single-process, restricted to the
    /// shard's conditions via the exclusion list, no result persistence.
    pub fn sub_request(&self, excluded_condition_ids: Vec<ConditionId>) -> VerificationRequest {
        VerificationRequest {
            specification: Arc::clone(&self.specification),
            perimeter: self.perimeter,
            tile_size: self.tile_size,
            max_parallelism: 1,
            excluded_condition_ids,
            persist_results: false,
        }
    }
}

// ============================================================================
// Parallel configuration
// ============================================================================

/// Tunables for how a job is split into sub-verifications.
///
/// All fields are optional in the sense that their zero/`None` value selects
/// the built-in default behavior.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParallelConfiguration {
    /// Bucket count for non-container conditions. 0 = one bucket per
    /// condition.
    pub max_non_container_tasks: usize,
    /// Bucket count for full-area container work. 0 = derived from the
    /// requested parallelism (leaves headroom for tile-parallel units).
    pub max_full_area_tasks: usize,
    /// Upper bound on tile-parallel units. 0 = one unit per natural tile.
    pub max_split_area_tasks: usize,
    /// Minimum tile edge length for splitting. <= 0 = use the request's
    /// tile size.
    pub minimum_split_area_extent: f64,
    /// Dispatch-priority order of exec types. `None` = NonContainer,
    /// Container, TileParallel.
    pub type_priority: Option<Vec<ExecType>>,
    /// Estimate involved rows per tile in the background and dispatch
    /// expensive tiles first.
    pub sort_by_number_of_objects: bool,
}

impl Default for ParallelConfiguration {
    fn default() -> Self {
        Self {
            max_non_container_tasks: 0,
            max_full_area_tasks: 0,
            max_split_area_tasks: 0,
            minimum_split_area_extent: 0.0,
            type_priority: None,
            sort_by_number_of_objects: false,
        }
    }
}

impl ParallelConfiguration {
    /// Validate configuration invariants.
    ///
    /// # Panics
    ///
    /// Panics on an invalid priority list (duplicates, or the `Mixed`
    /// pseudo-type, which is produced by partitioning and cannot be
    /// prioritized as an input class).
    pub fn validate(&self) {
        if let Some(priority) = &self.type_priority {
            for (i, t) in priority.iter().enumerate() {
                assert!(
                    !priority[..i].contains(t),
                    "duplicate exec type in type_priority: {:?}",
                    t
                );
            }
        }
        assert!(
            self.minimum_split_area_extent.is_finite(),
            "minimum_split_area_extent must be finite"
        );
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_with_ids(ids: &[u32]) -> QualitySpecification {
        QualitySpecification::new(
            "spec",
            ids.iter()
                .map(|&i| QualityCondition::new(i, format!("qc{}", i)))
                .collect(),
        )
    }

    #[test]
    fn excluded_ids_complement() {
        let spec = spec_with_ids(&[1, 2, 3, 4]);
        let excluded = spec.excluded_ids(&[ConditionId(2), ConditionId(4)]);
        assert_eq!(excluded, vec![ConditionId(1), ConditionId(3)]);
    }

    #[test]
    fn sub_request_forces_single_process() {
        let req = VerificationRequest::new(Arc::new(spec_with_ids(&[1, 2])), 100.0);
        let sub = req.sub_request(vec![ConditionId(2)]);

        assert_eq!(sub.max_parallelism, 1);
        assert!(!sub.persist_results);
        assert_eq!(sub.excluded_condition_ids, vec![ConditionId(2)]);
        assert_eq!(sub.tile_size, req.tile_size);
    }

    #[test]
    fn group_lookup() {
        let mut group = QualityConditionGroup::new(ExecType::TileParallel);
        group.push(
            QualityCondition::new(7, "qc7"),
            vec![ConditionTest {
                name: "t".into(),
                dataset: DatasetId(0),
            }],
        );

        assert!(group.contains_condition(ConditionId(7)));
        assert!(!group.contains_condition(ConditionId(8)));
        assert_eq!(group.condition(ConditionId(7)).unwrap().name, "qc7");
    }

    #[test]
    fn parallel_configuration_default_is_valid() {
        ParallelConfiguration::default().validate();
    }

    #[test]
    #[should_panic(expected = "duplicate exec type")]
    fn duplicate_type_priority_panics() {
        let config = ParallelConfiguration {
            type_priority: Some(vec![ExecType::NonContainer, ExecType::NonContainer]),
            ..Default::default()
        };
        config.validate();
    }
}
