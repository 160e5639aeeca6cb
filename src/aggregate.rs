//! Overall verification record and per-unit statistics merging.
//!
//! # Design
//!
//! One [`QualityVerification`] exists per run, seeded with one entry per
//! condition in the specification. Every terminal sub-verification folds its
//! statistics message into it; issue counting happens separately through the
//! dedup path (a worker's own issue counts would double-count boundary
//! duplicates).
//!
//! Merge rules per condition:
//! - execute / row-execute / tile-execute times are summed,
//! - `fulfilled` only ever goes from true to false (a worker that saw a hard
//!   violation wins over one that saw none),
//! - stop-condition linkage is adopted from the worker that reports it.
//!
//! Dataset load times are summed per dataset; processor time and
//! rows-with-stop-conditions accumulate across units.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use crate::response::VerificationStatsMsg;
use crate::spec::{ConditionId, DatasetId, QualityCondition, QualitySpecification};

// ============================================================================
// Per-condition record
// ============================================================================

/// Verification state of one condition, accumulated across units.
#[derive(Clone, Debug)]
pub struct ConditionVerification {
    pub condition: QualityCondition,
    /// False once any unit reports the condition unfulfilled, or a hard
    /// condition records an issue.
    pub fulfilled: bool,
    /// Deduplicated, accepted issues attributed to this condition.
    pub issue_count: u64,
    pub execute_time: Duration,
    pub row_execute_time: Duration,
    pub tile_execute_time: Duration,
    /// Condition whose violation stopped evaluation of this one, if any.
    pub stop_condition_id: Option<ConditionId>,
}

impl ConditionVerification {
    fn new(condition: QualityCondition) -> Self {
        Self {
            condition,
            fulfilled: true,
            issue_count: 0,
            execute_time: Duration::ZERO,
            row_execute_time: Duration::ZERO,
            tile_execute_time: Duration::ZERO,
            stop_condition_id: None,
        }
    }
}

/// Load statistics of one dataset, accumulated across units.
#[derive(Clone, Debug)]
pub struct DatasetVerification {
    pub dataset: DatasetId,
    pub load_time: Duration,
}

// ============================================================================
// Derived statistics
// ============================================================================

/// Pass/fail summary derived when the run ends.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VerificationStatistics {
    pub conditions_verified: usize,
    pub conditions_fulfilled: usize,
    pub conditions_with_issues: usize,
    pub total_issue_count: u64,
}

// ============================================================================
// QualityVerification
// ============================================================================

/// The one overall record of a verification run.
#[derive(Debug)]
pub struct QualityVerification {
    pub specification_name: String,
    pub operator: Option<String>,
    pub start_time: Option<SystemTime>,
    pub end_time: Option<SystemTime>,
    pub cancelled: bool,
    /// Failure detail when the run was cancelled by a worker failure.
    pub cancellation_message: Option<String>,
    pub conditions: Vec<ConditionVerification>,
    pub datasets: Vec<DatasetVerification>,
    pub processor_time: Duration,
    pub rows_with_stop_conditions: u64,
    pub context_name: Option<String>,
    pub context_type: Option<String>,
    /// Populated by [`QualityVerification::finish`].
    pub statistics: VerificationStatistics,
}

impl QualityVerification {
    /// Seed the record with one entry per specification condition.
    pub fn new(specification: &QualitySpecification) -> Self {
        Self {
            specification_name: specification.name.clone(),
            operator: None,
            start_time: None,
            end_time: None,
            cancelled: false,
            cancellation_message: None,
            conditions: specification
                .conditions
                .iter()
                .cloned()
                .map(ConditionVerification::new)
                .collect(),
            datasets: Vec::new(),
            processor_time: Duration::ZERO,
            rows_with_stop_conditions: 0,
            context_name: None,
            context_type: None,
            statistics: VerificationStatistics::default(),
        }
    }

    /// Mark the run as started.
    pub fn start(&mut self, operator: impl Into<String>) {
        self.operator = Some(operator.into());
        self.start_time = Some(SystemTime::now());
    }

    pub fn condition(&self, id: ConditionId) -> Option<&ConditionVerification> {
        self.conditions.iter().find(|c| c.condition.id == id)
    }

    fn condition_mut(&mut self, id: ConditionId) -> &mut ConditionVerification {
        self.conditions
            .iter_mut()
            .find(|c| c.condition.id == id)
            .unwrap_or_else(|| {
                // Sub-requests are derived from this same specification, so a
                // worker can only report conditions the record already knows.
                panic!("condition {:?} not present in the overall verification", id)
            })
    }

    /// Count one accepted, deduplicated issue against its condition.
    pub fn record_issue(&mut self, condition_id: ConditionId) {
        let cv = self.condition_mut(condition_id);
        cv.issue_count += 1;
        if !cv.condition.allow_errors {
            cv.fulfilled = false;
        }
    }

    /// Fold one unit's final statistics into the record.
    pub fn merge_stats(&mut self, stats: &VerificationStatsMsg) {
        if stats.cancelled {
            self.cancelled = true;
        }

        for cs in &stats.conditions {
            // Resolve the stop link first; borrowing rules aside, this also
            // validates the referenced id before any mutation.
            if let Some(stop_id) = cs.stop_condition_id {
                assert!(
                    self.condition(stop_id).is_some(),
                    "stop condition {:?} not present in the overall verification",
                    stop_id
                );
            }

            let cv = self.condition_mut(cs.condition_id);
            cv.execute_time += cs.execute_time;
            cv.row_execute_time += cs.row_execute_time;
            cv.tile_execute_time += cs.tile_execute_time;

            if !cs.fulfilled && cv.fulfilled {
                if cv.issue_count == 0 {
                    // Benign race: the only issue backing the worker's
                    // verdict may have been filtered here after the worker
                    // reported. The stricter verdict still wins.
                    tracing::debug!(
                        condition = ?cs.condition_id,
                        "worker reported unfulfilled with no accepted issues"
                    );
                }
                cv.fulfilled = false;
            }

            if let Some(stop_id) = cs.stop_condition_id {
                cv.stop_condition_id = Some(stop_id);
            }
        }

        for ds in &stats.datasets {
            match self.datasets.iter_mut().find(|d| d.dataset == ds.dataset) {
                Some(existing) => existing.load_time += ds.load_time,
                None => self.datasets.push(DatasetVerification {
                    dataset: ds.dataset,
                    load_time: ds.load_time,
                }),
            }
        }

        self.processor_time += stats.processor_time;
        self.rows_with_stop_conditions += stats.rows_with_stop_conditions;

        if let Some(name) = &stats.context_name {
            self.context_name = Some(name.clone());
        }
        if let Some(kind) = &stats.context_type {
            self.context_type = Some(kind.clone());
        }
        if let Some(operator) = &stats.operator {
            self.operator = Some(operator.clone());
        }
    }

    /// Close the record: end time, cancellation flag, derived statistics.
    pub fn finish(&mut self, cancelled: bool) {
        self.end_time = Some(SystemTime::now());
        if cancelled {
            self.cancelled = true;
        }

        self.statistics = VerificationStatistics {
            conditions_verified: self.conditions.len(),
            conditions_fulfilled: self.conditions.iter().filter(|c| c.fulfilled).count(),
            conditions_with_issues: self.conditions.iter().filter(|c| c.issue_count > 0).count(),
            total_issue_count: self.conditions.iter().map(|c| c.issue_count).sum(),
        };
    }
}

// ============================================================================
// Stop-condition rows
// ============================================================================

/// Why a row stopped further checks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StopInfo {
    pub condition_id: ConditionId,
    pub description: String,
    /// True when the stop was already reported as a regular issue (hard
    /// stop conditions need no second report).
    pub reported: bool,
}

/// Rows whose violations stop further checks, keyed by (table, object id).
///
/// The first stop per row wins; later stops on the same row are dropped.
#[derive(Debug, Default)]
pub struct RowsWithStopConditions {
    rows: HashMap<(String, i64), StopInfo, ahash::RandomState>,
}

impl RowsWithStopConditions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a stop for one row. No effect if the row already has one.
    pub fn add(&mut self, table: &str, object_id: i64, info: StopInfo) {
        self.rows
            .entry((table.to_string(), object_id))
            .or_insert(info);
    }

    pub fn stop_info(&self, table: &str, object_id: i64) -> Option<&StopInfo> {
        self.rows.get(&(table.to_string(), object_id))
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.rows.len()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::{ConditionStatsMsg, DatasetStatsMsg};

    fn spec() -> QualitySpecification {
        let mut hard = QualityCondition::new(1, "hard");
        hard.allow_errors = false;
        let soft = QualityCondition::new(2, "soft");
        QualitySpecification::new("spec", vec![hard, soft])
    }

    fn condition_stats(id: u32, fulfilled: bool, execute_secs: u64) -> ConditionStatsMsg {
        ConditionStatsMsg {
            condition_id: ConditionId(id),
            fulfilled,
            execute_time: Duration::from_secs(execute_secs),
            row_execute_time: Duration::ZERO,
            tile_execute_time: Duration::ZERO,
            stop_condition_id: None,
        }
    }

    #[test]
    fn merge_sums_execute_times() {
        let mut record = QualityVerification::new(&spec());

        record.merge_stats(&VerificationStatsMsg {
            conditions: vec![condition_stats(1, true, 3)],
            ..Default::default()
        });
        record.merge_stats(&VerificationStatsMsg {
            conditions: vec![condition_stats(1, true, 4)],
            ..Default::default()
        });

        let cv = record.condition(ConditionId(1)).unwrap();
        assert_eq!(cv.execute_time, Duration::from_secs(7));
        assert!(cv.fulfilled);
    }

    #[test]
    fn unfulfilled_wins_and_sticks() {
        let mut record = QualityVerification::new(&spec());

        record.merge_stats(&VerificationStatsMsg {
            conditions: vec![condition_stats(1, false, 1)],
            ..Default::default()
        });
        record.merge_stats(&VerificationStatsMsg {
            conditions: vec![condition_stats(1, true, 1)],
            ..Default::default()
        });

        assert!(!record.condition(ConditionId(1)).unwrap().fulfilled);
    }

    #[test]
    fn hard_condition_issue_makes_it_unfulfilled() {
        let mut record = QualityVerification::new(&spec());

        record.record_issue(ConditionId(1));
        assert!(!record.condition(ConditionId(1)).unwrap().fulfilled);

        // Soft condition keeps its fulfilled flag.
        record.record_issue(ConditionId(2));
        assert!(record.condition(ConditionId(2)).unwrap().fulfilled);
    }

    #[test]
    fn dataset_load_times_merge_per_dataset() {
        let mut record = QualityVerification::new(&spec());

        let stats = |secs| VerificationStatsMsg {
            datasets: vec![DatasetStatsMsg {
                dataset: DatasetId(7),
                load_time: Duration::from_secs(secs),
            }],
            ..Default::default()
        };
        record.merge_stats(&stats(2));
        record.merge_stats(&stats(5));

        assert_eq!(record.datasets.len(), 1);
        assert_eq!(record.datasets[0].load_time, Duration::from_secs(7));
    }

    #[test]
    fn cancelled_flag_is_sticky() {
        let mut record = QualityVerification::new(&spec());
        record.merge_stats(&VerificationStatsMsg {
            cancelled: true,
            ..Default::default()
        });
        record.merge_stats(&VerificationStatsMsg::default());

        assert!(record.cancelled);
    }

    #[test]
    fn stop_condition_link_adopted() {
        let mut record = QualityVerification::new(&spec());
        record.merge_stats(&VerificationStatsMsg {
            conditions: vec![ConditionStatsMsg {
                stop_condition_id: Some(ConditionId(1)),
                ..condition_stats(2, true, 0)
            }],
            ..Default::default()
        });

        assert_eq!(
            record.condition(ConditionId(2)).unwrap().stop_condition_id,
            Some(ConditionId(1))
        );
    }

    #[test]
    #[should_panic(expected = "not present in the overall verification")]
    fn unknown_condition_panics() {
        let mut record = QualityVerification::new(&spec());
        record.merge_stats(&VerificationStatsMsg {
            conditions: vec![condition_stats(99, true, 0)],
            ..Default::default()
        });
    }

    #[test]
    fn finish_derives_statistics() {
        let mut record = QualityVerification::new(&spec());
        record.start("tester");
        record.record_issue(ConditionId(1));
        record.finish(false);

        assert!(record.end_time.is_some());
        assert!(!record.cancelled);
        assert_eq!(
            record.statistics,
            VerificationStatistics {
                conditions_verified: 2,
                conditions_fulfilled: 1,
                conditions_with_issues: 1,
                total_issue_count: 1,
            }
        );
    }

    #[test]
    fn finish_with_cancellation() {
        let mut record = QualityVerification::new(&spec());
        record.finish(true);
        assert!(record.cancelled);
    }

    #[test]
    fn first_stop_per_row_wins() {
        let mut rows = RowsWithStopConditions::new();
        rows.add(
            "roads",
            5,
            StopInfo {
                condition_id: ConditionId(1),
                description: "first".into(),
                reported: true,
            },
        );
        rows.add(
            "roads",
            5,
            StopInfo {
                condition_id: ConditionId(2),
                description: "second".into(),
                reported: false,
            },
        );

        assert_eq!(rows.count(), 1);
        assert_eq!(rows.stop_info("roads", 5).unwrap().description, "first");
        assert!(rows.stop_info("sewers", 5).is_none());
    }
}
