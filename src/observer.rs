//! Outbound event seam for verification runs.
//!
//! # Design
//!
//! The coordinator reports everything a caller can react to through one
//! trait object: unit lifecycle, coalesced overall progress, deduplicated
//! issues, and the final record. Callbacks run on the coordinator thread;
//! implementations must return quickly or they stall dispatch.
//!
//! `issue_detected` doubles as the caller's issue filter: returning `false`
//! suppresses the issue downstream. The issue stays in the dedup registry
//! either way - a filtered issue must not resurface through a neighboring
//! tile.

use std::sync::Mutex;

use crate::aggregate::QualityVerification;
use crate::dedup::Issue;
use crate::partition::{SubVerificationId, SubVerificationInfo};
use crate::response::ServiceCallStatus;

// ============================================================================
// Trait
// ============================================================================

/// Receiver for scheduler events.
///
/// All methods have no-op defaults so implementations subscribe only to what
/// they need.
pub trait VerificationObserver: Send + Sync + 'static {
    /// The work plan is final: one entry per sub-verification, in dispatch
    /// order.
    fn sub_verifications_created(&self, units: &[SubVerificationInfo]) {
        let _ = units;
    }

    /// A unit was handed to a worker.
    fn started(&self, id: SubVerificationId, worker_address: &str) {
        let _ = (id, worker_address);
    }

    /// A unit reached a terminal state for this attempt.
    ///
    /// `Retry` means the unit goes back to the pending queue; any other
    /// status is final for the unit.
    fn finished(&self, id: SubVerificationId, status: ServiceCallStatus) {
        let _ = (id, status);
    }

    /// Completed-unit count changed.
    fn progress_changed(&self, current: usize, total: usize) {
        let _ = (current, total);
    }

    /// A new (deduplicated) issue. Return `false` to filter it from the
    /// results.
    fn issue_detected(&self, issue: &Issue) -> bool {
        let _ = issue;
        true
    }

    /// The run is over; `verification` carries final statistics and the
    /// cancellation flag.
    fn verification_finished(&self, verification: &QualityVerification) {
        let _ = verification;
    }
}

/// Observer that ignores every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullObserver;

impl VerificationObserver for NullObserver {}

// ============================================================================
// Recording observer (tests, diagnostics)
// ============================================================================

/// Event record kept by [`RecordingObserver`].
#[derive(Clone, Debug, PartialEq)]
pub enum ObservedEvent {
    Created { unit_count: usize },
    Started { id: SubVerificationId, address: String },
    Finished { id: SubVerificationId, status: ServiceCallStatus },
    Progress { current: usize, total: usize },
    Issue { description: String },
    RunFinished { cancelled: bool },
}

/// Observer that records all events in memory.
///
/// Intended for tests and diagnostics; locking per event is irrelevant at
/// that scale.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<ObservedEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ObservedEvent> {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn issue_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, ObservedEvent::Issue { .. }))
            .count()
    }

    fn record(&self, event: ObservedEvent) {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(event);
    }
}

impl VerificationObserver for RecordingObserver {
    fn sub_verifications_created(&self, units: &[SubVerificationInfo]) {
        self.record(ObservedEvent::Created {
            unit_count: units.len(),
        });
    }

    fn started(&self, id: SubVerificationId, worker_address: &str) {
        self.record(ObservedEvent::Started {
            id,
            address: worker_address.to_string(),
        });
    }

    fn finished(&self, id: SubVerificationId, status: ServiceCallStatus) {
        self.record(ObservedEvent::Finished { id, status });
    }

    fn progress_changed(&self, current: usize, total: usize) {
        self.record(ObservedEvent::Progress { current, total });
    }

    fn issue_detected(&self, issue: &Issue) -> bool {
        self.record(ObservedEvent::Issue {
            description: issue.description.clone(),
        });
        true
    }

    fn verification_finished(&self, verification: &QualityVerification) {
        self.record(ObservedEvent::RunFinished {
            cancelled: verification.cancelled,
        });
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_observer_accepts_issues() {
        let issue = Issue {
            condition_id: crate::spec::ConditionId(1),
            condition_name: "qc".into(),
            description: "d".into(),
            involved_rows: Vec::new(),
            envelope: None,
        };
        assert!(NullObserver.issue_detected(&issue));
    }

    #[test]
    fn recording_observer_keeps_order() {
        let observer = RecordingObserver::new();
        observer.progress_changed(1, 4);
        observer.progress_changed(2, 4);

        assert_eq!(
            observer.events(),
            vec![
                ObservedEvent::Progress { current: 1, total: 4 },
                ObservedEvent::Progress { current: 2, total: 4 },
            ]
        );
    }
}
