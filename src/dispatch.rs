//! The dispatch loop: one coordinator driving all sub-verifications.
//!
//! # Architecture
//!
//! ```text
//!                         ┌──────────────────────────────────────────┐
//!                         │               Coordinator                │
//!  partition ───────────► │  pending (stack)                         │
//!                         │     │ acquire()          completions     │
//!                         │     ▼                        ▲           │
//!                         │  WorkerPool ──► unit thread ─┘           │
//!                         │                   │                      │
//!                         │                   ▼                      │
//!                         │              SubResponse ──► drain ──►   │
//!                         │              (mailbox)    dedup/stats    │
//!                         └──────────────────────────────────────────┘
//! ```
//!
//! Per-unit state machine:
//!
//! ```text
//! Pending ──► Dispatched ──► Succeeded            (completed = true)
//!                  │   └───► Terminal-Failed      (completed = true)
//!                  └───────► Retryable ──► Pending
//! ```
//!
//! # Correctness Invariants
//!
//! - **Single owner**: pending stack, active map, pool, dedup registry and
//!   the overall record are touched by the coordinator thread only.
//! - **Bounded in-flight**: `|active| <= min(pool size, max_parallelism)`,
//!   enforced by the pool.
//! - **One completion per tick**: keeps retry bookkeeping simple and matches
//!   the bounded-latency progress contract.
//! - **No coordinator blocking on one worker**: the only wait is a bounded
//!   `recv_timeout` on the completion channel; a stuck worker call sits on
//!   its own thread.
//!
//! # Cancellation
//!
//! One shared token. Unit threads observe it between streamed messages and
//! hang up; the coordinator stops dispatching pending work and lets active
//! calls wind down. The final record is Cancelled, never Failed, when the
//! caller triggered it.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use serde::{Deserialize, Serialize};

use crate::aggregate::{QualityVerification, RowsWithStopConditions, StopInfo};
use crate::cancel::CancellationToken;
use crate::dedup::{InsertOutcome, IssueRegistry};
use crate::error::{VerificationError, WorkerError};
use crate::geom::{BoxTree, Envelope};
use crate::observer::VerificationObserver;
use crate::partition::{
    create_sub_verifications, IdSequence, SubVerification, SubVerificationId,
};
use crate::response::{ServiceCallStatus, SubResponse, WorkerMessage};
use crate::spec::{ParallelConfiguration, QualityConditionGroup, VerificationRequest};
use crate::worker::{WorkerClient, WorkerPool, WorkerSlotId};

// ============================================================================
// Configuration
// ============================================================================

/// Coordinator tunables.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Re-dispatch attempts per unit after its first failure.
    pub retry_cap: u32,
    /// Upper bound on coordinator wait per tick.
    pub poll_interval: Duration,
    /// Operator recorded on the overall verification (workers may override
    /// it with their own user name).
    pub operator: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            retry_cap: 1,
            poll_interval: Duration::from_millis(100),
            operator: "coordinator".to_string(),
        }
    }
}

impl DispatchConfig {
    /// Validate configuration invariants.
    ///
    /// # Panics
    ///
    /// Panics on a zero poll interval.
    pub fn validate(&self) {
        assert!(
            self.poll_interval > Duration::ZERO,
            "poll_interval must be > 0"
        );
    }
}

// ============================================================================
// Row-count estimation
// ============================================================================

/// Caller-supplied estimator behind the optional pending-work reordering.
///
/// `None` signals estimation failure; the run silently keeps natural order.
pub trait RowCountEstimator: Send + Sync + 'static {
    /// Approximate number of involved rows intersecting one tile.
    fn estimate_rows(&self, tile: &Envelope) -> Option<u64>;
}

/// Sort pending work so the most expensive tiles are dispatched first.
///
/// Ascending sort + stack popping from the back = largest estimate first.
/// Units without an estimate (untiled, or missing from the map) sort as 0
/// and are popped last among what remains.
fn sort_pending_by_estimate(
    pending: &mut [SubVerification],
    estimates: &HashMap<SubVerificationId, u64>,
) {
    for unit in pending.iter_mut() {
        if let Some(n) = estimates.get(&unit.id()) {
            unit.involved_row_estimate = Some(*n);
        }
    }
    pending.sort_by_key(|u| u.involved_row_estimate.unwrap_or(0));
}

// ============================================================================
// Unit outcome
// ============================================================================

/// Terminal classification of one dispatched attempt.
#[derive(Debug)]
enum UnitOutcome {
    Success,
    Cancelled,
    Failure { message: String, permanent: bool },
}

/// Derive the attempt outcome from the transport result, the mailbox status,
/// and the run token.
fn classify_outcome(
    transport_error: Option<&WorkerError>,
    response: &SubResponse,
    cancel: &CancellationToken,
) -> UnitOutcome {
    if let Some(err) = transport_error {
        if cancel.is_cancelled() {
            return UnitOutcome::Cancelled;
        }
        return UnitOutcome::Failure {
            message: err.message().to_string(),
            permanent: !err.is_retryable(),
        };
    }

    match response.status() {
        ServiceCallStatus::Finished => UnitOutcome::Success,
        ServiceCallStatus::Cancelled => UnitOutcome::Cancelled,
        ServiceCallStatus::Failed => UnitOutcome::Failure {
            message: response
                .cancellation_message()
                .unwrap_or_else(|| "worker reported failure".to_string()),
            permanent: false,
        },
        ServiceCallStatus::Retry => UnitOutcome::Failure {
            message: "worker requested retry".to_string(),
            permanent: false,
        },
        ServiceCallStatus::Running | ServiceCallStatus::Undefined => {
            if cancel.is_cancelled() {
                UnitOutcome::Cancelled
            } else {
                UnitOutcome::Failure {
                    message: "stream ended without terminal status".to_string(),
                    permanent: false,
                }
            }
        }
    }
}

// ============================================================================
// Unit background task
// ============================================================================

/// Drive one streamed call to completion, folding messages into the mailbox.
fn drive_call(
    client: &dyn WorkerClient,
    request: &VerificationRequest,
    response: &SubResponse,
    cancel: &CancellationToken,
    address: &str,
) -> Result<(), WorkerError> {
    let stream = client.verify(request, cancel)?;

    for item in stream {
        if cancel.is_cancelled() {
            // Cooperative hang-up; the worker was asked to stop and the
            // final state is Cancelled either way.
            response.set_status(ServiceCallStatus::Cancelled);
            return Ok(());
        }

        match item {
            Ok(WorkerMessage::Response(msg)) => {
                let had_progress = msg.progress.is_some();
                response.apply(msg);

                if had_progress && response.should_log_progress() {
                    let (current, total) = response.progress();
                    tracing::debug!(
                        worker = address,
                        current,
                        total,
                        buffered_issues = response.buffered_issues(),
                        "service progress"
                    );
                }
            }
            Ok(WorkerMessage::DataRequest { detail }) => {
                return Err(WorkerError::permanent(format!(
                    "unsupported data request from worker: {}",
                    detail
                )));
            }
            Err(err) => {
                response.set_cancellation_message(err.message());
                return Err(err);
            }
        }
    }

    Ok(())
}

// ============================================================================
// Runner
// ============================================================================

/// Result of one distributed verification run.
pub struct VerificationRun {
    pub verification: QualityVerification,
    pub stop_rows: RowsWithStopConditions,
    /// Terminally processed units, in completion order (success and
    /// terminal failure both count; retries appear once, as their final
    /// attempt).
    pub completed_units: Vec<SubVerification>,
}

/// Distributed verification runner: partitions the job and drives the
/// dispatch loop to completion on the calling thread.
pub struct DistributedVerificationRunner {
    request: VerificationRequest,
    parallel: ParallelConfiguration,
    dispatch: DispatchConfig,
    clients: Vec<Arc<dyn WorkerClient>>,
    observer: Arc<dyn VerificationObserver>,
    estimator: Option<Arc<dyn RowCountEstimator>>,
}

impl DistributedVerificationRunner {
    pub fn new(request: VerificationRequest, clients: Vec<Arc<dyn WorkerClient>>) -> Self {
        Self {
            request,
            parallel: ParallelConfiguration::default(),
            dispatch: DispatchConfig::default(),
            clients,
            observer: Arc::new(crate::observer::NullObserver),
            estimator: None,
        }
    }

    pub fn with_parallel_configuration(mut self, config: ParallelConfiguration) -> Self {
        self.parallel = config;
        self
    }

    pub fn with_dispatch_config(mut self, config: DispatchConfig) -> Self {
        self.dispatch = config;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn VerificationObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_row_count_estimator(mut self, estimator: Arc<dyn RowCountEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    /// Run the job to completion.
    ///
    /// Blocks the calling thread until every unit is terminally processed or
    /// the run aborts. Cancellation does not produce an `Err`: the returned
    /// record carries the `cancelled` flag.
    pub fn execute(
        self,
        groups: &[QualityConditionGroup],
        cancel: CancellationToken,
    ) -> Result<VerificationRun, VerificationError> {
        self.dispatch.validate();

        let mut record = QualityVerification::new(&self.request.specification);
        record.start(self.dispatch.operator.clone());

        let mut ids = IdSequence::new();
        let partition =
            create_sub_verifications(&self.request, groups, &self.parallel, &mut ids);
        let total = partition.units.len();

        let infos: Vec<_> = partition.units.iter().map(|u| u.info()).collect();
        self.observer.sub_verifications_created(&infos);

        let pool = WorkerPool::new(self.clients.clone(), self.request.max_parallelism);

        let mut coordinator = Coordinator {
            pool,
            observer: self.observer,
            cancel,
            retry_cap: self.dispatch.retry_cap,
            poll_interval: self.dispatch.poll_interval,
            record,
            registry: IssueRegistry::new(),
            stop_rows: RowsWithStopConditions::new(),
            tile_index: partition.tile_index,
            // Reverse so the first unit in dispatch order pops first.
            pending: partition.units.into_iter().rev().collect(),
            active: HashMap::new(),
            completed: Vec::new(),
            total,
            success_count: 0,
            failure_count: 0,
            retry_count: 0,
            last_reported_progress: 0,
        };

        let estimate_rx = if self.parallel.sort_by_number_of_objects {
            self.estimator
                .as_ref()
                .map(|estimator| spawn_estimation(&coordinator.pending, Arc::clone(estimator)))
        } else {
            None
        };

        coordinator.run(estimate_rx)
    }
}

/// Kick off background row-count estimation over the pending tiled units.
fn spawn_estimation(
    pending: &[SubVerification],
    estimator: Arc<dyn RowCountEstimator>,
) -> Receiver<HashMap<SubVerificationId, u64>> {
    let tiles: Vec<(SubVerificationId, Envelope)> = pending
        .iter()
        .filter_map(|u| u.tile_envelope().map(|e| (u.id(), *e)))
        .collect();

    let (tx, rx) = bounded(1);
    thread::spawn(move || {
        let mut estimates = HashMap::new();
        for (id, tile) in tiles {
            match estimator.estimate_rows(&tile) {
                Some(n) => {
                    estimates.insert(id, n);
                }
                // Best effort only: any failure keeps natural order.
                None => return,
            }
        }
        let _ = tx.send(estimates);
    });
    rx
}

// ============================================================================
// Coordinator
// ============================================================================

struct ActiveUnit {
    unit: SubVerification,
    join: thread::JoinHandle<()>,
    slot: WorkerSlotId,
    address: String,
}

struct Coordinator {
    pool: WorkerPool,
    observer: Arc<dyn VerificationObserver>,
    cancel: CancellationToken,
    retry_cap: u32,
    poll_interval: Duration,

    record: QualityVerification,
    registry: IssueRegistry,
    stop_rows: RowsWithStopConditions,
    tile_index: BoxTree<SubVerificationId>,

    pending: Vec<SubVerification>,
    active: HashMap<SubVerificationId, ActiveUnit>,
    completed: Vec<SubVerification>,

    total: usize,
    success_count: usize,
    failure_count: usize,
    retry_count: usize,
    last_reported_progress: usize,
}

impl Coordinator {
    fn run(
        mut self,
        mut estimate_rx: Option<Receiver<HashMap<SubVerificationId, u64>>>,
    ) -> Result<VerificationRun, VerificationError> {
        let (done_tx, done_rx) = unbounded();

        let started = self.fill_slots(&done_tx)?;
        if started == 0 {
            return Err(VerificationError::CouldNotStart);
        }

        while !self.active.is_empty()
            || (!self.pending.is_empty() && !self.cancel.is_cancelled())
        {
            match done_rx.recv_timeout(self.poll_interval) {
                Ok((id, transport_error)) => {
                    self.process_completion(id, transport_error);
                    if !self.cancel.is_cancelled() {
                        self.fill_slots(&done_tx)?;
                    }
                    tracing::info!(
                        failed = self.failure_count,
                        successful = self.success_count,
                        retried = self.retry_count,
                        remaining = self.active.len() + self.pending.len(),
                        "sub-verification round"
                    );
                }
                Err(RecvTimeoutError::Timeout) => {
                    self.idle_tick();
                }
                Err(RecvTimeoutError::Disconnected) => {
                    unreachable!("coordinator holds a completion sender")
                }
            }

            // Best-effort reordering once the background estimation lands.
            // A disconnected channel means estimation failed; natural order
            // stays in effect.
            if let Some(rx) = estimate_rx.take() {
                match rx.try_recv() {
                    Ok(estimates) => {
                        sort_pending_by_estimate(&mut self.pending, &estimates);
                        tracing::info!(
                            estimated = estimates.len(),
                            "re-sorted pending tiles by involved-row estimate"
                        );
                    }
                    Err(TryRecvError::Empty) => estimate_rx = Some(rx),
                    Err(TryRecvError::Disconnected) => {}
                }
            }
        }

        tracing::info!(
            failed = self.failure_count,
            successful = self.success_count,
            "finished distributed verification"
        );

        let cancelled = self.cancel.is_cancelled();
        self.record.finish(cancelled);
        self.observer.verification_finished(&self.record);

        Ok(VerificationRun {
            verification: self.record,
            stop_rows: self.stop_rows,
            completed_units: self.completed,
        })
    }

    /// Start pending units on free workers until the pool saturates.
    fn fill_slots(
        &mut self,
        done_tx: &Sender<(SubVerificationId, Option<WorkerError>)>,
    ) -> Result<usize, VerificationError> {
        let mut started = 0;
        while !self.pending.is_empty() {
            let Some(acquired) = self.pool.acquire()? else {
                break;
            };

            let unit = self.pending.pop().expect("pending checked non-empty");
            let id = unit.id();
            let address = acquired.client.address().to_string();

            let client = Arc::clone(&acquired.client);
            let request = unit.sub_request().clone();
            let response = Arc::clone(unit.response());
            let cancel = self.cancel.clone();
            let tx = done_tx.clone();
            let thread_address = address.clone();

            let join = thread::spawn(move || {
                let result = drive_call(&*client, &request, &response, &cancel, &thread_address);
                // Sending is the thread's last act; the coordinator joins
                // after receiving.
                let _ = tx.send((id, result.err()));
            });

            tracing::info!(unit = %id, worker = %address, remaining = self.pending.len(), "started {}", unit);
            self.observer.started(id, &address);

            self.active.insert(
                id,
                ActiveUnit {
                    unit,
                    join,
                    slot: acquired.slot,
                    address,
                },
            );
            started += 1;
        }
        Ok(started)
    }

    /// Handle one finished attempt: drain, classify, retry or finalize.
    fn process_completion(&mut self, id: SubVerificationId, transport_error: Option<WorkerError>) {
        let mut entry = self
            .active
            .remove(&id)
            .expect("completion for a unit that is not active");
        // The send is the thread's last statement; join returns promptly.
        let _ = entry.join.join();
        self.pool.release(entry.slot);

        drain_issues(
            &mut entry.unit,
            &mut self.registry,
            &mut self.record,
            &mut self.stop_rows,
            &*self.observer,
        );

        // Worker statistics arrive even on failed runs (issues found before
        // the failure are still valid).
        if let Some(stats) = entry.unit.response().stats() {
            self.record.merge_stats(&stats);
        }

        let outcome = classify_outcome(transport_error.as_ref(), entry.unit.response(), &self.cancel);

        match outcome {
            UnitOutcome::Success => {
                tracing::info!(unit = %id, worker = %entry.address, "finished {}", entry.unit);
                self.success_count += 1;
                self.finalize_unit(entry.unit, ServiceCallStatus::Finished);
            }
            UnitOutcome::Cancelled => {
                tracing::info!(unit = %id, "cancelled {}", entry.unit);
                self.finalize_unit(entry.unit, ServiceCallStatus::Cancelled);
            }
            UnitOutcome::Failure { message, permanent } => {
                tracing::warn!(
                    unit = %id,
                    worker = %entry.address,
                    failure_count = entry.unit.failure_count,
                    "failed {}: {}",
                    entry.unit,
                    message
                );

                let exhausted = entry.unit.failure_count >= self.retry_cap;
                if exhausted || permanent {
                    tracing::warn!(unit = %id, "giving up after {} failure(s)", entry.unit.failure_count + 1);
                    self.failure_count += 1;

                    // This shard's conditions stay unverified; the run as a
                    // whole is no longer trustworthy.
                    self.record.cancelled = true;
                    self.record.cancellation_message = Some(message);

                    self.finalize_unit(entry.unit, ServiceCallStatus::Failed);
                } else {
                    tracing::warn!(unit = %id, "re-queuing for retry");
                    self.retry_count += 1;
                    self.observer.finished(id, ServiceCallStatus::Retry);
                    self.pending.push(entry.unit.retry_clone());
                    // The failed attempt is dropped; its issues stay in the
                    // dedup registry so the retry cannot duplicate them.
                }
            }
        }
    }

    /// Mark a unit terminally processed and evict fully processed issues.
    fn finalize_unit(&mut self, mut unit: SubVerification, status: ServiceCallStatus) {
        unit.mark_completed();
        let evicted = self.registry.on_unit_completed(&unit, &self.tile_index);
        if evicted > 0 {
            tracing::debug!(unit = %unit.id(), evicted, live = self.registry.live_count(), "evicted fully processed issues");
        }
        self.observer.finished(unit.id(), status);
        self.completed.push(unit);
    }

    /// Nothing finished this tick: drain partial results and re-report
    /// overall progress when it moved.
    fn idle_tick(&mut self) {
        for entry in self.active.values_mut() {
            drain_issues(
                &mut entry.unit,
                &mut self.registry,
                &mut self.record,
                &mut self.stop_rows,
                &*self.observer,
            );
        }

        let completed_count = self.completed.len();
        if completed_count != self.last_reported_progress {
            self.last_reported_progress = completed_count;
            tracing::info!(
                current = completed_count,
                total = self.total,
                "overall progress"
            );
            self.observer.progress_changed(completed_count, self.total);
        }
    }
}

/// Drain a unit's mailbox into the dedup registry and the overall record.
///
/// Returns true when at least one message was drained.
fn drain_issues(
    unit: &mut SubVerification,
    registry: &mut IssueRegistry,
    record: &mut QualityVerification,
    stop_rows: &mut RowsWithStopConditions,
    observer: &dyn VerificationObserver,
) -> bool {
    let mut drained = false;

    while let Some(msg) = unit.response().try_take_issue() {
        drained = true;

        let Some(condition) = unit.condition(msg.condition_id).cloned() else {
            // A worker reporting a condition outside its shard is a worker
            // bug; dropping the message is safer than corrupting dedup state.
            tracing::warn!(
                unit = %unit.id(),
                condition = ?msg.condition_id,
                "issue for a condition not in this sub-verification"
            );
            continue;
        };

        match registry.insert(msg, &condition.name) {
            InsertOutcome::Duplicate => {}
            InsertOutcome::New(issue) => {
                if observer.issue_detected(&issue) {
                    unit.issue_count += 1;
                    record.record_issue(issue.condition_id);

                    if condition.stop_on_error {
                        for row in &issue.involved_rows {
                            stop_rows.add(
                                &row.table,
                                row.object_id,
                                StopInfo {
                                    condition_id: condition.id,
                                    description: issue.description.clone(),
                                    // A hard stop condition is already
                                    // reported through the issue itself.
                                    reported: !condition.allow_errors,
                                },
                            );
                        }
                    }
                } else {
                    unit.filtered_issue_count += 1;
                }
            }
        }
    }

    drained
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::VerificationResponse;

    fn response_with_status(status: ServiceCallStatus) -> SubResponse {
        let response = SubResponse::new();
        response.apply(VerificationResponse {
            status: Some(status),
            ..Default::default()
        });
        response
    }

    #[test]
    fn finished_stream_is_success() {
        let cancel = CancellationToken::new();
        let response = response_with_status(ServiceCallStatus::Finished);

        assert!(matches!(
            classify_outcome(None, &response, &cancel),
            UnitOutcome::Success
        ));
    }

    #[test]
    fn transport_error_is_failure() {
        let cancel = CancellationToken::new();
        let response = response_with_status(ServiceCallStatus::Running);
        let err = WorkerError::retryable("connection reset");

        let outcome = classify_outcome(Some(&err), &response, &cancel);
        assert!(matches!(
            outcome,
            UnitOutcome::Failure { permanent: false, .. }
        ));
    }

    #[test]
    fn data_request_failure_is_permanent() {
        let cancel = CancellationToken::new();
        let response = response_with_status(ServiceCallStatus::Running);
        let err = WorkerError::permanent("unsupported data request");

        let outcome = classify_outcome(Some(&err), &response, &cancel);
        assert!(matches!(
            outcome,
            UnitOutcome::Failure { permanent: true, .. }
        ));
    }

    #[test]
    fn cancellation_wins_over_failure() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let response = response_with_status(ServiceCallStatus::Running);
        let err = WorkerError::retryable("stream broken");

        assert!(matches!(
            classify_outcome(Some(&err), &response, &cancel),
            UnitOutcome::Cancelled
        ));
    }

    #[test]
    fn worker_failed_status_carries_message() {
        let cancel = CancellationToken::new();
        let response = response_with_status(ServiceCallStatus::Failed);
        response.set_cancellation_message("out of memory");

        let UnitOutcome::Failure { message, permanent } =
            classify_outcome(None, &response, &cancel)
        else {
            panic!("expected failure");
        };
        assert_eq!(message, "out of memory");
        assert!(!permanent);
    }

    #[test]
    fn missing_terminal_status_is_retryable_failure() {
        let cancel = CancellationToken::new();
        let response = response_with_status(ServiceCallStatus::Running);

        assert!(matches!(
            classify_outcome(None, &response, &cancel),
            UnitOutcome::Failure { permanent: false, .. }
        ));
    }

    #[test]
    fn retry_status_requests_rerun() {
        let cancel = CancellationToken::new();
        let response = response_with_status(ServiceCallStatus::Retry);

        let UnitOutcome::Failure { message, .. } = classify_outcome(None, &response, &cancel)
        else {
            panic!("expected failure");
        };
        assert!(message.contains("retry"));
    }

    #[test]
    fn dispatch_config_default_is_valid() {
        DispatchConfig::default().validate();
    }

    #[test]
    fn pending_sorted_so_expensive_tiles_pop_first() {
        use crate::spec::{
            ConditionTest, DatasetId, ExecType, QualityCondition, QualityConditionGroup,
            QualitySpecification,
        };

        let condition = QualityCondition::new(1, "qc1");
        let mut group = QualityConditionGroup::new(ExecType::TileParallel);
        group.push(
            condition.clone(),
            vec![ConditionTest {
                name: "t".into(),
                dataset: DatasetId(0),
            }],
        );

        let mut request = VerificationRequest::new(
            Arc::new(QualitySpecification::new("spec", vec![condition])),
            50.0,
        );
        request.max_parallelism = 2;
        request.perimeter = Some(crate::geom::Envelope::new(0.0, 0.0, 200.0, 50.0));

        let partition = create_sub_verifications(
            &request,
            &[group],
            &ParallelConfiguration::default(),
            &mut IdSequence::new(),
        );
        // Four tiles along x.
        let mut pending = partition.units;
        assert_eq!(pending.len(), 4);

        // Tile estimates grow with x: the right-most tile is the biggest.
        let estimates: HashMap<SubVerificationId, u64> = pending
            .iter()
            .map(|u| (u.id(), u.tile_envelope().unwrap().x_min as u64))
            .collect();

        sort_pending_by_estimate(&mut pending, &estimates);

        // Stack pops from the back: the largest estimate must be last.
        let popped_first = pending.last().unwrap();
        assert_eq!(popped_first.involved_row_estimate, Some(150));
        assert_eq!(pending.first().unwrap().involved_row_estimate, Some(0));
    }
}
