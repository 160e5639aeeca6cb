//! Streamed worker messages and the per-unit response mailbox.
//!
//! # Design
//!
//! A worker call is one long-lived, server-streamed exchange: a sequence of
//! [`WorkerMessage`]s carrying issue batches and progress, then exactly one
//! terminal status. The background task driving the call appends everything
//! into the unit's [`SubResponse`]; the coordinator drains it from the other
//! side while the stream is still live.
//!
//! ```text
//! worker stream ──► background task ──► SubResponse ──► coordinator
//!                   (single producer)    (mailbox)      (single consumer)
//! ```
//!
//! # Buffering
//!
//! The issue queue is unbounded by design. Back-pressure on a remote worker
//! mid-check would stall its container run; instead the coordinator drains
//! every poll tick and the call itself is bounded by cancellation. Accepted
//! trade-off: a pathological worker can buffer many issues before the next
//! drain.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use serde::{Deserialize, Serialize};

use crate::geom::Envelope;
use crate::spec::{ConditionId, DatasetId};

// ============================================================================
// Wire model
// ============================================================================

/// Status of one streamed verification call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceCallStatus {
    /// No status received yet.
    Undefined,
    Running,
    Finished,
    Failed,
    Cancelled,
    /// Worker asks the coordinator to re-run this shard.
    Retry,
}

impl ServiceCallStatus {
    /// Whether this status ends the stream.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ServiceCallStatus::Finished
                | ServiceCallStatus::Failed
                | ServiceCallStatus::Cancelled
                | ServiceCallStatus::Retry
        )
    }
}

/// One row involved in an issue, identified by table name and object id.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InvolvedRow {
    pub table: String,
    pub object_id: i64,
}

impl InvolvedRow {
    pub fn new(table: impl Into<String>, object_id: i64) -> Self {
        Self {
            table: table.into(),
            object_id,
        }
    }
}

/// One detected rule violation, as reported by a worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IssueMsg {
    pub condition_id: ConditionId,
    pub description: String,
    /// Rows participating in the violation, in worker-reported order.
    pub involved_rows: Vec<InvolvedRow>,
    /// Bounding extent of the issue geometry, if the violation has one.
    pub envelope: Option<Envelope>,
}

/// Coarse phase reported with progress updates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressKind {
    PreProcess,
    ProcessNonContainer,
    ProcessContainer,
    /// Coordinator-level progress across sub-verifications.
    ProcessParallel,
}

/// Progress update within one streamed call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressMsg {
    pub kind: ProgressKind,
    pub current: u32,
    pub total: u32,
    /// Failure detail when the call is no longer running.
    pub message: Option<String>,
    /// Tile the worker is currently processing.
    pub current_box: Option<Envelope>,
}

/// Per-condition statistics from one worker run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConditionStatsMsg {
    pub condition_id: ConditionId,
    pub fulfilled: bool,
    pub execute_time: Duration,
    pub row_execute_time: Duration,
    pub tile_execute_time: Duration,
    /// Condition that stopped further evaluation, if any.
    pub stop_condition_id: Option<ConditionId>,
}

/// Per-dataset statistics from one worker run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DatasetStatsMsg {
    pub dataset: DatasetId,
    pub load_time: Duration,
}

/// Final statistics of one sub-verification, sent once before the terminal
/// status.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VerificationStatsMsg {
    pub cancelled: bool,
    pub conditions: Vec<ConditionStatsMsg>,
    pub datasets: Vec<DatasetStatsMsg>,
    pub processor_time: Duration,
    pub rows_with_stop_conditions: u64,
    pub context_name: Option<String>,
    pub context_type: Option<String>,
    pub operator: Option<String>,
}

/// One streamed response message.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VerificationResponse {
    pub status: Option<ServiceCallStatus>,
    pub issues: Vec<IssueMsg>,
    pub progress: Option<ProgressMsg>,
    pub stats: Option<VerificationStatsMsg>,
}

/// Envelope around one streamed message.
///
/// Workers may interleave a data request (asking the coordinator for schema
/// or rows) into the response stream. That sub-protocol is not supported
/// here; receiving one fails the unit permanently.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum WorkerMessage {
    Response(VerificationResponse),
    DataRequest { detail: String },
}

// ============================================================================
// SubResponse mailbox
// ============================================================================

/// Minimum interval between streamed-progress log lines per unit.
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Thread-safe mailbox between one unit's background task and the
/// coordinator.
///
/// Single producer (the task driving the streamed call), single consumer
/// (the coordinator). The consumer may drain while the producer is still
/// appending; no coordination beyond the internal channel is required.
///
/// Scalar state (status, progress counters) lives in atomics; payload state
/// (messages, stats) behind short-lived mutexes that only ever serialize the
/// two parties.
#[derive(Debug)]
pub struct SubResponse {
    issues_tx: Sender<IssueMsg>,
    issues_rx: Receiver<IssueMsg>,

    /// Encoded [`ServiceCallStatus`].
    status: AtomicU8,
    progress_current: AtomicU32,
    progress_total: AtomicU32,

    cancellation_message: Mutex<Option<String>>,
    stats: Mutex<Option<VerificationStatsMsg>>,
    current_box: Mutex<Option<Envelope>>,
    last_progress_log: Mutex<Option<Instant>>,
}

impl Default for SubResponse {
    fn default() -> Self {
        Self::new()
    }
}

impl SubResponse {
    pub fn new() -> Self {
        let (issues_tx, issues_rx) = crossbeam_channel::unbounded();
        Self {
            issues_tx,
            issues_rx,
            status: AtomicU8::new(encode_status(ServiceCallStatus::Undefined)),
            progress_current: AtomicU32::new(0),
            progress_total: AtomicU32::new(0),
            cancellation_message: Mutex::new(None),
            stats: Mutex::new(None),
            current_box: Mutex::new(None),
            last_progress_log: Mutex::new(None),
        }
    }

    // ------------------------------------------------------------------
    // Producer side (unit background task)
    // ------------------------------------------------------------------

    /// Fold one streamed response into the mailbox.
    pub fn apply(&self, response: VerificationResponse) {
        for issue in response.issues {
            // Receiver lives as long as self; send cannot fail.
            let _ = self.issues_tx.send(issue);
        }

        if let Some(status) = response.status {
            self.set_status(status);
        }

        if let Some(progress) = &response.progress {
            self.update_progress(progress);
        }

        if let Some(stats) = response.stats {
            *self.stats.lock().unwrap_or_else(|p| p.into_inner()) = Some(stats);
        }
    }

    /// Overwrite the call status.
    pub fn set_status(&self, status: ServiceCallStatus) {
        self.status.store(encode_status(status), Ordering::Release);
    }

    /// Record a failure message (kept for the final result even if later
    /// progress messages carry none).
    pub fn set_cancellation_message(&self, message: impl Into<String>) {
        *self
            .cancellation_message
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(message.into());
    }

    fn update_progress(&self, progress: &ProgressMsg) {
        // A progress message on a no-longer-running call carries the failure
        // detail; keep it as the cancellation message.
        let status = self.status();
        if status != ServiceCallStatus::Running && status != ServiceCallStatus::Finished {
            if let Some(message) = &progress.message {
                self.set_cancellation_message(message.clone());
            }
        }

        self.progress_current
            .store(progress.current, Ordering::Relaxed);
        self.progress_total.store(progress.total, Ordering::Relaxed);

        if let Some(current_box) = progress.current_box {
            *self.current_box.lock().unwrap_or_else(|p| p.into_inner()) = Some(current_box);
        }
    }

    // ------------------------------------------------------------------
    // Consumer side (coordinator)
    // ------------------------------------------------------------------

    /// Take the next buffered issue, if any. Never blocks.
    pub fn try_take_issue(&self) -> Option<IssueMsg> {
        match self.issues_rx.try_recv() {
            Ok(issue) => Some(issue),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Number of buffered, not yet drained issues.
    #[inline]
    pub fn buffered_issues(&self) -> usize {
        self.issues_rx.len()
    }

    #[inline]
    pub fn status(&self) -> ServiceCallStatus {
        decode_status(self.status.load(Ordering::Acquire))
    }

    /// Last reported `(current, total)` progress of the call.
    pub fn progress(&self) -> (u32, u32) {
        (
            self.progress_current.load(Ordering::Relaxed),
            self.progress_total.load(Ordering::Relaxed),
        )
    }

    pub fn cancellation_message(&self) -> Option<String> {
        self.cancellation_message
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn stats(&self) -> Option<VerificationStatsMsg> {
        self.stats
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn current_box(&self) -> Option<Envelope> {
        *self.current_box.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Throttle for streamed-progress logging: true at most once per
    /// [`PROGRESS_LOG_INTERVAL`] per unit.
    pub fn should_log_progress(&self) -> bool {
        let mut last = self
            .last_progress_log
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        let now = Instant::now();
        match *last {
            Some(at) if now.duration_since(at) < PROGRESS_LOG_INTERVAL => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

fn encode_status(status: ServiceCallStatus) -> u8 {
    match status {
        ServiceCallStatus::Undefined => 0,
        ServiceCallStatus::Running => 1,
        ServiceCallStatus::Finished => 2,
        ServiceCallStatus::Failed => 3,
        ServiceCallStatus::Cancelled => 4,
        ServiceCallStatus::Retry => 5,
    }
}

fn decode_status(raw: u8) -> ServiceCallStatus {
    match raw {
        0 => ServiceCallStatus::Undefined,
        1 => ServiceCallStatus::Running,
        2 => ServiceCallStatus::Finished,
        3 => ServiceCallStatus::Failed,
        4 => ServiceCallStatus::Cancelled,
        5 => ServiceCallStatus::Retry,
        _ => unreachable!("invalid status encoding: {}", raw),
    }
}

// ============================================================================
// Tests
// ============================================================================
