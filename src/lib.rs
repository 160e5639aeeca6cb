//! Distributed scheduler for rule-based data-quality verification.
//!
//! ## Scope
//! This crate splits one large verification job into independently
//! executable sub-verifications, dispatches them across a bounded pool of
//! remote worker processes over long-lived streamed calls, and reassembles
//! one consistent result despite partial failures, retries, and spatial
//! overlap between units.
//!
//! ## Key invariants
//! - Every sub-verification id is unique; ids come from an explicit sequence,
//!   not a global counter.
//! - In-flight units never exceed `min(pool size, requested parallelism)`.
//! - Each physical rule violation is forwarded exactly once, even when
//!   spatially adjacent units detect it independently.
//! - A unit's `completed` flag is set exactly once; only completed tiles
//!   participate in boundary-overlap resolution.
//! - Retries are bounded; exceeding the cap finalizes the shard's failure
//!   and cancels the run while keeping completed shards' results.
//!
//! ## Job flow
//! 1) Partition condition groups into units per exec type (round-robin
//!    buckets, tile grid, priority order).
//! 2) The coordinator fills free worker slots and waits (bounded) for
//!    completions.
//! 3) Each dispatched unit's streamed call runs on its own thread, feeding
//!    the unit's mailbox.
//! 4) The coordinator drains mailboxes, deduplicates issues spatially, and
//!    merges per-unit statistics.
//! 5) Completion eviction bounds dedup memory: an issue is dropped once
//!    every tile intersecting its extent has completed.
//!
//! ## Notable entry points
//! - [`DistributedVerificationRunner`]: configure and run a job.
//! - [`WorkerClient`]: the transport seam implemented by callers.
//! - [`VerificationObserver`]: progress, issue, and lifecycle events.
//! - [`create_sub_verifications`]: the partitioner, usable standalone.
//!
//! ## Design trade-offs
//! Worker calls are blocking streams on dedicated threads rather than async
//! tasks: the pool is small (double digits), and a thread per in-flight call
//! keeps the coordinator free of executor coupling. Mailboxes are unbounded;
//! memory is bounded by drain frequency and call cancellation, not by
//! back-pressuring a remote worker mid-check.

pub mod aggregate;
pub mod cancel;
pub mod dedup;
pub mod dispatch;
pub mod error;
pub mod geom;
pub mod observer;
pub mod partition;
pub mod response;
pub mod spec;
pub mod worker;

pub use aggregate::{QualityVerification, RowsWithStopConditions, VerificationStatistics};
pub use cancel::CancellationToken;
pub use dedup::Issue;
pub use dispatch::{
    DispatchConfig, DistributedVerificationRunner, RowCountEstimator, VerificationRun,
};
pub use error::{ErrorClass, PoolError, VerificationError, WorkerError};
pub use geom::{BoxTree, Envelope};
pub use observer::{NullObserver, RecordingObserver, VerificationObserver};
pub use partition::{create_sub_verifications, IdSequence, SubVerification, SubVerificationId};
pub use response::{
    IssueMsg, ProgressKind, ProgressMsg, ServiceCallStatus, SubResponse, VerificationResponse,
    VerificationStatsMsg, WorkerMessage,
};
pub use spec::{
    ConditionId, ConditionTest, DatasetId, ExecType, ParallelConfiguration, QualityCondition,
    QualityConditionGroup, QualitySpecification, VerificationRequest,
};
pub use worker::{ResponseStream, WorkerClient, WorkerPool};
