//! Remote worker clients and the bounded worker pool.
//!
//! # Design
//!
//! [`WorkerClient`] is the transport seam: implementations own the actual
//! network calls, the scheduler owns threading, retry, and bookkeeping. The
//! call model is deliberately blocking - each streamed call is driven by a
//! dedicated thread, so the client can be a plain blocking RPC stub.
//!
//! The [`WorkerPool`] tracks which clients are busy and which have failed
//! their health probe. Two saturation conditions are kept strictly apart:
//!
//! - all healthy workers busy → `Ok(None)`: try again next tick;
//! - all configured workers unhealthy → [`PoolError::AllWorkersUnhealthy`]:
//!   a configuration problem, fatal for the run.
//!
//! A single configured endpoint may be a load balancer; the pool then grows
//! lazily by requesting dedicated channels from it, up to the desired
//! parallelism.
//!
//! # Concurrency
//!
//! The membership list stays in the low double digits, and only the
//! coordinator mutates it - plain `&mut self`, no internal locking.

use std::sync::Arc;

use crate::cancel::CancellationToken;
use crate::error::{PoolError, WorkerError};
use crate::response::WorkerMessage;
use crate::spec::VerificationRequest;

// ============================================================================
// Client trait
// ============================================================================

/// Blocking message stream of one verification call.
///
/// `None` ends the stream; a terminal status should have arrived in a
/// preceding message. An `Err` item ends the stream with a transport
/// failure, classified by the client.
pub type ResponseStream = Box<dyn Iterator<Item = Result<WorkerMessage, WorkerError>> + Send>;

/// Contract for one remote verification endpoint.
///
/// Implementations classify their own transport errors (the network layer
/// knows whether a fault is a timeout or an auth failure); the scheduler
/// only ever sees [`WorkerError`].
pub trait WorkerClient: Send + Sync + 'static {
    /// Stable address for logs and observer callbacks.
    fn address(&self) -> &str;

    /// Health probe. Called before handing the client out; expected to be
    /// cheap (channel state, not a full round-trip).
    fn can_accept_calls(&self) -> bool;

    /// Whether this endpoint is a load balancer that hands out dedicated
    /// worker channels instead of serving calls itself.
    fn is_load_balancer(&self) -> bool {
        false
    }

    /// Request one dedicated worker channel from a load balancer.
    ///
    /// `None` when no further channel is available right now. Non-balancer
    /// clients keep the default.
    fn worker_channel(&self) -> Option<Arc<dyn WorkerClient>> {
        None
    }

    /// Open the long-lived streamed verification call.
    ///
    /// The stream is drained on a dedicated thread; `cancel` is the shared
    /// run token the implementation should observe between messages.
    fn verify(
        &self,
        request: &VerificationRequest,
        cancel: &CancellationToken,
    ) -> Result<ResponseStream, WorkerError>;
}

// ============================================================================
// Pool
// ============================================================================

/// Index of one pool slot, used to release it after the call ends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerSlotId(usize);

/// A client checked out of the pool.
pub struct AcquiredWorker {
    pub slot: WorkerSlotId,
    pub client: Arc<dyn WorkerClient>,
}

struct PoolSlot {
    client: Arc<dyn WorkerClient>,
    busy: bool,
    failed: bool,
}

/// Size-bounded set of worker clients, owned by the coordinator.
pub struct WorkerPool {
    slots: Vec<PoolSlot>,
    /// Single configured endpoint that hands out channels, if any.
    balancer: Option<Arc<dyn WorkerClient>>,
    desired_parallelism: usize,
}

impl WorkerPool {
    /// Build a pool over the configured clients.
    ///
    /// When the only configured endpoint is a load balancer, the pool starts
    /// empty and grows on demand via [`WorkerClient::worker_channel`].
    ///
    /// # Panics
    ///
    /// Panics on an empty client list or zero parallelism (programming
    /// errors in the calling layer).
    pub fn new(clients: Vec<Arc<dyn WorkerClient>>, desired_parallelism: usize) -> Self {
        assert!(!clients.is_empty(), "worker pool requires at least one client");
        assert!(desired_parallelism > 0, "desired_parallelism must be > 0");

        let balancer = match clients.as_slice() {
            [only] if only.is_load_balancer() => Some(Arc::clone(only)),
            _ => None,
        };

        let slots = if balancer.is_some() {
            Vec::new()
        } else {
            clients
                .into_iter()
                .map(|client| PoolSlot {
                    client,
                    busy: false,
                    failed: false,
                })
                .collect()
        };

        Self {
            slots,
            balancer,
            desired_parallelism,
        }
    }

    #[inline]
    pub fn desired_parallelism(&self) -> usize {
        self.desired_parallelism
    }

    /// Number of clients currently checked out.
    pub fn busy_count(&self) -> usize {
        self.slots.iter().filter(|s| s.busy).count()
    }

    /// Number of slots not marked failed.
    pub fn healthy_count(&self) -> usize {
        self.slots.iter().filter(|s| !s.failed).count()
    }

    /// Check out a free, healthy client.
    ///
    /// Returns `Ok(None)` when the pool is saturated (every healthy client
    /// busy, or the parallelism bound reached). Returns an error only when
    /// no configured worker is reachable at all.
    pub fn acquire(&mut self) -> Result<Option<AcquiredWorker>, PoolError> {
        if self.busy_count() >= self.desired_parallelism {
            return Ok(None);
        }

        self.expand_from_balancer();

        for (idx, slot) in self.slots.iter_mut().enumerate() {
            if slot.busy || slot.failed {
                continue;
            }
            if !slot.client.can_accept_calls() {
                tracing::warn!(address = slot.client.address(), "pruning unhealthy worker");
                slot.failed = true;
                continue;
            }
            slot.busy = true;
            return Ok(Some(AcquiredWorker {
                slot: WorkerSlotId(idx),
                client: Arc::clone(&slot.client),
            }));
        }

        if self.healthy_count() == 0 && self.busy_count() == 0 {
            // Nothing running and nothing reachable: this run cannot make
            // progress.
            return Err(PoolError::AllWorkersUnhealthy {
                configured: self.configured_count(),
            });
        }

        Ok(None)
    }

    /// Return a checked-out client to the pool.
    ///
    /// # Panics
    ///
    /// Panics when the slot is not currently checked out (double release is
    /// a coordinator bug).
    pub fn release(&mut self, slot: WorkerSlotId) {
        let entry = &mut self.slots[slot.0];
        assert!(entry.busy, "releasing a worker slot that is not busy");
        entry.busy = false;
    }

    /// Lazily grow the pool from a configured load balancer.
    fn expand_from_balancer(&mut self) {
        let Some(balancer) = &self.balancer else {
            return;
        };

        while self.slots.iter().filter(|s| !s.failed).count() < self.desired_parallelism {
            match balancer.worker_channel() {
                Some(client) => {
                    tracing::info!(address = client.address(), "added worker from load balancer");
                    self.slots.push(PoolSlot {
                        client,
                        busy: false,
                        failed: false,
                    });
                }
                None => break,
            }
        }
    }

    fn configured_count(&self) -> usize {
        if self.balancer.is_some() {
            // The balancer is the one configured endpoint.
            1
        } else {
            self.slots.len()
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
