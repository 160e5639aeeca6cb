//! Sub-verification model and job partitioning.
//!
//! # Design
//!
//! Partitioning turns condition groups plus a target extent into an ordered
//! list of dispatchable [`SubVerification`]s:
//!
//! ```text
//! NonContainer group ──► round-robin conditions ──► untiled units
//! TileParallel group ──► tile grid over perimeter ─► one tiled unit per tile
//! remaining groups   ──► round-robin into Mixed ──► untiled units
//!                                 │
//!                                 ▼
//!               concatenate per type priority, assign ids
//! ```
//!
//! Each exec type has one pure partition function; [`create_sub_verifications`]
//! composes them and assigns ids in final list order from an explicit
//! [`IdSequence`] (no hidden global counter).
//!
//! # Preconditions
//!
//! Violations are programming errors in the calling layer and panic:
//! - at most one NonContainer and one TileParallel group,
//! - condition ids unique across all groups (issue eviction for untiled
//!   shards keys on the condition id alone),
//! - `max_parallelism >= 2` (a single-process run has no business here),
//! - a TileParallel group requires a perimeter to split.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::geom::{BoxTree, Envelope};
use crate::response::SubResponse;
use crate::spec::{
    ConditionId, ExecType, ParallelConfiguration, QualityCondition, QualityConditionGroup,
    VerificationRequest,
};

// ============================================================================
// Identity
// ============================================================================

/// Job-scoped identifier of one sub-verification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubVerificationId(pub u32);

impl fmt::Display for SubVerificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Explicit id source passed into the partitioner.
///
/// Ids are monotonically increasing in the order units appear in the final
/// dispatch list.
#[derive(Debug, Default)]
pub struct IdSequence {
    next: u32,
}

impl IdSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> SubVerificationId {
        let id = SubVerificationId(self.next);
        self.next = self.next.checked_add(1).expect("sub-verification id overflow");
        id
    }
}

// ============================================================================
// SubVerification
// ============================================================================

/// One distributable unit of verification work.
///
/// Created once by the partitioner. The dispatch loop owns all mutation;
/// the aggregator reads final state. A retry is a fresh instance carrying
/// the same id (see [`SubVerification::retry_clone`]).
#[derive(Debug)]
pub struct SubVerification {
    id: SubVerificationId,
    group: QualityConditionGroup,
    sub_request: VerificationRequest,
    response: Arc<SubResponse>,
    /// Present only for spatially split units.
    tile_envelope: Option<Envelope>,
    completed: bool,
    /// Failed dispatch attempts so far (carried across retries).
    pub failure_count: u32,
    /// Issues from this unit forwarded downstream.
    pub issue_count: u64,
    /// Issues from this unit suppressed by the caller's filter.
    pub filtered_issue_count: u64,
    /// Approximate involved-row count, used only to reorder pending work.
    pub involved_row_estimate: Option<u64>,
}

impl SubVerification {
    fn new(
        id: SubVerificationId,
        sub_request: VerificationRequest,
        group: QualityConditionGroup,
        tile_envelope: Option<Envelope>,
    ) -> Self {
        Self {
            id,
            group,
            sub_request,
            response: Arc::new(SubResponse::new()),
            tile_envelope,
            completed: false,
            failure_count: 0,
            issue_count: 0,
            filtered_issue_count: 0,
            involved_row_estimate: None,
        }
    }

    /// Fresh unit for re-dispatch after a transient failure.
    ///
    /// Same id and tile, incremented failure count, empty mailbox - issues
    /// buffered by the failed attempt must not leak into the retry.
    pub fn retry_clone(&self) -> SubVerification {
        SubVerification {
            id: self.id,
            group: self.group.clone(),
            sub_request: self.sub_request.clone(),
            response: Arc::new(SubResponse::new()),
            tile_envelope: self.tile_envelope,
            completed: false,
            failure_count: self.failure_count + 1,
            issue_count: 0,
            filtered_issue_count: 0,
            involved_row_estimate: self.involved_row_estimate,
        }
    }

    #[inline]
    pub fn id(&self) -> SubVerificationId {
        self.id
    }

    #[inline]
    pub fn exec_type(&self) -> ExecType {
        self.group.exec_type()
    }

    #[inline]
    pub fn group(&self) -> &QualityConditionGroup {
        &self.group
    }

    #[inline]
    pub fn sub_request(&self) -> &VerificationRequest {
        &self.sub_request
    }

    /// Shared mailbox; the producer half is handed to the unit's background
    /// task on dispatch.
    #[inline]
    pub fn response(&self) -> &Arc<SubResponse> {
        &self.response
    }

    #[inline]
    pub fn tile_envelope(&self) -> Option<&Envelope> {
        self.tile_envelope.as_ref()
    }

    #[inline]
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Transition to completed.
    ///
    /// # Panics
    ///
    /// Panics when called twice: completion is entered exactly once, and
    /// boundary-overlap resolution relies on the flag never reverting.
    pub fn mark_completed(&mut self) {
        assert!(!self.completed, "sub-verification {} completed twice", self.id);
        self.completed = true;
    }

    #[inline]
    pub fn contains_condition(&self, id: ConditionId) -> bool {
        self.group.contains_condition(id)
    }

    pub fn condition(&self, id: ConditionId) -> Option<&QualityCondition> {
        self.group.condition(id)
    }

    /// Summary for observers and logs.
    pub fn info(&self) -> SubVerificationInfo {
        SubVerificationInfo {
            id: self.id,
            exec_type: self.exec_type(),
            tile_envelope: self.tile_envelope,
            condition_count: self.group.condition_count(),
        }
    }
}

impl fmt::Display for SubVerification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} sub-verification {} with {} condition(s)",
            self.exec_type(),
            self.id,
            self.group.condition_count()
        )?;
        if let Some(tile) = &self.tile_envelope {
            write!(f, " in tile {}", tile)?;
        }
        Ok(())
    }
}

/// Immutable summary of one unit, reported when the work plan is created.
#[derive(Clone, Debug)]
pub struct SubVerificationInfo {
    pub id: SubVerificationId,
    pub exec_type: ExecType,
    pub tile_envelope: Option<Envelope>,
    pub condition_count: usize,
}

// ============================================================================
// Partition result
// ============================================================================

/// Output of [`create_sub_verifications`].
pub struct Partition {
    /// Units in dispatch order (ids assigned in this order).
    pub units: Vec<SubVerification>,
    /// Spatial index over the tiled units, for completion tracking.
    /// Empty when the job has no TileParallel group.
    pub tile_index: BoxTree<SubVerificationId>,
}

// ============================================================================
// Top-level dispatcher
// ============================================================================

/// Split a job into sub-verifications.
///
/// See the module docs for the per-type strategies and preconditions.
pub fn create_sub_verifications(
    request: &VerificationRequest,
    groups: &[QualityConditionGroup],
    config: &ParallelConfiguration,
    ids: &mut IdSequence,
) -> Partition {
    config.validate();
    assert!(
        request.max_parallelism >= 2,
        "distributed verification requires max_parallelism >= 2, got {}",
        request.max_parallelism
    );
    assert_unique_condition_ids(groups);

    let non_container: Vec<&QualityConditionGroup> = groups
        .iter()
        .filter(|g| g.exec_type() == ExecType::NonContainer)
        .collect();
    assert!(
        non_container.len() <= 1,
        "expected <= 1 NonContainer group, got {}",
        non_container.len()
    );

    let tile_parallel: Vec<&QualityConditionGroup> = groups
        .iter()
        .filter(|g| g.exec_type() == ExecType::TileParallel)
        .collect();
    assert!(
        tile_parallel.len() <= 1,
        "expected <= 1 TileParallel group, got {}",
        tile_parallel.len()
    );

    // Non-container buckets.
    let mut non_container_groups = Vec::new();
    for group in &non_container {
        non_container_groups.extend(partition_non_container(group, config.max_non_container_tasks));
    }
    tracing::info!(
        buckets = non_container_groups.len(),
        conditions = non_container.iter().map(|g| g.condition_count()).sum::<usize>(),
        "partitioned non-container conditions"
    );

    // Tiled units.
    let mut tiles = Vec::new();
    for group in &tile_parallel {
        if group.is_empty() {
            continue;
        }
        tiles = partition_tile_parallel(request, group, config);
        tracing::info!(
            tiles = tiles.len(),
            conditions = group.condition_count(),
            "partitioned tile-parallel conditions"
        );
    }

    // Remaining container work, re-bucketed as Mixed.
    let remaining: Vec<&QualityConditionGroup> = groups
        .iter()
        .filter(|g| {
            g.exec_type() != ExecType::NonContainer && g.exec_type() != ExecType::TileParallel
        })
        .collect();

    let bucket_count = if config.max_full_area_tasks > 0 {
        config.max_full_area_tasks
    } else {
        // Leave headroom for tile-parallel units, which profit most from
        // parallelism, without starving full-area container work.
        let parallel = request.max_parallelism;
        (parallel / 2).max(
            parallel
                .saturating_sub(non_container_groups.len())
                .saturating_sub(tiles.len()),
        )
    };
    let container_groups = partition_container(&remaining, bucket_count);
    tracing::info!(
        buckets = container_groups.len(),
        conditions = remaining.iter().map(|g| g.condition_count()).sum::<usize>(),
        "partitioned container conditions"
    );

    // Assemble in priority order, then assign ids in list order.
    let mut units = Vec::new();
    let build_untiled = |groups: Vec<QualityConditionGroup>, units: &mut Vec<_>| {
        for group in groups {
            let included: Vec<ConditionId> = group.condition_ids().collect();
            let excluded = request.specification.excluded_ids(&included);
            units.push((group, request.sub_request(excluded), None));
        }
    };

    let mut staged: Vec<(ExecType, Vec<(QualityConditionGroup, VerificationRequest, Option<Envelope>)>)> =
        Vec::new();
    {
        let mut non_container_units = Vec::new();
        build_untiled(non_container_groups, &mut non_container_units);
        staged.push((ExecType::NonContainer, non_container_units));

        let mut container_units = Vec::new();
        build_untiled(container_groups, &mut container_units);
        staged.push((ExecType::Container, container_units));

        let mut tile_units = Vec::new();
        for (tile, clipped, group) in tiles {
            let included: Vec<ConditionId> = group.condition_ids().collect();
            let excluded = request.specification.excluded_ids(&included);
            let mut sub_request = request.sub_request(excluded);
            sub_request.perimeter = Some(clipped);
            tile_units.push((group, sub_request, Some(tile)));
        }
        staged.push((ExecType::TileParallel, tile_units));
    }

    for exec_type in priority_order(config) {
        let stage = staged
            .iter_mut()
            .find(|(t, _)| *t == exec_type)
            .map(|(_, units)| std::mem::take(units))
            .unwrap_or_default();
        for (group, sub_request, tile) in stage {
            units.push(SubVerification::new(ids.next_id(), sub_request, group, tile));
        }
    }

    let tile_entries: Vec<(Envelope, SubVerificationId)> = units
        .iter()
        .filter_map(|u| u.tile_envelope().map(|e| (*e, u.id())))
        .collect();
    let tile_index = BoxTree::build(tile_entries);

    Partition { units, tile_index }
}

/// Resolve the dispatch-priority order of exec types.
///
/// Configured entries come first; types they omit follow in default order.
fn priority_order(config: &ParallelConfiguration) -> Vec<ExecType> {
    const DEFAULT: [ExecType; 3] = [
        ExecType::NonContainer,
        ExecType::Container,
        ExecType::TileParallel,
    ];

    let mut order = Vec::with_capacity(3);
    if let Some(priority) = &config.type_priority {
        for t in priority {
            assert!(
                DEFAULT.contains(t),
                "unexpected type priority {:?}; Mixed is produced by partitioning, not dispatched by priority",
                t
            );
            order.push(*t);
        }
    }
    for t in DEFAULT {
        if !order.contains(&t) {
            order.push(t);
        }
    }
    order
}

fn assert_unique_condition_ids(groups: &[QualityConditionGroup]) {
    let mut seen = HashSet::new();
    for group in groups {
        for id in group.condition_ids() {
            assert!(
                seen.insert(id),
                "condition id {:?} appears in more than one group; ids must be job-unique",
                id
            );
        }
    }
}

// ============================================================================
// Per-type partition functions
// ============================================================================

/// Round-robin non-container conditions into buckets.
///
/// `max_tasks == 0` selects the default of one condition per bucket.
fn partition_non_container(
    group: &QualityConditionGroup,
    max_tasks: usize,
) -> Vec<QualityConditionGroup> {
    if group.is_empty() {
        return Vec::new();
    }

    let max_tasks = if max_tasks == 0 {
        group.condition_count()
    } else {
        max_tasks
    };

    let mut buckets: Vec<QualityConditionGroup> = Vec::new();
    for (i, (condition, tests)) in group.entries().enumerate() {
        let slot = i % max_tasks;
        if buckets.len() <= slot {
            buckets.push(QualityConditionGroup::new(group.exec_type()));
        }
        buckets[slot].push(condition.clone(), tests.clone());
    }
    buckets
}

/// Round-robin remaining container work into `bucket_count` Mixed groups.
fn partition_container(
    groups: &[&QualityConditionGroup],
    bucket_count: usize,
) -> Vec<QualityConditionGroup> {
    assert!(bucket_count > 0, "container bucket count must be > 0");

    let mut buckets: Vec<QualityConditionGroup> = Vec::new();
    let mut slot = 0;
    for group in groups {
        for (condition, tests) in group.entries() {
            if buckets.len() <= slot {
                buckets.push(QualityConditionGroup::new(ExecType::Mixed));
            }
            buckets[slot].push(condition.clone(), tests.clone());
            slot = (slot + 1) % bucket_count;
        }
    }
    buckets
}

/// Split a tile-parallel group into per-tile units.
///
/// Returns `(tile, clipped perimeter, group clone)` triples.
fn partition_tile_parallel(
    request: &VerificationRequest,
    group: &QualityConditionGroup,
    config: &ParallelConfiguration,
) -> Vec<(Envelope, Envelope, QualityConditionGroup)> {
    let perimeter = request
        .perimeter
        .expect("tile-parallel verification requires a perimeter");

    let split_size = if config.minimum_split_area_extent > 0.0 {
        config.minimum_split_area_extent
    } else {
        request.tile_size
    };
    assert!(split_size > 0.0, "split size must be > 0");

    let natural: Vec<Envelope> = natural_tiles(&perimeter, split_size).collect();

    let tile_boxes: Vec<Envelope> = if config.max_split_area_tasks == 0
        || config.max_split_area_tasks >= natural.len()
    {
        natural
    } else {
        balanced_grid(&perimeter, config.max_split_area_tasks).collect()
    };

    let mut out = Vec::with_capacity(tile_boxes.len());
    for tile in tile_boxes {
        // Clip the perimeter to the tile; an empty clip means the tile lies
        // outside the verified area entirely.
        let Some(clipped) = perimeter.intersection(&tile) else {
            continue;
        };
        out.push((tile, clipped, group.clone()));
    }
    out
}

/// Natural tiling: a `ceil(w/size) x ceil(h/size)` grid, edge tiles clipped
/// to the extent.
fn natural_tiles(extent: &Envelope, size: f64) -> impl Iterator<Item = Envelope> + '_ {
    let nx = (extent.width() / size).ceil().max(1.0) as usize;
    let ny = (extent.height() / size).ceil().max(1.0) as usize;
    let extent = *extent;

    (0..ny).flat_map(move |iy| {
        (0..nx).map(move |ix| {
            Envelope::new(
                extent.x_min + ix as f64 * size,
                extent.y_min + iy as f64 * size,
                (extent.x_min + (ix + 1) as f64 * size).min(extent.x_max),
                (extent.y_min + (iy + 1) as f64 * size).min(extent.y_max),
            )
        })
    })
}

/// Balanced grid for a capped tile count.
///
/// `nx = ceil(sqrt(h/w * max))`, `ny = max/nx` - the grid never exceeds
/// `max` tiles and roughly equalizes tile aspect with the extent's.
fn balanced_grid(extent: &Envelope, max_tiles: usize) -> impl Iterator<Item = Envelope> + '_ {
    let w = extent.width();
    let h = extent.height();

    let nx = ((h / w * max_tiles as f64).sqrt().ceil() as usize)
        .clamp(1, max_tiles);
    let ny = (max_tiles / nx).max(1);

    let dx = w / nx as f64;
    let dy = h / ny as f64;
    let extent = *extent;

    (0..nx).flat_map(move |ix| {
        (0..ny).map(move |iy| {
            Envelope::new(
                extent.x_min + ix as f64 * dx,
                extent.y_min + iy as f64 * dy,
                extent.x_min + (ix + 1) as f64 * dx,
                extent.y_min + (iy + 1) as f64 * dy,
            )
        })
    })
}

// ============================================================================
// Tests
// ============================================================================
