//! Minimal planar geometry: axis-aligned envelopes and a bounding-box tree.
//!
//! # Scope
//!
//! This module deliberately stops at what tile bookkeeping needs:
//! - [`Envelope`]: closed axis-aligned rectangle with intersection/clipping.
//! - [`BoxTree`]: a bulk-loaded, read-only spatial index over envelopes,
//!   used to answer "which tiles overlap this extent" during issue eviction.
//!
//! There is no geometry kernel here: no projections, no polygons, no
//! topology. Perimeters and issue extents are handled at envelope precision.
//!
//! # Intersection Convention
//!
//! Envelopes are **closed** intervals: two envelopes sharing only an edge or
//! a corner DO intersect. Issues detected exactly on a tile boundary must be
//! attributed to every adjacent tile, otherwise boundary duplicates could be
//! evicted while a neighboring tile is still running.

use std::fmt;

use serde::{Deserialize, Serialize};

// ============================================================================
// Envelope
// ============================================================================

/// Closed axis-aligned rectangle in map units.
///
/// Invariant: `x_min <= x_max` and `y_min <= y_max` (enforced by [`Envelope::new`]).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub x_min: f64,
    pub y_min: f64,
    pub x_max: f64,
    pub y_max: f64,
}

impl Envelope {
    /// Create an envelope from its corner coordinates.
    ///
    /// # Panics
    ///
    /// Panics if the extent is inverted or any coordinate is NaN.
    pub fn new(x_min: f64, y_min: f64, x_max: f64, y_max: f64) -> Self {
        assert!(
            x_min <= x_max && y_min <= y_max,
            "inverted envelope: [{}, {}] x [{}, {}]",
            x_min,
            x_max,
            y_min,
            y_max
        );
        Self {
            x_min,
            y_min,
            x_max,
            y_max,
        }
    }

    /// Width of the envelope (always >= 0).
    #[inline]
    pub fn width(&self) -> f64 {
        self.x_max - self.x_min
    }

    /// Height of the envelope (always >= 0).
    #[inline]
    pub fn height(&self) -> f64 {
        self.y_max - self.y_min
    }

    /// Closed-interval intersection test. Touching edges count.
    #[inline]
    pub fn intersects(&self, other: &Envelope) -> bool {
        self.x_min <= other.x_max
            && other.x_min <= self.x_max
            && self.y_min <= other.y_max
            && other.y_min <= self.y_max
    }

    /// Clip this envelope to `other`.
    ///
    /// Returns `None` when the envelopes do not overlap. A degenerate
    /// (zero-width or zero-height) result is still `Some`: a shared edge is a
    /// valid, non-empty clip under the closed-interval convention.
    pub fn intersection(&self, other: &Envelope) -> Option<Envelope> {
        if !self.intersects(other) {
            return None;
        }
        Some(Envelope {
            x_min: self.x_min.max(other.x_min),
            y_min: self.y_min.max(other.y_min),
            x_max: self.x_max.min(other.x_max),
            y_max: self.y_max.min(other.y_max),
        })
    }

    /// Smallest envelope containing both inputs.
    pub fn union(&self, other: &Envelope) -> Envelope {
        Envelope {
            x_min: self.x_min.min(other.x_min),
            y_min: self.y_min.min(other.y_min),
            x_max: self.x_max.max(other.x_max),
            y_max: self.y_max.max(other.y_max),
        }
    }

    /// Center of the envelope on the given axis (0 = x, 1 = y).
    #[inline]
    fn center(&self, axis: usize) -> f64 {
        if axis == 0 {
            (self.x_min + self.x_max) * 0.5
        } else {
            (self.y_min + self.y_max) * 0.5
        }
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}] x [{}, {}]",
            self.x_min, self.x_max, self.y_min, self.y_max
        )
    }
}

// ============================================================================
// BoxTree
// ============================================================================

/// Default leaf capacity for [`BoxTree`].
const DEFAULT_MAX_PER_NODE: usize = 4;

/// Bulk-loaded bounding-box tree.
///
/// Built once over the full entry set, queried many times, never mutated.
/// The build recursively median-splits entries along the longer axis of the
/// current bounding box until a node holds at most `max_per_node` entries.
///
/// # Complexity
///
/// Build is O(n log^2 n) (sort per level), search is O(log n + k) for k hits.
/// Entry counts here are tile counts (typically tens to a few thousand), so
/// neither bound is close to mattering; the tree exists so eviction checks do
/// not rescan every tile for every live issue.
#[derive(Debug)]
pub struct BoxTree<T> {
    entries: Vec<(Envelope, T)>,
    root: Option<Node>,
}

#[derive(Debug)]
struct Node {
    bounds: Envelope,
    kind: NodeKind,
}

#[derive(Debug)]
enum NodeKind {
    /// Indices into `BoxTree::entries`.
    Leaf(Vec<usize>),
    Inner(Vec<Node>),
}

impl<T> BoxTree<T> {
    /// Build a tree over the given entries with the default leaf capacity.
    pub fn build(entries: Vec<(Envelope, T)>) -> Self {
        Self::with_capacity_per_node(entries, DEFAULT_MAX_PER_NODE)
    }

    /// Build a tree with an explicit leaf capacity.
    ///
    /// # Panics
    ///
    /// Panics if `max_per_node` is 0.
    pub fn with_capacity_per_node(entries: Vec<(Envelope, T)>, max_per_node: usize) -> Self {
        assert!(max_per_node > 0, "max_per_node must be > 0");

        if entries.is_empty() {
            return Self {
                entries,
                root: None,
            };
        }

        let mut indices: Vec<usize> = (0..entries.len()).collect();
        let root = build_node(&entries, &mut indices, max_per_node);
        Self {
            entries,
            root: Some(root),
        }
    }

    /// Number of entries in the tree.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the tree holds no entries.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over all entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &(Envelope, T)> {
        self.entries.iter()
    }

    /// Iterate over entries whose envelope intersects `query`.
    pub fn search<'a>(&'a self, query: &Envelope) -> SearchIter<'a, T> {
        let mut stack = Vec::new();
        if let Some(root) = &self.root {
            if root.bounds.intersects(query) {
                stack.push(root);
            }
        }
        SearchIter {
            tree: self,
            query: *query,
            stack,
            leaf: None,
        }
    }
}

/// Iterator over tree entries intersecting a query envelope.
pub struct SearchIter<'a, T> {
    tree: &'a BoxTree<T>,
    query: Envelope,
    stack: Vec<&'a Node>,
    /// Remaining indices of the leaf currently being drained.
    leaf: Option<(&'a [usize], usize)>,
}

impl<'a, T> Iterator for SearchIter<'a, T> {
    type Item = &'a (Envelope, T);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            // Drain the current leaf first.
            if let Some((indices, pos)) = &mut self.leaf {
                while *pos < indices.len() {
                    let idx = indices[*pos];
                    *pos += 1;
                    let entry = &self.tree.entries[idx];
                    if entry.0.intersects(&self.query) {
                        return Some(entry);
                    }
                }
                self.leaf = None;
            }

            let node = self.stack.pop()?;
            match &node.kind {
                NodeKind::Leaf(indices) => {
                    self.leaf = Some((indices.as_slice(), 0));
                }
                NodeKind::Inner(children) => {
                    for child in children {
                        if child.bounds.intersects(&self.query) {
                            self.stack.push(child);
                        }
                    }
                }
            }
        }
    }
}

/// Recursively build a node over `indices` (entry positions).
fn build_node<T>(entries: &[(Envelope, T)], indices: &mut [usize], max_per_node: usize) -> Node {
    let bounds = indices
        .iter()
        .map(|&i| entries[i].0)
        .reduce(|a, b| a.union(&b))
        .expect("build_node called with empty indices");

    if indices.len() <= max_per_node {
        return Node {
            bounds,
            kind: NodeKind::Leaf(indices.to_vec()),
        };
    }

    // Median split along the longer axis of the current bounds.
    let axis = if bounds.width() >= bounds.height() { 0 } else { 1 };
    indices.sort_by(|&a, &b| {
        entries[a]
            .0
            .center(axis)
            .total_cmp(&entries[b].0.center(axis))
    });

    let mid = indices.len() / 2;
    let (left, right) = indices.split_at_mut(mid);
    let children = vec![
        build_node(entries, left, max_per_node),
        build_node(entries, right, max_per_node),
    ];

    Node {
        bounds,
        kind: NodeKind::Inner(children),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn env(x0: f64, y0: f64, x1: f64, y1: f64) -> Envelope {
        Envelope::new(x0, y0, x1, y1)
    }

    #[test]
    fn envelope_dimensions() {
        let e = env(0.0, 0.0, 100.0, 50.0);
        assert_eq!(e.width(), 100.0);
        assert_eq!(e.height(), 50.0);
    }

    #[test]
    #[should_panic(expected = "inverted envelope")]
    fn envelope_inverted_panics() {
        env(10.0, 0.0, 0.0, 5.0);
    }

    #[test]
    fn envelope_intersects_overlapping() {
        let a = env(0.0, 0.0, 10.0, 10.0);
        let b = env(5.0, 5.0, 15.0, 15.0);
        assert!(a.intersects(&b));
        assert!(b.intersects(&a));
    }

    #[test]
    fn envelope_touching_edge_intersects() {
        // Adjacent tiles share an edge; issues on the boundary belong to both.
        let a = env(0.0, 0.0, 50.0, 50.0);
        let b = env(50.0, 0.0, 100.0, 50.0);
        assert!(a.intersects(&b));

        let clip = a.intersection(&b).unwrap();
        assert_eq!(clip.width(), 0.0);
    }

    #[test]
    fn envelope_disjoint() {
        let a = env(0.0, 0.0, 10.0, 10.0);
        let b = env(20.0, 20.0, 30.0, 30.0);
        assert!(!a.intersects(&b));
        assert!(a.intersection(&b).is_none());
    }

    #[test]
    fn envelope_clip_is_contained() {
        let a = env(0.0, 0.0, 10.0, 10.0);
        let b = env(5.0, -5.0, 20.0, 5.0);
        let c = a.intersection(&b).unwrap();
        assert_eq!(c, env(5.0, 0.0, 10.0, 5.0));
    }

    #[test]
    fn boxtree_empty() {
        let tree: BoxTree<u32> = BoxTree::build(Vec::new());
        assert!(tree.is_empty());
        assert_eq!(tree.search(&env(0.0, 0.0, 1.0, 1.0)).count(), 0);
    }

    #[test]
    fn boxtree_finds_intersecting_entries() {
        let entries = vec![
            (env(0.0, 0.0, 50.0, 50.0), 0u32),
            (env(50.0, 0.0, 100.0, 50.0), 1),
            (env(0.0, 50.0, 50.0, 100.0), 2),
            (env(50.0, 50.0, 100.0, 100.0), 3),
        ];
        let tree = BoxTree::build(entries);

        let hits: Vec<u32> = tree
            .search(&env(10.0, 10.0, 20.0, 20.0))
            .map(|(_, v)| *v)
            .collect();
        assert_eq!(hits, vec![0]);

        // Query on the shared corner touches all four tiles.
        let mut hits: Vec<u32> = tree
            .search(&env(50.0, 50.0, 50.0, 50.0))
            .map(|(_, v)| *v)
            .collect();
        hits.sort_unstable();
        assert_eq!(hits, vec![0, 1, 2, 3]);
    }

    #[test]
    fn boxtree_search_matches_linear_scan() {
        // Grid of 10x10 tiles, size 10 each.
        let mut entries = Vec::new();
        for iy in 0..10 {
            for ix in 0..10 {
                let e = env(
                    ix as f64 * 10.0,
                    iy as f64 * 10.0,
                    (ix + 1) as f64 * 10.0,
                    (iy + 1) as f64 * 10.0,
                );
                entries.push((e, iy * 10 + ix));
            }
        }
        let linear = entries.clone();
        let tree = BoxTree::build(entries);

        let queries = [
            env(0.0, 0.0, 100.0, 100.0),
            env(15.0, 15.0, 35.0, 35.0),
            env(99.0, 99.0, 120.0, 120.0),
            env(50.0, 0.0, 50.0, 100.0),
        ];

        for q in &queries {
            let mut expected: Vec<i32> = linear
                .iter()
                .filter(|(e, _)| e.intersects(q))
                .map(|(_, v)| *v)
                .collect();
            expected.sort_unstable();

            let mut got: Vec<i32> = tree.search(q).map(|(_, v)| *v).collect();
            got.sort_unstable();

            assert_eq!(got, expected, "query {}", q);
        }
    }

    #[test]
    fn boxtree_single_entry() {
        let tree = BoxTree::build(vec![(env(0.0, 0.0, 10.0, 10.0), "only")]);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.search(&env(5.0, 5.0, 6.0, 6.0)).count(), 1);
        assert_eq!(tree.search(&env(11.0, 11.0, 12.0, 12.0)).count(), 0);
    }
}
