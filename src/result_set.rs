//! Result collectors and priority queues used during search.
//!
//! Distances are floats, so every ordering here goes through `total_cmp` and
//! breaks ties by ID to keep results deterministic.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use crate::element::DistanceValue;

/// A neighbor entry with a distance and point ID.
#[derive(Debug, Clone, Copy)]
pub struct Neighbor<R> {
    pub id: usize,
    pub distance: R,
}

impl<R: DistanceValue> Neighbor<R> {
    pub fn new(id: usize, distance: R) -> Self {
        Self { id, distance }
    }
}

impl<R: DistanceValue> PartialEq for Neighbor<R> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<R: DistanceValue> Eq for Neighbor<R> {}

// Max-heap order: largest distance on top, larger ID loses ties.
impl<R: DistanceValue> PartialOrd for Neighbor<R> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<R: DistanceValue> Ord for Neighbor<R> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// Sink for candidate points found during a search.
pub trait ResultSet<R: DistanceValue> {
    /// Offer a candidate. Every call counts as one distance evaluation.
    fn add_point(&mut self, distance: R, id: usize);

    /// Distance a candidate must beat to enter the set.
    fn worst_dist(&self) -> R;

    fn is_full(&self) -> bool;

    /// Number of candidates offered so far.
    fn evaluated(&self) -> usize;
}

/// Keeps the `k` closest distinct points seen.
#[derive(Debug)]
pub struct KnnResultSet<R: DistanceValue> {
    k: usize,
    heap: BinaryHeap<Neighbor<R>>,
    evaluated: usize,
}

impl<R: DistanceValue> KnnResultSet<R> {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            heap: BinaryHeap::with_capacity(k + 1),
            evaluated: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, id: usize) -> bool {
        self.heap.iter().any(|n| n.id == id)
    }

    /// Drain into a Vec sorted ascending by (distance, id).
    pub fn into_sorted_vec(self) -> Vec<Neighbor<R>> {
        self.heap.into_sorted_vec()
    }

    /// Drain in heap order.
    pub fn into_vec(self) -> Vec<Neighbor<R>> {
        self.heap.into_vec()
    }
}

impl<R: DistanceValue> ResultSet<R> for KnnResultSet<R> {
    fn add_point(&mut self, distance: R, id: usize) {
        self.evaluated += 1;
        if self.k == 0 {
            return;
        }
        let candidate = Neighbor::new(id, distance);
        if self.heap.len() == self.k {
            match self.heap.peek() {
                Some(top) if candidate >= *top => return,
                _ => {}
            }
        }
        if self.contains(id) {
            return;
        }
        self.heap.push(candidate);
        if self.heap.len() > self.k {
            self.heap.pop();
        }
    }

    fn worst_dist(&self) -> R {
        if self.heap.len() < self.k {
            return R::INFINITY;
        }
        self.heap.peek().map_or(R::INFINITY, |n| n.distance)
    }

    fn is_full(&self) -> bool {
        self.heap.len() == self.k
    }

    fn evaluated(&self) -> usize {
        self.evaluated
    }
}

/// Keeps every distinct point with `distance <= radius`, optionally capped
/// to the closest `max_results`.
#[derive(Debug)]
pub struct RadiusResultSet<R: DistanceValue> {
    radius: R,
    cap: Option<usize>,
    heap: BinaryHeap<Neighbor<R>>,
    seen: HashSet<usize>,
    evaluated: usize,
}

impl<R: DistanceValue> RadiusResultSet<R> {
    pub fn new(radius: R, cap: Option<usize>) -> Self {
        Self {
            radius,
            cap,
            heap: BinaryHeap::new(),
            seen: HashSet::new(),
            evaluated: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn into_sorted_vec(self) -> Vec<Neighbor<R>> {
        self.heap.into_sorted_vec()
    }

    pub fn into_vec(self) -> Vec<Neighbor<R>> {
        self.heap.into_vec()
    }
}

impl<R: DistanceValue> ResultSet<R> for RadiusResultSet<R> {
    fn add_point(&mut self, distance: R, id: usize) {
        self.evaluated += 1;
        if distance > self.radius || self.cap == Some(0) {
            return;
        }
        let candidate = Neighbor::new(id, distance);
        if let (Some(cap), Some(top)) = (self.cap, self.heap.peek()) {
            if self.heap.len() == cap && candidate >= *top {
                return;
            }
        }
        if !self.seen.insert(id) {
            return;
        }
        self.heap.push(candidate);
        if let Some(cap) = self.cap {
            if self.heap.len() > cap {
                self.heap.pop();
            }
        }
    }

    fn worst_dist(&self) -> R {
        match (self.cap, self.heap.peek()) {
            (Some(cap), Some(top)) if self.heap.len() == cap => top.distance,
            _ => self.radius,
        }
    }

    fn is_full(&self) -> bool {
        self.cap.map_or(false, |cap| self.heap.len() == cap)
    }

    fn evaluated(&self) -> usize {
        self.evaluated
    }
}

/// A pending subtree in a best-bin-first traversal.
#[derive(Debug, Clone, Copy)]
pub struct Branch<R, N> {
    /// Lower bound on the distance to anything under `node`.
    pub mindist: R,
    seq: u64,
    pub node: N,
}

impl<R: DistanceValue, N> PartialEq for Branch<R, N> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<R: DistanceValue, N> Eq for Branch<R, N> {}

impl<R: DistanceValue, N> PartialOrd for Branch<R, N> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Reversed so that `BinaryHeap` pops the smallest bound, oldest first.
impl<R: DistanceValue, N> Ord for Branch<R, N> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .mindist
            .total_cmp(&self.mindist)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Min-heap of branches ordered by lower bound, FIFO among equal bounds.
#[derive(Debug)]
pub struct BranchHeap<R, N> {
    heap: BinaryHeap<Branch<R, N>>,
    next_seq: u64,
}

impl<R: DistanceValue, N> BranchHeap<R, N> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    pub fn push(&mut self, mindist: R, node: N) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Branch { mindist, seq, node });
    }

    pub fn pop(&mut self) -> Option<Branch<R, N>> {
        self.heap.pop()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl<R: DistanceValue, N> Default for BranchHeap<R, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_knn_keeps_closest() {
        let mut rs = KnnResultSet::new(2);
        rs.add_point(5.0f32, 0);
        rs.add_point(1.0, 1);
        rs.add_point(3.0, 2);
        assert_eq!(rs.len(), 2);
        assert_eq!(rs.worst_dist(), 3.0);
        assert_eq!(rs.evaluated(), 3);
        let sorted = rs.into_sorted_vec();
        assert_eq!(sorted[0].id, 1);
        assert_eq!(sorted[1].id, 2);
    }

    #[test]
    fn test_knn_worst_is_infinite_until_full() {
        let mut rs = KnnResultSet::new(3);
        rs.add_point(1.0f64, 0);
        assert_eq!(rs.worst_dist(), f64::INFINITY);
        assert!(!rs.is_full());
    }

    #[test]
    fn test_knn_dedups_ids() {
        let mut rs = KnnResultSet::new(3);
        rs.add_point(1.0f32, 7);
        rs.add_point(1.0, 7);
        rs.add_point(2.0, 8);
        assert_eq!(rs.len(), 2);
    }

    #[test]
    fn test_knn_ties_prefer_lower_id() {
        let mut rs = KnnResultSet::new(2);
        rs.add_point(1.0f32, 9);
        rs.add_point(1.0, 4);
        rs.add_point(1.0, 6);
        let ids: Vec<usize> = rs.into_sorted_vec().iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![4, 6]);
    }

    #[test]
    fn test_knn_zero_k() {
        let mut rs = KnnResultSet::new(0);
        rs.add_point(1.0f32, 0);
        assert!(rs.is_empty());
    }

    #[test]
    fn test_radius_inclusive_and_capped() {
        let mut rs = RadiusResultSet::new(2.0f32, None);
        rs.add_point(2.0, 0);
        rs.add_point(2.5, 1);
        rs.add_point(0.5, 2);
        assert_eq!(rs.len(), 2);
        assert_eq!(rs.worst_dist(), 2.0);

        let mut capped = RadiusResultSet::new(10.0f32, Some(2));
        for (id, d) in [(0, 4.0), (1, 1.0), (2, 3.0), (3, 2.0)] {
            capped.add_point(d, id);
        }
        assert!(capped.is_full());
        assert_eq!(capped.worst_dist(), 2.0);
        let ids: Vec<usize> = capped.into_sorted_vec().iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn test_branch_heap_is_min_first_fifo() {
        let mut heap = BranchHeap::new();
        heap.push(3.0f32, "c");
        heap.push(1.0, "a1");
        heap.push(2.0, "b");
        heap.push(1.0, "a2");
        let order: Vec<&str> = std::iter::from_fn(|| heap.pop().map(|b| b.node)).collect();
        assert_eq!(order, vec!["a1", "a2", "b", "c"]);
    }
}
