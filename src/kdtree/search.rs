//! Best-bin-first and exact traversal of KD-trees.

use crate::dataset::Dataset;
use crate::distance::DistanceMetric;
use crate::element::{DistanceValue, Element};
use crate::result_set::{BranchHeap, ResultSet};

use super::tree::{KdNode, KdTree};

/// Shared best-bin-first search across several trees.
///
/// Every tree is descended once, queuing the skipped branches; afterwards
/// branches are expanded closest-first until `max_checks` leaf points have
/// been examined and the result set is full, or the queue runs dry.
pub(crate) struct BestBinFirst<'a, T: Element, S> {
    trees: &'a [KdTree<T::Distance>],
    distance: DistanceMetric,
    dataset: &'a Dataset<T>,
    query: &'a [T],
    result: &'a mut S,
    checked: Vec<bool>,
    checks: usize,
    max_checks: usize,
    eps_error: T::Distance,
    heap: BranchHeap<T::Distance, (usize, usize)>,
}

impl<'a, T, S> BestBinFirst<'a, T, S>
where
    T: Element,
    S: ResultSet<T::Distance>,
{
    pub(crate) fn new(
        trees: &'a [KdTree<T::Distance>],
        distance: DistanceMetric,
        dataset: &'a Dataset<T>,
        query: &'a [T],
        result: &'a mut S,
        max_checks: usize,
        eps: f32,
    ) -> Self {
        Self {
            trees,
            distance,
            dataset,
            query,
            result,
            checked: vec![false; dataset.rows()],
            checks: 0,
            max_checks,
            eps_error: <T::Distance as DistanceValue>::ONE
                + <T::Distance as DistanceValue>::from_f64(eps as f64),
            heap: BranchHeap::new(),
        }
    }

    /// Run the search; returns the number of leaf points examined.
    pub(crate) fn run(mut self) -> usize {
        let zero = <T::Distance as DistanceValue>::ZERO;
        for tree in 0..self.trees.len() {
            self.descend(tree, 0, zero);
        }
        while self.checks < self.max_checks || !self.result.is_full() {
            match self.heap.pop() {
                Some(branch) => {
                    let (tree, node) = branch.node;
                    self.descend(tree, node, branch.mindist);
                }
                None => break,
            }
        }
        self.checks
    }

    fn descend(&mut self, tree: usize, mut node: usize, mindist: T::Distance) {
        if self.result.worst_dist() < mindist {
            return;
        }
        let trees = self.trees;
        let zero = <T::Distance as DistanceValue>::ZERO;
        loop {
            match &trees[tree].nodes[node] {
                KdNode::Leaf(points) => {
                    for &id in points {
                        if self.checked[id] || !self.dataset.is_live(id) {
                            continue;
                        }
                        if self.checks >= self.max_checks && self.result.is_full() {
                            return;
                        }
                        self.checked[id] = true;
                        self.checks += 1;
                        let dist = self.distance.eval_bounded(
                            self.query,
                            self.dataset.row(id),
                            self.result.worst_dist(),
                        );
                        self.result.add_point(dist, id);
                    }
                    return;
                }
                KdNode::Split {
                    dim,
                    value,
                    left,
                    right,
                } => {
                    let val = self.query[*dim].to_distance();
                    let (best, other) = if val < *value {
                        (*left, *right)
                    } else {
                        (*right, *left)
                    };
                    let cut = self.distance.accum_dist::<_, _, T::Distance>(val, *value);
                    let bound = self.distance.update_bound(mindist, zero, cut);
                    if bound * self.eps_error < self.result.worst_dist() || !self.result.is_full() {
                        self.heap.push(bound, (tree, other));
                    }
                    node = best;
                }
            }
        }
    }
}

enum Frame<R> {
    Visit(usize),
    Far {
        node: usize,
        mindist: R,
        dim: usize,
        old: R,
        cut: R,
    },
    Restore {
        dim: usize,
        old: R,
        mindist: R,
    },
}

/// Exhaustive traversal of one tree, pruning only branches whose lower bound
/// (scaled by `1 + eps`) exceeds the current worst result.
pub(crate) fn search_exact<T, S>(
    tree: &KdTree<T::Distance>,
    distance: DistanceMetric,
    dataset: &Dataset<T>,
    query: &[T],
    result: &mut S,
    eps: f32,
) where
    T: Element,
    S: ResultSet<T::Distance>,
{
    let zero = <T::Distance as DistanceValue>::ZERO;
    let eps_error = <T::Distance as DistanceValue>::ONE
        + <T::Distance as DistanceValue>::from_f64(eps as f64);
    // Per-dimension contribution to the current lower bound.
    let mut dists = vec![zero; dataset.dimension()];
    let mut mindist = zero;
    let mut stack = vec![Frame::Visit(0)];

    while let Some(frame) = stack.pop() {
        match frame {
            Frame::Visit(node) => match &tree.nodes[node] {
                KdNode::Leaf(points) => {
                    for &id in points {
                        if !dataset.is_live(id) {
                            continue;
                        }
                        let dist = distance.eval_bounded(query, dataset.row(id), result.worst_dist());
                        result.add_point(dist, id);
                    }
                }
                KdNode::Split {
                    dim,
                    value,
                    left,
                    right,
                } => {
                    let val = query[*dim].to_distance();
                    let (best, other) = if val < *value {
                        (*left, *right)
                    } else {
                        (*right, *left)
                    };
                    let old = dists[*dim];
                    let cut = distance.accum_dist::<_, _, T::Distance>(val, *value);
                    stack.push(Frame::Far {
                        node: other,
                        mindist: distance.update_bound(mindist, old, cut),
                        dim: *dim,
                        old,
                        cut,
                    });
                    stack.push(Frame::Visit(best));
                }
            },
            Frame::Far {
                node,
                mindist: far,
                dim,
                old,
                cut,
            } => {
                if far * eps_error <= result.worst_dist() {
                    stack.push(Frame::Restore { dim, old, mindist });
                    dists[dim] = cut;
                    mindist = far;
                    stack.push(Frame::Visit(node));
                }
            }
            Frame::Restore {
                dim,
                old,
                mindist: saved,
            } => {
                dists[dim] = old;
                mindist = saved;
            }
        }
    }
}
