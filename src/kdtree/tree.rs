//! KD-tree nodes and construction.

use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::dataset::Dataset;
use crate::element::{DistanceValue, Element};

/// Points sampled when estimating the mean and variance of a node.
const SAMPLE_MEAN: usize = 100;
/// Highest-variance dimensions a randomized split chooses among.
const RAND_DIM: usize = 5;

/// How a node picks its cut dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitRule {
    /// Random choice among the top-variance dimensions of a sample
    Randomized,
    /// The dimension of maximum variance over all points
    MaxVariance,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum KdNode<R> {
    Leaf(Vec<usize>),
    Split {
        dim: usize,
        value: R,
        left: usize,
        right: usize,
    },
}

/// One KD-tree stored as a node arena; node 0 is the root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct KdTree<R> {
    pub(crate) nodes: Vec<KdNode<R>>,
}

impl<R: DistanceValue> KdTree<R> {
    /// Build over `ids` (already in the order the tree should see them).
    pub(crate) fn build<T: Element<Distance = R>>(
        dataset: &Dataset<T>,
        ids: Vec<usize>,
        leaf_max_size: usize,
        rule: SplitRule,
        rng: &mut StdRng,
    ) -> Self {
        let mut tree = Self {
            nodes: vec![KdNode::Leaf(Vec::new())],
        };
        tree.fill(0, ids, dataset, leaf_max_size, rule, rng);
        tree
    }

    /// Route a new point to its leaf and split the leaf once overfull.
    pub(crate) fn insert<T: Element<Distance = R>>(
        &mut self,
        dataset: &Dataset<T>,
        id: usize,
        leaf_max_size: usize,
        rule: SplitRule,
        rng: &mut StdRng,
    ) {
        let point = dataset.row(id);
        let mut node = 0;
        loop {
            match &mut self.nodes[node] {
                KdNode::Split {
                    dim,
                    value,
                    left,
                    right,
                } => {
                    node = if point[*dim].to_distance() < *value {
                        *left
                    } else {
                        *right
                    };
                }
                KdNode::Leaf(points) => {
                    points.push(id);
                    if points.len() > leaf_max_size {
                        let ids = std::mem::take(points);
                        self.fill(node, ids, dataset, leaf_max_size, rule, rng);
                    }
                    return;
                }
            }
        }
    }

    pub(crate) fn used_memory(&self) -> usize {
        let leaves: usize = self
            .nodes
            .iter()
            .map(|n| match n {
                KdNode::Leaf(points) => points.capacity() * std::mem::size_of::<usize>(),
                KdNode::Split { .. } => 0,
            })
            .sum();
        self.nodes.capacity() * std::mem::size_of::<KdNode<R>>() + leaves
    }

    pub(crate) fn depth(&self) -> usize {
        let mut max_depth = 0;
        let mut stack = vec![(0usize, 1usize)];
        while let Some((node, depth)) = stack.pop() {
            max_depth = max_depth.max(depth);
            if let KdNode::Split { left, right, .. } = &self.nodes[node] {
                stack.push((*left, depth + 1));
                stack.push((*right, depth + 1));
            }
        }
        max_depth
    }

    /// Divide `ids` into the subtree rooted at `slot`.
    fn fill<T: Element<Distance = R>>(
        &mut self,
        slot: usize,
        mut ids: Vec<usize>,
        dataset: &Dataset<T>,
        leaf_max_size: usize,
        rule: SplitRule,
        rng: &mut StdRng,
    ) {
        let mut work = vec![(slot, 0, ids.len())];
        while let Some((slot, start, end)) = work.pop() {
            let ind = &mut ids[start..end];
            if ind.len() <= leaf_max_size {
                self.nodes[slot] = KdNode::Leaf(ind.to_vec());
                continue;
            }
            let (dim, value) = choose_split(dataset, ind, rule, rng);
            let mid = start + split_index(dataset, ind, dim, value);

            let left = self.nodes.len();
            let right = left + 1;
            self.nodes.push(KdNode::Leaf(Vec::new()));
            self.nodes.push(KdNode::Leaf(Vec::new()));
            self.nodes[slot] = KdNode::Split {
                dim,
                value,
                left,
                right,
            };
            work.push((right, mid, end));
            work.push((left, start, mid));
        }
    }
}

/// Pick the cut dimension and its value (the mean along that dimension).
fn choose_split<T: Element>(
    dataset: &Dataset<T>,
    ind: &[usize],
    rule: SplitRule,
    rng: &mut StdRng,
) -> (usize, T::Distance) {
    let cols = dataset.dimension();
    let sample = match rule {
        SplitRule::Randomized => &ind[..ind.len().min(SAMPLE_MEAN)],
        SplitRule::MaxVariance => ind,
    };
    let n = <T::Distance as DistanceValue>::from_usize(sample.len());

    let mut mean = vec![<T::Distance as DistanceValue>::ZERO; cols];
    for &id in sample {
        for (m, v) in mean.iter_mut().zip(dataset.row(id)) {
            *m += v.to_distance();
        }
    }
    for m in mean.iter_mut() {
        *m = *m / n;
    }

    let mut var = vec![<T::Distance as DistanceValue>::ZERO; cols];
    for &id in sample {
        for ((s, m), v) in var.iter_mut().zip(&mean).zip(dataset.row(id)) {
            let d = v.to_distance() - *m;
            *s += d * d;
        }
    }

    let dim = match rule {
        SplitRule::MaxVariance => {
            let mut best = 0;
            for d in 1..cols {
                if var[d] > var[best] {
                    best = d;
                }
            }
            best
        }
        SplitRule::Randomized => {
            let mut order: Vec<usize> = (0..cols).collect();
            order.sort_by(|&a, &b| var[b].total_cmp(&var[a]).then(a.cmp(&b)));
            let top = cols.min(RAND_DIM);
            order[rng.gen_range(0..top)]
        }
    };
    (dim, mean[dim])
}

/// Partition `ind` around `value` along `dim` and return the split position.
///
/// Points below the cut come first, then points equal to it. The split
/// lands on one of those boundaries when that keeps both halves at least
/// half full, otherwise in the middle.
fn split_index<T: Element>(dataset: &Dataset<T>, ind: &mut [usize], dim: usize, value: T::Distance) -> usize {
    let count = ind.len();
    let at = |id: usize| dataset.row(id)[dim].to_distance();

    let mut lim1 = 0;
    for i in 0..count {
        if at(ind[i]) < value {
            ind.swap(i, lim1);
            lim1 += 1;
        }
    }
    let mut lim2 = lim1;
    for i in lim1..count {
        if at(ind[i]) <= value {
            ind.swap(i, lim2);
            lim2 += 1;
        }
    }

    let half = count / 2;
    let index = if lim1 > half {
        lim1
    } else if lim2 < half {
        lim2
    } else {
        half
    };
    // All remaining points equal along this dimension.
    if lim1 == count || lim2 == 0 {
        half
    } else {
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn grid(n: usize) -> Dataset<f32> {
        let mut data = Vec::new();
        for i in 0..n {
            data.push((i % 10) as f32);
            data.push((i / 10) as f32 * 0.1);
        }
        Dataset::from_flat(2, data).unwrap()
    }

    fn leaf_ids(tree: &KdTree<f32>) -> Vec<usize> {
        let mut ids: Vec<usize> = tree
            .nodes
            .iter()
            .flat_map(|n| match n {
                KdNode::Leaf(points) => points.clone(),
                KdNode::Split { .. } => Vec::new(),
            })
            .collect();
        ids.sort_unstable();
        ids
    }

    #[test]
    fn test_every_point_in_one_leaf() {
        let ds = grid(100);
        let mut rng = StdRng::seed_from_u64(1);
        let tree = KdTree::build(&ds, (0..100).collect(), 4, SplitRule::Randomized, &mut rng);
        assert_eq!(leaf_ids(&tree), (0..100).collect::<Vec<_>>());
        for node in &tree.nodes {
            if let KdNode::Leaf(points) = node {
                assert!(points.len() <= 4);
            }
        }
    }

    #[test]
    fn test_max_variance_picks_widest_dimension() {
        let ds = grid(100);
        let mut rng = StdRng::seed_from_u64(0);
        let tree = KdTree::build(&ds, (0..100).collect(), 10, SplitRule::MaxVariance, &mut rng);
        match &tree.nodes[0] {
            KdNode::Split { dim, value, .. } => {
                assert_eq!(*dim, 0);
                assert!((value - 4.5).abs() < 1e-5);
            }
            KdNode::Leaf(_) => panic!("root should split"),
        }
    }

    #[test]
    fn test_identical_points_terminate() {
        let ds = Dataset::from_flat(3, vec![1.0f32; 3 * 50]).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let tree = KdTree::build(&ds, (0..50).collect(), 2, SplitRule::Randomized, &mut rng);
        assert_eq!(leaf_ids(&tree).len(), 50);
        assert!(tree.depth() < 10);
    }

    #[test]
    fn test_insert_splits_overfull_leaf() {
        let mut ds = grid(4);
        let mut rng = StdRng::seed_from_u64(9);
        let mut tree = KdTree::build(&ds, (0..4).collect(), 4, SplitRule::Randomized, &mut rng);
        assert_eq!(tree.nodes.len(), 1);
        let added = ds.push_rows(&[8.0, 0.5, 9.0, 0.5]).unwrap();
        for id in added {
            tree.insert(&ds, id, 4, SplitRule::Randomized, &mut rng);
        }
        assert!(tree.nodes.len() > 1);
        assert_eq!(leaf_ids(&tree), (0..6).collect::<Vec<_>>());
    }
}
