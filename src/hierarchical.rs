//! Hierarchical clustering forest.
//!
//! Every tree partitions its points around `branching` data points chosen
//! with the configured center initialization, assigning each point to the
//! nearest chosen pivot, and recurses until a cluster fits in a leaf. No
//! averaging takes place, so any metric works, Hamming included. Trees
//! differ only in the random stream that picks their pivots.

use std::ops::Range;

use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dataset::Dataset;
use crate::distance::DistanceMetric;
use crate::element::{DistanceValue, Element};
use crate::error::{AnnError, Result};
use crate::index::{NnIndex, SearchBudget};
use crate::kmeans::centers::choose_centers;
use crate::parallel::{parallel_map, stream_rng};
use crate::params::{Algorithm, CentersInit, Parameters};
use crate::result_set::{BranchHeap, ResultSet};

const INSERT_STREAM: u64 = 1 << 32;

/// Build settings shared by every tree.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct Layout {
    distance: DistanceMetric,
    branching: usize,
    leaf_max_size: usize,
    centers_init: CentersInit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ClusterNode<R> {
    /// Data point the cluster is gathered around; the root has none.
    pivot: Option<usize>,
    /// Largest distance from the pivot to a point in the subtree.
    radius: R,
    children: Vec<usize>,
    points: Vec<usize>,
}

impl<R: DistanceValue> ClusterNode<R> {
    fn new(pivot: Option<usize>, radius: R) -> Self {
        Self {
            pivot,
            radius,
            children: Vec::new(),
            points: Vec::new(),
        }
    }

    fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// One clustering tree; node 0 is the root.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ClusterTree<R> {
    nodes: Vec<ClusterNode<R>>,
}

impl<R: DistanceValue> ClusterTree<R> {
    fn grow<T: Element<Distance = R>>(layout: &Layout, dataset: &Dataset<T>, ids: Vec<usize>, rng: &mut StdRng) -> Self {
        let mut tree = Self {
            nodes: vec![ClusterNode::new(None, R::ZERO)],
        };
        tree.cluster(layout, dataset, 0, ids, rng);
        tree
    }

    fn pivot_dist<T: Element<Distance = R>>(&self, layout: &Layout, dataset: &Dataset<T>, point: &[T], node: usize) -> R {
        match self.nodes[node].pivot {
            Some(pivot) => layout.distance.eval(point, dataset.row(pivot)),
            None => R::ZERO,
        }
    }

    /// Split `ids` into the subtree rooted at `slot`.
    fn cluster<T: Element<Distance = R>>(
        &mut self,
        layout: &Layout,
        dataset: &Dataset<T>,
        slot: usize,
        ids: Vec<usize>,
        rng: &mut StdRng,
    ) {
        let mut work = vec![(slot, ids)];
        while let Some((slot, ids)) = work.pop() {
            if ids.len() <= layout.leaf_max_size {
                self.nodes[slot].points = ids;
                continue;
            }
            let seeds = choose_centers(layout.centers_init, layout.branching, dataset, &ids, layout.distance, rng);
            if seeds.len() < 2 {
                self.nodes[slot].points = ids;
                continue;
            }

            let mut groups: Vec<Vec<usize>> = vec![Vec::new(); seeds.len()];
            let mut radii = vec![R::ZERO; seeds.len()];
            for &id in &ids {
                let point = dataset.row(id);
                let mut best = 0;
                let mut best_dist = layout.distance.eval(point, dataset.row(seeds[0]));
                for (i, &seed) in seeds.iter().enumerate().skip(1) {
                    let d = layout.distance.eval(point, dataset.row(seed));
                    if d < best_dist {
                        best = i;
                        best_dist = d;
                    }
                }
                groups[best].push(id);
                if best_dist > radii[best] {
                    radii[best] = best_dist;
                }
            }
            // Metrics without d(x, x) = min can pull everything into one group.
            if groups.iter().any(|g| g.len() == ids.len()) {
                self.nodes[slot].points = ids;
                continue;
            }

            let mut children = Vec::with_capacity(seeds.len());
            for ((seed, radius), members) in seeds.into_iter().zip(radii).zip(groups) {
                if members.is_empty() {
                    continue;
                }
                let child = self.nodes.len();
                self.nodes.push(ClusterNode::new(Some(seed), radius));
                children.push(child);
                work.push((child, members));
            }
            self.nodes[slot].children = children;
            self.nodes[slot].points = Vec::new();
        }
    }

    fn insert<T: Element<Distance = R>>(
        &mut self,
        layout: &Layout,
        dataset: &Dataset<T>,
        id: usize,
        rng: impl FnOnce() -> StdRng,
    ) {
        let point = dataset.row(id);
        let mut node_idx = 0;
        while !self.nodes[node_idx].is_leaf() {
            let mut best = self.nodes[node_idx].children[0];
            let mut best_dist = self.pivot_dist(layout, dataset, point, best);
            for &child in &self.nodes[node_idx].children[1..] {
                let d = self.pivot_dist(layout, dataset, point, child);
                if d < best_dist {
                    best = child;
                    best_dist = d;
                }
            }
            let node = &mut self.nodes[best];
            if best_dist > node.radius {
                node.radius = best_dist;
            }
            node_idx = best;
        }

        let leaf = &mut self.nodes[node_idx];
        leaf.points.push(id);
        if leaf.points.len() > layout.leaf_max_size {
            let points = std::mem::take(&mut leaf.points);
            self.cluster(layout, dataset, node_idx, points, &mut rng());
        }
    }

    fn max_point_id(&self) -> Option<usize> {
        self.nodes
            .iter()
            .flat_map(|n| n.points.iter().chain(n.pivot.iter()))
            .copied()
            .max()
    }

    fn used_memory(&self) -> usize {
        let per_node: usize = self
            .nodes
            .iter()
            .map(|n| (n.children.capacity() + n.points.capacity()) * std::mem::size_of::<usize>())
            .sum();
        self.nodes.capacity() * std::mem::size_of::<ClusterNode<R>>() + per_node
    }
}

/// Forest of hierarchical clustering trees searched together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HierarchicalIndex<R> {
    layout: Layout,
    seed: u64,
    trees: Vec<ClusterTree<R>>,
}

impl<R: DistanceValue> HierarchicalIndex<R> {
    pub fn tree_count(&self) -> usize {
        self.trees.len()
    }

    pub fn branching(&self) -> usize {
        self.layout.branching
    }

    /// Largest point ID referenced by any tree.
    pub(crate) fn max_point_id(&self) -> Option<usize> {
        self.trees.iter().filter_map(ClusterTree::max_point_id).max()
    }

    fn search_exact<T, S>(&self, dataset: &Dataset<T>, query: &[T], result: &mut S)
    where
        T: Element<Distance = R>,
        S: ResultSet<R>,
    {
        let Some(tree) = self.trees.first() else { return };
        let distance = self.layout.distance;
        let mut stack = vec![(0usize, R::ZERO)];
        while let Some((node_idx, to_pivot)) = stack.pop() {
            let node = &tree.nodes[node_idx];
            if node.pivot.is_some() && distance.ball_excludes(to_pivot, node.radius, result.worst_dist()) {
                continue;
            }
            if node.is_leaf() {
                for &id in &node.points {
                    if dataset.is_live(id) {
                        let dist = distance.eval_bounded(query, dataset.row(id), result.worst_dist());
                        result.add_point(dist, id);
                    }
                }
                continue;
            }
            let mut order: Vec<(R, usize)> = node
                .children
                .iter()
                .map(|&c| (tree.pivot_dist(&self.layout, dataset, query, c), c))
                .collect();
            order.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
            // Nearest child on top of the stack.
            stack.extend(order.into_iter().rev().map(|(d, c)| (c, d)));
        }
    }
}

/// Best-bin-first search over every tree, ranking queued clusters by the
/// distance from the query to their pivot.
struct Traversal<'a, T: Element, S> {
    index: &'a HierarchicalIndex<T::Distance>,
    dataset: &'a Dataset<T>,
    query: &'a [T],
    result: &'a mut S,
    checked: Vec<bool>,
    checks: usize,
    max_checks: usize,
    heap: BranchHeap<T::Distance, (usize, usize)>,
}

impl<'a, T, S> Traversal<'a, T, S>
where
    T: Element,
    S: ResultSet<T::Distance>,
{
    fn run(mut self) {
        for tree in 0..self.index.trees.len() {
            self.descend(tree, 0);
        }
        while self.checks < self.max_checks || !self.result.is_full() {
            match self.heap.pop() {
                Some(branch) => {
                    let (tree, node) = branch.node;
                    self.descend(tree, node);
                }
                None => break,
            }
        }
    }

    fn descend(&mut self, tree_idx: usize, mut node_idx: usize) {
        let index = self.index;
        let tree = &index.trees[tree_idx];
        loop {
            let node = &tree.nodes[node_idx];
            if node.is_leaf() {
                for &id in &node.points {
                    if self.checked[id] || !self.dataset.is_live(id) {
                        continue;
                    }
                    if self.checks >= self.max_checks && self.result.is_full() {
                        return;
                    }
                    self.checked[id] = true;
                    self.checks += 1;
                    let dist = index
                        .layout
                        .distance
                        .eval_bounded(self.query, self.dataset.row(id), self.result.worst_dist());
                    self.result.add_point(dist, id);
                }
                return;
            }

            let dists: Vec<T::Distance> = node
                .children
                .iter()
                .map(|&c| tree.pivot_dist(&index.layout, self.dataset, self.query, c))
                .collect();
            let mut best = 0;
            for i in 1..dists.len() {
                if dists[i] < dists[best] {
                    best = i;
                }
            }
            for (i, &child) in node.children.iter().enumerate() {
                if i != best {
                    self.heap.push(dists[i], (tree_idx, child));
                }
            }
            node_idx = node.children[best];
        }
    }
}

impl<R: DistanceValue> NnIndex<R> for HierarchicalIndex<R> {
    fn build<T: Element<Distance = R>>(dataset: &Dataset<T>, params: &Parameters) -> Result<Self> {
        if params.trees == 0 || params.branching < 2 || params.leaf_max_size == 0 {
            return Err(AnnError::invalid(
                "hierarchical clustering needs trees >= 1, branching >= 2 and leaf_max_size >= 1",
            ));
        }
        let layout = Layout {
            distance: params.distance,
            branching: params.branching,
            leaf_max_size: params.leaf_max_size,
            centers_init: params.centers_init,
        };
        let live: Vec<usize> = dataset.live_ids().collect();
        let seed = params.random_seed;

        let trees = parallel_map(params.cores, params.trees, |t| {
            let mut rng = stream_rng(seed, t as u64);
            ClusterTree::grow(&layout, dataset, live.clone(), &mut rng)
        })?;

        debug!(
            trees = trees.len(),
            points = live.len(),
            nodes = trees.iter().map(|t| t.nodes.len()).sum::<usize>(),
            init = ?layout.centers_init,
            "Built hierarchical clustering trees"
        );
        Ok(Self { layout, seed, trees })
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::Hierarchical
    }

    fn add_points<T: Element<Distance = R>>(&mut self, dataset: &Dataset<T>, ids: Range<usize>) -> Result<()> {
        let layout = self.layout;
        let seed = self.seed;
        let tree_count = self.trees.len() as u64;
        for (t, tree) in self.trees.iter_mut().enumerate() {
            for id in ids.clone() {
                let stream = INSERT_STREAM + (id as u64) * tree_count + t as u64;
                tree.insert(&layout, dataset, id, || stream_rng(seed, stream));
            }
        }
        Ok(())
    }

    // Tombstoned points stay in their leaves and are skipped while searching.
    fn remove_point<T: Element<Distance = R>>(&mut self, _dataset: &Dataset<T>, _id: usize) {}

    fn find_neighbors<T, S>(&self, dataset: &Dataset<T>, query: &[T], result: &mut S, budget: &SearchBudget)
    where
        T: Element<Distance = R>,
        S: ResultSet<R>,
    {
        match budget.max_checks {
            None => self.search_exact(dataset, query, result),
            Some(max_checks) => Traversal {
                index: self,
                dataset,
                query,
                result,
                checked: vec![false; dataset.rows()],
                checks: 0,
                max_checks,
                heap: BranchHeap::new(),
            }
            .run(),
        }
    }

    fn used_memory(&self) -> usize {
        self.trees.iter().map(ClusterTree::used_memory).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linear::LinearIndex;
    use crate::result_set::KnnResultSet;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn clustered(n: usize, dim: usize, seed: u64) -> Dataset<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut data = Vec::with_capacity(n * dim);
        for i in 0..n {
            let center = (i % 5) as f32 * 10.0;
            for _ in 0..dim {
                data.push(center + rng.gen_range(-1.0..1.0));
            }
        }
        Dataset::from_flat(dim, data).unwrap()
    }

    fn knn<T, I>(index: &I, ds: &Dataset<T>, q: &[T], k: usize, budget: SearchBudget) -> Vec<usize>
    where
        T: Element<Distance = f32>,
        I: NnIndex<f32>,
    {
        let mut rs = KnnResultSet::new(k);
        index.find_neighbors(ds, q, &mut rs, &budget);
        rs.into_sorted_vec().iter().map(|n| n.id).collect()
    }

    fn small(trees: usize, branching: usize) -> Parameters {
        Parameters::hierarchical(trees, branching).with_leaf_max_size(8)
    }

    #[test]
    fn test_every_tree_holds_every_point_once() {
        let ds = clustered(300, 3, 1);
        let index = HierarchicalIndex::build(&ds, &small(3, 4).with_seed(2)).unwrap();
        assert_eq!(index.tree_count(), 3);
        for tree in &index.trees {
            let mut seen: Vec<usize> = tree.nodes.iter().flat_map(|n| n.points.clone()).collect();
            seen.sort_unstable();
            assert_eq!(seen, (0..300).collect::<Vec<_>>());
            for node in &tree.nodes {
                if node.is_leaf() {
                    assert!(node.points.len() <= 8);
                } else {
                    assert!(node.children.len() >= 2 && node.children.len() <= 4);
                }
            }
        }
        assert_eq!(index.max_point_id(), Some(299));
    }

    #[test]
    fn test_unlimited_checks_is_exact() {
        let ds = clustered(400, 4, 3);
        for metric in [DistanceMetric::Euclidean, DistanceMetric::Manhattan, DistanceMetric::Max] {
            for init in [CentersInit::Random, CentersInit::Gonzales, CentersInit::KMeansPP] {
                let params = small(2, 6).with_distance(metric).with_centers_init(init);
                let index = HierarchicalIndex::build(&ds, &params).unwrap();
                let linear = LinearIndex::new(metric);
                let q = [9.5f32, 10.2, 10.0, 9.8];
                assert_eq!(
                    knn(&index, &ds, &q, 7, SearchBudget::unlimited()),
                    knn(&linear, &ds, &q, 7, SearchBudget::unlimited()),
                    "{} {:?}",
                    metric,
                    init
                );
            }
        }
    }

    #[test]
    fn test_hamming_codes() {
        let mut rng = StdRng::seed_from_u64(4);
        let data: Vec<u8> = (0..500 * 8).map(|_| rng.gen()).collect();
        let ds = Dataset::from_flat(8, data).unwrap();
        let params = small(4, 8).with_distance(DistanceMetric::Hamming);
        let index = HierarchicalIndex::<f32>::build(&ds, &params).unwrap();
        let linear = LinearIndex::new(DistanceMetric::Hamming);

        let query = ds.row(17).to_vec();
        assert_eq!(knn(&index, &ds, &query, 1, SearchBudget::checks(64)), vec![17]);
        let exact: Vec<f32> = {
            let mut rs = KnnResultSet::new(5);
            index.find_neighbors(&ds, &query, &mut rs, &SearchBudget::unlimited());
            rs.into_sorted_vec().iter().map(|n| n.distance).collect()
        };
        let truth: Vec<f32> = {
            let mut rs = KnnResultSet::new(5);
            linear.find_neighbors(&ds, &query, &mut rs, &SearchBudget::unlimited());
            rs.into_sorted_vec().iter().map(|n| n.distance).collect()
        };
        assert_eq!(exact, truth);
    }

    #[test]
    fn test_budgeted_search_finds_cluster() {
        let ds = clustered(500, 2, 5);
        let index = HierarchicalIndex::build(&ds, &small(4, 5)).unwrap();
        let ids = knn(&index, &ds, &[20.0, 20.0], 10, SearchBudget::checks(64));
        assert_eq!(ids.len(), 10);
        for id in ids {
            assert_eq!(id % 5, 2);
        }
    }

    #[test]
    fn test_added_points_are_searchable() {
        let mut ds = clustered(100, 2, 6);
        let mut index = HierarchicalIndex::build(&ds, &small(2, 4)).unwrap();
        let far: Vec<f32> = (0..20).flat_map(|i| [100.0 + i as f32 * 0.1, 100.0]).collect();
        let ids = ds.push_rows(&far).unwrap();
        index.add_points(&ds, ids).unwrap();
        assert_eq!(index.max_point_id(), Some(119));

        let mut found = knn(&index, &ds, &[100.0, 100.0], 20, SearchBudget::unlimited());
        found.sort_unstable();
        assert_eq!(found, (100..120).collect::<Vec<_>>());
        let budgeted = knn(&index, &ds, &[100.0, 100.0], 3, SearchBudget::checks(64));
        assert_eq!(budgeted, vec![100, 101, 102]);
    }

    #[test]
    fn test_removed_points_are_skipped() {
        let mut ds = clustered(200, 2, 7);
        let mut index = HierarchicalIndex::build(&ds, &small(2, 4)).unwrap();
        ds.remove(0).unwrap();
        index.remove_point(&ds, 0);
        let q = ds.row(0).to_vec();
        assert!(!knn(&index, &ds, &q, 5, SearchBudget::unlimited()).contains(&0));
        assert!(!knn(&index, &ds, &q, 5, SearchBudget::checks(16)).contains(&0));
    }

    #[test]
    fn test_duplicate_points_stay_in_one_leaf() {
        let ds = Dataset::from_flat(2, vec![1.0f32; 2 * 50]).unwrap();
        let index = HierarchicalIndex::build(&ds, &small(1, 4)).unwrap();
        assert_eq!(index.trees[0].nodes.len(), 1);
        assert_eq!(index.trees[0].nodes[0].points.len(), 50);
    }

    #[test]
    fn test_deterministic_across_cores() {
        let ds = clustered(300, 3, 8);
        let a = HierarchicalIndex::build(&ds, &small(4, 4).with_seed(11)).unwrap();
        let b = HierarchicalIndex::build(&ds, &small(4, 4).with_seed(11).with_cores(4)).unwrap();
        for (x, y) in a.trees.iter().zip(&b.trees) {
            let px: Vec<Option<usize>> = x.nodes.iter().map(|n| n.pivot).collect();
            let py: Vec<Option<usize>> = y.nodes.iter().map(|n| n.pivot).collect();
            assert_eq!(px, py);
        }
    }
}
