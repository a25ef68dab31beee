//! Hierarchical k-means tree index.
//!
//! Each internal node splits its points into `branching` clusters with
//! k-means and recurses; nodes with fewer than `branching` points (or too
//! few distinct points to seed that many centers) become leaves. Search
//! descends to the nearest center and queues the other children, ranked by
//! distance minus `cb_index` times the child's variance.

pub(crate) mod centers;
pub(crate) mod lloyd;

use std::ops::Range;

use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dataset::Dataset;
use crate::distance::DistanceMetric;
use crate::element::{to_distance_row, DistanceValue, Element};
use crate::error::{AnnError, Result};
use crate::index::{NnIndex, SearchBudget};
use crate::parallel::stream_rng;
use crate::params::{Algorithm, CentersInit, Parameters};
use crate::result_set::{BranchHeap, ResultSet};

use centers::{choose_centers, mean_of};
use lloyd::lloyd;

const INSERT_STREAM: u64 = 1 << 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KMeansNode<R> {
    pivot: Vec<R>,
    /// Largest distance from the pivot to a member.
    radius: R,
    /// Mean distance from the pivot to the members.
    variance: R,
    size: usize,
    children: Vec<usize>,
    points: Vec<usize>,
}

impl<R: DistanceValue> KMeansNode<R> {
    fn new<T: Element<Distance = R>>(
        dataset: &Dataset<T>,
        ids: &[usize],
        pivot: Vec<R>,
        distance: DistanceMetric,
    ) -> Self {
        let mut radius = R::ZERO;
        let mut total = R::ZERO;
        for &id in ids {
            let d = distance.eval(dataset.row(id), &pivot);
            total += d;
            if d > radius {
                radius = d;
            }
        }
        let variance = if ids.is_empty() {
            R::ZERO
        } else {
            total / R::from_usize(ids.len())
        };
        Self {
            pivot,
            radius,
            variance,
            size: ids.len(),
            children: Vec::new(),
            points: Vec::new(),
        }
    }

    fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Hierarchical k-means tree; node 0 is the root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KMeansTree<R> {
    distance: DistanceMetric,
    branching: usize,
    iterations: usize,
    centers_init: CentersInit,
    cb_index: f32,
    seed: u64,
    nodes: Vec<KMeansNode<R>>,
}

impl<R: DistanceValue> KMeansTree<R> {
    pub fn branching(&self) -> usize {
        self.branching
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn max_point_id(&self) -> Option<usize> {
        self.nodes.iter().filter_map(|n| n.points.iter().copied().max()).max()
    }

    /// Cluster `ids` into the subtree rooted at `slot`, whose statistics are
    /// already set.
    fn cluster<T: Element<Distance = R>>(
        &mut self,
        dataset: &Dataset<T>,
        slot: usize,
        ids: Vec<usize>,
        rng: &mut StdRng,
    ) {
        let mut work = vec![(slot, ids)];
        while let Some((slot, ids)) = work.pop() {
            if ids.len() < self.branching {
                self.nodes[slot].points = ids;
                continue;
            }
            let seeds = choose_centers(
                self.centers_init,
                self.branching,
                dataset,
                &ids,
                self.distance,
                rng,
            );
            if seeds.len() < self.branching {
                self.nodes[slot].points = ids;
                continue;
            }
            let initial = seeds.iter().map(|&c| to_distance_row(dataset.row(c))).collect();
            let clustering = lloyd(dataset, &ids, initial, self.iterations, self.distance);
            let groups = clustering.members(&ids);

            let mut children = Vec::with_capacity(self.branching);
            for (center, members) in clustering.centers.into_iter().zip(groups) {
                let child = self.nodes.len();
                self.nodes
                    .push(KMeansNode::new(dataset, &members, center, self.distance));
                children.push(child);
                work.push((child, members));
            }
            self.nodes[slot].children = children;
            self.nodes[slot].points = Vec::new();
        }
    }

    /// Whether no point under `node` can beat the current worst result.
    fn can_skip(&self, node: &KMeansNode<R>, to_pivot: R, worst: R) -> bool {
        self.distance.ball_excludes(to_pivot, node.radius, worst)
    }

    fn scan_leaf<T, S>(&self, node: &KMeansNode<R>, dataset: &Dataset<T>, query: &[T], result: &mut S) -> usize
    where
        T: Element<Distance = R>,
        S: ResultSet<R>,
    {
        let mut checked = 0;
        for &id in &node.points {
            if !dataset.is_live(id) {
                continue;
            }
            let dist = self
                .distance
                .eval_bounded(query, dataset.row(id), result.worst_dist());
            result.add_point(dist, id);
            checked += 1;
        }
        checked
    }

    fn search_budgeted<T, S>(&self, dataset: &Dataset<T>, query: &[T], result: &mut S, max_checks: usize)
    where
        T: Element<Distance = R>,
        S: ResultSet<R>,
    {
        let cb_index = R::from_f64(self.cb_index as f64);
        let mut heap: BranchHeap<R, usize> = BranchHeap::new();
        let mut checks = 0;
        let mut next = Some(0);

        while let Some(start) = next {
            let mut node_idx = start;
            loop {
                let node = &self.nodes[node_idx];
                let bsq = self.distance.eval(query, &node.pivot);
                if self.can_skip(node, bsq, result.worst_dist()) {
                    break;
                }
                if node.is_leaf() {
                    if checks < max_checks || !result.is_full() {
                        checks += self.scan_leaf(node, dataset, query, result);
                    }
                    break;
                }
                let dists: Vec<R> = node
                    .children
                    .iter()
                    .map(|&c| self.distance.eval(query, &self.nodes[c].pivot))
                    .collect();
                let mut best = 0;
                for i in 1..dists.len() {
                    if dists[i] < dists[best] {
                        best = i;
                    }
                }
                for (i, &child) in node.children.iter().enumerate() {
                    if i != best {
                        heap.push(dists[i] - cb_index * self.nodes[child].variance, child);
                    }
                }
                node_idx = node.children[best];
            }

            next = if checks < max_checks || !result.is_full() {
                heap.pop().map(|b| b.node)
            } else {
                None
            };
        }
    }

    fn search_exact<T, S>(&self, dataset: &Dataset<T>, query: &[T], result: &mut S)
    where
        T: Element<Distance = R>,
        S: ResultSet<R>,
    {
        let mut stack = vec![0usize];
        while let Some(node_idx) = stack.pop() {
            let node = &self.nodes[node_idx];
            let bsq = self.distance.eval(query, &node.pivot);
            if self.can_skip(node, bsq, result.worst_dist()) {
                continue;
            }
            if node.is_leaf() {
                self.scan_leaf(node, dataset, query, result);
                continue;
            }
            let mut order: Vec<(R, usize)> = node
                .children
                .iter()
                .map(|&c| (self.distance.eval(query, &self.nodes[c].pivot), c))
                .collect();
            order.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
            // Nearest child on top of the stack.
            stack.extend(order.into_iter().rev().map(|(_, c)| c));
        }
    }
}

impl<R: DistanceValue> NnIndex<R> for KMeansTree<R> {
    fn build<T: Element<Distance = R>>(dataset: &Dataset<T>, params: &Parameters) -> Result<Self> {
        if !params.distance.is_vector_space() {
            return Err(AnnError::invalid(format!(
                "{} distance cannot be used with k-means centers",
                params.distance
            )));
        }
        if params.branching < 2 {
            return Err(AnnError::invalid("branching must be at least 2"));
        }
        let ids: Vec<usize> = dataset.live_ids().collect();
        let root = KMeansNode::new(
            dataset,
            &ids,
            mean_of(dataset, &ids, dataset.dimension()),
            params.distance,
        );
        let mut tree = Self {
            distance: params.distance,
            branching: params.branching,
            iterations: params.kmeans_iterations(),
            centers_init: params.centers_init,
            cb_index: params.cb_index,
            seed: params.random_seed,
            nodes: vec![root],
        };
        let mut rng = stream_rng(params.random_seed, 0);
        tree.cluster(dataset, 0, ids, &mut rng);

        debug!(
            nodes = tree.nodes.len(),
            branching = tree.branching,
            init = ?tree.centers_init,
            "Built k-means tree"
        );
        Ok(tree)
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::KMeans
    }

    fn add_points<T: Element<Distance = R>>(&mut self, dataset: &Dataset<T>, ids: Range<usize>) -> Result<()> {
        for id in ids {
            let point = dataset.row(id);
            let mut node_idx = 0;
            let mut dist = self.distance.eval(point, &self.nodes[0].pivot);
            loop {
                let node = &mut self.nodes[node_idx];
                if dist > node.radius {
                    node.radius = dist;
                }
                let size = R::from_usize(node.size);
                node.variance = (size * node.variance + dist) / (size + R::ONE);
                node.size += 1;

                if node.is_leaf() {
                    node.points.push(id);
                    if node.points.len() >= self.branching {
                        let points = std::mem::take(&mut node.points);
                        let mut rng = stream_rng(self.seed, INSERT_STREAM + id as u64);
                        self.cluster(dataset, node_idx, points, &mut rng);
                    }
                    break;
                }

                let mut best = node.children[0];
                let mut best_dist = self.distance.eval(point, &self.nodes[best].pivot);
                for &child in &self.nodes[node_idx].children[1..] {
                    let d = self.distance.eval(point, &self.nodes[child].pivot);
                    if d < best_dist {
                        best = child;
                        best_dist = d;
                    }
                }
                node_idx = best;
                dist = best_dist;
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
            Some(max_checks) => self.search_budgeted(dataset, query, result, max_checks),
        }
    }

    fn used_memory(&self) -> usize {
        let per_node: usize = self
            .nodes
            .iter()
            .map(|n| {
                n.pivot.capacity() * std::mem::size_of::<R>()
                    + (n.children.capacity() + n.points.capacity()) * std::mem::size_of::<usize>()
            })
            .sum();
        self.nodes.capacity() * std::mem::size_of::<KMeansNode<R>>() + per_node
    }
}
