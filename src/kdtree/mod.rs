//! KD-tree indices: a randomized forest and a single deterministic tree.
//!
//! Both variants share one node layout and one best-bin-first search. The
//! forest shuffles the points per tree and cuts each node on a random pick
//! among its highest-variance dimensions; the single tree always cuts the
//! dimension of maximum variance.

mod search;
mod tree;

pub use tree::SplitRule;

use std::ops::Range;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dataset::Dataset;
use crate::distance::DistanceMetric;
use crate::element::{DistanceValue, Element};
use crate::error::{AnnError, Result};
use crate::index::{NnIndex, SearchBudget};
use crate::parallel::{parallel_map, stream_rng};
use crate::params::{Algorithm, Parameters};
use crate::result_set::ResultSet;

use search::{search_exact, BestBinFirst};
use tree::KdTree;

// Stream offset separating insertion randomness from build randomness.
const INSERT_STREAM: u64 = 1 << 32;

/// A set of KD-trees searched together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KdForest<R> {
    algorithm: Algorithm,
    distance: DistanceMetric,
    rule: SplitRule,
    leaf_max_size: usize,
    seed: u64,
    trees: Vec<KdTree<R>>,
}

impl<R: DistanceValue> KdForest<R> {
    /// Build `trees` randomized trees regardless of `params.algorithm`.
    pub fn build_forest<T: Element<Distance = R>>(dataset: &Dataset<T>, params: &Parameters) -> Result<Self> {
        Self::build_with(dataset, params, SplitRule::Randomized, params.trees, Algorithm::KdTree)
    }

    fn build_with<T: Element<Distance = R>>(
        dataset: &Dataset<T>,
        params: &Parameters,
        rule: SplitRule,
        tree_count: usize,
        algorithm: Algorithm,
    ) -> Result<Self> {
        if !params.distance.supports_kdtree() {
            return Err(AnnError::invalid(format!(
                "{} distance cannot be used with KD-trees",
                params.distance
            )));
        }
        if tree_count == 0 || params.leaf_max_size == 0 {
            return Err(AnnError::invalid("KD-trees need at least one tree and leaf_max_size >= 1"));
        }
        let live: Vec<usize> = dataset.live_ids().collect();
        let seed = params.random_seed;
        let leaf = params.leaf_max_size;

        let trees = parallel_map(params.cores, tree_count, |t| {
            let mut rng = stream_rng(seed, t as u64);
            let mut ids = live.clone();
            if rule == SplitRule::Randomized {
                ids.shuffle(&mut rng);
            }
            KdTree::build(dataset, ids, leaf, rule, &mut rng)
        })?;

        debug!(
            trees = trees.len(),
            points = live.len(),
            max_depth = trees.iter().map(KdTree::depth).max().unwrap_or(0),
            "Built KD-trees"
        );

        Ok(Self {
            algorithm,
            distance: params.distance,
            rule,
            leaf_max_size: leaf,
            seed,
            trees,
        })
    }

    /// Largest point ID held in any leaf.
    pub(crate) fn max_point_id(&self) -> Option<usize> {
        self.trees
            .iter()
            .flat_map(|t| t.nodes.iter())
            .filter_map(|node| match node {
                tree::KdNode::Leaf(points) => points.iter().copied().max(),
                tree::KdNode::Split { .. } => None,
            })
            .max()
    }

    pub fn tree_count(&self) -> usize {
        self.trees.len()
    }

    pub fn split_rule(&self) -> SplitRule {
        self.rule
    }
}

impl<R: DistanceValue> NnIndex<R> for KdForest<R> {
    fn build<T: Element<Distance = R>>(dataset: &Dataset<T>, params: &Parameters) -> Result<Self> {
        match params.algorithm {
            Algorithm::KdTreeSingle => {
                Self::build_with(dataset, params, SplitRule::MaxVariance, 1, Algorithm::KdTreeSingle)
            }
            _ => Self::build_forest(dataset, params),
        }
    }

    fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    fn add_points<T: Element<Distance = R>>(&mut self, dataset: &Dataset<T>, ids: Range<usize>) -> Result<()> {
        let tree_count = self.trees.len() as u64;
        for (t, tree) in self.trees.iter_mut().enumerate() {
            for id in ids.clone() {
                let stream = INSERT_STREAM + (id as u64) * tree_count + t as u64;
                let mut rng = stream_rng(self.seed, stream);
                tree.insert(dataset, id, self.leaf_max_size, self.rule, &mut rng);
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
            None => {
                if let Some(tree) = self.trees.first() {
                    search_exact(tree, self.distance, dataset, query, result, budget.eps);
                }
            }
            Some(max_checks) => {
                BestBinFirst::new(&self.trees, self.distance, dataset, query, result, max_checks, budget.eps)
                    .run();
            }
        }
    }

    fn used_memory(&self) -> usize {
        self.trees.iter().map(KdTree::used_memory).sum()
    }
}
