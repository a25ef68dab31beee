//! Index configuration.
//!
//! One [`Parameters`] value carries every knob an index build or search can
//! use; each backend reads the fields relevant to it and ignores the rest.

use serde::{Deserialize, Serialize};

use crate::distance::DistanceMetric;
use crate::error::{AnnError, Result};
use crate::lsh::check_mask_budget;
use crate::persistence::serialization;

/// Upper bound on Lloyd iterations when `iterations` is `None`.
pub const MAX_KMEANS_ITERATIONS: usize = 1000;

/// Visit budget used when `Checks::Autotuned` is requested but no tuned
/// value is available.
pub const FALLBACK_CHECKS: usize = 32;

/// Index algorithm selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Algorithm {
    /// Exhaustive scan (exact)
    Linear,
    /// Randomized KD-forest
    KdTree,
    /// One deterministic KD-tree
    KdTreeSingle,
    /// Hierarchical k-means tree
    KMeans,
    /// K-means tree and KD-forest searched together
    Composite,
    /// Multi-probe locality-sensitive hashing
    Lsh,
    /// Forest of trees clustered around randomly chosen data points
    Hierarchical,
    /// Pick an algorithm and its parameters by sampling the data
    Autotuned,
}

/// Strategy for choosing initial k-means centers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CentersInit {
    /// Distinct points drawn uniformly at random
    Random,
    /// Greedy farthest-point selection
    Gonzales,
    /// Distance-squared weighted sampling (k-means++)
    KMeansPP,
    /// Means of random groups, snapped to the nearest data point
    Groupwise,
}

/// Search effort for tree and hash backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Checks {
    /// Search until the structure is exhausted; KD-trees search exactly
    Unlimited,
    /// Use the value chosen by the autotuner
    Autotuned,
    /// Stop after this many leaf points have been examined
    Exact(usize),
}

/// Configuration for building and searching an index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    pub algorithm: Algorithm,
    pub checks: Checks,
    /// Relative error bound: a branch is skipped when its lower bound times
    /// `1 + eps` exceeds the current worst result.
    pub eps: f32,
    pub sorted: bool,
    /// Cap on radius search results (`None` = unlimited).
    pub max_neighbors: Option<usize>,
    /// Worker threads; 0 or 1 runs sequentially.
    pub cores: usize,
    pub trees: usize,
    pub leaf_max_size: usize,
    pub branching: usize,
    /// Lloyd iterations per k-means level (`None` = until convergence).
    pub iterations: Option<usize>,
    pub centers_init: CentersInit,
    /// Cluster-bias index for k-means traversal.
    pub cb_index: f32,
    pub target_precision: f32,
    pub build_weight: f32,
    pub memory_weight: f32,
    pub sample_fraction: f32,
    pub table_number: usize,
    pub key_size: u32,
    pub multi_probe_level: u32,
    pub distance: DistanceMetric,
    pub random_seed: u64,
    /// Growth ratio beyond which `add_points` rebuilds from scratch.
    pub rebuild_threshold: f32,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::KdTree,
            checks: Checks::Exact(32),
            eps: 0.0,
            sorted: true,
            max_neighbors: None,
            cores: 0,
            trees: 4,
            leaf_max_size: 4,
            branching: 32,
            iterations: Some(11),
            centers_init: CentersInit::Random,
            cb_index: 0.2,
            target_precision: 0.9,
            build_weight: 0.01,
            memory_weight: 0.0,
            sample_fraction: 0.1,
            table_number: 12,
            key_size: 20,
            multi_probe_level: 2,
            distance: DistanceMetric::Euclidean,
            random_seed: 0,
            rebuild_threshold: 2.0,
        }
    }
}

impl Parameters {
    pub fn linear() -> Self {
        Self {
            algorithm: Algorithm::Linear,
            ..Self::default()
        }
    }

    pub fn kdtree(trees: usize) -> Self {
        Self {
            algorithm: Algorithm::KdTree,
            trees,
            ..Self::default()
        }
    }

    pub fn kdtree_single(leaf_max_size: usize) -> Self {
        Self {
            algorithm: Algorithm::KdTreeSingle,
            leaf_max_size,
            ..Self::default()
        }
    }

    pub fn kmeans(branching: usize, iterations: Option<usize>) -> Self {
        Self {
            algorithm: Algorithm::KMeans,
            branching,
            iterations,
            ..Self::default()
        }
    }

    pub fn composite(trees: usize, branching: usize) -> Self {
        Self {
            algorithm: Algorithm::Composite,
            trees,
            branching,
            ..Self::default()
        }
    }

    pub fn lsh(table_number: usize, key_size: u32, multi_probe_level: u32) -> Self {
        Self {
            algorithm: Algorithm::Lsh,
            table_number,
            key_size,
            multi_probe_level,
            ..Self::default()
        }
    }

    pub fn hierarchical(trees: usize, branching: usize) -> Self {
        Self {
            algorithm: Algorithm::Hierarchical,
            trees,
            branching,
            leaf_max_size: 100,
            ..Self::default()
        }
    }

    pub fn autotuned(
        target_precision: f32,
        build_weight: f32,
        memory_weight: f32,
        sample_fraction: f32,
    ) -> Self {
        Self {
            algorithm: Algorithm::Autotuned,
            checks: Checks::Autotuned,
            target_precision,
            build_weight,
            memory_weight,
            sample_fraction,
            ..Self::default()
        }
    }

    pub fn with_distance(mut self, distance: DistanceMetric) -> Self {
        self.distance = distance;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.random_seed = seed;
        self
    }

    pub fn with_checks(mut self, checks: Checks) -> Self {
        self.checks = checks;
        self
    }

    pub fn with_eps(mut self, eps: f32) -> Self {
        self.eps = eps;
        self
    }

    pub fn with_cores(mut self, cores: usize) -> Self {
        self.cores = cores;
        self
    }

    pub fn with_centers_init(mut self, init: CentersInit) -> Self {
        self.centers_init = init;
        self
    }

    pub fn with_leaf_max_size(mut self, leaf_max_size: usize) -> Self {
        self.leaf_max_size = leaf_max_size;
        self
    }

    pub fn with_rebuild_threshold(mut self, threshold: f32) -> Self {
        self.rebuild_threshold = threshold;
        self
    }

    /// Reject configurations no backend can honor.
    pub fn validate(&self) -> Result<()> {
        if !(self.eps >= 0.0) {
            return Err(AnnError::invalid(format!("eps must be >= 0, got {}", self.eps)));
        }
        if self.checks == Checks::Exact(0) {
            return Err(AnnError::invalid("checks must be at least 1"));
        }
        if let DistanceMetric::Minkowski { order } = self.distance {
            if !(order > 0.0) {
                return Err(AnnError::invalid(format!(
                    "Minkowski order must be positive, got {}",
                    order
                )));
            }
        }
        if !(self.rebuild_threshold >= 0.0) {
            return Err(AnnError::invalid("rebuild_threshold must be >= 0"));
        }
        if self.max_neighbors == Some(0) {
            return Err(AnnError::invalid("max_neighbors must be at least 1"));
        }

        let uses_kd = matches!(
            self.algorithm,
            Algorithm::KdTree | Algorithm::KdTreeSingle | Algorithm::Composite
        );
        let uses_kmeans = matches!(self.algorithm, Algorithm::KMeans | Algorithm::Composite);

        if uses_kd {
            if self.algorithm != Algorithm::KdTreeSingle && self.trees == 0 {
                return Err(AnnError::invalid("trees must be at least 1"));
            }
            if self.leaf_max_size == 0 {
                return Err(AnnError::invalid("leaf_max_size must be at least 1"));
            }
            if !self.distance.supports_kdtree() {
                return Err(AnnError::invalid(format!(
                    "{} distance cannot be used with KD-trees",
                    self.distance
                )));
            }
        }
        if uses_kmeans {
            if self.branching < 2 {
                return Err(AnnError::invalid(format!(
                    "branching must be at least 2, got {}",
                    self.branching
                )));
            }
            if !(self.cb_index >= 0.0) {
                return Err(AnnError::invalid("cb_index must be >= 0"));
            }
            if !self.distance.is_vector_space() {
                return Err(AnnError::invalid(format!(
                    "{} distance cannot be used with k-means centers",
                    self.distance
                )));
            }
        }
        if self.algorithm == Algorithm::Hierarchical {
            if self.trees == 0 {
                return Err(AnnError::invalid("trees must be at least 1"));
            }
            if self.branching < 2 {
                return Err(AnnError::invalid(format!(
                    "branching must be at least 2, got {}",
                    self.branching
                )));
            }
            if self.leaf_max_size == 0 {
                return Err(AnnError::invalid("leaf_max_size must be at least 1"));
            }
        }
        if self.algorithm == Algorithm::Lsh {
            if self.table_number == 0 {
                return Err(AnnError::invalid("table_number must be at least 1"));
            }
            if !(1..=32).contains(&self.key_size) {
                return Err(AnnError::invalid(format!(
                    "key_size must be in 1..=32, got {}",
                    self.key_size
                )));
            }
            check_mask_budget(self.key_size, self.multi_probe_level)?;
        }
        if self.algorithm == Algorithm::Autotuned {
            if !(self.target_precision > 0.0 && self.target_precision <= 1.0) {
                return Err(AnnError::invalid("target_precision must be in (0, 1]"));
            }
            if !(self.sample_fraction > 0.0 && self.sample_fraction <= 1.0) {
                return Err(AnnError::invalid("sample_fraction must be in (0, 1]"));
            }
            if !(self.build_weight >= 0.0 && self.memory_weight >= 0.0) {
                return Err(AnnError::invalid("cost weights must be >= 0"));
            }
        }
        Ok(())
    }

    /// Encode as JSON.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serialization::to_json(self)
    }

    /// Decode from JSON and validate.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let params: Parameters = serialization::from_json(bytes)?;
        params.validate()?;
        Ok(params)
    }

    pub(crate) fn kmeans_iterations(&self) -> usize {
        self.iterations.unwrap_or(MAX_KMEANS_ITERATIONS)
    }
}

/// Per-call search settings, by default taken from the index [`Parameters`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchParams {
    pub checks: Checks,
    pub eps: f32,
    pub sorted: bool,
    pub max_neighbors: Option<usize>,
    pub cores: usize,
}

impl Default for SearchParams {
    fn default() -> Self {
        SearchParams::from(&Parameters::default())
    }
}

impl From<&Parameters> for SearchParams {
    fn from(p: &Parameters) -> Self {
        Self {
            checks: p.checks,
            eps: p.eps,
            sorted: p.sorted,
            max_neighbors: p.max_neighbors,
            cores: p.cores,
        }
    }
}

impl SearchParams {
    pub fn new(checks: Checks) -> Self {
        Self {
            checks,
            ..Self::default()
        }
    }

    pub fn with_eps(mut self, eps: f32) -> Self {
        self.eps = eps;
        self
    }

    pub fn with_cores(mut self, cores: usize) -> Self {
        self.cores = cores;
        self
    }

    pub fn with_sorted(mut self, sorted: bool) -> Self {
        self.sorted = sorted;
        self
    }

    pub fn with_max_neighbors(mut self, max: Option<usize>) -> Self {
        self.max_neighbors = max;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !(self.eps >= 0.0) {
            return Err(AnnError::invalid(format!("eps must be >= 0, got {}", self.eps)));
        }
        if self.checks == Checks::Exact(0) {
            return Err(AnnError::invalid("checks must be at least 1"));
        }
        Ok(())
    }

    /// Leaf-visit budget; `None` means unbounded.
    pub(crate) fn max_checks(&self, tuned: Option<usize>) -> Option<usize> {
        match self.checks {
            Checks::Unlimited => None,
            Checks::Exact(n) => Some(n),
            Checks::Autotuned => Some(tuned.unwrap_or(FALLBACK_CHECKS)),
        }
    }
}
