//! K-means tree and randomized KD-forest searched as one index.

use std::ops::Range;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dataset::Dataset;
use crate::element::{DistanceValue, Element};
use crate::error::Result;
use crate::index::{NnIndex, SearchBudget};
use crate::kdtree::KdForest;
use crate::kmeans::KMeansTree;
use crate::parallel::effective_threads;
use crate::params::{Algorithm, Parameters};
use crate::result_set::ResultSet;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeIndex<R> {
    kmeans: KMeansTree<R>,
    kdtree: KdForest<R>,
}

impl<R: DistanceValue> CompositeIndex<R> {
    pub fn kmeans(&self) -> &KMeansTree<R> {
        &self.kmeans
    }

    pub fn kdtree(&self) -> &KdForest<R> {
        &self.kdtree
    }

    pub(crate) fn max_point_id(&self) -> Option<usize> {
        self.kmeans.max_point_id().max(self.kdtree.max_point_id())
    }
}

impl<R: DistanceValue> NnIndex<R> for CompositeIndex<R> {
    fn build<T: Element<Distance = R>>(dataset: &Dataset<T>, params: &Parameters) -> Result<Self> {
        let (kmeans, kdtree) = if effective_threads(params.cores) > 1 {
            rayon::join(
                || KMeansTree::build(dataset, params),
                || KdForest::build_forest(dataset, params),
            )
        } else {
            (KMeansTree::build(dataset, params), KdForest::build_forest(dataset, params))
        };
        let index = Self {
            kmeans: kmeans?,
            kdtree: kdtree?,
        };
        debug!(
            kmeans_nodes = index.kmeans.node_count(),
            trees = index.kdtree.tree_count(),
            "Built composite index"
        );
        Ok(index)
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::Composite
    }

    fn add_points<T: Element<Distance = R>>(&mut self, dataset: &Dataset<T>, ids: Range<usize>) -> Result<()> {
        self.kmeans.add_points(dataset, ids.clone())?;
        self.kdtree.add_points(dataset, ids)
    }

    fn remove_point<T: Element<Distance = R>>(&mut self, dataset: &Dataset<T>, id: usize) {
        self.kmeans.remove_point(dataset, id);
        self.kdtree.remove_point(dataset, id);
    }

    // Both structures feed one result set, which drops duplicate IDs.
    fn find_neighbors<T, S>(&self, dataset: &Dataset<T>, query: &[T], result: &mut S, budget: &SearchBudget)
    where
        T: Element<Distance = R>,
        S: ResultSet<R>,
    {
        self.kmeans.find_neighbors(dataset, query, result, budget);
        self.kdtree.find_neighbors(dataset, query, result, budget);
    }

    fn used_memory(&self) -> usize {
        self.kmeans.used_memory() + self.kdtree.used_memory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::DistanceMetric;
    use crate::linear::LinearIndex;
    use crate::result_set::KnnResultSet;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_dataset(n: usize, dim: usize, seed: u64) -> Dataset<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        let data: Vec<f32> = (0..n * dim).map(|_| rng.gen_range(0.0..1.0)).collect();
        Dataset::from_flat(dim, data).unwrap()
    }

    fn knn<I: NnIndex<f32>>(index: &I, ds: &Dataset<f32>, q: &[f32], k: usize, budget: SearchBudget) -> Vec<usize> {
        let mut rs = KnnResultSet::new(k);
        index.find_neighbors(ds, q, &mut rs, &budget);
        rs.into_sorted_vec().iter().map(|n| n.id).collect()
    }

    #[test]
    fn test_recall_at_least_kdtree_alone() {
        let ds = random_dataset(2000, 6, 1);
        let params = Parameters::composite(2, 8).with_seed(3);
        let composite = CompositeIndex::build(&ds, &params).unwrap();
        let linear = LinearIndex::new(DistanceMetric::Euclidean);
        let mut rng = StdRng::seed_from_u64(11);
        let (mut hits_composite, mut hits_kd) = (0, 0);
        for _ in 0..30 {
            let q: Vec<f32> = (0..6).map(|_| rng.gen_range(0.0..1.0)).collect();
            let truth = knn(&linear, &ds, &q, 5, SearchBudget::unlimited());
            let both = knn(&composite, &ds, &q, 5, SearchBudget::checks(16));
            let kd = knn(composite.kdtree(), &ds, &q, 5, SearchBudget::checks(16));
            hits_composite += both.iter().filter(|id| truth.contains(id)).count();
            hits_kd += kd.iter().filter(|id| truth.contains(id)).count();
        }
        assert!(hits_composite >= hits_kd);
    }

    #[test]
    fn test_parallel_build_matches_sequential() {
        let ds = random_dataset(500, 3, 2);
        let params = Parameters::composite(2, 4).with_seed(5);
        let a = CompositeIndex::build(&ds, &params).unwrap();
        let b = CompositeIndex::build(&ds, &params.clone().with_cores(2)).unwrap();
        let q = [0.5f32, 0.5, 0.5];
        assert_eq!(
            knn(&a, &ds, &q, 10, SearchBudget::checks(32)),
            knn(&b, &ds, &q, 10, SearchBudget::checks(32))
        );
    }

    #[test]
    fn test_no_duplicate_ids() {
        let ds = random_dataset(300, 2, 4);
        let index = CompositeIndex::build(&ds, &Parameters::composite(1, 4)).unwrap();
        let ids = knn(&index, &ds, &[0.2, 0.8], 20, SearchBudget::unlimited());
        let mut dedup = ids.clone();
        dedup.sort_unstable();
        dedup.dedup();
        assert_eq!(dedup.len(), ids.len());
        assert_eq!(ids.len(), 20);
    }
}
