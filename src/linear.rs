//! Brute-force linear index: exact O(n) k-NN search

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::dataset::Dataset;
use crate::distance::DistanceMetric;
use crate::element::{DistanceValue, Element};
use crate::error::Result;
use crate::index::{NnIndex, SearchBudget};
use crate::params::{Algorithm, Parameters};
use crate::result_set::ResultSet;

/// A linear index that computes the distance to every live point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearIndex {
    distance: DistanceMetric,
}

impl LinearIndex {
    pub fn new(distance: DistanceMetric) -> Self {
        Self { distance }
    }

    pub fn metric(&self) -> DistanceMetric {
        self.distance
    }
}

impl<R: DistanceValue> NnIndex<R> for LinearIndex {
    fn build<T: Element<Distance = R>>(_dataset: &Dataset<T>, params: &Parameters) -> Result<Self> {
        Ok(Self::new(params.distance))
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::Linear
    }

    fn add_points<T: Element<Distance = R>>(
        &mut self,
        _dataset: &Dataset<T>,
        _ids: Range<usize>,
    ) -> Result<()> {
        Ok(())
    }

    fn remove_point<T: Element<Distance = R>>(&mut self, _dataset: &Dataset<T>, _id: usize) {}

    fn find_neighbors<T, S>(&self, dataset: &Dataset<T>, query: &[T], result: &mut S, _budget: &SearchBudget)
    where
        T: Element<Distance = R>,
        S: ResultSet<R>,
    {
        for id in dataset.live_ids() {
            let dist = self
                .distance
                .eval_bounded(query, dataset.row(id), result.worst_dist());
            result.add_point(dist, id);
        }
    }

    fn used_memory(&self) -> usize {
        0
    }
}
