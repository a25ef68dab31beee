//! Closed set of search structures behind one [`NnIndex`] implementation.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::composite::CompositeIndex;
use crate::dataset::Dataset;
use crate::element::{DistanceValue, Element};
use crate::error::{AnnError, Result};
use crate::hierarchical::HierarchicalIndex;
use crate::index::{NnIndex, SearchBudget};
use crate::kdtree::KdForest;
use crate::kmeans::KMeansTree;
use crate::linear::LinearIndex;
use crate::lsh::LshIndex;
use crate::params::{Algorithm, Parameters};
use crate::result_set::ResultSet;

/// The backend an index resolved to when it was built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Backend<R> {
    Linear(LinearIndex),
    KdTree(KdForest<R>),
    KMeans(KMeansTree<R>),
    Lsh(LshIndex<R>),
    Composite(CompositeIndex<R>),
    Hierarchical(HierarchicalIndex<R>),
}

macro_rules! dispatch {
    ($self:expr, $inner:ident => $body:expr) => {
        match $self {
            Backend::Linear($inner) => $body,
            Backend::KdTree($inner) => $body,
            Backend::KMeans($inner) => $body,
            Backend::Lsh($inner) => $body,
            Backend::Composite($inner) => $body,
            Backend::Hierarchical($inner) => $body,
        }
    };
}

impl<R: DistanceValue> Backend<R> {
    /// Largest point ID the structure refers to; `None` when it holds none.
    pub(crate) fn max_point_id(&self) -> Option<usize> {
        match self {
            Backend::Linear(_) => None,
            Backend::KdTree(b) => b.max_point_id(),
            Backend::KMeans(b) => b.max_point_id(),
            Backend::Lsh(b) => b.max_point_id(),
            Backend::Composite(b) => b.max_point_id(),
            Backend::Hierarchical(b) => b.max_point_id(),
        }
    }
}

impl<R: DistanceValue> NnIndex<R> for Backend<R> {
    /// `params.algorithm` must already be concrete; autotuning is resolved
    /// by the caller.
    fn build<T: Element<Distance = R>>(dataset: &Dataset<T>, params: &Parameters) -> Result<Self> {
        Ok(match params.algorithm {
            Algorithm::Linear => Backend::Linear(<LinearIndex as NnIndex<R>>::build(dataset, params)?),
            Algorithm::KdTree | Algorithm::KdTreeSingle => Backend::KdTree(KdForest::build(dataset, params)?),
            Algorithm::KMeans => Backend::KMeans(KMeansTree::build(dataset, params)?),
            Algorithm::Lsh => Backend::Lsh(LshIndex::build(dataset, params)?),
            Algorithm::Composite => Backend::Composite(CompositeIndex::build(dataset, params)?),
            Algorithm::Hierarchical => Backend::Hierarchical(HierarchicalIndex::build(dataset, params)?),
            Algorithm::Autotuned => {
                return Err(AnnError::invalid("autotuned parameters must be resolved before building"))
            }
        })
    }

    fn algorithm(&self) -> Algorithm {
        dispatch!(self, b => NnIndex::<R>::algorithm(b))
    }

    fn add_points<T: Element<Distance = R>>(&mut self, dataset: &Dataset<T>, ids: Range<usize>) -> Result<()> {
        dispatch!(self, b => NnIndex::<R>::add_points(b, dataset, ids))
    }

    fn remove_point<T: Element<Distance = R>>(&mut self, dataset: &Dataset<T>, id: usize) {
        dispatch!(self, b => NnIndex::<R>::remove_point(b, dataset, id))
    }

    fn find_neighbors<T, S>(&self, dataset: &Dataset<T>, query: &[T], result: &mut S, budget: &SearchBudget)
    where
        T: Element<Distance = R>,
        S: ResultSet<R>,
    {
        dispatch!(self, b => NnIndex::<R>::find_neighbors(b, dataset, query, result, budget))
    }

    fn used_memory(&self) -> usize {
        dispatch!(self, b => NnIndex::<R>::used_memory(b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::DistanceMetric;

    #[test]
    fn test_build_resolves_variant() {
        let ds = Dataset::from_flat(2, (0..200).map(|v| v as f32).collect()).unwrap();
        let cases = [
            (Parameters::linear(), Algorithm::Linear),
            (Parameters::kdtree(2), Algorithm::KdTree),
            (Parameters::kdtree_single(4), Algorithm::KdTreeSingle),
            (Parameters::kmeans(4, Some(5)), Algorithm::KMeans),
            (Parameters::lsh(2, 8, 1), Algorithm::Lsh),
            (Parameters::composite(2, 4), Algorithm::Composite),
            (Parameters::hierarchical(2, 4), Algorithm::Hierarchical),
        ];
        for (params, expected) in cases {
            let backend = Backend::<f32>::build(&ds, &params).unwrap();
            assert_eq!(backend.algorithm(), expected);
        }
    }

    #[test]
    fn test_autotuned_is_rejected() {
        let ds = Dataset::from_flat(1, vec![1.0f32, 2.0]).unwrap();
        let params = Parameters::autotuned(0.9, 0.01, 0.0, 0.1);
        assert!(matches!(
            Backend::<f32>::build(&ds, &params),
            Err(AnnError::InvalidParameters(_))
        ));
    }

    #[test]
    fn test_linear_uses_no_memory() {
        let ds = Dataset::from_flat(1, vec![1u8, 2, 3]).unwrap();
        let params = Parameters::linear().with_distance(DistanceMetric::Hamming);
        let backend = Backend::<f32>::build(&ds, &params).unwrap();
        assert_eq!(backend.used_memory(), 0);
    }
}
