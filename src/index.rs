//! Backend contract shared by every search structure.

use std::ops::Range;

use crate::dataset::Dataset;
use crate::element::{DistanceValue, Element};
use crate::error::Result;
use crate::params::{Algorithm, Parameters};
use crate::result_set::ResultSet;

/// Effort limits for a single query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchBudget {
    /// Leaf points to examine before stopping once the result set is full;
    /// `None` searches until the structure is exhausted.
    pub max_checks: Option<usize>,
    pub eps: f32,
}

impl SearchBudget {
    pub fn unlimited() -> Self {
        Self {
            max_checks: None,
            eps: 0.0,
        }
    }

    pub fn checks(n: usize) -> Self {
        Self {
            max_checks: Some(n),
            eps: 0.0,
        }
    }

    #[inline]
    pub(crate) fn exhausted(&self, checks: usize) -> bool {
        matches!(self.max_checks, Some(max) if checks >= max)
    }
}

/// A search structure built over a [`Dataset`] it does not own.
///
/// Backends store topology only; point data is always read from the dataset
/// passed in. IDs tombstoned in the dataset must never be reported.
pub trait NnIndex<R: DistanceValue> {
    /// Build the structure over all live points of `dataset`.
    fn build<T: Element<Distance = R>>(dataset: &Dataset<T>, params: &Parameters) -> Result<Self>
    where
        Self: Sized;

    fn algorithm(&self) -> Algorithm;

    /// Incorporate rows `ids`, which were just appended to `dataset`.
    ///
    /// On error the structure must not reference any of `ids`; the caller
    /// drops those rows again.
    fn add_points<T: Element<Distance = R>>(
        &mut self,
        dataset: &Dataset<T>,
        ids: Range<usize>,
    ) -> Result<()>;

    /// Forget a point that was just tombstoned in `dataset`.
    fn remove_point<T: Element<Distance = R>>(&mut self, dataset: &Dataset<T>, id: usize);

    /// Offer candidates for `query` to `result`.
    fn find_neighbors<T, S>(
        &self,
        dataset: &Dataset<T>,
        query: &[T],
        result: &mut S,
        budget: &SearchBudget,
    ) where
        T: Element<Distance = R>,
        S: ResultSet<R>;

    /// Bytes held by the structure, excluding point data.
    fn used_memory(&self) -> usize;
}
