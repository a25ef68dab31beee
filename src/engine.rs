//! Handle-based operation set over owned indices.
//!
//! An [`Engine`] owns every index it builds or loads and hands out
//! [`IndexHandle`]s. Handles are never reused, so a freed handle keeps
//! failing with [`AnnError::InvalidHandle`]. Calls that mutate an index take
//! `&mut self`; searches take `&self` and may run concurrently.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ann_index::{self, Index, Neighbors};
use crate::clustering;
use crate::dataset::Dataset;
use crate::element::Element;
use crate::error::{AnnError, Result};
use crate::params::{Parameters, SearchParams};

/// Identifies an index owned by an [`Engine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexHandle(u64);

impl IndexHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for IndexHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Owner of all indices over element type `T`.
#[derive(Debug)]
pub struct Engine<T: Element> {
    indices: HashMap<IndexHandle, Index<T>>,
    next_handle: u64,
}

impl<T: Element> Default for Engine<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Element> Engine<T> {
    pub fn new() -> Self {
        Self {
            indices: HashMap::new(),
            next_handle: 1,
        }
    }

    /// Number of live handles.
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Build an index over a copy of a `rows x cols` row-major buffer.
    pub fn build(&mut self, points: &[T], rows: usize, cols: usize, params: &Parameters) -> Result<IndexHandle> {
        let index = Index::from_rows(points, rows, cols, params)?;
        Ok(self.register(index))
    }

    pub fn build_array(&mut self, points: ArrayView2<'_, T>, params: &Parameters) -> Result<IndexHandle> {
        let index = Index::from_array(points, params)?;
        Ok(self.register(index))
    }

    /// Take ownership of an index built elsewhere.
    pub fn insert(&mut self, index: Index<T>) -> IndexHandle {
        self.register(index)
    }

    pub fn index(&self, handle: IndexHandle) -> Result<&Index<T>> {
        self.indices
            .get(&handle)
            .ok_or(AnnError::InvalidHandle(handle.0))
    }

    pub fn index_mut(&mut self, handle: IndexHandle) -> Result<&mut Index<T>> {
        self.indices
            .get_mut(&handle)
            .ok_or(AnnError::InvalidHandle(handle.0))
    }

    /// Append row-major points; returns the number added.
    pub fn add_points(&mut self, handle: IndexHandle, points: &[T], rebuild_threshold: f32) -> Result<usize> {
        self.index_mut(handle)?
            .add_points_with_threshold(points, rebuild_threshold)
    }

    /// Remove one point; returns the number removed.
    pub fn remove_point(&mut self, handle: IndexHandle, id: usize) -> Result<usize> {
        self.index_mut(handle)?.remove_point(id)?;
        Ok(1)
    }

    pub fn get_point(&self, handle: IndexHandle, id: usize) -> Result<&[T]> {
        self.index(handle)?.get_point(id)
    }

    pub fn veclen(&self, handle: IndexHandle) -> Result<usize> {
        Ok(self.index(handle)?.veclen())
    }

    pub fn size(&self, handle: IndexHandle) -> Result<usize> {
        Ok(self.index(handle)?.len())
    }

    pub fn used_memory(&self, handle: IndexHandle) -> Result<usize> {
        Ok(self.index(handle)?.used_memory())
    }

    pub fn save_index(&self, handle: IndexHandle, path: impl AsRef<Path>) -> Result<()> {
        self.index(handle)?.save_file(path)
    }

    /// Load a saved index over a copy of the dataset it was saved with.
    pub fn load_index(
        &mut self,
        path: impl AsRef<Path>,
        points: &[T],
        rows: usize,
        cols: usize,
    ) -> Result<IndexHandle> {
        let dataset = Dataset::from_rows(rows, cols, points)?;
        let index = Index::load_file(path, dataset)?;
        Ok(self.register(index))
    }

    /// One-shot search without keeping an index around.
    pub fn find_nearest_neighbors(
        &self,
        points: &[T],
        rows: usize,
        cols: usize,
        queries: &[T],
        k: usize,
        params: &Parameters,
    ) -> Result<Vec<Neighbors<T>>> {
        ann_index::find_nearest_neighbors(Dataset::from_rows(rows, cols, points)?, queries, k, params)
    }

    pub fn find_nearest_neighbors_index(
        &self,
        handle: IndexHandle,
        queries: &[T],
        k: usize,
        search: &SearchParams,
    ) -> Result<Vec<Neighbors<T>>> {
        self.index(handle)?.knn_search_with(queries, k, search)
    }

    pub fn radius_search(
        &self,
        handle: IndexHandle,
        query: &[T],
        radius: T::Distance,
        search: &SearchParams,
    ) -> Result<Neighbors<T>> {
        self.index(handle)?.radius_search(query, radius, search)
    }

    /// Drop an index. The handle stays invalid afterwards.
    pub fn free_index(&mut self, handle: IndexHandle) -> Result<()> {
        self.indices
            .remove(&handle)
            .map(|_| debug!(handle = %handle, "Freed index"))
            .ok_or(AnnError::InvalidHandle(handle.0))
    }

    /// K-means centers of the given rows, one per output row. Under
    /// [`status`] the count is the number of centers produced, which may be
    /// below `clusters`.
    pub fn compute_cluster_centers(
        &self,
        points: &[T],
        rows: usize,
        cols: usize,
        clusters: usize,
        params: &Parameters,
    ) -> Result<Array2<T::Distance>> {
        let dataset = Dataset::from_rows(rows, cols, points)?;
        clustering::compute_cluster_centers(&dataset, clusters, params)
    }

    fn register(&mut self, index: Index<T>) -> IndexHandle {
        let handle = IndexHandle(self.next_handle);
        self.next_handle += 1;
        debug!(handle = %handle, algorithm = ?index.algorithm(), points = index.len(), "Registered index");
        self.indices.insert(handle, index);
        handle
    }
}

/// Values that report a count under the status-code convention.
pub trait Counted {
    fn count(&self) -> usize;
}

impl Counted for usize {
    fn count(&self) -> usize {
        *self
    }
}

impl Counted for () {
    fn count(&self) -> usize {
        0
    }
}

impl Counted for IndexHandle {
    fn count(&self) -> usize {
        1
    }
}

impl<V> Counted for Vec<V> {
    fn count(&self) -> usize {
        self.len()
    }
}

impl<V> Counted for &[V] {
    fn count(&self) -> usize {
        self.len()
    }
}

impl<V> Counted for Array2<V> {
    fn count(&self) -> usize {
        self.nrows()
    }
}

/// Non-negative count on success, the error's negative code on failure.
pub fn status<V: Counted>(result: &Result<V>) -> i64 {
    match result {
        Ok(v) => i64::try_from(v.count()).unwrap_or(i64::MAX),
        Err(e) => e.code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Checks;
    use tempfile::TempDir;

    fn grid() -> Vec<f32> {
        (0..10)
            .flat_map(|x| (0..10).map(move |y| [x as f32, y as f32]))
            .flatten()
            .collect()
    }

    #[test]
    fn test_handle_lifecycle() {
        let mut engine = Engine::<f32>::new();
        let h = engine.build(&grid(), 100, 2, &Parameters::kdtree(2)).unwrap();
        assert_eq!(engine.size(h).unwrap(), 100);
        assert_eq!(engine.veclen(h).unwrap(), 2);
        assert!(engine.used_memory(h).unwrap() > 0);

        engine.free_index(h).unwrap();
        assert!(matches!(engine.size(h), Err(AnnError::InvalidHandle(_))));
        assert!(matches!(engine.free_index(h), Err(AnnError::InvalidHandle(_))));

        let h2 = engine.build(&grid(), 100, 2, &Parameters::linear()).unwrap();
        assert_ne!(h, h2);
    }

    #[test]
    fn test_operations_through_handle() {
        let mut engine = Engine::<f32>::new();
        let h = engine.build(&grid(), 100, 2, &Parameters::kdtree(4)).unwrap();

        assert_eq!(engine.add_points(h, &[20.0, 20.0, 21.0, 21.0], 2.0).unwrap(), 2);
        assert_eq!(engine.get_point(h, 101).unwrap(), &[21.0, 21.0]);
        assert_eq!(engine.remove_point(h, 0).unwrap(), 1);
        assert_eq!(engine.size(h).unwrap(), 101);

        let search = SearchParams::new(Checks::Unlimited);
        let found = engine.find_nearest_neighbors_index(h, &[0.0, 0.0], 1, &search).unwrap();
        assert_ne!(found[0][0].id, 0);
        assert_eq!(found[0][0].distance, 1.0);

        let near = engine.radius_search(h, &[20.5, 20.5], 1.0, &search).unwrap();
        assert_eq!(near.len(), 2);
    }

    #[test]
    fn test_save_and_load_handles() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("grid.annx");
        let mut engine = Engine::<f32>::new();
        let points = grid();
        let h = engine.build(&points, 100, 2, &Parameters::kmeans(4, Some(5))).unwrap();
        engine.save_index(h, &path).unwrap();

        let loaded = engine.load_index(&path, &points, 100, 2).unwrap();
        let search = SearchParams::default();
        assert_eq!(
            engine.find_nearest_neighbors_index(h, &[3.2, 4.9], 3, &search).unwrap()[0]
                .iter()
                .map(|n| n.id)
                .collect::<Vec<_>>(),
            engine.find_nearest_neighbors_index(loaded, &[3.2, 4.9], 3, &search).unwrap()[0]
                .iter()
                .map(|n| n.id)
                .collect::<Vec<_>>()
        );

        let mut shifted = points.clone();
        shifted[0] = 99.0;
        assert!(matches!(
            engine.load_index(&path, &shifted, 100, 2),
            Err(AnnError::DatasetMismatch(_))
        ));
    }

    #[test]
    fn test_status_codes() {
        let mut engine = Engine::<u8>::new();
        let built = engine.build(&[1, 2, 3, 4], 2, 2, &Parameters::linear());
        assert_eq!(status(&built), 1);
        let h = built.unwrap();
        assert_eq!(status(&engine.add_points(h, &[5, 6, 7, 8], 2.0)), 2);
        assert_eq!(status(&engine.add_points(h, &[5], 2.0)), -2);
        assert_eq!(status(&engine.remove_point(h, 77)), -7);
        assert_eq!(status(&engine.size(IndexHandle(999))), -3);
        assert_eq!(status(&engine.build(&[1, 2, 3], 2, 2, &Parameters::linear())), -1);
    }

    #[test]
    fn test_transient_search_and_clustering() {
        let engine = Engine::<f64>::new();
        let points = [0.0, 0.1, 10.0, 10.1];
        let found = engine
            .find_nearest_neighbors(&points, 4, 1, &[9.0], 2, &Parameters::linear())
            .unwrap();
        assert_eq!(found[0].iter().map(|n| n.id).collect::<Vec<_>>(), vec![2, 3]);

        let centers = engine
            .compute_cluster_centers(&points, 4, 1, 2, &Parameters::default())
            .unwrap();
        assert_eq!(status(&Ok::<_, AnnError>(centers)), 2);
        assert!(engine.is_empty());

        // Three distinct values among ten points: three centers come back.
        let repeated: Vec<f64> = (0..10).map(|i| (i % 3) as f64).collect();
        let produced = engine.compute_cluster_centers(&repeated, 10, 1, 5, &Parameters::default());
        assert_eq!(status(&produced), 3);
        assert_eq!(produced.unwrap().dim(), (3, 1));
    }
}
