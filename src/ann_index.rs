//! The owned index handle: a dataset plus the search structure built over it.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::autotune::{autotune, AutotuneReport};
use crate::backend::Backend;
use crate::dataset::{Dataset, DatasetFingerprint};
use crate::element::{DistanceValue, Element};
use crate::error::{AnnError, Result};
use crate::index::{NnIndex, SearchBudget};
use crate::linear::LinearIndex;
use crate::parallel::parallel_map;
use crate::params::{Algorithm, Parameters, SearchParams};
use crate::persistence::index_file;
use crate::result_set::{KnnResultSet, Neighbor, RadiusResultSet, ResultSet};

/// Nearest-neighbor results for one query, closest first when sorted.
pub type Neighbors<T> = Vec<Neighbor<<T as Element>::Distance>>;

/// A searchable index over points of element type `T`.
///
/// The index owns its dataset. Point IDs are row numbers and stay stable
/// across insertions, removals and rebuilds.
#[derive(Debug, Clone)]
pub struct Index<T: Element> {
    dataset: Dataset<T>,
    /// Parameters with the algorithm resolved (never `Autotuned`).
    params: Parameters,
    backend: Backend<T::Distance>,
    autotune: Option<AutotuneReport>,
    /// Live points when the structure was last built from scratch.
    built_size: usize,
    added_since_build: usize,
    rebuild_count: usize,
}

#[derive(Serialize)]
struct IndexImageRef<'a, R> {
    header: ImageHeader,
    params: &'a Parameters,
    removed: Vec<usize>,
    autotune: &'a Option<AutotuneReport>,
    built_size: usize,
    added_since_build: usize,
    rebuild_count: usize,
    backend: &'a Backend<R>,
}

// Leading fields of an image, checked before the topology is decoded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct ImageHeader {
    type_tag: u8,
    fingerprint: DatasetFingerprint,
}

#[derive(Deserialize)]
struct IndexImage<R> {
    header: ImageHeader,
    params: Parameters,
    removed: Vec<usize>,
    autotune: Option<AutotuneReport>,
    built_size: usize,
    added_since_build: usize,
    rebuild_count: usize,
    backend: Backend<R>,
}

impl<T: Element> Index<T> {
    /// Build an index over `dataset`.
    ///
    /// With `Algorithm::Autotuned` a configuration is chosen on a sample of
    /// the data first; see [`Index::autotune_report`].
    pub fn build(dataset: Dataset<T>, params: &Parameters) -> Result<Self> {
        params.validate()?;
        let (params, report) = if params.algorithm == Algorithm::Autotuned {
            let (resolved, report) = autotune(&dataset, params)?;
            resolved.validate()?;
            (resolved, Some(report))
        } else {
            (params.clone(), None)
        };

        let backend = Backend::build(&dataset, &params)?;
        debug!(
            algorithm = ?params.algorithm,
            points = dataset.len(),
            dimension = dataset.dimension(),
            memory = backend.used_memory(),
            "Built index"
        );
        Ok(Self {
            built_size: dataset.len(),
            dataset,
            params,
            backend,
            autotune: report,
            added_since_build: 0,
            rebuild_count: 0,
        })
    }

    /// Build over a copy of a `rows x cols` row-major buffer.
    pub fn from_rows(points: &[T], rows: usize, cols: usize, params: &Parameters) -> Result<Self> {
        Self::build(Dataset::from_rows(rows, cols, points)?, params)
    }

    /// Build over a copy of a 2-D array (one point per row).
    pub fn from_array(points: ArrayView2<'_, T>, params: &Parameters) -> Result<Self> {
        Self::build(Dataset::from_array(points)?, params)
    }

    /// Append points using the configured rebuild threshold.
    pub fn add_points(&mut self, points: &[T]) -> Result<usize> {
        self.add_points_with_threshold(points, self.params.rebuild_threshold)
    }

    /// Append row-major `points` and return how many were added.
    ///
    /// Once the rows added since the last full build exceed
    /// `rebuild_threshold` times the live size at that build, the structure
    /// is rebuilt from scratch with the same parameters; otherwise the new
    /// points are inserted in place.
    pub fn add_points_with_threshold(&mut self, points: &[T], rebuild_threshold: f32) -> Result<usize> {
        if !(rebuild_threshold >= 0.0) {
            return Err(AnnError::invalid("rebuild_threshold must be >= 0"));
        }
        let ids = self.dataset.push_rows(points)?;
        let added = ids.len();
        if added == 0 {
            return Ok(0);
        }
        let first = ids.start;
        self.added_since_build += added;

        let growth = self.added_since_build as f64 / self.built_size.max(1) as f64;
        let outcome = if growth > rebuild_threshold as f64 {
            self.rebuild()
        } else {
            self.backend.add_points(&self.dataset, ids)
        };
        if let Err(e) = outcome {
            // `rebuild` only replaces the backend on success.
            self.dataset.truncate(first);
            self.added_since_build -= added;
            warn!(error = %e, rows = added, "Insertion failed; appended rows dropped");
            return Err(e);
        }
        Ok(added)
    }

    /// Rebuild the structure over the live points with unchanged parameters.
    pub fn rebuild(&mut self) -> Result<()> {
        self.backend = Backend::build(&self.dataset, &self.params)?;
        self.built_size = self.dataset.len();
        self.added_since_build = 0;
        self.rebuild_count += 1;
        info!(
            algorithm = ?self.params.algorithm,
            points = self.built_size,
            rebuilds = self.rebuild_count,
            "Rebuilt index"
        );
        Ok(())
    }

    /// Tombstone point `id`; it is never reported again.
    pub fn remove_point(&mut self, id: usize) -> Result<()> {
        self.dataset.remove(id)?;
        self.backend.remove_point(&self.dataset, id);
        Ok(())
    }

    pub fn get_point(&self, id: usize) -> Result<&[T]> {
        self.dataset.get(id).ok_or(AnnError::NotFound { id })
    }

    /// Dimensionality of the indexed points.
    pub fn veclen(&self) -> usize {
        self.dataset.dimension()
    }

    /// Number of live points.
    pub fn len(&self) -> usize {
        self.dataset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    /// Bytes held by the search structure and the point storage.
    pub fn used_memory(&self) -> usize {
        self.backend.used_memory() + self.dataset.used_memory()
    }

    /// The algorithm actually in use (resolved when autotuned).
    pub fn algorithm(&self) -> Algorithm {
        self.backend.algorithm()
    }

    pub fn parameters(&self) -> &Parameters {
        &self.params
    }

    pub fn dataset(&self) -> &Dataset<T> {
        &self.dataset
    }

    pub fn autotune_report(&self) -> Option<&AutotuneReport> {
        self.autotune.as_ref()
    }

    /// Full rebuilds triggered by insertions (or explicit calls) so far.
    pub fn rebuild_count(&self) -> usize {
        self.rebuild_count
    }

    /// `k` nearest neighbors of one query, using the index parameters.
    pub fn search(&self, query: &[T], k: usize) -> Result<Neighbors<T>> {
        self.search_with(query, k, &SearchParams::from(&self.params))
    }

    pub fn search_with(&self, query: &[T], k: usize, search: &SearchParams) -> Result<Neighbors<T>> {
        search.validate()?;
        self.check_query(query)?;
        Ok(self.knn_one(query, k, &self.budget(search), search.sorted))
    }

    /// `k` nearest neighbors of each row of a row-major query batch.
    pub fn knn_search(&self, queries: &[T], k: usize) -> Result<Vec<Neighbors<T>>> {
        self.knn_search_with(queries, k, &SearchParams::from(&self.params))
    }

    /// Batch search; rows are spread over `search.cores` workers and the
    /// results do not depend on the worker count.
    pub fn knn_search_with(&self, queries: &[T], k: usize, search: &SearchParams) -> Result<Vec<Neighbors<T>>> {
        search.validate()?;
        let cols = self.veclen();
        if queries.len() % cols != 0 {
            return Err(AnnError::DimensionMismatch {
                expected: cols,
                actual: queries.len() % cols,
            });
        }
        let budget = self.budget(search);
        let rows = queries.len() / cols;
        parallel_map(search.cores, rows, |i| {
            self.knn_one(&queries[i * cols..(i + 1) * cols], k, &budget, search.sorted)
        })
    }

    /// Batch search over an array of queries, returning `rows x k` matrices
    /// of IDs and distances. Missing entries hold `-1` and infinity.
    pub fn knn_search_array(
        &self,
        queries: ArrayView2<'_, T>,
        k: usize,
        search: &SearchParams,
    ) -> Result<(Array2<i64>, Array2<T::Distance>)> {
        search.validate()?;
        if queries.ncols() != self.veclen() {
            return Err(AnnError::DimensionMismatch {
                expected: self.veclen(),
                actual: queries.ncols(),
            });
        }
        let budget = self.budget(search);
        let found = parallel_map(search.cores, queries.nrows(), |i| {
            let query: Vec<T> = queries.row(i).iter().copied().collect();
            self.knn_one(&query, k, &budget, search.sorted)
        })?;

        let mut indices = Array2::from_elem((queries.nrows(), k), -1i64);
        let mut dists = Array2::from_elem((queries.nrows(), k), <T::Distance as DistanceValue>::INFINITY);
        for (row, neighbors) in found.iter().enumerate() {
            for (col, n) in neighbors.iter().enumerate() {
                indices[[row, col]] = n.id as i64;
                dists[[row, col]] = n.distance;
            }
        }
        Ok((indices, dists))
    }

    /// Every live point within `radius` of `query` (in the metric's own
    /// units, so squared for Euclidean), capped at `search.max_neighbors`.
    pub fn radius_search(&self, query: &[T], radius: T::Distance, search: &SearchParams) -> Result<Neighbors<T>> {
        search.validate()?;
        self.check_query(query)?;
        if !(radius >= <T::Distance as DistanceValue>::ZERO) {
            return Err(AnnError::invalid("radius must be >= 0"));
        }
        let mut result = RadiusResultSet::new(radius, search.max_neighbors);
        self.backend
            .find_neighbors(&self.dataset, query, &mut result, &self.budget(search));
        Ok(if search.sorted {
            result.into_sorted_vec()
        } else {
            result.into_vec()
        })
    }

    /// Write the index (never the point data) to `writer`.
    pub fn save_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let image = IndexImageRef {
            header: ImageHeader {
                type_tag: T::TYPE_TAG,
                fingerprint: self.dataset.fingerprint(),
            },
            params: &self.params,
            removed: self.dataset.removed_ids(),
            autotune: &self.autotune,
            built_size: self.built_size,
            added_since_build: self.added_since_build,
            rebuild_count: self.rebuild_count,
            backend: &self.backend,
        };
        index_file::write_frame(writer, &image)
    }

    pub fn save_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path.as_ref())?);
        self.save_to(&mut writer)?;
        debug!(path = %path.as_ref().display(), "Saved index");
        Ok(())
    }

    /// Restore an index saved by [`Index::save_to`] over the same dataset.
    ///
    /// `dataset` must hold exactly the rows the index was saved with; points
    /// removed before saving are removed from it again.
    pub fn load_from<Rd: Read>(reader: &mut Rd, mut dataset: Dataset<T>) -> Result<Self> {
        let payload = index_file::read_payload(reader)?;
        let header: ImageHeader = index_file::decode_payload(&payload)?;
        if header.type_tag != T::TYPE_TAG {
            return Err(AnnError::DatasetMismatch(format!(
                "Index was saved for element type tag {}, loading as {} ({})",
                header.type_tag,
                T::TYPE_TAG,
                T::NAME
            )));
        }
        let fingerprint = dataset.fingerprint();
        if fingerprint != header.fingerprint {
            return Err(AnnError::DatasetMismatch(format!(
                "Index was saved over {} x {} points (checksum {:08x}), got {} x {} (checksum {:08x})",
                header.fingerprint.rows,
                header.fingerprint.cols,
                header.fingerprint.checksum,
                fingerprint.rows,
                fingerprint.cols,
                fingerprint.checksum
            )));
        }

        let image: IndexImage<T::Distance> = index_file::decode_payload(&payload)?;
        if image.params.algorithm == Algorithm::Autotuned {
            return Err(AnnError::CorruptIndex("Saved index has no resolved algorithm".to_string()));
        }
        if let Some(id) = image.backend.max_point_id().filter(|&id| id >= dataset.rows()) {
            return Err(AnnError::CorruptIndex(format!(
                "Index refers to point {} but the dataset has {} rows",
                id,
                dataset.rows()
            )));
        }
        for id in image.removed {
            if dataset.is_live(id) {
                dataset.remove(id)?;
            } else if id >= dataset.rows() {
                return Err(AnnError::CorruptIndex(format!("Removed ID {} is out of range", id)));
            }
        }
        debug!(
            algorithm = ?image.params.algorithm,
            rows = image.header.fingerprint.rows,
            removed = dataset.rows() - dataset.len(),
            "Loaded index"
        );
        Ok(Self {
            dataset,
            params: image.params,
            backend: image.backend,
            autotune: image.autotune,
            built_size: image.built_size,
            added_since_build: image.added_since_build,
            rebuild_count: image.rebuild_count,
        })
    }

    pub fn load_file(path: impl AsRef<Path>, dataset: Dataset<T>) -> Result<Self> {
        let mut reader = BufReader::new(File::open(path.as_ref())?);
        Self::load_from(&mut reader, dataset)
    }

    fn budget(&self, search: &SearchParams) -> SearchBudget {
        SearchBudget {
            max_checks: search.max_checks(self.autotune.as_ref().map(|r| r.checks)),
            eps: search.eps,
        }
    }

    fn check_query(&self, query: &[T]) -> Result<()> {
        if query.len() != self.veclen() {
            return Err(AnnError::DimensionMismatch {
                expected: self.veclen(),
                actual: query.len(),
            });
        }
        Ok(())
    }

    fn knn_one(&self, query: &[T], k: usize, budget: &SearchBudget, sorted: bool) -> Neighbors<T> {
        let mut result = KnnResultSet::new(k);
        self.backend
            .find_neighbors(&self.dataset, query, &mut result, budget);

        // Hash buckets and tight budgets can come up short of k; fill the
        // rest exactly.
        if result.len() < k.min(self.dataset.len()) {
            NnIndex::<T::Distance>::find_neighbors(
                &LinearIndex::new(self.params.distance),
                &self.dataset,
                query,
                &mut result,
                &SearchBudget::unlimited(),
            );
        }
        if sorted {
            result.into_sorted_vec()
        } else {
            result.into_vec()
        }
    }
}

/// Build a transient index over `dataset`, answer `queries` and drop it.
pub fn find_nearest_neighbors<T: Element>(
    dataset: Dataset<T>,
    queries: &[T],
    k: usize,
    params: &Parameters,
) -> Result<Vec<Neighbors<T>>> {
    let index = Index::build(dataset, params)?;
    index.knn_search(queries, k)
}
