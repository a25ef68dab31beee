//! Standalone k-means over a dataset.

use ndarray::Array2;
use tracing::debug;

use crate::dataset::Dataset;
use crate::element::{to_distance_row, DistanceValue, Element};
use crate::error::{AnnError, Result};
use crate::kmeans::centers::choose_centers;
use crate::kmeans::lloyd::lloyd;
use crate::parallel::stream_rng;
use crate::params::Parameters;

/// Cluster the live points of `dataset` into at most `clusters` groups and
/// return the centers, one per row.
///
/// Seeding follows `params.centers_init` and `params.random_seed`; Lloyd
/// iterations are capped by `params.iterations`. The row count is the number
/// of centers produced, which is below `clusters` when the data holds fewer
/// distinct points than requested.
pub fn compute_cluster_centers<T: Element>(
    dataset: &Dataset<T>,
    clusters: usize,
    params: &Parameters,
) -> Result<Array2<T::Distance>> {
    params.validate()?;
    if clusters == 0 {
        return Err(AnnError::invalid("cluster count must be at least 1"));
    }
    if !params.distance.is_vector_space() {
        return Err(AnnError::invalid(format!(
            "{} distance cannot be used with k-means centers",
            params.distance
        )));
    }
    let cols = dataset.dimension();
    let ids: Vec<usize> = dataset.live_ids().collect();
    let mut rng = stream_rng(params.random_seed, 0);
    let seeds = choose_centers(params.centers_init, clusters, dataset, &ids, params.distance, &mut rng);
    if seeds.is_empty() {
        return Ok(Array2::from_elem((0, cols), <T::Distance as DistanceValue>::ZERO));
    }

    let initial = seeds.iter().map(|&id| to_distance_row(dataset.row(id))).collect();
    let clustering = lloyd(dataset, &ids, initial, params.kmeans_iterations(), params.distance);
    debug!(
        requested = clusters,
        found = clustering.centers.len(),
        iterations = clustering.iterations,
        "Computed cluster centers"
    );

    let rows = clustering.centers.len();
    let flat: Vec<T::Distance> = clustering.centers.into_iter().flatten().collect();
    Array2::from_shape_vec((rows, cols), flat).map_err(|e| AnnError::invalid(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::DistanceMetric;
    use crate::params::CentersInit;
    use approx::assert_abs_diff_eq;

    fn two_blobs() -> Dataset<f64> {
        let mut data = Vec::new();
        for i in 0..50 {
            let jitter = (i % 5) as f64 * 0.01;
            data.extend_from_slice(&[jitter, jitter]);
            data.extend_from_slice(&[10.0 + jitter, 10.0 - jitter]);
        }
        Dataset::from_flat(2, data).unwrap()
    }

    #[test]
    fn test_two_clusters_found() {
        let params = Parameters::kmeans(2, Some(20)).with_centers_init(CentersInit::KMeansPP);
        let centers = compute_cluster_centers(&two_blobs(), 2, &params).unwrap();
        assert_eq!(centers.dim(), (2, 2));
        let mut xs: Vec<f64> = centers.column(0).to_vec();
        xs.sort_by(f64::total_cmp);
        assert_abs_diff_eq!(xs[0], 0.02, epsilon = 1e-9);
        assert_abs_diff_eq!(xs[1], 10.02, epsilon = 1e-9);
    }

    #[test]
    fn test_fewer_distinct_points_than_requested() {
        let ds = Dataset::from_flat(1, vec![1.0f32, 1.0, 2.0, 2.0]).unwrap();
        let centers = compute_cluster_centers(&ds, 5, &Parameters::default()).unwrap();
        assert_eq!(centers.nrows(), 2);
    }

    #[test]
    fn test_rejects_bad_input() {
        let ds = two_blobs();
        assert!(compute_cluster_centers(&ds, 0, &Parameters::default()).is_err());
        let hamming = Parameters::default().with_distance(DistanceMetric::Hamming);
        assert!(compute_cluster_centers(&ds, 2, &hamming).is_err());
        let negative_eps = Parameters::kmeans(2, Some(5)).with_eps(-1.0);
        assert!(matches!(
            compute_cluster_centers(&ds, 2, &negative_eps),
            Err(AnnError::InvalidParameters(_))
        ));
        let bad_order = Parameters::linear().with_distance(DistanceMetric::Minkowski { order: -2.0 });
        assert!(matches!(
            compute_cluster_centers(&ds, 2, &bad_order),
            Err(AnnError::InvalidParameters(_))
        ));
    }

    #[test]
    fn test_integer_points_give_float_centers() {
        let ds = Dataset::from_flat(1, vec![0u8, 2, 100, 102]).unwrap();
        let params = Parameters::default().with_centers_init(CentersInit::Gonzales);
        let centers = compute_cluster_centers(&ds, 2, &params).unwrap();
        let mut xs: Vec<f32> = centers.iter().copied().collect();
        xs.sort_by(f32::total_cmp);
        assert_eq!(xs, vec![1.0, 101.0]);
    }
}
