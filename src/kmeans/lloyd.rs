//! Lloyd iterations over a subset of a dataset.

use crate::dataset::Dataset;
use crate::distance::DistanceMetric;
use crate::element::{DistanceValue, Element};

/// Outcome of a k-means pass over `ids`.
#[derive(Debug, Clone)]
pub(crate) struct Clustering<R> {
    pub(crate) centers: Vec<Vec<R>>,
    /// Cluster of `ids[i]`.
    pub(crate) assignment: Vec<usize>,
    pub(crate) iterations: usize,
}

impl<R> Clustering<R> {
    /// Members of each cluster, in `ids` order.
    pub(crate) fn members(&self, ids: &[usize]) -> Vec<Vec<usize>> {
        let mut groups = vec![Vec::new(); self.centers.len()];
        for (&id, &c) in ids.iter().zip(&self.assignment) {
            groups[c].push(id);
        }
        groups
    }
}

fn nearest<T: Element>(distance: DistanceMetric, point: &[T], centers: &[Vec<T::Distance>]) -> usize {
    let mut best = 0;
    let mut best_dist = <T::Distance as DistanceValue>::INFINITY;
    for (c, center) in centers.iter().enumerate() {
        let d = distance.eval_bounded(point, center, best_dist);
        if d < best_dist {
            best = c;
            best_dist = d;
        }
    }
    best
}

/// Overwrite each non-empty cluster's center with the mean of its members.
fn update_centers<T: Element>(
    dataset: &Dataset<T>,
    ids: &[usize],
    assignment: &[usize],
    counts: &[usize],
    centers: &mut [Vec<T::Distance>],
) {
    let zero = <T::Distance as DistanceValue>::ZERO;
    let mut sums = vec![vec![zero; dataset.dimension()]; centers.len()];
    for (&id, &c) in ids.iter().zip(assignment) {
        for (acc, v) in sums[c].iter_mut().zip(dataset.row(id)) {
            *acc += v.to_distance();
        }
    }
    for ((center, sum), &count) in centers.iter_mut().zip(sums).zip(counts) {
        if count > 0 {
            let n = <T::Distance as DistanceValue>::from_usize(count);
            *center = sum.into_iter().map(|v| v / n).collect();
        }
    }
}

/// Give every empty cluster one point taken from the next cluster that holds
/// more than one. Returns whether anything moved.
fn fill_empty(assignment: &mut [usize], counts: &mut [usize]) -> bool {
    let n = assignment.len();
    let mut moved = false;
    for c in 0..counts.len() {
        if counts[c] != 0 {
            continue;
        }
        let mut j = (c + 1) % n;
        while counts[assignment[j]] <= 1 {
            j = (j + 1) % n;
        }
        counts[assignment[j]] -= 1;
        counts[c] += 1;
        assignment[j] = c;
        moved = true;
    }
    moved
}

/// Refine `centers` for at most `max_iterations` rounds or until no point
/// changes cluster. A cluster that becomes empty takes one point from the
/// next cluster holding more than one.
///
/// Requires `ids.len() >= centers.len()`.
pub(crate) fn lloyd<T: Element>(
    dataset: &Dataset<T>,
    ids: &[usize],
    mut centers: Vec<Vec<T::Distance>>,
    max_iterations: usize,
    distance: DistanceMetric,
) -> Clustering<T::Distance> {
    let k = centers.len();
    let mut assignment: Vec<usize> = ids
        .iter()
        .map(|&id| nearest(distance, dataset.row(id), &centers))
        .collect();
    let mut counts = vec![0usize; k];
    for &c in &assignment {
        counts[c] += 1;
    }
    fill_empty(&mut assignment, &mut counts);

    let mut iterations = 0;
    let mut converged = false;
    while !converged && iterations < max_iterations {
        converged = true;
        iterations += 1;

        update_centers(dataset, ids, &assignment, &counts, &mut centers);

        for (i, &id) in ids.iter().enumerate() {
            let c = nearest(distance, dataset.row(id), &centers);
            if c != assignment[i] {
                counts[assignment[i]] -= 1;
                counts[c] += 1;
                assignment[i] = c;
                converged = false;
            }
        }

        if fill_empty(&mut assignment, &mut counts) {
            converged = false;
        }
    }

    // Centers always describe the final assignment.
    update_centers(dataset, ids, &assignment, &counts, &mut centers);

    Clustering {
        centers,
        assignment,
        iterations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use crate::element::to_distance_row;

    #[test]
    fn test_two_clusters_converge() {
        let ds = Dataset::from_flat(1, vec![0.0f32, 1.0, 2.0, 10.0, 11.0, 12.0]).unwrap();
        let ids: Vec<usize> = (0..6).collect();
        let init = vec![to_distance_row(ds.row(0)), to_distance_row(ds.row(1))];
        let result = lloyd(&ds, &ids, init, 100, DistanceMetric::Euclidean);
        let mut centers: Vec<f32> = result.centers.iter().map(|c| c[0]).collect();
        centers.sort_by(f32::total_cmp);
        assert_relative_eq!(centers[0], 1.0, epsilon = 1e-6);
        assert_relative_eq!(centers[1], 11.0, epsilon = 1e-6);
        assert!(result.iterations < 100);

        let members = result.members(&ids);
        assert_eq!(members.iter().map(Vec::len).sum::<usize>(), 6);
    }

    #[test]
    fn test_empty_cluster_is_refilled() {
        // The second starting center is far from every point.
        let ds = Dataset::from_flat(1, vec![0.0f32, 0.1, 0.2, 0.3]).unwrap();
        let ids: Vec<usize> = (0..4).collect();
        let init = vec![vec![0.0f32], vec![1000.0f32]];
        let result = lloyd(&ds, &ids, init, 5, DistanceMetric::Euclidean);
        let members = result.members(&ids);
        assert!(members.iter().all(|m| !m.is_empty()));
    }

    #[test]
    fn test_zero_iterations_keeps_assignment() {
        let ds = Dataset::from_flat(1, vec![0.0f32, 5.0, 10.0]).unwrap();
        let ids = vec![0, 1, 2];
        let init = vec![vec![0.0f32], vec![10.0f32]];
        let result = lloyd(&ds, &ids, init, 0, DistanceMetric::Euclidean);
        assert_eq!(result.iterations, 0);
        assert_eq!(result.assignment[0], 0);
        assert_eq!(result.assignment[2], 1);
    }
}
