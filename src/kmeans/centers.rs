//! Initial center selection for k-means.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::dataset::Dataset;
use crate::distance::DistanceMetric;
use crate::element::{DistanceValue, Element};
use crate::params::CentersInit;

/// Pick up to `k` distinct points of `ids` as initial centers.
///
/// Fewer than `k` IDs come back when the points do not contain `k` distinct
/// positions.
pub(crate) fn choose_centers<T: Element>(
    init: CentersInit,
    k: usize,
    dataset: &Dataset<T>,
    ids: &[usize],
    distance: DistanceMetric,
    rng: &mut StdRng,
) -> Vec<usize> {
    if ids.is_empty() || k == 0 {
        return Vec::new();
    }
    match init {
        CentersInit::Random => random(k, dataset, ids, distance, rng),
        CentersInit::Gonzales => gonzales(k, dataset, ids, distance, rng),
        CentersInit::KMeansPP => kmeans_pp(k, dataset, ids, distance, rng),
        CentersInit::Groupwise => groupwise(k, dataset, ids, distance, rng),
    }
}

fn is_duplicate<T: Element>(
    dataset: &Dataset<T>,
    centers: &[usize],
    candidate: usize,
    distance: DistanceMetric,
) -> bool {
    let tiny = <T::Distance as DistanceValue>::from_f64(1e-16);
    centers
        .iter()
        .any(|&c| distance.eval(dataset.row(c), dataset.row(candidate)) < tiny)
}

fn random<T: Element>(
    k: usize,
    dataset: &Dataset<T>,
    ids: &[usize],
    distance: DistanceMetric,
    rng: &mut StdRng,
) -> Vec<usize> {
    let mut order = ids.to_vec();
    order.shuffle(rng);
    let mut centers = Vec::with_capacity(k);
    for id in order {
        if centers.len() == k {
            break;
        }
        if !is_duplicate(dataset, &centers, id, distance) {
            centers.push(id);
        }
    }
    centers
}

/// Greedy farthest-point selection.
fn gonzales<T: Element>(
    k: usize,
    dataset: &Dataset<T>,
    ids: &[usize],
    distance: DistanceMetric,
    rng: &mut StdRng,
) -> Vec<usize> {
    let first = ids[rng.gen_range(0..ids.len())];
    let mut centers = vec![first];
    let mut closest: Vec<T::Distance> = ids
        .iter()
        .map(|&id| distance.eval(dataset.row(first), dataset.row(id)))
        .collect();

    while centers.len() < k {
        let mut best: Option<(usize, T::Distance)> = None;
        for (j, &d) in closest.iter().enumerate() {
            if d > <T::Distance as DistanceValue>::ZERO && best.map_or(true, |(_, b)| d > b) {
                best = Some((j, d));
            }
        }
        let Some((j, _)) = best else { break };
        let center = ids[j];
        centers.push(center);
        for (c, &id) in closest.iter_mut().zip(ids) {
            let d = distance.eval(dataset.row(center), dataset.row(id));
            if d < *c {
                *c = d;
            }
        }
    }
    centers
}

/// k-means++ seeding: each new center is drawn with probability
/// proportional to its distance from the nearest chosen center.
fn kmeans_pp<T: Element>(
    k: usize,
    dataset: &Dataset<T>,
    ids: &[usize],
    distance: DistanceMetric,
    rng: &mut StdRng,
) -> Vec<usize> {
    let first = ids[rng.gen_range(0..ids.len())];
    let mut centers = vec![first];
    let mut closest: Vec<f64> = ids
        .iter()
        .map(|&id| distance.eval(dataset.row(first), dataset.row(id)).to_f64())
        .collect();
    let mut potential: f64 = closest.iter().sum();

    while centers.len() < k && potential > 0.0 {
        let mut target = rng.gen::<f64>() * potential;
        let mut pick = ids.len() - 1;
        for (j, &d) in closest.iter().enumerate() {
            if target <= d && d > 0.0 {
                pick = j;
                break;
            }
            target -= d;
        }
        if closest[pick] <= 0.0 {
            match closest.iter().position(|&d| d > 0.0) {
                Some(j) => pick = j,
                None => break,
            }
        }
        let center = ids[pick];
        centers.push(center);
        for (c, &id) in closest.iter_mut().zip(ids) {
            let d = distance.eval(dataset.row(center), dataset.row(id)).to_f64();
            if d < *c {
                *c = d;
            }
        }
        potential = closest.iter().sum();
    }
    centers
}

/// Split a shuffled copy of the points into `k` groups and take, from each
/// group, the member nearest the group mean.
fn groupwise<T: Element>(
    k: usize,
    dataset: &Dataset<T>,
    ids: &[usize],
    distance: DistanceMetric,
    rng: &mut StdRng,
) -> Vec<usize> {
    let mut order = ids.to_vec();
    order.shuffle(rng);
    let groups = k.min(order.len());
    let cols = dataset.dimension();
    let mut centers = Vec::with_capacity(groups);

    for g in 0..groups {
        let start = g * order.len() / groups;
        let end = (g + 1) * order.len() / groups;
        let members = &order[start..end];
        let mean = mean_of(dataset, members, cols);
        let nearest = members.iter().copied().min_by(|&a, &b| {
            let da = distance.eval(dataset.row(a), &mean);
            let db = distance.eval(dataset.row(b), &mean);
            da.total_cmp(&db).then(a.cmp(&b))
        });
        if let Some(id) = nearest {
            if !is_duplicate(dataset, &centers, id, distance) {
                centers.push(id);
            }
        }
    }
    centers
}

/// Component-wise mean of the given rows.
pub(crate) fn mean_of<T: Element>(dataset: &Dataset<T>, ids: &[usize], cols: usize) -> Vec<T::Distance> {
    let mut mean = vec![<T::Distance as DistanceValue>::ZERO; cols];
    if ids.is_empty() {
        return mean;
    }
    for &id in ids {
        for (m, v) in mean.iter_mut().zip(dataset.row(id)) {
            *m += v.to_distance();
        }
    }
    let n = <T::Distance as DistanceValue>::from_usize(ids.len());
    for m in mean.iter_mut() {
        *m = *m / n;
    }
    mean
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn two_blobs() -> Dataset<f32> {
        let mut data = Vec::new();
        for i in 0..20 {
            let off = if i < 10 { 0.0 } else { 100.0 };
            data.push(off + (i % 10) as f32 * 0.1);
            data.push(off);
        }
        Dataset::from_flat(2, data).unwrap()
    }

    const ALL: [CentersInit; 4] = [
        CentersInit::Random,
        CentersInit::Gonzales,
        CentersInit::KMeansPP,
        CentersInit::Groupwise,
    ];

    #[test]
    fn test_returns_k_distinct_centers() {
        let ds = two_blobs();
        let ids: Vec<usize> = (0..20).collect();
        for init in ALL {
            let mut rng = StdRng::seed_from_u64(11);
            let centers = choose_centers(init, 4, &ds, &ids, DistanceMetric::Euclidean, &mut rng);
            assert_eq!(centers.len(), 4, "{:?}", init);
            let mut sorted = centers.clone();
            sorted.sort_unstable();
            sorted.dedup();
            assert_eq!(sorted.len(), 4);
        }
    }

    #[test]
    fn test_gonzales_spans_both_blobs() {
        let ds = two_blobs();
        let ids: Vec<usize> = (0..20).collect();
        let mut rng = StdRng::seed_from_u64(0);
        let centers = choose_centers(CentersInit::Gonzales, 2, &ds, &ids, DistanceMetric::Euclidean, &mut rng);
        let blobs: Vec<bool> = centers.iter().map(|&c| c < 10).collect();
        assert_ne!(blobs[0], blobs[1]);
    }

    #[test]
    fn test_duplicate_points_limit_centers() {
        let ds = Dataset::from_flat(2, vec![1.0f32; 20]).unwrap();
        let ids: Vec<usize> = (0..10).collect();
        for init in ALL {
            let mut rng = StdRng::seed_from_u64(1);
            let centers = choose_centers(init, 3, &ds, &ids, DistanceMetric::Euclidean, &mut rng);
            assert_eq!(centers.len(), 1, "{:?}", init);
        }
    }
}
