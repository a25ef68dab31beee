//! Distance metrics for vector similarity
//!
//! Every metric is expressed as an accumulation of per-dimension terms so
//! that tree search can stop summing as soon as a partial result exceeds the
//! current worst candidate.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::element::{DistanceValue, Element};
use crate::error::{AnnError, Result};

/// Distance metrics for measuring vector dissimilarity
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum DistanceMetric {
    /// Squared Euclidean (L2) distance
    Euclidean,
    /// Manhattan (L1) distance
    Manhattan,
    /// Sum of `|a - b|^order` (no final root)
    Minkowski { order: f32 },
    /// Chebyshev (L-infinity) distance
    Max,
    /// Histogram mass not shared by both vectors
    HistIntersect,
    /// Squared Hellinger distance
    Hellinger,
    /// Chi-square distance
    ChiSquare,
    /// Kullback-Leibler divergence (asymmetric)
    KullbackLeibler,
    /// Number of differing bits
    Hamming,
    /// Number of differing bits, counted byte by byte through a lookup table
    HammingLut,
}

impl Default for DistanceMetric {
    fn default() -> Self {
        DistanceMetric::Euclidean
    }
}

// Check the partial sum every this many dimensions.
const EARLY_EXIT_STRIDE: usize = 4;

static BYTE_POPCOUNT: [u8; 256] = {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = (i as u8).count_ones() as u8;
        i += 1;
    }
    table
};

impl DistanceMetric {
    /// Compute the distance between two vectors using this metric
    pub fn distance<A, B, R>(&self, a: &[A], b: &[B]) -> Result<R>
    where
        A: Element<Distance = R>,
        B: Element<Distance = R>,
        R: DistanceValue,
    {
        if a.len() != b.len() {
            return Err(AnnError::DimensionMismatch {
                expected: a.len(),
                actual: b.len(),
            });
        }
        Ok(self.eval(a, b))
    }

    /// Like [`distance`](Self::distance) but allowed to stop once the partial
    /// sum exceeds `worst`, returning some value still above `worst`.
    pub fn distance_bounded<A, B, R>(&self, a: &[A], b: &[B], worst: R) -> Result<R>
    where
        A: Element<Distance = R>,
        B: Element<Distance = R>,
        R: DistanceValue,
    {
        if a.len() != b.len() {
            return Err(AnnError::DimensionMismatch {
                expected: a.len(),
                actual: b.len(),
            });
        }
        Ok(self.eval_bounded(a, b, worst))
    }

    /// Full distance without a dimension check.
    #[inline]
    pub(crate) fn eval<A, B, R>(&self, a: &[A], b: &[B]) -> R
    where
        A: Element<Distance = R>,
        B: Element<Distance = R>,
        R: DistanceValue,
    {
        self.eval_bounded(a, b, R::INFINITY)
    }

    /// Distance that may stop early once the partial result exceeds `worst`.
    ///
    /// The returned value is exact whenever it is `<= worst`; otherwise it is
    /// some partial sum that is still `> worst`.
    #[inline]
    pub(crate) fn eval_bounded<A, B, R>(&self, a: &[A], b: &[B], worst: R) -> R
    where
        A: Element<Distance = R>,
        B: Element<Distance = R>,
        R: DistanceValue,
    {
        match self {
            DistanceMetric::Hamming | DistanceMetric::HammingLut => {
                let mut acc = R::ZERO;
                for (x, y) in a.iter().zip(b) {
                    acc += self.accum_dist(*x, *y);
                }
                acc
            }
            DistanceMetric::Max => {
                let mut acc = R::ZERO;
                for (x, y) in a.iter().zip(b) {
                    acc = acc.max((x.to_distance() - y.to_distance()).abs());
                    if acc > worst {
                        return acc;
                    }
                }
                acc
            }
            _ => {
                let prune = self.has_monotone_partial_sums();
                let mut acc = R::ZERO;
                for (i, (x, y)) in a.iter().zip(b).enumerate() {
                    acc += self.accum_dist(*x, *y);
                    if prune && i % EARLY_EXIT_STRIDE == EARLY_EXIT_STRIDE - 1 && acc > worst {
                        return acc;
                    }
                }
                acc
            }
        }
    }

    /// Contribution of a single dimension to the total distance.
    ///
    /// KD-tree search adds this term for the split dimension to obtain a
    /// lower bound for the far branch. Bit metrics count the differing bits
    /// of the raw elements, so the sum of these terms is exactly `eval`.
    #[inline]
    pub(crate) fn accum_dist<A, B, R>(&self, a: A, b: B) -> R
    where
        A: Element<Distance = R>,
        B: Element<Distance = R>,
        R: DistanceValue,
    {
        let bits = || a.bit_pattern() ^ b.bit_pattern();
        let (a, b) = (a.to_distance(), b.to_distance());
        match self {
            DistanceMetric::Euclidean => {
                let d = a - b;
                d * d
            }
            DistanceMetric::Manhattan | DistanceMetric::Max => (a - b).abs(),
            DistanceMetric::Minkowski { order } => (a - b).abs().powf(R::from_f64(*order as f64)),
            DistanceMetric::HistIntersect => {
                let half = R::from_f64(0.5);
                (a + b) * half - a.min(b)
            }
            DistanceMetric::Hellinger => {
                let d = a.max(R::ZERO).sqrt() - b.max(R::ZERO).sqrt();
                d * d
            }
            DistanceMetric::ChiSquare => {
                let sum = a + b;
                if sum > R::ZERO {
                    let d = a - b;
                    d * d / sum
                } else {
                    R::ZERO
                }
            }
            DistanceMetric::KullbackLeibler => {
                if a > R::ZERO && b > R::ZERO {
                    a * (a / b).ln()
                } else {
                    R::ZERO
                }
            }
            DistanceMetric::Hamming => R::from_usize(bits().count_ones() as usize),
            DistanceMetric::HammingLut => R::from_usize(
                bits()
                    .to_le_bytes()
                    .iter()
                    .map(|&byte| BYTE_POPCOUNT[byte as usize] as usize)
                    .sum(),
            ),
        }
    }

    /// Whether a ball of `radius` around a pivot at distance `to_pivot` from
    /// the query cannot hold anything closer than `worst`.
    ///
    /// Only metrics that obey the triangle inequality prune; the squared
    /// Euclidean test compares the unsquared quantities.
    pub(crate) fn ball_excludes<R: DistanceValue>(&self, to_pivot: R, radius: R, worst: R) -> bool {
        if worst == R::INFINITY {
            return false;
        }
        match self {
            DistanceMetric::Euclidean => {
                let val = to_pivot - radius - worst;
                let four = R::from_f64(4.0);
                val > R::ZERO && val * val - four * radius * worst > R::ZERO
            }
            DistanceMetric::Manhattan
            | DistanceMetric::Max
            | DistanceMetric::Hamming
            | DistanceMetric::HammingLut => to_pivot - radius > worst,
            _ => false,
        }
    }

    /// Lower bound on the distance to a region after one dimension's
    /// contribution changes from `old` to `cut`.
    #[inline]
    pub(crate) fn update_bound<R: DistanceValue>(&self, bound: R, old: R, cut: R) -> R {
        match self {
            DistanceMetric::Max => bound.max(cut),
            // Terms can be negative, so no partial sum bounds the total.
            DistanceMetric::KullbackLeibler => R::ZERO,
            _ => bound - old + cut,
        }
    }

    /// Whether partial sums never decrease, so early exit is safe.
    pub fn has_monotone_partial_sums(&self) -> bool {
        !matches!(self, DistanceMetric::KullbackLeibler)
    }

    /// Whether `d(a, b) == d(b, a)` for all inputs.
    pub fn is_symmetric(&self) -> bool {
        !matches!(self, DistanceMetric::KullbackLeibler)
    }

    /// Whether the metric is meaningful for averaged centers and axis splits.
    pub fn is_vector_space(&self) -> bool {
        !self.is_hamming()
    }

    /// Whether axis-aligned KD-tree splits are meaningful under this metric.
    pub fn supports_kdtree(&self) -> bool {
        !self.is_hamming()
    }

    pub fn is_hamming(&self) -> bool {
        matches!(self, DistanceMetric::Hamming | DistanceMetric::HammingLut)
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DistanceMetric::Euclidean => write!(f, "euclidean"),
            DistanceMetric::Manhattan => write!(f, "manhattan"),
            DistanceMetric::Minkowski { order } => write!(f, "minkowski:{}", order),
            DistanceMetric::Max => write!(f, "max"),
            DistanceMetric::HistIntersect => write!(f, "hist-intersect"),
            DistanceMetric::Hellinger => write!(f, "hellinger"),
            DistanceMetric::ChiSquare => write!(f, "chi-square"),
            DistanceMetric::KullbackLeibler => write!(f, "kullback-leibler"),
            DistanceMetric::Hamming => write!(f, "hamming"),
            DistanceMetric::HammingLut => write!(f, "hamming-lut"),
        }
    }
}

impl FromStr for DistanceMetric {
    type Err = AnnError;

    /// Parse a metric name; Minkowski takes its order after a colon
    /// (`minkowski:3`).
    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_ascii_lowercase();
        let (name, arg) = match lower.split_once(':') {
            Some((name, arg)) => (name, Some(arg)),
            None => (lower.as_str(), None),
        };
        let metric = match name {
            "euclidean" | "l2" => DistanceMetric::Euclidean,
            "manhattan" | "l1" => DistanceMetric::Manhattan,
            "minkowski" => {
                let order = arg
                    .ok_or_else(|| AnnError::invalid("minkowski requires an order, e.g. minkowski:3"))?
                    .parse::<f32>()
                    .map_err(|_| AnnError::invalid(format!("Invalid Minkowski order in '{}'", s)))?;
                DistanceMetric::Minkowski { order }
            }
            "max" | "chebyshev" => DistanceMetric::Max,
            "hist-intersect" | "intersect" => DistanceMetric::HistIntersect,
            "hellinger" => DistanceMetric::Hellinger,
            "chi-square" | "cs" => DistanceMetric::ChiSquare,
            "kullback-leibler" | "kl" => DistanceMetric::KullbackLeibler,
            "hamming" | "hamming-popcnt" | "hammingpopcnt" => DistanceMetric::Hamming,
            "hamming-lut" | "hamminglut" => DistanceMetric::HammingLut,
            "l2-simple" | "l2simple" => DistanceMetric::Euclidean,
            _ => return Err(AnnError::invalid(format!("Unknown distance metric: {}", s))),
        };
        if arg.is_some() && !matches!(metric, DistanceMetric::Minkowski { .. }) {
            return Err(AnnError::invalid(format!("Metric '{}' takes no argument", name)));
        }
        Ok(metric)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    const SYMMETRIC: [DistanceMetric; 8] = [
        DistanceMetric::Euclidean,
        DistanceMetric::Manhattan,
        DistanceMetric::Minkowski { order: 3.0 },
        DistanceMetric::Max,
        DistanceMetric::HistIntersect,
        DistanceMetric::Hellinger,
        DistanceMetric::ChiSquare,
        DistanceMetric::Hamming,
    ];

    #[test]
    fn test_euclidean_is_squared() {
        let d: f32 = DistanceMetric::Euclidean
            .distance(&[1.0f32, 2.0, 3.0], &[4.0f32, 5.0, 6.0])
            .unwrap();
        assert_relative_eq!(d, 27.0, epsilon = 1e-5);
    }

    #[test]
    fn test_manhattan_and_max() {
        let a = [1.0f32, -2.0, 3.0];
        let b = [4.0f32, 2.0, 3.5];
        let l1: f32 = DistanceMetric::Manhattan.distance(&a, &b).unwrap();
        let linf: f32 = DistanceMetric::Max.distance(&a, &b).unwrap();
        assert_relative_eq!(l1, 7.5, epsilon = 1e-6);
        assert_relative_eq!(linf, 4.0, epsilon = 1e-6);
    }

    #[test]
    fn test_minkowski_order() {
        let d: f64 = DistanceMetric::Minkowski { order: 3.0 }
            .distance(&[0.0f64, 0.0], &[1.0f64, 2.0])
            .unwrap();
        assert_relative_eq!(d, 9.0, epsilon = 1e-9);
    }

    #[test]
    fn test_histogram_metrics() {
        let a = [0.5f32, 0.5, 0.0];
        let b = [0.25f32, 0.25, 0.5];
        let inter: f32 = DistanceMetric::HistIntersect.distance(&a, &b).unwrap();
        assert_relative_eq!(inter, 0.5, epsilon = 1e-6);

        let chi: f32 = DistanceMetric::ChiSquare.distance(&a, &b).unwrap();
        // 2 * (0.0625 / 0.75) + 0.25 / 0.5
        assert_relative_eq!(chi, 2.0 * 0.0625 / 0.75 + 0.5, epsilon = 1e-6);

        let kl: f32 = DistanceMetric::KullbackLeibler.distance(&a, &b).unwrap();
        assert_relative_eq!(kl, 2.0f32.ln(), epsilon = 1e-6);
    }

    #[test]
    fn test_hamming_on_bytes() {
        let d: f32 = DistanceMetric::Hamming
            .distance(&[0b1111_0000u8, 0b0000_0001], &[0b0000_0000u8, 0b0000_0011])
            .unwrap();
        assert_relative_eq!(d, 5.0);
        let lut: f32 = DistanceMetric::HammingLut
            .distance(&[0b1111_0000u8, 0b0000_0001], &[0b0000_0000u8, 0b0000_0011])
            .unwrap();
        assert_relative_eq!(lut, 5.0);
    }

    #[test]
    fn test_bit_terms_sum_to_full_distance() {
        let a = [-1i8, 3, 0, 127];
        let b = [0i8, -3, 5, -128];
        for metric in [DistanceMetric::Hamming, DistanceMetric::HammingLut] {
            let full: f32 = metric.distance(&a, &b).unwrap();
            let terms: f32 = a.iter().zip(&b).map(|(x, y)| metric.accum_dist::<_, _, f32>(*x, *y)).sum();
            assert_eq!(full, terms, "{}", metric);
            // 8 + 7 + 2 + 8 differing bits
            assert_eq!(full, 25.0);
        }
    }

    #[test]
    fn test_ball_exclusion() {
        // Pivot 10 away with radius 3: nothing in the ball is within 6.
        assert!(DistanceMetric::Manhattan.ball_excludes(10.0f32, 3.0, 6.0));
        assert!(!DistanceMetric::Manhattan.ball_excludes(10.0f32, 3.0, 7.5));
        assert!(DistanceMetric::Hamming.ball_excludes(9.0f32, 2.0, 6.0));
        // Squared Euclidean: sqrt(100) - sqrt(9) = 7 > sqrt(36)
        assert!(DistanceMetric::Euclidean.ball_excludes(100.0f32, 9.0, 36.0));
        assert!(!DistanceMetric::Euclidean.ball_excludes(100.0f32, 9.0, 64.0));
        assert!(!DistanceMetric::Euclidean.ball_excludes(100.0f32, 9.0, f32::INFINITY));
        assert!(!DistanceMetric::ChiSquare.ball_excludes(100.0f32, 0.0, 1.0));
    }

    #[test]
    fn test_integer_elements_do_not_overflow() {
        let d: f32 = DistanceMetric::Euclidean
            .distance(&[0u8; 64], &[255u8; 64])
            .unwrap();
        assert_relative_eq!(d, 64.0 * 255.0 * 255.0, epsilon = 1.0);
    }

    #[test]
    fn test_early_exit_returns_value_above_bound() {
        let a = vec![0.0f32; 16];
        let b = vec![1.0f32; 16];
        let partial: f32 = DistanceMetric::Euclidean.eval_bounded(&a, &b, 2.0);
        assert!(partial > 2.0);
        assert!(partial < 16.0);
        let full: f32 = DistanceMetric::Euclidean.eval_bounded(&a, &b, 100.0);
        assert_relative_eq!(full, 16.0);
    }

    #[test]
    fn test_dimension_mismatch() {
        let result: Result<f32> = DistanceMetric::Euclidean.distance(&[1.0f32, 2.0], &[1.0f32, 2.0, 3.0]);
        assert!(matches!(result, Err(AnnError::DimensionMismatch { .. })));
        let bounded: Result<f32> = DistanceMetric::Manhattan.distance_bounded(&[1.0f32], &[1.0f32, 2.0], 1.0);
        assert!(matches!(bounded, Err(AnnError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("L2".parse::<DistanceMetric>().unwrap(), DistanceMetric::Euclidean);
        assert_eq!("l1".parse::<DistanceMetric>().unwrap(), DistanceMetric::Manhattan);
        assert_eq!(
            "minkowski:4".parse::<DistanceMetric>().unwrap(),
            DistanceMetric::Minkowski { order: 4.0 }
        );
        assert_eq!("HammingPopcnt".parse::<DistanceMetric>().unwrap(), DistanceMetric::Hamming);
        assert_eq!("hamming-popcnt".parse::<DistanceMetric>().unwrap(), DistanceMetric::Hamming);
        assert_eq!("L2Simple".parse::<DistanceMetric>().unwrap(), DistanceMetric::Euclidean);
        assert_eq!("l2-simple".parse::<DistanceMetric>().unwrap(), DistanceMetric::Euclidean);
        assert!("minkowski".parse::<DistanceMetric>().is_err());
        assert!("cosine".parse::<DistanceMetric>().is_err());
        for metric in SYMMETRIC {
            assert_eq!(metric.to_string().parse::<DistanceMetric>().unwrap(), metric);
        }
    }

    proptest! {
        #[test]
        fn prop_symmetric_metrics(
            a in prop::collection::vec(0.0f32..100.0, 8),
            b in prop::collection::vec(0.0f32..100.0, 8),
        ) {
            for metric in SYMMETRIC {
                let ab: f32 = metric.eval(&a, &b);
                let ba: f32 = metric.eval(&b, &a);
                prop_assert!((ab - ba).abs() <= 1e-3 * ab.abs().max(1.0));
                let aa: f32 = metric.eval(&a, &a);
                prop_assert!(aa.abs() <= 1e-4);
            }
        }

        #[test]
        fn prop_hamming_lut_matches_popcount(
            a in prop::collection::vec(any::<u8>(), 16),
            b in prop::collection::vec(any::<u8>(), 16),
        ) {
            let pop: f32 = DistanceMetric::Hamming.eval(&a, &b);
            let lut: f32 = DistanceMetric::HammingLut.eval(&a, &b);
            prop_assert_eq!(pop, lut);
        }
    }
}
