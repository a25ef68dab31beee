//! Key functions and probe masks for LSH tables.

use ndarray_rand::rand_distr::StandardNormal;
use rand::rngs::StdRng;
use rand::seq::index;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::element::{DistanceValue, Element};
use crate::error::{AnnError, Result};

/// Maps a point to a bucket key of up to 32 bits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum KeyFunction<R> {
    /// Key bit `i` is bit `bit` of component `dim`; used for Hamming data.
    BitSample(Vec<(usize, u32)>),
    /// Key bit `i` is the sign of `(point - offset) . planes[i]`.
    Projection { offset: Vec<R>, planes: Vec<Vec<R>> },
}

impl<R: DistanceValue> KeyFunction<R> {
    /// Sample `key_size` distinct bits out of the `cols * T::BITS` bits of a
    /// point.
    pub(crate) fn bit_sample<T: Element>(cols: usize, key_size: u32, rng: &mut StdRng) -> Self {
        let total = cols * T::BITS as usize;
        let amount = (key_size as usize).min(total);
        let bits = index::sample(rng, total, amount)
            .into_iter()
            .map(|b| (b / T::BITS as usize, (b % T::BITS as usize) as u32))
            .collect();
        KeyFunction::BitSample(bits)
    }

    /// Random Gaussian hyperplanes through `offset`.
    pub(crate) fn projection(offset: Vec<R>, key_size: u32, rng: &mut StdRng) -> Self {
        let cols = offset.len();
        let planes = (0..key_size)
            .map(|_| {
                (0..cols)
                    .map(|_| R::from_f64(rng.sample::<f64, _>(StandardNormal)))
                    .collect()
            })
            .collect();
        KeyFunction::Projection { offset, planes }
    }

    pub(crate) fn key<T: Element<Distance = R>>(&self, point: &[T]) -> u32 {
        let mut key = 0u32;
        match self {
            KeyFunction::BitSample(bits) => {
                for (i, &(dim, bit)) in bits.iter().enumerate() {
                    if (point[dim].bit_pattern() >> bit) & 1 == 1 {
                        key |= 1 << i;
                    }
                }
            }
            KeyFunction::Projection { offset, planes } => {
                for (i, plane) in planes.iter().enumerate() {
                    let mut dot = R::ZERO;
                    for ((v, o), w) in point.iter().zip(offset).zip(plane) {
                        dot += (v.to_distance() - *o) * *w;
                    }
                    if dot >= R::ZERO {
                        key |= 1 << i;
                    }
                }
            }
        }
        key
    }

    /// Number of bits in the keys this function produces.
    pub(crate) fn width(&self) -> u32 {
        match self {
            KeyFunction::BitSample(bits) => bits.len() as u32,
            KeyFunction::Projection { planes, .. } => planes.len() as u32,
        }
    }

    pub(crate) fn used_memory(&self) -> usize {
        match self {
            KeyFunction::BitSample(bits) => bits.capacity() * std::mem::size_of::<(usize, u32)>(),
            KeyFunction::Projection { offset, planes } => {
                (offset.capacity() + planes.iter().map(Vec::capacity).sum::<usize>())
                    * std::mem::size_of::<R>()
            }
        }
    }
}

/// Upper bound on bucket masks visited per table.
pub(crate) const MAX_BUCKET_MASKS: u64 = 1 << 16;

/// Number of masks over `key_size` bits with at most `level` bits set,
/// or an error when `level` exceeds the key or the count exceeds
/// [`MAX_BUCKET_MASKS`].
pub(crate) fn check_mask_budget(key_size: u32, level: u32) -> Result<usize> {
    if level > key_size {
        return Err(AnnError::invalid(format!(
            "multi_probe_level {} exceeds key_size {}",
            level, key_size
        )));
    }
    let mut total: u64 = 1;
    let mut choose: u64 = 1;
    for bits in 1..=level as u64 {
        // C(n, k) = C(n, k - 1) * (n - k + 1) / k, exact at every step.
        choose = choose * (key_size as u64 - bits + 1) / bits;
        total += choose;
        if total > MAX_BUCKET_MASKS {
            return Err(AnnError::invalid(format!(
                "multi_probe_level {} over {} key bits needs more than {} bucket masks per table",
                level, key_size, MAX_BUCKET_MASKS
            )));
        }
    }
    Ok(total as usize)
}

/// XOR masks over `key_size` bits with at most `level` bits set, ordered by
/// number of set bits and then by value.
pub(crate) fn probe_masks(key_size: u32, level: u32) -> Result<Vec<u32>> {
    let count = check_mask_budget(key_size, level)?;
    let mut masks = Vec::with_capacity(count);
    masks.push(0u32);
    for bits in 1..=level {
        let mut group = Vec::new();
        combinations(key_size, bits, 0, 0, &mut group);
        group.sort_unstable();
        masks.extend(group);
    }
    Ok(masks)
}

fn combinations(key_size: u32, remaining: u32, start: u32, current: u32, out: &mut Vec<u32>) {
    if remaining == 0 {
        out.push(current);
        return;
    }
    for bit in start..key_size {
        if key_size - bit < remaining {
            break;
        }
        combinations(key_size, remaining - 1, bit + 1, current | (1 << bit), out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_probe_masks_order() {
        let masks = probe_masks(3, 2).unwrap();
        assert_eq!(masks, vec![0b000, 0b001, 0b010, 0b100, 0b011, 0b101, 0b110]);
        assert_eq!(probe_masks(20, 0).unwrap(), vec![0]);
        assert_eq!(probe_masks(32, 2).unwrap().len(), 1 + 32 + 32 * 31 / 2);
    }

    #[test]
    fn test_mask_budget_is_bounded() {
        assert_eq!(check_mask_budget(3, 3).unwrap(), 8);
        assert_eq!(check_mask_budget(32, 3).unwrap(), 1 + 32 + 496 + 4960);
        assert!(matches!(check_mask_budget(8, 9), Err(AnnError::InvalidParameters(_))));
        assert!(matches!(check_mask_budget(32, 32), Err(AnnError::InvalidParameters(_))));
        assert!(matches!(check_mask_budget(24, 8), Err(AnnError::InvalidParameters(_))));
        assert!(probe_masks(32, 32).is_err());
    }

    #[test]
    fn test_bit_sample_key() {
        let f: KeyFunction<f32> = KeyFunction::BitSample(vec![(0, 0), (1, 7), (0, 3)]);
        assert_eq!(f.key(&[0b0000_1001u8, 0b1000_0000]), 0b111);
        assert_eq!(f.key(&[0u8, 0b1000_0000]), 0b010);
    }

    #[test]
    fn test_bit_sample_is_distinct() {
        let mut rng = StdRng::seed_from_u64(3);
        let f = KeyFunction::<f32>::bit_sample::<u8>(4, 32, &mut rng);
        match &f {
            KeyFunction::BitSample(bits) => {
                let mut sorted = bits.clone();
                sorted.sort_unstable();
                sorted.dedup();
                assert_eq!(sorted.len(), 32);
                assert!(bits.iter().all(|&(d, b)| d < 4 && b < 8));
            }
            KeyFunction::Projection { .. } => panic!("expected bit sampling"),
        }
        assert_eq!(f.width(), 32);
    }

    #[test]
    fn test_projection_separates_opposite_points() {
        let mut rng = StdRng::seed_from_u64(1);
        let f = KeyFunction::projection(vec![0.0f32; 3], 16, &mut rng);
        let a = f.key(&[1.0f32, 2.0, 3.0]);
        let b = f.key(&[-1.0f32, -2.0, -3.0]);
        assert_eq!(a ^ b, 0xFFFF);
    }
}
