//! Multi-probe locality-sensitive hashing index.
//!
//! Each table hashes points to a key of `key_size` bits. A query probes its
//! own bucket plus every bucket whose key differs in at most
//! `multi_probe_level` bits, then ranks the collected candidates by their
//! true distance.

mod hash;

use std::collections::{BTreeMap, HashSet};
use std::ops::Range;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dataset::Dataset;
use crate::distance::DistanceMetric;
use crate::element::{DistanceValue, Element};
use crate::error::{AnnError, Result};
use crate::index::{NnIndex, SearchBudget};
use crate::kmeans::centers::mean_of;
use crate::parallel::{parallel_map, stream_rng};
use crate::params::{Algorithm, Parameters};
use crate::result_set::ResultSet;

pub(crate) use hash::check_mask_budget;
use hash::{probe_masks, KeyFunction};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LshTable<R> {
    key: KeyFunction<R>,
    buckets: BTreeMap<u32, Vec<usize>>,
}

impl<R: DistanceValue> LshTable<R> {
    fn insert<T: Element<Distance = R>>(&mut self, dataset: &Dataset<T>, id: usize) {
        let key = self.key.key(dataset.row(id));
        self.buckets.entry(key).or_default().push(id);
    }

    fn remove<T: Element<Distance = R>>(&mut self, dataset: &Dataset<T>, id: usize) {
        let key = self.key.key(dataset.row(id));
        if let Some(bucket) = self.buckets.get_mut(&key) {
            bucket.retain(|&p| p != id);
            if bucket.is_empty() {
                self.buckets.remove(&key);
            }
        }
    }
}

/// A set of LSH tables probed together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LshIndex<R> {
    distance: DistanceMetric,
    key_size: u32,
    multi_probe_level: u32,
    masks: Vec<u32>,
    tables: Vec<LshTable<R>>,
}

impl<R: DistanceValue> LshIndex<R> {
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn bucket_count(&self) -> usize {
        self.tables.iter().map(|t| t.buckets.len()).sum()
    }

    pub(crate) fn max_point_id(&self) -> Option<usize> {
        self.tables
            .iter()
            .flat_map(|t| t.buckets.values())
            .filter_map(|bucket| bucket.iter().copied().max())
            .max()
    }

    /// Distinct live candidates for `query`, in probe order.
    fn candidates<T: Element<Distance = R>>(&self, dataset: &Dataset<T>, query: &[T]) -> Vec<usize> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for table in &self.tables {
            let key = table.key.key(query);
            let width_mask = match table.key.width() {
                32 => u32::MAX,
                w => (1u32 << w) - 1,
            };
            for &mask in &self.masks {
                if mask & !width_mask != 0 {
                    continue;
                }
                if let Some(bucket) = table.buckets.get(&(key ^ mask)) {
                    for &id in bucket {
                        if dataset.is_live(id) && seen.insert(id) {
                            out.push(id);
                        }
                    }
                }
            }
        }
        out
    }
}

impl<R: DistanceValue> NnIndex<R> for LshIndex<R> {
    fn build<T: Element<Distance = R>>(dataset: &Dataset<T>, params: &Parameters) -> Result<Self> {
        if params.table_number == 0 || !(1..=32).contains(&params.key_size) {
            return Err(AnnError::invalid(format!(
                "LSH needs at least one table and a key size in 1..=32 (got {} tables, {} bits)",
                params.table_number, params.key_size
            )));
        }
        let masks = probe_masks(params.key_size, params.multi_probe_level)?;
        let live: Vec<usize> = dataset.live_ids().collect();
        let cols = dataset.dimension();
        let offset = if params.distance.is_hamming() {
            Vec::new()
        } else {
            mean_of(dataset, &live, cols)
        };

        let tables = parallel_map(params.cores, params.table_number, |t| {
            let mut rng = stream_rng(params.random_seed, t as u64);
            let key = if params.distance.is_hamming() {
                KeyFunction::bit_sample::<T>(cols, params.key_size, &mut rng)
            } else {
                KeyFunction::projection(offset.clone(), params.key_size, &mut rng)
            };
            let mut table = LshTable {
                key,
                buckets: BTreeMap::new(),
            };
            for &id in &live {
                table.insert(dataset, id);
            }
            table
        })?;

        let index = Self {
            distance: params.distance,
            key_size: params.key_size,
            multi_probe_level: params.multi_probe_level,
            masks,
            tables,
        };
        debug!(
            tables = index.tables.len(),
            buckets = index.bucket_count(),
            probes = index.masks.len(),
            "Built LSH tables"
        );
        Ok(index)
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::Lsh
    }

    fn add_points<T: Element<Distance = R>>(&mut self, dataset: &Dataset<T>, ids: Range<usize>) -> Result<()> {
        for table in &mut self.tables {
            for id in ids.clone() {
                table.insert(dataset, id);
            }
        }
        Ok(())
    }

    fn remove_point<T: Element<Distance = R>>(&mut self, dataset: &Dataset<T>, id: usize) {
        for table in &mut self.tables {
            table.remove(dataset, id);
        }
    }

    fn find_neighbors<T, S>(&self, dataset: &Dataset<T>, query: &[T], result: &mut S, _budget: &SearchBudget)
    where
        T: Element<Distance = R>,
        S: ResultSet<R>,
    {
        for id in self.candidates(dataset, query) {
            let dist = self
                .distance
                .eval_bounded(query, dataset.row(id), result.worst_dist());
            result.add_point(dist, id);
        }
    }

    fn used_memory(&self) -> usize {
        let tables: usize = self
            .tables
            .iter()
            .map(|t| {
                t.key.used_memory()
                    + t.buckets
                        .values()
                        .map(|b| b.capacity() * std::mem::size_of::<usize>() + std::mem::size_of::<u32>())
                        .sum::<usize>()
            })
            .sum();
        tables + self.masks.capacity() * std::mem::size_of::<u32>()
    }
}
