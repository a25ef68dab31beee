//! Automatic choice of backend and parameters.
//!
//! A sample of the live points is split into a training set and a handful
//! of held-out queries. Every candidate configuration is built on the
//! training set, its visit budget is raised until the fraction of queries
//! whose exact nearest neighbor is recovered reaches the target, and the
//! configuration with the lowest weighted cost wins.
//!
//! Costs are counted rather than timed so that tuning is reproducible:
//! search cost is the number of distance evaluations over all held-out
//! queries, build cost an estimate of the distance evaluations a build
//! performs, and memory cost the index size relative to the sample.

use rand::seq::index;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::dataset::Dataset;
use crate::element::{DistanceValue, Element};
use crate::error::Result;
use crate::index::{NnIndex, SearchBudget};
use crate::linear::LinearIndex;
use crate::lsh::check_mask_budget;
use crate::parallel::{parallel_map, stream_rng};
use crate::params::{Algorithm, Parameters};
use crate::result_set::{KnnResultSet, ResultSet};

const SAMPLE_STREAM: u64 = u64::MAX;
const MIN_SAMPLE: usize = 100;
const MAX_TEST_QUERIES: usize = 1000;

const KDTREE_TREES: [usize; 4] = [1, 4, 8, 16];
const KMEANS_BRANCHING: [usize; 3] = [16, 32, 64];
const KMEANS_ITERATIONS: [usize; 3] = [1, 5, 10];
const LSH_TABLES: [usize; 3] = [4, 8, 12];
const LSH_KEY_SIZES: [u32; 3] = [12, 16, 20];

/// Outcome of a tuning run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutotuneReport {
    /// The concrete configuration that was selected.
    pub algorithm: Algorithm,
    /// Visit budget that reached the target on the sample.
    pub checks: usize,
    /// Fraction of held-out queries whose nearest neighbor was found.
    pub precision: f32,
    pub target_precision: f32,
    pub met_target: bool,
    /// Distance evaluations of a linear scan divided by those of the chosen
    /// configuration, on the sample.
    pub speedup: f32,
    pub candidates: usize,
    pub sample_size: usize,
    pub test_queries: usize,
}

#[derive(Debug, Clone)]
struct Trial {
    params: Parameters,
    checks: usize,
    precision: f32,
    search_cost: f64,
    build_cost: f64,
    memory: usize,
}

struct Sample<'a, T: Element> {
    train: Dataset<T>,
    queries: Vec<&'a [T]>,
    truth: Vec<T::Distance>,
}

impl<'a, T: Element> Sample<'a, T> {
    /// Precision and total distance evaluations for `backend` at `checks`.
    fn evaluate(&self, backend: &Backend<T::Distance>, checks: usize, eps: f32) -> (f32, usize) {
        let budget = SearchBudget {
            max_checks: Some(checks),
            eps,
        };
        let mut hits = 0;
        let mut evaluated = 0;
        for (query, truth) in self.queries.iter().zip(&self.truth) {
            let mut result = KnnResultSet::new(1);
            backend.find_neighbors(&self.train, query, &mut result, &budget);
            evaluated += result.evaluated();
            if let Some(best) = result.into_sorted_vec().first() {
                if best.distance <= *truth {
                    hits += 1;
                }
            }
        }
        (hits as f32 / self.queries.len() as f32, evaluated)
    }
}

/// Pick a configuration for `dataset` meeting `params.target_precision`.
///
/// Returns `params` with a concrete algorithm and the fields of the chosen
/// configuration filled in, plus the tuned visit budget in the report.
pub fn autotune<T: Element>(dataset: &Dataset<T>, params: &Parameters) -> Result<(Parameters, AutotuneReport)> {
    let live: Vec<usize> = dataset.live_ids().collect();
    if live.len() < 2 {
        let chosen = Parameters {
            algorithm: Algorithm::Linear,
            ..params.clone()
        };
        let report = AutotuneReport {
            algorithm: Algorithm::Linear,
            checks: live.len().max(1),
            precision: 1.0,
            target_precision: params.target_precision,
            met_target: true,
            speedup: 1.0,
            candidates: 0,
            sample_size: live.len(),
            test_queries: 0,
        };
        return Ok((chosen, report));
    }

    let sample = draw_sample(dataset, &live, params);
    let candidates = candidates(params);
    let linear_cost = (sample.train.len() * sample.queries.len()) as f64;

    let trials = parallel_map(params.cores, candidates.len(), |i| run_trial(&sample, &candidates[i]))?
        .into_iter()
        .collect::<Result<Vec<Trial>>>()?;

    let target = params.target_precision;
    let sample_bytes = sample.train.used_memory().max(1) as f64;
    let best_time = trials
        .iter()
        .map(|t| time_cost(t, params.build_weight))
        .fold(f64::INFINITY, f64::min)
        .max(1.0);
    let total_cost = |t: &Trial| {
        time_cost(t, params.build_weight) / best_time
            + params.memory_weight as f64 * (sample_bytes + t.memory as f64) / sample_bytes
    };

    let meeting: Vec<&Trial> = trials.iter().filter(|t| t.precision >= target).collect();
    let met_target = !meeting.is_empty();
    let best = if met_target {
        meeting
            .into_iter()
            .min_by(|a, b| total_cost(a).total_cmp(&total_cost(b)))
    } else {
        trials.iter().min_by(|a, b| {
            b.precision
                .total_cmp(&a.precision)
                .then(total_cost(a).total_cmp(&total_cost(b)))
        })
    };

    let (chosen, checks, precision, search_cost) = match best {
        Some(t) if t.search_cost < linear_cost => (
            Parameters {
                cores: params.cores,
                ..t.params.clone()
            },
            t.checks,
            t.precision,
            t.search_cost,
        ),
        _ => (
            Parameters {
                algorithm: Algorithm::Linear,
                ..params.clone()
            },
            sample.train.len(),
            1.0,
            linear_cost,
        ),
    };
    let met_target = met_target || precision >= target;

    let report = AutotuneReport {
        algorithm: chosen.algorithm,
        checks,
        precision,
        target_precision: target,
        met_target,
        speedup: (linear_cost / search_cost.max(1.0)) as f32,
        candidates: trials.len(),
        sample_size: sample.train.len() + sample.queries.len(),
        test_queries: sample.queries.len(),
    };

    if met_target {
        info!(
            algorithm = ?report.algorithm,
            checks = report.checks,
            precision = report.precision,
            speedup = report.speedup,
            "Autotuning selected configuration"
        );
    } else {
        warn!(
            algorithm = ?report.algorithm,
            precision = report.precision,
            target = target,
            "No sampled configuration met the target precision; using the most precise one"
        );
    }
    Ok((chosen, report))
}

fn draw_sample<'a, T: Element>(dataset: &'a Dataset<T>, live: &[usize], params: &Parameters) -> Sample<'a, T> {
    let wanted = (params.sample_fraction as f64 * live.len() as f64).round() as usize;
    let size = wanted.max(MIN_SAMPLE.min(live.len())).min(live.len());
    let tests = (size / 10).clamp(1, MAX_TEST_QUERIES);

    let mut rng = stream_rng(params.random_seed, SAMPLE_STREAM);
    let picked: Vec<usize> = index::sample(&mut rng, live.len(), size)
        .into_iter()
        .map(|i| live[i])
        .collect();
    let (query_ids, train_ids) = picked.split_at(tests);

    let train = dataset.subset(train_ids);
    let queries: Vec<&[T]> = query_ids.iter().map(|&id| dataset.row(id)).collect();
    let linear = LinearIndex::new(params.distance);
    let truth = queries
        .iter()
        .map(|q| {
            let mut result = KnnResultSet::new(1);
            NnIndex::<T::Distance>::find_neighbors(&linear, &train, q, &mut result, &SearchBudget::unlimited());
            result
                .into_sorted_vec()
                .first()
                .map_or(<T::Distance as DistanceValue>::INFINITY, |n| n.distance)
        })
        .collect();

    Sample { train, queries, truth }
}

/// Configurations worth trying for `params.distance`.
fn candidates(params: &Parameters) -> Vec<Parameters> {
    let base = Parameters {
        cores: 1,
        ..params.clone()
    };
    let mut out = Vec::new();
    if params.distance.supports_kdtree() {
        for &trees in &KDTREE_TREES {
            out.push(Parameters {
                algorithm: Algorithm::KdTree,
                trees,
                ..base.clone()
            });
        }
    }
    if params.distance.is_vector_space() {
        for &branching in &KMEANS_BRANCHING {
            for &iterations in &KMEANS_ITERATIONS {
                out.push(Parameters {
                    algorithm: Algorithm::KMeans,
                    branching,
                    iterations: Some(iterations),
                    ..base.clone()
                });
            }
        }
    }
    if params.distance.is_hamming() {
        for &table_number in &LSH_TABLES {
            for &key_size in &LSH_KEY_SIZES {
                if check_mask_budget(key_size, params.multi_probe_level).is_err() {
                    continue;
                }
                out.push(Parameters {
                    algorithm: Algorithm::Lsh,
                    table_number,
                    key_size,
                    ..base.clone()
                });
            }
        }
    }
    out
}

fn run_trial<T: Element>(sample: &Sample<'_, T>, params: &Parameters) -> Result<Trial> {
    let backend = Backend::build(&sample.train, params)?;
    let n = sample.train.len();
    let (checks, precision, evaluated) = if params.algorithm == Algorithm::Lsh {
        let (precision, evaluated) = sample.evaluate(&backend, n, params.eps);
        (n, precision, evaluated)
    } else {
        tune_checks(sample, &backend, params.target_precision, params.eps)
    };
    let trial = Trial {
        params: params.clone(),
        checks,
        precision,
        search_cost: evaluated as f64,
        build_cost: build_cost(params, n),
        memory: backend.used_memory(),
    };
    debug!(
        algorithm = ?params.algorithm,
        trees = params.trees,
        branching = params.branching,
        checks = trial.checks,
        precision = trial.precision,
        search_cost = trial.search_cost,
        "Autotune trial"
    );
    Ok(trial)
}

/// Smallest visit budget reaching `target`: double until it is reached,
/// then bisect the last interval.
fn tune_checks<T: Element>(
    sample: &Sample<'_, T>,
    backend: &Backend<T::Distance>,
    target: f32,
    eps: f32,
) -> (usize, f32, usize) {
    let max = sample.train.len().max(1);
    let mut checks = 1;
    let (mut precision, mut evaluated) = sample.evaluate(backend, checks, eps);
    while precision < target && checks < max {
        checks = (checks * 2).min(max);
        (precision, evaluated) = sample.evaluate(backend, checks, eps);
    }
    if precision < target || checks == 1 {
        return (checks, precision, evaluated);
    }

    let (mut lo, mut hi) = (checks / 2, checks);
    while hi - lo > 1 {
        let mid = lo + (hi - lo) / 2;
        let (p, e) = sample.evaluate(backend, mid, eps);
        if p >= target {
            hi = mid;
            precision = p;
            evaluated = e;
        } else {
            lo = mid;
        }
    }
    (hi, precision, evaluated)
}

fn time_cost(trial: &Trial, build_weight: f32) -> f64 {
    trial.search_cost + build_weight as f64 * trial.build_cost
}

/// Estimated distance evaluations needed to build `params` over `n` points.
fn build_cost(params: &Parameters, n: usize) -> f64 {
    let n = n.max(1) as f64;
    match params.algorithm {
        Algorithm::KdTree | Algorithm::KdTreeSingle => {
            let depth = (n / params.leaf_max_size.max(1) as f64).log2().max(1.0);
            params.trees as f64 * n * depth
        }
        Algorithm::KMeans | Algorithm::Composite => {
            let b = params.branching.max(2) as f64;
            let depth = n.log(b).max(1.0);
            n * b * params.kmeans_iterations() as f64 * depth
        }
        Algorithm::Hierarchical => {
            let b = params.branching.max(2) as f64;
            params.trees as f64 * n * b * n.log(b).max(1.0)
        }
        Algorithm::Lsh => params.table_number as f64 * n,
        Algorithm::Linear | Algorithm::Autotuned => 0.0,
    }
}
