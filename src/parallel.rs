//! Worker-pool helpers shared by batch search, forest builds and autotuning.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use rayon::ThreadPool;
use tracing::{debug, warn};

use crate::error::{AnnError, Result};

// Pools by thread count, started on first use and kept for the process.
static POOLS: OnceLock<Mutex<HashMap<usize, Arc<ThreadPool>>>> = OnceLock::new();

/// Independent generator for task `stream` of a seeded computation, so that
/// results do not depend on which worker runs which task.
pub(crate) fn stream_rng(seed: u64, stream: u64) -> StdRng {
    let mixed = seed ^ stream.wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    StdRng::seed_from_u64(mixed)
}

/// Threads to use for a `cores` request: 0 and 1 mean sequential, larger
/// requests are clipped to the hardware concurrency.
pub(crate) fn effective_threads(cores: usize) -> usize {
    if cores <= 1 {
        return 1;
    }
    let hardware = std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1);
    if cores > hardware {
        warn!(requested = cores, hardware, "Clipping worker count to available cores");
        hardware
    } else {
        cores
    }
}

/// Shared pool with exactly `threads` workers.
fn pool(threads: usize) -> Result<Arc<ThreadPool>> {
    let mut pools = POOLS
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    if let Some(pool) = pools.get(&threads) {
        return Ok(Arc::clone(pool));
    }
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("ann-worker-{}", i))
        .build()
        .map_err(|e| {
            let reason = format!("Failed to start worker pool: {}", e);
            AnnError::from(io::Error::new(io::ErrorKind::Other, reason))
        })?;
    debug!(threads, "Started worker pool");
    let pool = Arc::new(pool);
    pools.insert(threads, Arc::clone(&pool));
    Ok(pool)
}

/// Map `f` over `0..len`, in order, on up to `cores` workers.
pub(crate) fn parallel_map<U, F>(cores: usize, len: usize, f: F) -> Result<Vec<U>>
where
    U: Send,
    F: Fn(usize) -> U + Sync + Send,
{
    let threads = effective_threads(cores).min(len.max(1));
    if threads <= 1 {
        return Ok((0..len).map(f).collect());
    }
    let pool = pool(threads)?;
    Ok(pool.install(|| (0..len).into_par_iter().map(f).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_for_zero_and_one() {
        assert_eq!(effective_threads(0), 1);
        assert_eq!(effective_threads(1), 1);
    }

    #[test]
    fn test_clipped_to_hardware() {
        let hw = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        assert!(effective_threads(10_000) <= hw);
    }

    #[test]
    fn test_map_preserves_order() {
        let seq = parallel_map(1, 100, |i| i * i).unwrap();
        let par = parallel_map(4, 100, |i| i * i).unwrap();
        assert_eq!(seq, par);
        assert_eq!(par[9], 81);
    }

    #[test]
    fn test_pools_are_reused() {
        let a = pool(2).unwrap();
        let b = pool(2).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.current_num_threads(), 2);
        let c = pool(3).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(c.current_num_threads(), 3);
    }

    #[test]
    fn test_empty_range() {
        let out: Vec<usize> = parallel_map(8, 0, |i| i).unwrap();
        assert!(out.is_empty());
    }
}
