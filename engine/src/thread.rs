//! Two-level thread pools
//!
//! The scheduler uses two nested parallel levels: R "region threads"
//! cooperate on the blocks of a region, and each region thread drives B
//! "block threads" over the sub-blocks of a mini-block. When B is 1, the
//! inner level collapses to the region thread itself. A flat thread id
//! `region * B + block` spans `[0, R*B)`.

use data::error::{Error, Result};
use rayon::ThreadPool;

/// The region-level pool and the per-region-thread block pools
pub struct ThreadPools {
    /// Outer pool of R region threads
    pub region: ThreadPool,

    /// One inner pool of B threads per region thread; empty when B == 1
    pub block: Vec<ThreadPool>,

    pub num_region: usize,
    pub num_block: usize,
}
//
impl ThreadPools {
    /// Carve the thread budget into the two levels
    ///
    /// `max_threads` of 0 uses `hw_threads`; the total is reduced by
    /// `thread_divisor`, and `num_block_threads` of them serve each block.
    pub fn new(
        max_threads: usize,
        thread_divisor: usize,
        num_block_threads: usize,
        hw_threads: usize,
    ) -> Result<Self> {
        let total = if max_threads == 0 {
            hw_threads
        } else {
            max_threads
        };
        let total = (total / thread_divisor.max(1)).max(1);
        let num_block = num_block_threads.clamp(1, total);
        let num_region = (total / num_block).max(1);

        let build = |n: usize| {
            rayon::ThreadPoolBuilder::new()
                .num_threads(n)
                .build()
                .map_err(|e| Error::Config(format!("failed to build thread pool: {e}")))
        };
        let region = build(num_region)?;
        let block = if num_block > 1 {
            (0..num_region)
                .map(|_| build(num_block))
                .collect::<Result<Vec<_>>>()?
        } else {
            Vec::new()
        };
        log::debug!(
            "thread pools: {num_region} region thread(s) x {num_block} block thread(s)"
        );
        Ok(Self {
            region,
            block,
            num_region,
            num_block,
        })
    }

    /// Unique id across both levels: `region * B + block`
    pub fn flat_thread_id(&self, region_thread: usize, block_thread: usize) -> usize {
        region_thread * self.num_block + block_thread
    }

    /// Total computation threads
    pub fn total_threads(&self) -> usize {
        self.num_region * self.num_block
    }

    /// The inner pool serving one region thread, if nesting is active
    pub fn block_pool(&self, region_thread: usize) -> Option<&ThreadPool> {
        self.block.get(region_thread)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::prelude::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[test]
    fn budget_is_split_between_levels() {
        let pools = ThreadPools::new(8, 1, 2, 16).unwrap();
        assert_eq!(pools.num_region, 4);
        assert_eq!(pools.num_block, 2);
        assert_eq!(pools.block.len(), 4);
        assert_eq!(pools.total_threads(), 8);
        assert_eq!(pools.flat_thread_id(3, 1), 7);
    }

    #[test]
    fn collapsed_inner_level_builds_no_pools() {
        let pools = ThreadPools::new(4, 1, 1, 4).unwrap();
        assert_eq!(pools.num_block, 1);
        assert!(pools.block.is_empty());
    }

    #[test]
    fn nested_install_exposes_both_indices() {
        let pools = ThreadPools::new(4, 1, 2, 4).unwrap();
        let seen = Mutex::new(HashSet::new());
        pools.region.install(|| {
            (0..pools.num_region).into_par_iter().for_each(|_| {
                let r = rayon::current_thread_index().unwrap_or(0);
                if let Some(inner) = pools.block_pool(r) {
                    inner.install(|| {
                        (0..2).into_par_iter().for_each(|_| {
                            let b = rayon::current_thread_index().unwrap_or(0);
                            seen.lock().unwrap().insert(pools.flat_thread_id(r, b));
                        });
                    });
                }
            });
        });
        let seen = seen.lock().unwrap();
        assert!(!seen.is_empty());
        assert!(seen.iter().all(|&id| id < pools.total_threads()));
    }
}
