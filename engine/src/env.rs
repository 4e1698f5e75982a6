//! Kernel environment
//!
//! Wraps the transport and the thread budget. Created once per process (or
//! once per in-process rank when testing with a thread transport) and
//! shared by every solution built from it.

use crate::comm::{Comm, SoloComm};
use data::error::Result;
use std::sync::Arc;

/// Environment shared by the solutions of one rank
pub struct KernelEnv {
    comm: Arc<dyn Comm>,

    /// Hardware thread budget discovered at startup
    pub max_threads: usize,
}
//
impl KernelEnv {
    /// Single-rank environment with the default transport
    pub fn new() -> Arc<Self> {
        Self::with_comm(Arc::new(SoloComm))
    }

    /// Environment on an explicit transport
    pub fn with_comm(comm: Arc<dyn Comm>) -> Arc<Self> {
        let max_threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Arc::new(Self { comm, max_threads })
    }

    /// The transport
    pub fn comm(&self) -> &Arc<dyn Comm> {
        &self.comm
    }

    /// Total number of ranks
    pub fn num_ranks(&self) -> usize {
        self.comm.num_ranks()
    }

    /// This rank's index
    pub fn rank_index(&self) -> usize {
        self.comm.rank()
    }

    /// Block until every rank has arrived
    pub fn global_barrier(&self) -> Result<()> {
        self.comm.barrier()
    }
}

/// Single-rank environment; alias for discoverability from the API docs
pub fn new_env() -> Arc<KernelEnv> {
    KernelEnv::new()
}

/// Environment on an explicit transport
pub fn new_env_with_comm(comm: Arc<dyn Comm>) -> Arc<KernelEnv> {
    KernelEnv::with_comm(comm)
}
