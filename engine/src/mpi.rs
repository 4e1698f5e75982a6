//! Neighborhood info and halo buffers
//!
//! The neighborhood of a rank is the product of {prev, self, next} over the
//! domain dims: 3^N cells including self. For every neighbor and every var
//! that exchanges with it, a send/receive buffer pair carries the copy
//! window (in element coordinates of the var), a flag allowing fold-aligned
//! vector copies, and the storage behind it — owned memory or a handle into
//! the shared-memory window.

use crate::comm::shm::ShmBuf;
use data::indices::Indices;
use data::Precision;
use std::sync::Arc;

/// Cell offsets of a neighbor in one dim
pub const RANK_PREV: i64 = 0;
pub const RANK_SELF: i64 = 1;
pub const RANK_NEXT: i64 = 2;

/// Cells per dim in the neighborhood
pub const NUM_OFFSETS: i64 = 3;

/// Static facts about this rank's neighborhood
#[derive(Debug)]
pub struct MpiInfo {
    /// Number of domain dims
    pub ndims: usize,

    /// Total neighborhood cells, 3^ndims, including self
    pub neighborhood_size: usize,

    /// Index of the self cell
    pub my_neighbor_index: usize,

    /// MPI rank per cell; `None` where there is no neighbor
    pub my_neighbors: Vec<Option<usize>>,

    /// Manhattan distance per cell
    pub man_dists: Vec<i64>,

    /// Whether the cell's rank has all-vector-multiple domain sizes
    pub has_all_vlen_mults: Vec<bool>,

    /// Shared-memory rank per cell, when the neighbor is co-located
    pub shm_ranks: Vec<Option<usize>>,
}
//
impl MpiInfo {
    /// Empty neighborhood over `ndims` domain dims
    pub fn new(ndims: usize) -> Self {
        let size = (NUM_OFFSETS as usize).pow(ndims as u32);
        let self_offsets = Indices::new(ndims, RANK_SELF);
        let mut info = Self {
            ndims,
            neighborhood_size: size,
            my_neighbor_index: 0,
            my_neighbors: vec![None; size],
            man_dists: vec![0; size],
            has_all_vlen_mults: vec![false; size],
            shm_ranks: vec![None; size],
        };
        info.my_neighbor_index = info.neighbor_index(&self_offsets);
        info
    }

    /// Row-major cell index of a tuple of per-dim offsets (0..=2 each)
    pub fn neighbor_index(&self, offsets: &Indices) -> usize {
        debug_assert_eq!(offsets.len(), self.ndims);
        let mut idx = 0i64;
        for j in 0..self.ndims {
            debug_assert!((0..NUM_OFFSETS).contains(&offsets[j]));
            idx = idx * NUM_OFFSETS + offsets[j];
        }
        idx as usize
    }

    /// Per-dim offsets (0..=2) of a cell index
    pub fn neighbor_offsets(&self, mut index: usize) -> Indices {
        let mut ofs = Indices::new(self.ndims, 0);
        for j in (0..self.ndims).rev() {
            ofs[j] = (index as i64) % NUM_OFFSETS;
            index /= NUM_OFFSETS as usize;
        }
        ofs
    }

    /// Visit every cell except self: `(offsets, rank_or_none, cell_index)`
    pub fn visit_neighbors(&self, mut visitor: impl FnMut(&Indices, Option<usize>, usize)) {
        for ni in 0..self.neighborhood_size {
            if ni == self.my_neighbor_index {
                continue;
            }
            let ofs = self.neighbor_offsets(ni);
            visitor(&ofs, self.my_neighbors[ni], ni);
        }
    }
}

/// Direction of one buffer in a pair
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BufDir {
    Send,
    Recv,
}

/// Storage behind one halo buffer
pub enum BufStorage {
    /// Not yet planned or zero-sized
    None,
    /// Memory owned by this rank
    Owned(Vec<Precision>),
    /// A buffer inside the shared-memory window (owner may be a peer)
    Shm(Arc<ShmBuf>),
}
//
impl std::fmt::Debug for BufStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BufStorage::None => write!(f, "None"),
            BufStorage::Owned(v) => write!(f, "Owned({} elems)", v.len()),
            BufStorage::Shm(b) => write!(f, "Shm({} elems)", b.len()),
        }
    }
}

/// One halo buffer for one (var, neighbor) pair
#[derive(Debug)]
pub struct MpiBuf {
    /// Descriptive name, unique per (var, direction, rank pair)
    pub name: String,

    /// First copied point, in element coordinates of the owning var
    pub begin_pt: Vec<i64>,

    /// Last copied point (inclusive); the step entry is a placeholder
    /// overwritten at each exchange
    pub last_pt: Vec<i64>,

    /// Points copied per dim
    pub num_pts: Vec<i64>,

    /// Whether fold-aligned vector copies may be used
    pub vec_copy_ok: bool,

    pub storage: BufStorage,

    /// Byte offset of this buffer within its owner's planned slab; shared
    /// across ranks so peers can locate shm buffers
    pub plan_offset: u64,
}
//
impl MpiBuf {
    /// An unplanned, empty buffer
    pub fn new() -> Self {
        Self {
            name: String::new(),
            begin_pt: Vec::new(),
            last_pt: Vec::new(),
            num_pts: Vec::new(),
            vec_copy_ok: false,
            storage: BufStorage::None,
            plan_offset: 0,
        }
    }

    /// Total elements over the full copy window (every step slot)
    pub fn size(&self) -> i64 {
        if self.num_pts.is_empty() {
            0
        } else {
            self.num_pts.iter().product()
        }
    }

    /// Total bytes over the full copy window
    pub fn bytes(&self) -> usize {
        self.size() as usize * data::ELEMENT_BYTES
    }

    /// Whether the buffer participates in exchanges at all
    pub fn is_active(&self) -> bool {
        self.size() > 0
    }

    /// Forget any storage; planning data survives
    pub fn release_storage(&mut self) {
        self.storage = BufStorage::None;
    }
}
//
impl Default for MpiBuf {
    fn default() -> Self {
        Self::new()
    }
}

/// The send/receive pair for one (var, neighbor)
#[derive(Debug, Default)]
pub struct MpiBufs {
    pub send: MpiBuf,
    pub recv: MpiBuf,
}
//
impl MpiBufs {
    pub fn buf_mut(&mut self, dir: BufDir) -> &mut MpiBuf {
        match dir {
            BufDir::Send => &mut self.send,
            BufDir::Recv => &mut self.recv,
        }
    }

    /// Re-arm the send-side shm lock; the peer owns the recv side
    pub fn reset_locks(&mut self) {
        if let BufStorage::Shm(buf) = &self.send.storage {
            buf.lock.init();
        }
    }
}

/// All halo-exchange state for one var
#[derive(Debug)]
pub struct MpiData {
    /// One buffer pair per neighborhood cell
    pub bufs: Vec<MpiBufs>,

    /// Posted (not yet fulfilled) receive tag per cell
    pub recv_pending: Vec<Option<u64>>,

    /// Payloads already pulled off the transport by a poke
    pub recv_ready: Vec<Option<Vec<Precision>>>,
}
//
impl MpiData {
    pub fn new(neighborhood_size: usize) -> Self {
        Self {
            bufs: (0..neighborhood_size).map(|_| MpiBufs::default()).collect(),
            recv_pending: vec![None; neighborhood_size],
            recv_ready: (0..neighborhood_size).map(|_| None).collect(),
        }
    }

    pub fn reset_locks(&mut self) {
        for b in &mut self.bufs {
            b.reset_locks();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neighbor_index_round_trips() {
        let info = MpiInfo::new(3);
        assert_eq!(info.neighborhood_size, 27);
        // Self sits at the center cell.
        assert_eq!(info.my_neighbor_index, 13);
        for ni in 0..info.neighborhood_size {
            let ofs = info.neighbor_offsets(ni);
            assert_eq!(info.neighbor_index(&ofs), ni);
        }
    }

    #[test]
    fn visit_skips_self() {
        let info = MpiInfo::new(2);
        let mut seen = 0;
        info.visit_neighbors(|_, _, ni| {
            assert_ne!(ni, info.my_neighbor_index);
            seen += 1;
        });
        assert_eq!(seen, 8);
    }
}
