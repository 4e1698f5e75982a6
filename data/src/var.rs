//! N-dimensional vars
//!
//! A [`Var`] owns (or aliases) the storage for one named quantity. Its dims
//! are any subset of the solution's dims: at most one step dim, any domain
//! dims, any misc dims. Around the domain, each dim carries halos (kept in
//! sync by the halo exchange) and pads (allocated slack containing the
//! halos). The step dim uses rotational storage: writing step `t+1` may
//! evict the oldest step, and the valid steps always form a contiguous
//! window no longer than the step allocation.
//!
//! Element storage is row-major over the allocation sizes, in the var's dim
//! order. The SIMD fold affects only geometry (pad alignment and the
//! rounding rules of the tile scheduler), not the storage layout; the inner
//! kernels supplied by the stencil compiler see global element indices.

use crate::dims::{DimKind, DimSet};
use crate::error::{Error, Result};
use crate::math;
use crate::Precision;
use ndarray::{ArrayD, IxDyn};
use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Shared element storage behind a var (or several fused vars)
///
/// During a parallel tile sweep many threads write elements of the same var
/// through `&VarStorage`. Safety rests on the tile decomposition: the
/// scheduler hands every (step, point) to exactly one sub-block, and a
/// bundle's writes are confined to its declared output vars, so no two
/// threads ever touch the same element between joins.
pub struct VarStorage {
    data: UnsafeCell<ArrayD<Precision>>,
}
//
// SAFETY: see the struct-level contract; all aliased access goes through
// raw-pointer reads/writes of disjoint elements.
unsafe impl Sync for VarStorage {}
unsafe impl Send for VarStorage {}
//
impl VarStorage {
    fn new(shape: &[usize]) -> Self {
        Self {
            data: UnsafeCell::new(ArrayD::zeros(IxDyn(shape))),
        }
    }

    /// Total number of stored elements
    pub fn len(&self) -> usize {
        // SAFETY: len() does not alias element data.
        unsafe { (*self.data.get()).len() }
    }

    /// Whether the storage is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read one element by linear offset
    ///
    /// # Safety
    /// `off` must be in bounds and no other thread may be writing this
    /// element concurrently.
    #[inline]
    pub unsafe fn read(&self, off: usize) -> Precision {
        debug_assert!(off < self.len());
        *(*self.data.get()).as_ptr().add(off)
    }

    /// Write one element by linear offset
    ///
    /// # Safety
    /// `off` must be in bounds and no other thread may be reading or
    /// writing this element concurrently.
    #[inline]
    pub unsafe fn write(&self, off: usize, val: Precision) {
        debug_assert!(off < self.len());
        *(*self.data.get()).as_mut_ptr().add(off) = val;
    }

    /// Exclusive view of the backing array
    ///
    /// Callers reach this through `&mut Var`, which the solution API only
    /// hands out between parallel sweeps.
    #[allow(clippy::mut_from_ref)]
    fn array_mut(&self) -> &mut ArrayD<Precision> {
        // SAFETY: only called from &mut Var methods; see above.
        unsafe { &mut *self.data.get() }
    }

    /// Shared view of the backing array
    fn array(&self) -> &ArrayD<Precision> {
        // SAFETY: only called while no parallel sweep is running.
        unsafe { &*self.data.get() }
    }
}

/// Per-dim bookkeeping inside a var
#[derive(Debug)]
pub struct VarDim {
    name: String,
    kind: DimKind,

    /// Domain size (domain dims), element count (misc dims); unused for step
    domain_size: i64,

    left_halo: i64,
    right_halo: i64,

    /// User-requested minimum total pads (must contain the halos)
    left_min_pad: i64,
    right_min_pad: i64,

    /// User-requested extra pad outside the halos
    left_extra_pad: i64,
    right_extra_pad: i64,

    /// Committed pads; grow-only
    left_pad: i64,
    right_pad: i64,

    /// Committed allocation size in this dim
    alloc_size: i64,

    /// Global index of the first rank-domain point
    rank_offset: i64,

    /// Offset of this var's domain relative to the rank start; non-zero only
    /// for scratch vars, where it tracks the current mini-block. Updated by
    /// the owning region thread during a sweep, hence atomic.
    local_offset: AtomicI64,

    /// Wave-front extensions to cover skewed tile shifts
    left_wf_ext: i64,
    right_wf_ext: i64,

    /// SIMD fold length (1 in non-vectorized dims)
    fold_len: i64,

    /// First valid index in a misc dim
    first_misc: i64,
}
//
impl VarDim {
    fn new(name: &str, kind: DimKind, fold_len: i64) -> Self {
        Self {
            name: name.to_string(),
            kind,
            domain_size: 0,
            left_halo: 0,
            right_halo: 0,
            left_min_pad: 0,
            right_min_pad: 0,
            left_extra_pad: 0,
            right_extra_pad: 0,
            left_pad: 0,
            right_pad: 0,
            alloc_size: if kind == DimKind::Step { 1 } else { 0 },
            rank_offset: 0,
            local_offset: AtomicI64::new(0),
            left_wf_ext: 0,
            right_wf_ext: 0,
            fold_len,
            first_misc: 0,
        }
    }

    /// Pad the left side must reach, given current settings
    fn needed_left_pad(&self) -> i64 {
        let want = self
            .left_min_pad
            .max(self.left_halo + self.left_extra_pad)
            .max(self.left_halo + self.left_wf_ext);
        math::round_up(want.max(self.left_pad), self.fold_len)
    }

    /// Pad the right side must reach, given current settings
    fn needed_right_pad(&self) -> i64 {
        let want = self
            .right_min_pad
            .max(self.right_halo + self.right_extra_pad)
            .max(self.right_halo + self.right_wf_ext);
        want.max(self.right_pad)
    }
}

/// One named n-dimensional quantity
pub struct Var {
    name: String,
    dims: Vec<VarDim>,

    /// Position of the step dim in `dims`, if used
    step_posn: Option<usize>,

    storage: Option<Arc<VarStorage>>,

    fixed_size: bool,
    scratch: bool,
    step_wrap: bool,

    /// Preferred memory key for the allocation planner
    numa_pref: i32,

    /// Valid step window (inclusive); meaningful once storage exists
    first_valid_step: i64,
    last_valid_step: i64,

    /// Per-step-slot dirty flags; single slot for vars without a step dim
    dirty: Vec<bool>,

    /// Max Manhattan distance of neighbors this var must exchange with
    l1_norm: i64,
}
//
impl Var {
    /// Create a var over a subset of the solution dims; metadata only
    pub fn new(name: impl Into<String>, dims: &DimSet, dim_names: &[&str]) -> Result<Self> {
        let name = name.into();
        let mut vdims = Vec::with_capacity(dim_names.len());
        let mut step_posn = None;
        for (i, dname) in dim_names.iter().enumerate() {
            let kind = dims.kind_of(dname).ok_or_else(|| {
                Error::DimMismatch(format!(
                    "var '{name}': dimension '{dname}' is not a solution dimension"
                ))
            })?;
            if vdims.iter().any(|d: &VarDim| d.name == *dname) {
                return Err(Error::DimMismatch(format!(
                    "var '{name}': dimension '{dname}' appears twice"
                )));
            }
            if kind == DimKind::Step {
                step_posn = Some(i);
            }
            let fold = match kind {
                DimKind::Domain => dims.fold_len(dims.domain_posn(dname).unwrap()),
                _ => 1,
            };
            vdims.push(VarDim::new(dname, kind, fold));
        }
        let nslots = 1;
        Ok(Self {
            name,
            dims: vdims,
            step_posn,
            storage: None,
            fixed_size: false,
            scratch: false,
            step_wrap: false,
            numa_pref: NUMA_PREF_DEFAULT,
            first_valid_step: 0,
            last_valid_step: -1,
            dirty: vec![false; nslots],
            l1_norm: 0,
        })
    }

    /// Create a fixed-size var: it ignores solution resizes and sits at rank
    /// offset zero in every domain dim
    pub fn new_fixed_size(
        name: impl Into<String>,
        dims: &DimSet,
        dim_names: &[&str],
        sizes: &[i64],
    ) -> Result<Self> {
        let mut var = Self::new(name, dims, dim_names)?;
        if sizes.len() != var.dims.len() {
            return Err(Error::DimMismatch(format!(
                "var '{}': {} size(s) given for {} dimension(s)",
                var.name,
                sizes.len(),
                var.dims.len()
            )));
        }
        var.fixed_size = true;
        for (d, &sz) in var.dims.iter_mut().zip(sizes) {
            match d.kind {
                DimKind::Step => d.alloc_size = sz,
                _ => d.domain_size = sz,
            }
        }
        Ok(var)
    }

    /// Var name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of dims
    pub fn num_dims(&self) -> usize {
        self.dims.len()
    }

    /// Dim names in order
    pub fn dim_names(&self) -> Vec<&str> {
        self.dims.iter().map(|d| d.name.as_str()).collect()
    }

    /// Whether the named dim is used by this var
    pub fn is_dim_used(&self, name: &str) -> bool {
        self.dims.iter().any(|d| d.name == name)
    }

    /// Position of the named dim in this var, if used
    pub fn dim_posn(&self, name: &str) -> Option<usize> {
        self.dims.iter().position(|d| d.name == name)
    }

    /// Position of the step dim in this var, if used
    pub fn step_posn(&self) -> Option<usize> {
        self.step_posn
    }

    /// Kind of the dim at position `i`
    pub fn dim_kind(&self, i: usize) -> DimKind {
        self.dims[i].kind
    }

    /// Whether this var ignores solution resizes
    pub fn is_fixed_size(&self) -> bool {
        self.fixed_size
    }

    /// Whether this var is thread-private scratch storage
    pub fn is_scratch(&self) -> bool {
        self.scratch
    }

    /// Mark this var as scratch storage
    pub fn set_scratch(&mut self, scratch: bool) {
        self.scratch = scratch;
    }

    /// Whether step indices outside the valid window alias into it
    pub fn step_wrap(&self) -> bool {
        self.step_wrap
    }

    /// Allow step indices to be taken modulo the step allocation
    pub fn set_step_wrap(&mut self, wrap: bool) {
        self.step_wrap = wrap;
    }

    /// Preferred memory key for the allocation planner
    pub fn numa_preferred(&self) -> i32 {
        self.numa_pref
    }

    /// Set the preferred memory key
    pub fn set_numa_preferred(&mut self, key: i32) {
        self.numa_pref = key;
    }

    /// Max Manhattan distance of neighbors this var exchanges halos with
    pub fn halo_exchange_l1_norm(&self) -> i64 {
        self.l1_norm
    }

    /// Set the halo-exchange distance (normally done by the compiler)
    pub fn set_halo_exchange_l1_norm(&mut self, norm: i64) {
        self.l1_norm = norm;
    }

    // --- size and pad configuration -------------------------------------

    fn dim_mut(&mut self, name: &str, fn_name: &str) -> Result<&mut VarDim> {
        let n = self.name.clone();
        self.dims
            .iter_mut()
            .find(|d| d.name == name)
            .ok_or_else(|| {
                Error::DimMismatch(format!(
                    "{fn_name}: dimension '{name}' is not used in var '{n}'"
                ))
            })
    }

    fn require_unallocated(&self, fn_name: &str) -> Result<()> {
        if self.storage.is_some() {
            return Err(Error::Preparation(format!(
                "{fn_name}: var '{}' already has storage allocated",
                self.name
            )));
        }
        Ok(())
    }

    /// Set the rank-domain size in a domain dim
    pub fn set_domain_size(&mut self, dim: &str, size: i64) -> Result<()> {
        self.require_unallocated("set_domain_size")?;
        let d = self.dim_mut(dim, "set_domain_size")?;
        d.domain_size = size;
        Ok(())
    }

    /// Set both halos in a dim
    pub fn set_halo_size(&mut self, dim: &str, size: i64) -> Result<()> {
        self.set_left_halo_size(dim, size)?;
        self.set_right_halo_size(dim, size)
    }

    /// Set the left halo; a halo bigger than the pad grows the pad
    pub fn set_left_halo_size(&mut self, dim: &str, size: i64) -> Result<()> {
        self.require_unallocated("set_left_halo_size")?;
        let d = self.dim_mut(dim, "set_left_halo_size")?;
        d.left_halo = size;
        Ok(())
    }

    /// Set the right halo; a halo bigger than the pad grows the pad
    pub fn set_right_halo_size(&mut self, dim: &str, size: i64) -> Result<()> {
        self.require_unallocated("set_right_halo_size")?;
        let d = self.dim_mut(dim, "set_right_halo_size")?;
        d.right_halo = size;
        Ok(())
    }

    /// Set both minimum pads in a dim
    pub fn set_min_pad_size(&mut self, dim: &str, size: i64) -> Result<()> {
        self.set_left_min_pad_size(dim, size)?;
        self.set_right_min_pad_size(dim, size)
    }

    /// Request a minimum total left pad (including the halo)
    pub fn set_left_min_pad_size(&mut self, dim: &str, size: i64) -> Result<()> {
        self.require_unallocated("set_left_min_pad_size")?;
        let d = self.dim_mut(dim, "set_left_min_pad_size")?;
        d.left_min_pad = d.left_min_pad.max(size);
        Ok(())
    }

    /// Request a minimum total right pad (including the halo)
    pub fn set_right_min_pad_size(&mut self, dim: &str, size: i64) -> Result<()> {
        self.require_unallocated("set_right_min_pad_size")?;
        let d = self.dim_mut(dim, "set_right_min_pad_size")?;
        d.right_min_pad = d.right_min_pad.max(size);
        Ok(())
    }

    /// Request extra pad outside the halos on both sides
    pub fn set_extra_pad_size(&mut self, dim: &str, size: i64) -> Result<()> {
        self.require_unallocated("set_extra_pad_size")?;
        let d = self.dim_mut(dim, "set_extra_pad_size")?;
        d.left_extra_pad = d.left_extra_pad.max(size);
        d.right_extra_pad = d.right_extra_pad.max(size);
        Ok(())
    }

    /// Set the allocation size directly (step dim, misc dims, or any dim of
    /// a fixed-size var)
    pub fn set_alloc_size(&mut self, dim: &str, size: i64) -> Result<()> {
        self.require_unallocated("set_alloc_size")?;
        let fixed = self.fixed_size;
        let d = self.dim_mut(dim, "set_alloc_size")?;
        match d.kind {
            DimKind::Step => d.alloc_size = size,
            DimKind::Misc => d.domain_size = size,
            DimKind::Domain if fixed => d.domain_size = size,
            DimKind::Domain => {
                return Err(Error::Config(format!(
                    "set_alloc_size: domain dimension '{dim}' of non-fixed-size var \
                     is sized by the solution"
                )))
            }
        }
        Ok(())
    }

    /// Set the first valid index of a misc dim
    pub fn set_first_misc_index(&mut self, dim: &str, idx: i64) -> Result<()> {
        self.require_unallocated("set_first_misc_index")?;
        let d = self.dim_mut(dim, "set_first_misc_index")?;
        if d.kind != DimKind::Misc {
            return Err(Error::Config(format!(
                "set_first_misc_index: dimension '{dim}' is not a misc dimension"
            )));
        }
        d.first_misc = idx;
        Ok(())
    }

    /// Set the global index of the first rank-domain point (engine use)
    pub fn set_rank_offset(&mut self, posn: usize, ofs: i64) {
        if !self.fixed_size {
            self.dims[posn].rank_offset = ofs;
        }
    }

    /// Set the wave-front extensions in a dim (engine use)
    pub fn set_wf_exts(&mut self, posn: usize, left: i64, right: i64) {
        self.dims[posn].left_wf_ext = left;
        self.dims[posn].right_wf_ext = right;
    }

    /// Move a scratch var's domain to track the current mini-block begin
    ///
    /// Rounded down so the domain start stays vector-aligned within the
    /// allocation. May be called through `&self` from the owning thread.
    pub fn set_local_offset(&self, posn: usize, ofs: i64) {
        let d = &self.dims[posn];
        let aligned = math::round_down(ofs, d.fold_len);
        d.local_offset.store(aligned, Ordering::Relaxed);
    }

    // --- geometry queries ------------------------------------------------

    fn local_offset(&self, i: usize) -> i64 {
        self.dims[i].local_offset.load(Ordering::Relaxed)
    }

    /// Rank-domain size in a dim
    pub fn domain_size(&self, i: usize) -> i64 {
        self.dims[i].domain_size
    }

    /// Left halo in a dim
    pub fn left_halo_size(&self, i: usize) -> i64 {
        self.dims[i].left_halo
    }

    /// Right halo in a dim
    pub fn right_halo_size(&self, i: usize) -> i64 {
        self.dims[i].right_halo
    }

    /// Committed (or prospective) left pad in a dim
    pub fn left_pad_size(&self, i: usize) -> i64 {
        self.dims[i].needed_left_pad()
    }

    /// Committed (or prospective) right pad in a dim
    pub fn right_pad_size(&self, i: usize) -> i64 {
        self.dims[i].needed_right_pad()
    }

    /// Allocation size in a dim
    pub fn alloc_size(&self, i: usize) -> i64 {
        let d = &self.dims[i];
        match d.kind {
            DimKind::Step => d.alloc_size,
            DimKind::Misc => d.domain_size,
            DimKind::Domain => {
                if self.storage.is_some() {
                    d.alloc_size
                } else {
                    let lp = d.needed_left_pad();
                    let rp = d.needed_right_pad();
                    math::round_up(lp + d.domain_size + rp, d.fold_len)
                }
            }
        }
    }

    /// Global index of the first rank-domain point in a domain dim
    pub fn first_rank_domain_index(&self, i: usize) -> i64 {
        let d = &self.dims[i];
        d.rank_offset + self.local_offset(i)
    }

    /// Global index of the last rank-domain point in a domain dim
    pub fn last_rank_domain_index(&self, i: usize) -> i64 {
        self.first_rank_domain_index(i) + self.dims[i].domain_size - 1
    }

    /// Global index of the first halo point on the left
    pub fn first_rank_halo_index(&self, i: usize) -> i64 {
        self.first_rank_domain_index(i) - self.dims[i].left_halo
    }

    /// Global index of the last halo point on the right
    pub fn last_rank_halo_index(&self, i: usize) -> i64 {
        self.last_rank_domain_index(i) + self.dims[i].right_halo
    }

    /// Global index of the first allocated point in a domain dim
    pub fn first_rank_alloc_index(&self, i: usize) -> i64 {
        self.first_rank_domain_index(i) - self.left_pad_size(i)
    }

    /// Global index of the last allocated point in a domain dim
    pub fn last_rank_alloc_index(&self, i: usize) -> i64 {
        self.first_rank_alloc_index(i) + self.alloc_size(i) - 1
    }

    /// First valid index of a misc dim
    pub fn first_misc_index(&self, i: usize) -> i64 {
        self.dims[i].first_misc
    }

    /// Last valid index of a misc dim
    pub fn last_misc_index(&self, i: usize) -> i64 {
        self.dims[i].first_misc + self.dims[i].domain_size - 1
    }

    /// First step index in the valid window
    pub fn first_valid_step_index(&self) -> i64 {
        self.first_valid_step
    }

    /// Last step index in the valid window
    pub fn last_valid_step_index(&self) -> i64 {
        self.last_valid_step
    }

    /// Whether every index lies in this rank's allocation
    ///
    /// Domain dims check the allocated range, misc dims the declared index
    /// range, and the step dim the valid window (any index when wrapping).
    pub fn are_indices_local(&self, idxs: &[i64]) -> bool {
        debug_assert_eq!(idxs.len(), self.dims.len());
        self.dims.iter().enumerate().all(|(i, d)| match d.kind {
            DimKind::Step => {
                self.step_wrap
                    || (idxs[i] >= self.first_valid_step && idxs[i] <= self.last_valid_step)
            }
            DimKind::Domain => {
                idxs[i] >= self.first_rank_alloc_index(i)
                    && idxs[i] <= self.last_rank_alloc_index(i)
            }
            DimKind::Misc => {
                idxs[i] >= self.first_misc_index(i) && idxs[i] <= self.last_misc_index(i)
            }
        })
    }

    /// Render a set of indices against this var's dim names
    pub fn format_indices(&self, idxs: &[i64]) -> String {
        self.dims
            .iter()
            .zip(idxs)
            .map(|(d, v)| format!("{}={v}", d.name))
            .collect::<Vec<_>>()
            .join(", ")
    }

    // --- step window and dirty tracking ----------------------------------

    fn step_alloc(&self) -> i64 {
        self.step_posn.map_or(1, |p| self.dims[p].alloc_size)
    }

    fn step_slot(&self, t: i64) -> usize {
        math::mod_flr(t, self.step_alloc()) as usize
    }

    /// Slide the valid window to admit step `t`, possibly evicting the
    /// oldest step on the other side
    pub fn update_valid_step(&mut self, t: i64) {
        let cap = self.step_alloc();
        if t > self.last_valid_step {
            self.last_valid_step = t;
            self.first_valid_step = self.first_valid_step.max(t - cap + 1);
        }
        if t < self.first_valid_step {
            self.first_valid_step = t;
            self.last_valid_step = self.last_valid_step.min(t + cap - 1);
        }
    }

    /// Whether the halo at step `t` is out of date
    pub fn is_dirty(&self, t: i64) -> bool {
        self.dirty[self.step_slot(t)]
    }

    /// Mark the halo at step `t` dirty or clean
    pub fn set_dirty(&mut self, flag: bool, t: i64) {
        let slot = self.step_slot(t);
        self.dirty[slot] = flag;
    }

    /// Mark every step slot dirty or clean
    pub fn set_dirty_all(&mut self, flag: bool) {
        self.dirty.iter_mut().for_each(|f| *f = flag);
    }

    // --- storage ---------------------------------------------------------

    /// Whether storage has been allocated
    pub fn is_storage_allocated(&self) -> bool {
        self.storage.is_some()
    }

    /// Total storage elements that allocation would use right now
    pub fn num_storage_elements(&self) -> i64 {
        (0..self.dims.len()).map(|i| self.alloc_size(i)).product()
    }

    /// Total storage bytes that allocation would use right now
    pub fn num_storage_bytes(&self) -> usize {
        self.num_storage_elements() as usize * crate::ELEMENT_BYTES
    }

    /// Commit pads and allocate zero-filled storage
    pub fn alloc_storage(&mut self) -> Result<()> {
        if self.storage.is_some() {
            return Ok(());
        }
        // Commit pads and allocs; pads are grow-only from here on.
        for i in 0..self.dims.len() {
            let lp = self.dims[i].needed_left_pad();
            let rp_min = self.dims[i].needed_right_pad();
            let d = &mut self.dims[i];
            if d.kind == DimKind::Domain {
                let alloc = math::round_up(lp + d.domain_size + rp_min, d.fold_len);
                d.left_pad = lp;
                d.right_pad = alloc - lp - d.domain_size;
                d.alloc_size = alloc;
            }
        }
        let mut shape = Vec::with_capacity(self.dims.len());
        for i in 0..self.dims.len() {
            let alloc = self.alloc_size(i);
            if alloc <= 0 {
                return Err(Error::Allocation(format!(
                    "var '{}': allocation size in dimension '{}' is {alloc}",
                    self.name, self.dims[i].name
                )));
            }
            shape.push(alloc as usize);
        }
        self.storage = Some(Arc::new(VarStorage::new(&shape)));
        self.first_valid_step = 0;
        self.last_valid_step = self.step_alloc() - 1;
        self.dirty = vec![false; self.step_alloc() as usize];
        log::debug!(
            "var '{}': {} element(s) allocated across [{}]",
            self.name,
            self.num_storage_elements(),
            (0..self.dims.len())
                .map(|i| format!("{}={}", self.dims[i].name, self.alloc_size(i)))
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(())
    }

    /// Drop the storage reference; metadata survives
    pub fn release_storage(&mut self) {
        self.storage = None;
    }

    /// Shared handle to the storage, if allocated
    pub fn storage(&self) -> Option<&Arc<VarStorage>> {
        self.storage.as_ref()
    }

    fn storage_ref(&self) -> Result<&Arc<VarStorage>> {
        self.storage.as_ref().ok_or_else(|| {
            Error::Preparation(format!("var '{}': storage is not allocated", self.name))
        })
    }

    /// Alias this var to `source`'s storage
    ///
    /// Fails with [`Error::DimMismatch`] unless the dim lists, fold layout,
    /// and committed allocation shapes agree.
    pub fn fuse_vars(&mut self, source: &Var) -> Result<()> {
        let src_storage = source.storage_ref()?.clone();
        if self.dims.len() != source.dims.len() {
            return Err(Error::DimMismatch(format!(
                "cannot fuse var '{}' onto '{}': different dimension counts",
                self.name, source.name
            )));
        }
        for (a, b) in self.dims.iter().zip(&source.dims) {
            if a.name != b.name || a.kind != b.kind || a.fold_len != b.fold_len {
                return Err(Error::DimMismatch(format!(
                    "cannot fuse var '{}' onto '{}': dimension '{}' differs",
                    self.name, source.name, a.name
                )));
            }
        }
        // Adopt the source geometry wholesale so indexing agrees.
        for (a, b) in self.dims.iter_mut().zip(&source.dims) {
            a.domain_size = b.domain_size;
            a.left_halo = b.left_halo;
            a.right_halo = b.right_halo;
            a.left_pad = b.left_pad;
            a.right_pad = b.right_pad;
            a.left_min_pad = b.left_min_pad;
            a.right_min_pad = b.right_min_pad;
            a.alloc_size = b.alloc_size;
            a.rank_offset = b.rank_offset;
            a.first_misc = b.first_misc;
        }
        self.first_valid_step = source.first_valid_step;
        self.last_valid_step = source.last_valid_step;
        self.dirty = source.dirty.clone();
        self.storage = Some(src_storage);
        Ok(())
    }

    /// Borrow the raw storage as a flat element slice
    pub fn raw_storage_buffer(&self) -> Result<&[Precision]> {
        let st = self.storage_ref()?;
        // Standard-layout arrays created by us are always contiguous.
        Ok(st
            .array()
            .as_slice_memory_order()
            .expect("var storage is contiguous by construction"))
    }

    // --- element addressing ----------------------------------------------

    /// Per-dim slot (0-based storage coordinate) of a global index
    fn slot_of(&self, i: usize, idx: i64, strict: bool) -> Result<Option<i64>> {
        let d = &self.dims[i];
        let slot = match d.kind {
            DimKind::Step => {
                if !self.step_wrap && (idx < self.first_valid_step || idx > self.last_valid_step) {
                    if strict {
                        return Err(Error::IndexOutOfRange(format!(
                            "var '{}': step index {idx} is outside valid window [{}...{}]",
                            self.name, self.first_valid_step, self.last_valid_step
                        )));
                    }
                    return Ok(None);
                }
                math::mod_flr(idx, d.alloc_size)
            }
            DimKind::Domain => idx - self.first_rank_alloc_index(i),
            DimKind::Misc => idx - d.first_misc,
        };
        if slot < 0 || slot >= self.alloc_size(i) {
            if strict {
                return Err(Error::IndexOutOfRange(format!(
                    "var '{}': index {idx} in dimension '{}' is outside allocated range \
                     [{}...{}]",
                    self.name,
                    d.name,
                    match d.kind {
                        DimKind::Domain => self.first_rank_alloc_index(i),
                        DimKind::Misc => d.first_misc,
                        DimKind::Step => 0,
                    },
                    match d.kind {
                        DimKind::Domain => self.last_rank_alloc_index(i),
                        DimKind::Misc => self.last_misc_index(i),
                        DimKind::Step => d.alloc_size - 1,
                    }
                )));
            }
            return Ok(None);
        }
        Ok(Some(slot))
    }

    /// Linear storage offset of a global index vector
    pub fn offset_of(&self, idxs: &[i64], strict: bool) -> Result<Option<usize>> {
        debug_assert_eq!(idxs.len(), self.dims.len());
        let mut off: i64 = 0;
        for i in 0..self.dims.len() {
            match self.slot_of(i, idxs[i], strict)? {
                Some(slot) => off = off * self.alloc_size(i) + slot,
                None => return Ok(None),
            }
        }
        Ok(Some(off as usize))
    }

    /// Linear storage offset without range checks (debug-asserted)
    ///
    /// The tile scheduler guarantees in-range indices; this is the hot-path
    /// variant used by the inner kernels.
    #[inline]
    pub fn offset_unchecked(&self, idxs: &[i64]) -> usize {
        debug_assert_eq!(idxs.len(), self.dims.len());
        let mut off: i64 = 0;
        for (i, d) in self.dims.iter().enumerate() {
            let slot = match d.kind {
                DimKind::Step => math::mod_flr(idxs[i], d.alloc_size),
                DimKind::Domain => idxs[i] - self.first_rank_alloc_index(i),
                DimKind::Misc => idxs[i] - d.first_misc,
            };
            debug_assert!(
                slot >= 0 && slot < self.alloc_size(i),
                "var '{}': unchecked index {} out of range in dim '{}'",
                self.name,
                idxs[i],
                d.name
            );
            off = off * self.alloc_size(i) + slot;
        }
        off as usize
    }

    // --- element access --------------------------------------------------

    /// Read one element
    pub fn get_element(&self, idxs: &[i64]) -> Result<Precision> {
        let st = self.storage_ref()?;
        let off = self
            .offset_of(idxs, true)?
            .expect("strict offset lookup always yields an offset");
        // SAFETY: in bounds per offset_of; shared read outside sweeps.
        Ok(unsafe { st.read(off) })
    }

    /// Write one element; returns the number of elements written (0 or 1)
    pub fn set_element(&mut self, val: Precision, idxs: &[i64], strict: bool) -> Result<usize> {
        if self.storage.is_none() {
            if strict {
                return Err(Error::Preparation(format!(
                    "var '{}': storage is not allocated",
                    self.name
                )));
            }
            return Ok(0);
        }
        match self.offset_of(idxs, strict)? {
            Some(off) => {
                let st = self.storage.as_ref().unwrap();
                // SAFETY: exclusive through &mut self.
                unsafe { st.write(off, val) };
                if let Some(p) = self.step_posn {
                    let t = idxs[p];
                    self.update_valid_step(t);
                    self.set_dirty(true, t);
                } else {
                    self.dirty[0] = true;
                }
                Ok(1)
            }
            None => Ok(0),
        }
    }

    /// Add to one element; exclusivity through `&mut self` makes the
    /// read-modify-write atomic
    pub fn add_to_element(&mut self, val: Precision, idxs: &[i64], strict: bool) -> Result<usize> {
        if self.storage.is_none() {
            if strict {
                return Err(Error::Preparation(format!(
                    "var '{}': storage is not allocated",
                    self.name
                )));
            }
            return Ok(0);
        }
        match self.offset_of(idxs, strict)? {
            Some(off) => {
                let st = self.storage.as_ref().unwrap();
                // SAFETY: exclusive through &mut self.
                unsafe {
                    let old = st.read(off);
                    st.write(off, old + val);
                }
                if let Some(p) = self.step_posn {
                    let t = idxs[p];
                    self.update_valid_step(t);
                    self.set_dirty(true, t);
                }
                Ok(1)
            }
            None => Ok(0),
        }
    }

    /// Fill the whole allocation with one value
    pub fn set_all_elements_same(&mut self, val: Precision) -> Result<()> {
        let st = self.storage_ref()?;
        st.array_mut().fill(val);
        self.set_dirty_all(true);
        Ok(())
    }

    // --- slice access ----------------------------------------------------

    /// Visit the row-major linear offsets of the inclusive slice
    /// `[first, last]`, calling `f(buffer_index, storage_offset)`
    fn visit_slice(
        &self,
        first: &[i64],
        last: &[i64],
        mut f: impl FnMut(usize, usize),
    ) -> Result<usize> {
        debug_assert_eq!(first.len(), self.dims.len());
        debug_assert_eq!(last.len(), self.dims.len());
        let n = self.dims.len();
        let mut lens = Vec::with_capacity(n);
        for i in 0..n {
            if last[i] < first[i] {
                return Err(Error::IndexOutOfRange(format!(
                    "var '{}': slice is empty in dimension '{}'",
                    self.name, self.dims[i].name
                )));
            }
            // Validate both corners strictly.
            self.slot_of(i, first[i], true)?;
            self.slot_of(i, last[i], true)?;
            lens.push(last[i] - first[i] + 1);
        }
        let total: i64 = lens.iter().product();
        let mut point: Vec<i64> = first.to_vec();
        for bi in 0..total {
            let off = self.offset_unchecked(&point);
            f(bi as usize, off);
            for d in (0..n).rev() {
                point[d] += 1;
                if point[d] <= last[d] {
                    break;
                }
                point[d] = first[d];
            }
        }
        Ok(total as usize)
    }

    /// Number of elements in the inclusive slice `[first, last]`
    pub fn slice_len(first: &[i64], last: &[i64]) -> usize {
        first
            .iter()
            .zip(last)
            .map(|(f, l)| (l - f + 1).max(0))
            .product::<i64>() as usize
    }

    /// Copy the inclusive slice `[first, last]` into `buf` in row-major
    /// order; returns the number of elements copied
    pub fn get_elements_in_slice(
        &self,
        buf: &mut [Precision],
        first: &[i64],
        last: &[i64],
    ) -> Result<usize> {
        if buf.len() < Self::slice_len(first, last) {
            return Err(Error::IndexOutOfRange(format!(
                "var '{}': buffer of {} element(s) is too small for slice of {}",
                self.name,
                buf.len(),
                Self::slice_len(first, last)
            )));
        }
        let st = self.storage_ref()?.clone();
        let n = self.visit_slice(first, last, |bi, off| {
            // SAFETY: offsets validated by visit_slice.
            buf[bi] = unsafe { st.read(off) };
        })?;
        Ok(n)
    }

    /// Fill the inclusive slice `[first, last]` from `buf` in row-major
    /// order; returns the number of elements written
    pub fn set_elements_in_slice(
        &mut self,
        buf: &[Precision],
        first: &[i64],
        last: &[i64],
    ) -> Result<usize> {
        if buf.len() < Self::slice_len(first, last) {
            return Err(Error::IndexOutOfRange(format!(
                "var '{}': buffer of {} element(s) is too small for slice of {}",
                self.name,
                buf.len(),
                Self::slice_len(first, last)
            )));
        }
        let st = self.storage_ref()?.clone();
        let n = self.visit_slice(first, last, |bi, off| {
            // SAFETY: exclusive through &mut self.
            unsafe { st.write(off, buf[bi]) };
        })?;
        if let Some(p) = self.step_posn {
            for t in first[p]..=last[p] {
                self.update_valid_step(t);
                self.set_dirty(true, t);
            }
        }
        Ok(n)
    }

    /// Copy a slice from another var with the same dim list
    pub fn copy_elements_in_slice(
        &mut self,
        source: &Var,
        first: &[i64],
        last: &[i64],
    ) -> Result<usize> {
        if self.dim_names() != source.dim_names() {
            return Err(Error::DimMismatch(format!(
                "copy_elements_in_slice: vars '{}' and '{}' have different dimensions",
                self.name, source.name
            )));
        }
        let mut buf = vec![0.0; {
            let mut n = 1i64;
            for i in 0..first.len() {
                n *= last[i] - first[i] + 1;
            }
            n as usize
        }];
        source.get_elements_in_slice(&mut buf, first, last)?;
        self.set_elements_in_slice(&buf, first, last)
    }

    /// Like [`Var::get_elements_in_slice`] but asserting fold alignment;
    /// used by vectorized halo packing
    pub fn get_vecs_in_slice(
        &self,
        buf: &mut [Precision],
        first: &[i64],
        last: &[i64],
    ) -> Result<usize> {
        debug_assert!(self.slice_is_fold_aligned(first, last));
        self.get_elements_in_slice(buf, first, last)
    }

    /// Like [`Var::set_elements_in_slice`] but asserting fold alignment;
    /// used by vectorized halo unpacking
    pub fn set_vecs_in_slice(
        &mut self,
        buf: &[Precision],
        first: &[i64],
        last: &[i64],
    ) -> Result<usize> {
        debug_assert!(self.slice_is_fold_aligned(first, last));
        self.set_elements_in_slice(buf, first, last)
    }

    /// Whether a slice begins and ends on fold boundaries in every
    /// vectorized domain dim
    pub fn slice_is_fold_aligned(&self, first: &[i64], last: &[i64]) -> bool {
        self.dims.iter().enumerate().all(|(i, d)| {
            d.kind != DimKind::Domain
                || d.fold_len == 1
                || (math::mod_flr(first[i] - self.first_rank_alloc_index(i), d.fold_len) == 0
                    && math::mod_flr(last[i] + 1 - first[i], d.fold_len) == 0)
        })
    }
}
//
impl fmt::Debug for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Var")
            .field("name", &self.name)
            .field("dims", &self.dim_names())
            .field("allocated", &self.is_storage_allocated())
            .field("fixed_size", &self.fixed_size)
            .field("scratch", &self.scratch)
            .finish()
    }
}

/// Default memory key: prefer the local NUMA node
pub const NUMA_PREF_DEFAULT: i32 = -1;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dims::DimSet;

    fn dims() -> DimSet {
        DimSet::with_layout("t", &["x", "y"], &["m"], &[1, 4], &[1, 1]).unwrap()
    }

    fn make_var(dims: &DimSet) -> Var {
        let mut v = Var::new("u", dims, &["t", "x", "y"]).unwrap();
        v.set_domain_size("x", 8).unwrap();
        v.set_domain_size("y", 8).unwrap();
        v.set_halo_size("x", 1).unwrap();
        v.set_halo_size("y", 2).unwrap();
        v.set_alloc_size("t", 2).unwrap();
        v
    }

    #[test]
    fn pads_contain_halos_and_respect_fold() {
        let d = dims();
        let mut v = make_var(&d);
        v.alloc_storage().unwrap();
        // x: fold 1, halo 1 -> pad >= 1 on both sides.
        let x = v.dim_posn("x").unwrap();
        assert!(v.left_pad_size(x) >= 1);
        assert!(v.alloc_size(x) >= 8 + v.left_pad_size(x) + 1);
        // y: fold 4, halo 2 -> left pad rounded up to 4.
        let y = v.dim_posn("y").unwrap();
        assert_eq!(v.left_pad_size(y) % 4, 0);
        assert!(v.left_pad_size(y) >= 2);
        assert_eq!(v.alloc_size(y) % 4, 0);
    }

    #[test]
    fn pads_never_shrink() {
        let d = dims();
        let mut v = make_var(&d);
        v.set_left_min_pad_size("y", 8).unwrap();
        let y = v.dim_posn("y").unwrap();
        let before = v.left_pad_size(y);
        v.set_left_min_pad_size("y", 2).unwrap();
        assert_eq!(v.left_pad_size(y), before);
    }

    #[test]
    fn strict_access_is_bounded_by_alloc_range() {
        let d = dims();
        let mut v = make_var(&d);
        v.alloc_storage().unwrap();
        let x = v.dim_posn("x").unwrap();
        let first = v.first_rank_alloc_index(x);
        let last = v.last_rank_alloc_index(x);

        // Exactly on the boundaries succeeds.
        assert_eq!(v.set_element(1.0, &[0, first, 0], true).unwrap(), 1);
        assert_eq!(v.set_element(1.0, &[0, last, 0], true).unwrap(), 1);

        // One past either boundary fails when strict, writes 0 otherwise.
        assert!(v.set_element(1.0, &[0, last + 1, 0], true).is_err());
        assert_eq!(v.set_element(1.0, &[0, last + 1, 0], false).unwrap(), 0);
        assert!(v.set_element(1.0, &[0, first - 1, 0], true).is_err());
    }

    #[test]
    fn step_rotation_wraps_modulo_alloc() {
        let d = dims();
        let mut v = make_var(&d);
        v.set_step_wrap(true);
        v.alloc_storage().unwrap();
        v.set_element(3.5, &[0, 0, 0], true).unwrap();
        // Step alloc is 2, so step 2 aliases step 0 when wrapping.
        assert_eq!(v.get_element(&[2, 0, 0]).unwrap(), 3.5);
        assert_eq!(v.get_element(&[0, 0, 0]).unwrap(), 3.5);
    }

    #[test]
    fn valid_window_slides_and_evicts() {
        let d = dims();
        let mut v = make_var(&d);
        v.alloc_storage().unwrap();
        assert_eq!(v.first_valid_step_index(), 0);
        assert_eq!(v.last_valid_step_index(), 1);
        v.update_valid_step(2);
        assert_eq!(v.first_valid_step_index(), 1);
        assert_eq!(v.last_valid_step_index(), 2);
        // Step 0 is now outside the window.
        assert!(v.get_element(&[0, 0, 0]).is_err());
    }

    #[test]
    fn slice_round_trip() {
        let d = dims();
        let mut v = make_var(&d);
        v.alloc_storage().unwrap();
        let first = [0, 0, 0];
        let last = [0, 3, 3];
        let buf: Vec<Precision> = (0..16).map(|i| i as Precision).collect();
        assert_eq!(v.set_elements_in_slice(&buf, &first, &last).unwrap(), 16);
        let mut out = vec![0.0; 16];
        assert_eq!(v.get_elements_in_slice(&mut out, &first, &last).unwrap(), 16);
        assert_eq!(out, buf);
    }

    #[test]
    fn fixed_size_var_reads_back_filled_elements() {
        let d = dims();
        let mut v = Var::new_fixed_size("p", &d, &["t", "x", "y", "m"], &[2, 5, 5, 3]).unwrap();
        v.alloc_storage().unwrap();
        v.set_all_elements_same(1.0).unwrap();
        // Read the last m plane of step 0 as a row-major slice.
        let mut out = vec![0.0; 25];
        let n = v
            .get_elements_in_slice(&mut out, &[0, 0, 0, 2], &[0, 4, 4, 2])
            .unwrap();
        assert_eq!(n, 25);
        assert!(out.iter().all(|&x| x == 1.0));
    }

    #[test]
    fn fuse_aliases_storage() {
        let d = dims();
        let mut a = make_var(&d);
        a.alloc_storage().unwrap();
        a.set_element(7.0, &[0, 2, 2], true).unwrap();
        let mut b = Var::new("u2", &d, &["t", "x", "y"]).unwrap();
        b.fuse_vars(&a).unwrap();
        assert_eq!(b.get_element(&[0, 2, 2]).unwrap(), 7.0);
        b.set_element(9.0, &[0, 3, 3], true).unwrap();
        assert_eq!(a.get_element(&[0, 3, 3]).unwrap(), 9.0);
    }

    #[test]
    fn fuse_rejects_mismatched_dims() {
        let d = dims();
        let mut a = make_var(&d);
        a.alloc_storage().unwrap();
        let mut b = Var::new("w", &d, &["t", "x"]).unwrap();
        assert!(matches!(b.fuse_vars(&a), Err(Error::DimMismatch(_))));
    }

    #[test]
    fn setters_fail_after_allocation() {
        let d = dims();
        let mut v = make_var(&d);
        v.alloc_storage().unwrap();
        assert!(matches!(
            v.set_domain_size("x", 4),
            Err(Error::Preparation(_))
        ));
        assert!(matches!(
            v.set_alloc_size("t", 4),
            Err(Error::Preparation(_))
        ));
    }
}
