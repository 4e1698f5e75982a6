//! Inner-kernel tables and the evaluation context
//!
//! The stencil compiler is an external collaborator: for every bundle it
//! supplies a [`KernelTable`] of function values — a scalar kernel, a
//! masked-vector kernel, and a cluster kernel. The engine never inspects
//! them; it only chooses which one to call for each zone of a sub-block.
//!
//! Kernels address vars through an [`EvalCtx`] using global element
//! indices in each var's own dim order. Scratch vars are resolved per
//! region thread so each thread reuses its private allocation.

use data::var::Var;
use data::Precision;
use std::sync::Arc;

/// Reference to a var from inside a kernel
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum VarRef {
    /// A solution var, by arena id
    Id(usize),
    /// A scratch var, by scratch-definition index; resolved per thread
    Scratch(usize),
}

/// Read/write access to vars during a sweep
pub struct EvalCtx<'a> {
    vars: &'a [Var],
    svars: &'a [Var],
    scratch_map: &'a [Vec<usize>],

    /// Outer-level thread executing this mini-block
    pub region_thread: usize,

    /// Inner-level thread executing this sub-block
    pub block_thread: usize,
}
//
impl<'a> EvalCtx<'a> {
    pub(crate) fn new(
        vars: &'a [Var],
        svars: &'a [Var],
        scratch_map: &'a [Vec<usize>],
        region_thread: usize,
        block_thread: usize,
    ) -> Self {
        Self {
            vars,
            svars,
            scratch_map,
            region_thread,
            block_thread,
        }
    }

    /// Resolve a var reference for this thread
    pub fn var(&self, r: VarRef) -> &Var {
        match r {
            VarRef::Id(id) => &self.vars[id],
            VarRef::Scratch(def) => &self.svars[self.scratch_map[def][self.region_thread]],
        }
    }

    /// Read one element at global indices in the var's dim order
    #[inline]
    pub fn read(&self, r: VarRef, idxs: &[i64]) -> Precision {
        let v = self.var(r);
        let st = v.storage().expect("var storage exists during a sweep");
        // SAFETY: the tile decomposition guarantees no concurrent write to
        // this element; the offset is scheduler-produced and in range.
        unsafe { st.read(v.offset_unchecked(idxs)) }
    }

    /// Write one element at global indices in the var's dim order
    #[inline]
    pub fn write(&self, r: VarRef, idxs: &[i64], val: Precision) {
        let v = self.var(r);
        let st = v.storage().expect("var storage exists during a sweep");
        // SAFETY: each (step, point) belongs to exactly one sub-block, and
        // writes are confined to the bundle's declared outputs.
        unsafe { st.write(v.offset_unchecked(idxs), val) }
    }
}

/// Scalar kernel: evaluate one point at global stencil-dim indices
/// `[t, d0, d1, ...]`
pub type ScalarFn = Arc<dyn Fn(&EvalCtx, &[i64]) + Send + Sync>;

/// Vector kernel: evaluate one fold-shaped vector whose first point is at
/// the given indices, storing only the lanes enabled in the write mask
///
/// Mask bit `k` corresponds to the fold point with row-major linear index
/// `k` over the fold lengths (domain dim order).
pub type VectorFn = Arc<dyn Fn(&EvalCtx, &[i64], u64) + Send + Sync>;

/// Cluster kernel: evaluate a run of clusters along the inner dim
///
/// Covers `[start_j, start_j + cluster_pts(j))` in every outer domain dim
/// and `[start_inner, stop_inner)` in the inner dim.
pub type ClusterFn = Arc<dyn Fn(&EvalCtx, &[i64], i64) + Send + Sync>;

/// The per-bundle v-table of inner kernels
#[derive(Clone)]
pub struct KernelTable {
    pub scalar: ScalarFn,
    pub vector: VectorFn,
    pub cluster: ClusterFn,
}
//
impl KernelTable {
    /// Build a table from explicit kernels
    pub fn new(scalar: ScalarFn, vector: VectorFn, cluster: ClusterFn) -> Self {
        Self {
            scalar,
            vector,
            cluster,
        }
    }

    /// Derive the vector and cluster kernels from the scalar kernel
    ///
    /// Correct for any bundle; an optimizing compiler would supply
    /// specialized kernels instead.
    pub fn from_scalar(dims: &data::dims::DimSet, scalar: ScalarFn) -> Self {
        let nddims = dims.num_domain_dims();
        let inner = dims.inner_posn();
        let fold: Vec<i64> = dims.fold_lens().to_vec();
        let cluster_pts: Vec<i64> = (0..nddims).map(|j| dims.cluster_pts(j)).collect();
        debug_assert!(dims.vec_len() <= 64, "write masks are one machine word");

        let vector: VectorFn = {
            let scalar = scalar.clone();
            let fold = fold.clone();
            Arc::new(move |ctx: &EvalCtx, start: &[i64], mask: u64| {
                let mut point = start.to_vec();
                let mut k = 0u32;
                visit_box(&fold, &mut |ofs| {
                    if mask & (1u64 << k) != 0 {
                        for (j, o) in ofs.iter().enumerate() {
                            point[j + 1] = start[j + 1] + o;
                        }
                        scalar(ctx, &point);
                    }
                    k += 1;
                });
            })
        };

        let cluster: ClusterFn = {
            let scalar = scalar.clone();
            Arc::new(move |ctx: &EvalCtx, start: &[i64], stop_inner: i64| {
                let mut extents = cluster_pts.clone();
                extents[inner] = stop_inner - start[inner + 1];
                let mut point = start.to_vec();
                visit_box(&extents, &mut |ofs| {
                    for (j, o) in ofs.iter().enumerate() {
                        point[j + 1] = start[j + 1] + o;
                    }
                    scalar(ctx, &point);
                });
            })
        };

        Self {
            scalar,
            vector,
            cluster,
        }
    }
}

/// Visit every offset in the box `[0, extents)` in row-major order
fn visit_box(extents: &[i64], f: &mut impl FnMut(&[i64])) {
    if extents.iter().any(|&e| e <= 0) {
        return;
    }
    let mut ofs = vec![0i64; extents.len()];
    loop {
        f(&ofs);
        let mut d = extents.len();
        loop {
            if d == 0 {
                return;
            }
            d -= 1;
            ofs[d] += 1;
            if ofs[d] < extents[d] {
                break;
            }
            ofs[d] = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use data::dims::DimSet;
    use std::sync::Mutex;

    fn record_kernel(log: Arc<Mutex<Vec<Vec<i64>>>>) -> ScalarFn {
        Arc::new(move |_ctx, idxs| {
            log.lock().unwrap().push(idxs.to_vec());
        })
    }

    fn empty_ctx_parts() -> (Vec<Var>, Vec<Var>, Vec<Vec<usize>>) {
        (Vec::new(), Vec::new(), Vec::new())
    }

    #[test]
    fn derived_vector_kernel_honors_the_mask() {
        let dims = DimSet::with_layout("t", &["x", "y"], &[], &[1, 4], &[1, 1]).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let table = KernelTable::from_scalar(&dims, record_kernel(log.clone()));
        let (vars, svars, scratch) = empty_ctx_parts();
        let ctx = EvalCtx::new(&vars, &svars, &scratch, 0, 0);

        // Enable lanes 1 and 3 of the 4-point fold.
        (table.vector)(&ctx, &[5, 10, 20], 0b1010);
        let seen = log.lock().unwrap().clone();
        assert_eq!(seen, vec![vec![5, 10, 21], vec![5, 10, 23]]);
    }

    #[test]
    fn derived_cluster_kernel_covers_the_inner_run() {
        let dims = DimSet::with_layout("t", &["x", "y"], &[], &[1, 2], &[1, 2]).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let table = KernelTable::from_scalar(&dims, record_kernel(log.clone()));
        let (vars, svars, scratch) = empty_ctx_parts();
        let ctx = EvalCtx::new(&vars, &svars, &scratch, 0, 0);

        // Cluster: x spans 1 point (fold 1 * mult 1), y runs 0..8.
        (table.cluster)(&ctx, &[0, 3, 0], 8);
        let seen = log.lock().unwrap().clone();
        assert_eq!(seen.len(), 8);
        assert!(seen.iter().all(|p| p[1] == 3));
        assert_eq!(seen[0], vec![0, 3, 0]);
        assert_eq!(seen[7], vec![0, 3, 7]);
    }
}
