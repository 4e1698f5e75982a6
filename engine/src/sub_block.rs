//! Sub-block evaluation
//!
//! A mini-block is trimmed to each solid box of the bundle, then its
//! sub-blocks are spread across the block threads. Each sub-block splits
//! into three zones: full vector-clusters (the optimized inner loop), full
//! or partial vectors on the faces (masked stores, with face masks ANDed
//! at edges and corners), and a scalar fringe along the inner dim when the
//! sub-block width there is not a vector multiple.

use crate::context::StencilContext;
use crate::kernels::{EvalCtx, VarRef};
use crate::scan::{self, ScanSpan};
use crate::settings::{KernelSettings, STEP_POSN};
use data::math;
use rayon::prelude::*;

/// Offset added before slab binding so the pattern is stable for negative
/// indices
const BIND_IDX_OFS: i64 = 0x1000;

impl StencilContext {
    /// Evaluate one bundle over one mini-block
    ///
    /// Respects the bundle's box list, evaluates required scratch bundles
    /// first, and drives the inner thread level over the sub-blocks.
    pub(crate) fn calc_bundle_mini_block(
        &self,
        bundle_id: usize,
        region_thread: usize,
        settings: &KernelSettings,
        mini_block_idxs: &ScanSpan,
    ) {
        let bundle = &self.bundles[bundle_id];
        debug_assert!(!bundle.is_scratch);
        log::trace!(
            "calc_bundle_mini_block('{}'): [{} ... {}) by region thread {region_thread}",
            bundle.name,
            mini_block_idxs.begin,
            mini_block_idxs.end
        );

        let nddims = self.dims.num_domain_dims();
        let nsd = nddims + 1;
        let pools = self.pools.as_ref().expect("thread pools exist after prepare");
        let nbt = pools.num_block;
        let bind_threads = nbt > 1 && settings.bind_block_threads;
        let bind_posn = settings.bind_posn;
        let bind_slab_pts = settings.sub_block_sizes.vals()[bind_posn].max(1);

        for bb in &bundle.bb_list {
            if bb.num_points == 0 {
                continue;
            }

            // Trim the mini-block to this solid box.
            let mut mb_idxs = mini_block_idxs.clone();
            let mut bb_ok = true;
            for j in 0..nddims {
                let i = j + 1;
                mb_idxs.begin[i] = mini_block_idxs.begin[i].max(bb.begin[j]);
                mb_idxs.end[i] = mini_block_idxs.end[i].min(bb.end[j]);
                if mb_idxs.end[i] <= mb_idxs.begin[i] {
                    bb_ok = false;
                    break;
                }
            }
            if !bb_ok {
                continue;
            }

            // Scratch prerequisites first, then this bundle.
            let mut reqd = bundle.scratch_children.clone();
            reqd.push(bundle_id);
            for sgi in reqd {
                let adj = self.adjust_span(region_thread, sgi, &mb_idxs);

                // Sub-block strides: bind to slabs, or cover the whole
                // mini-block where one sub-block suffices.
                let mut span = adj.clone();
                for j in 0..nddims {
                    let i = j + 1;
                    if bind_threads && i == bind_posn {
                        span.stride[i] = bind_slab_pts;
                        span.align[i] = bind_slab_pts;
                    } else if settings.sub_block_sizes.vals()[i]
                        >= settings.mini_block_sizes.vals()[i]
                        || bind_threads
                    {
                        span.stride[i] = span.end[i] - span.begin[i];
                    }
                }
                let tiles = scan::collect_tiles(&span, 1..nsd);
                if tiles.is_empty() {
                    continue;
                }

                if let Some(inner_pool) =
                    (nbt > 1).then(|| pools.block_pool(region_thread % pools.num_region))
                        .flatten()
                {
                    if bind_threads {
                        // Every block thread walks all sub-blocks but only
                        // evaluates those bound to its slab index, keeping
                        // each thread on stable cache lines across packs.
                        inner_pool.broadcast(|bctx| {
                            let bt = bctx.index();
                            for tile in &tiles {
                                let bind_elem = tile.start[bind_posn];
                                let slab =
                                    math::div_flr(bind_elem + BIND_IDX_OFS, bind_slab_pts);
                                let thr = math::mod_flr(slab, nbt as i64) as usize;
                                if thr == bt {
                                    self.calc_sub_block(
                                        sgi,
                                        region_thread,
                                        bt,
                                        settings,
                                        tile,
                                    );
                                }
                            }
                        });
                    } else {
                        inner_pool.install(|| {
                            tiles.par_iter().for_each(|tile| {
                                let bt = rayon::current_thread_index().unwrap_or(0);
                                self.calc_sub_block(sgi, region_thread, bt, settings, tile);
                            });
                        });
                    }
                } else {
                    // Collapsed inner level.
                    for tile in &tiles {
                        self.calc_sub_block(sgi, region_thread, 0, settings, tile);
                    }
                }
            }
        }
    }

    /// Expand a span by the halos of a scratch bundle's output var
    ///
    /// Scratch results must be valid into their halos because the consuming
    /// bundle reads them there; non-scratch bundles pass through unchanged.
    pub(crate) fn adjust_span(
        &self,
        region_thread: usize,
        bundle_id: usize,
        idxs: &ScanSpan,
    ) -> ScanSpan {
        let mut adj = idxs.clone();
        let bundle = &self.bundles[bundle_id];
        for out in &bundle.outputs {
            let VarRef::Scratch(def) = out else {
                continue;
            };
            let sv = &self.svars[self.scratch_map[*def][region_thread]];
            for j in 0..self.dims.num_domain_dims() {
                let i = j + 1;
                let dname = &self.dims.domain_dims()[j];
                let Some(posn) = sv.dim_posn(dname) else {
                    continue;
                };
                let fold = self.dims.fold_len(j);
                let lh = math::round_up(sv.left_halo_size(posn), fold);
                let rh = math::round_up(sv.right_halo_size(posn), fold);
                adj.begin[i] = idxs.begin[i] - lh;
                adj.end[i] = idxs.end[i] + rh;
                debug_assert!(adj.begin[i] >= sv.first_rank_alloc_index(posn));
                debug_assert!(adj.end[i] <= sv.last_rank_alloc_index(posn) + 1);

                // A stride covering the whole tile keeps covering it.
                let width = idxs.end[i] - idxs.begin[i];
                if idxs.stride[i] >= width {
                    adj.stride[i] = adj.end[i] - adj.begin[i];
                }
            }
            // All scratch vars of one bundle share their halos.
            break;
        }
        adj
    }

    /// Evaluate one sub-block with the kernel variant the settings allow
    pub(crate) fn calc_sub_block(
        &self,
        bundle_id: usize,
        region_thread: usize,
        block_thread: usize,
        settings: &KernelSettings,
        tile: &ScanSpan,
    ) {
        if settings.force_scalar {
            self.calc_sub_block_scalar(bundle_id, region_thread, block_thread, tile);
        } else {
            self.calc_sub_block_vec(bundle_id, region_thread, block_thread, tile);
        }
    }

    /// Scalar evaluation of every point in a sub-block (debug path)
    fn calc_sub_block_scalar(
        &self,
        bundle_id: usize,
        region_thread: usize,
        block_thread: usize,
        tile: &ScanSpan,
    ) {
        let nddims = self.dims.num_domain_dims();
        let bundle = &self.bundles[bundle_id];
        let ectx = EvalCtx::new(
            &self.vars,
            &self.svars,
            &self.scratch_map,
            region_thread,
            block_thread,
        );
        let t = tile.start[STEP_POSN];
        let mut idxs = vec![0i64; nddims + 1];
        idxs[STEP_POSN] = t;
        let mut cursor: Vec<i64> = (1..=nddims).map(|i| tile.start[i]).collect();
        if (1..=nddims).any(|i| tile.stop[i] <= tile.start[i]) {
            return;
        }
        'outer: loop {
            idxs[1..].copy_from_slice(&cursor);
            (bundle.kernels.scalar)(&ectx, &idxs);
            let mut d = nddims;
            loop {
                if d == 0 {
                    break 'outer;
                }
                d -= 1;
                cursor[d] += 1;
                if cursor[d] < tile.stop[d + 1] {
                    break;
                }
                cursor[d] = tile.start[d + 1];
            }
        }
    }

    /// Vectorized evaluation of one sub-block
    ///
    /// The index ranges are split into full vector-clusters, full/partial
    /// vectors, and an inner-dim scalar fringe. Geometry is computed in
    /// rank-relative coordinates (vector boundaries are anchored at the
    /// rank offset); kernels receive global element indices.
    fn calc_sub_block_vec(
        &self,
        bundle_id: usize,
        region_thread: usize,
        block_thread: usize,
        tile: &ScanSpan,
    ) {
        let nddims = self.dims.num_domain_dims();
        let inner = self.dims.inner_posn();
        let bundle = &self.bundles[bundle_id];
        let ectx = EvalCtx::new(
            &self.vars,
            &self.svars,
            &self.scratch_map,
            region_thread,
            block_thread,
        );
        let t = tile.start[STEP_POSN];

        // Rank-relative begin/end per domain dim.
        let mut ebgn = vec![0i64; nddims];
        let mut eend = vec![0i64; nddims];
        // Full clusters.
        let mut fcbgn = vec![0i64; nddims];
        let mut fcend = vec![0i64; nddims];
        // Full vectors.
        let mut fvbgn = vec![0i64; nddims];
        let mut fvend = vec![0i64; nddims];
        // Full or partial vectors.
        let mut vbgn = vec![0i64; nddims];
        let mut vend = vec![0i64; nddims];

        let mut peel_masks = vec![u64::MAX; nddims];
        let mut rem_masks = vec![u64::MAX; nddims];

        let mut do_clusters = true;
        let mut do_vectors = false;
        let mut do_scalars = false;

        for j in 0..nddims {
            let i = j + 1;
            let rofs = self.rank_domain_offsets[j];
            ebgn[j] = tile.start[i] - rofs;
            eend[j] = tile.stop[i] - rofs;
            if eend[j] <= ebgn[j] {
                return;
            }

            let cpts = self.dims.cluster_pts(j);
            fcbgn[j] = math::round_up(ebgn[j], cpts);
            fcend[j] = math::round_down(eend[j], cpts);
            if fcend[j] <= fcbgn[j] {
                do_clusters = false;
            }

            if fcbgn[j] > ebgn[j] || fcend[j] < eend[j] {
                let vpts = self.dims.fold_len(j);
                let mut fvb = math::round_up(ebgn[j], vpts);
                let mut fve = math::round_down(eend[j], vpts);
                let mut vb = math::round_down(ebgn[j], vpts);
                let mut ve = math::round_up(eend[j], vpts);
                if j == inner {
                    // No vectors in the plane of the inner dim; the fringe
                    // there is handled by scalars.
                    fvb = fcbgn[j];
                    fve = fcend[j];
                    vb = fcbgn[j];
                    ve = fcend[j];
                }
                fvbgn[j] = fvb;
                fvend[j] = fve;
                vbgn[j] = vb;
                vend[j] = ve;

                if vb < fcbgn[j] || ve > fcend[j] {
                    do_vectors = true;
                }

                // Build this dim's peel and remainder masks over the fold
                // points; edge and corner vectors AND them together.
                if vb < fvb || ve > fve {
                    let mut pmask = 0u64;
                    let mut rmask = 0u64;
                    let mut k = 0u32;
                    visit_fold_points(self.dims.fold_lens(), &mut |pt| {
                        let p = vb + pt[j];
                        if p >= ebgn[j] {
                            pmask |= 1u64 << k;
                        }
                        let p = fve + pt[j];
                        if p < eend[j] {
                            rmask |= 1u64 << k;
                        }
                        k += 1;
                    });
                    peel_masks[j] = pmask;
                    rem_masks[j] = rmask;
                }

                if j == inner && (ebgn[j] < vb || eend[j] > ve) {
                    do_scalars = true;
                }
            } else {
                fvbgn[j] = fcbgn[j];
                fvend[j] = fcend[j];
                vbgn[j] = fcbgn[j];
                vend[j] = fcend[j];
            }
        }

        let rofs = |j: usize| self.rank_domain_offsets[j];

        // Full rectilinear polytope of aligned clusters: optimized code.
        if do_clusters {
            let mut idxs = vec![0i64; nddims + 1];
            idxs[STEP_POSN] = t;
            let stop_inner = fcend[inner] + rofs(inner);
            self.for_each_tile_start(&fcbgn, &fcend, inner, |outer_pos| {
                for j in 0..nddims {
                    idxs[j + 1] = outer_pos[j] + rofs(j);
                }
                idxs[inner + 1] = fcbgn[inner] + rofs(inner);
                (bundle.kernels.cluster)(&ectx, &idxs, stop_inner);
            });
        }

        // Full and partial vectors around the cluster zone.
        if do_vectors {
            let mut idxs = vec![0i64; nddims + 1];
            idxs[STEP_POSN] = t;
            self.for_each_vector_row(&vbgn, &vend, inner, |outer_pos| {
                // Rows fully inside the cluster zone were done above.
                let mut ok = false;
                let mut mask = u64::MAX;
                for j in 0..nddims {
                    if j == inner {
                        continue;
                    }
                    if outer_pos[j] < fcbgn[j] || outer_pos[j] >= fcend[j] {
                        ok = true;
                        if outer_pos[j] < fvbgn[j] {
                            mask &= peel_masks[j];
                        }
                        if outer_pos[j] >= fvend[j] {
                            mask &= rem_masks[j];
                        }
                    }
                }
                if !ok {
                    return;
                }
                let fold_in = self.dims.fold_len(inner);
                let mut vin = vbgn[inner];
                while vin < vend[inner] {
                    for j in 0..nddims {
                        idxs[j + 1] = outer_pos[j] + rofs(j);
                    }
                    idxs[inner + 1] = vin + rofs(inner);
                    (bundle.kernels.vector)(&ectx, &idxs, mask);
                    vin += fold_in;
                }
            });
        }

        // Scalar fringe: anything not covered by vectors (inner dim only).
        if do_scalars {
            let mut idxs = vec![0i64; nddims + 1];
            idxs[STEP_POSN] = t;
            let mut cursor = ebgn.clone();
            'outer: loop {
                let fringe = (0..nddims)
                    .any(|j| cursor[j] < vbgn[j] || cursor[j] >= vend[j]);
                if fringe {
                    for j in 0..nddims {
                        idxs[j + 1] = cursor[j] + rofs(j);
                    }
                    (bundle.kernels.scalar)(&ectx, &idxs);
                }
                let mut d = nddims;
                loop {
                    if d == 0 {
                        break 'outer;
                    }
                    d -= 1;
                    cursor[d] += 1;
                    if cursor[d] < eend[d] {
                        break;
                    }
                    cursor[d] = ebgn[d];
                }
            }
        }
    }

    /// Visit cluster starts over the outer dims (inner handled by the
    /// cluster kernel); positions are rank-relative
    fn for_each_tile_start(
        &self,
        begin: &[i64],
        end: &[i64],
        inner: usize,
        mut f: impl FnMut(&[i64]),
    ) {
        let nddims = begin.len();
        let mut cursor: Vec<i64> = begin.to_vec();
        if (0..nddims).any(|j| j != inner && end[j] <= begin[j]) {
            return;
        }
        'outer: loop {
            f(&cursor);
            let mut d = nddims;
            loop {
                if d == 0 {
                    break 'outer;
                }
                d -= 1;
                if d == inner {
                    continue;
                }
                cursor[d] += self.dims.cluster_pts(d);
                if cursor[d] < end[d] {
                    break;
                }
                cursor[d] = begin[d];
            }
        }
    }

    /// Visit vector starts over the outer dims, stepping by the fold
    fn for_each_vector_row(
        &self,
        begin: &[i64],
        end: &[i64],
        inner: usize,
        mut f: impl FnMut(&[i64]),
    ) {
        let nddims = begin.len();
        let mut cursor: Vec<i64> = begin.to_vec();
        if (0..nddims).any(|j| j != inner && end[j] <= begin[j]) {
            return;
        }
        'outer: loop {
            f(&cursor);
            let mut d = nddims;
            loop {
                if d == 0 {
                    break 'outer;
                }
                d -= 1;
                if d == inner {
                    continue;
                }
                cursor[d] += self.dims.fold_len(d);
                if cursor[d] < end[d] {
                    break;
                }
                cursor[d] = begin[d];
            }
        }
    }
}

/// Visit every point of the fold box in mask-bit order
fn visit_fold_points(fold_lens: &[i64], f: &mut impl FnMut(&[i64])) {
    let mut pt = vec![0i64; fold_lens.len()];
    loop {
        f(&pt);
        let mut d = fold_lens.len();
        loop {
            if d == 0 {
                return;
            }
            d -= 1;
            pt[d] += 1;
            if pt[d] < fold_lens[d] {
                break;
            }
            pt[d] = 0;
        }
    }
}
