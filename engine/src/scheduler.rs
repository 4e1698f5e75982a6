//! The tile scheduler
//!
//! Five nested levels: step window -> region (temporal wavefront) -> block
//! (phase/shape tessellation under temporal blocking) -> mini-block ->
//! sub-block. Regions stride through wave-front slabs of steps; blocks are
//! the unit of outer-thread parallelism; mini-blocks iterate (time, pack)
//! with a skew shift per iteration; sub-blocks are evaluated by the inner
//! kernels in `sub_block.rs`.
//!
//! All spatial skewing shifts left: bounds are shifted by
//! `angle(d) * shift_num` and clamped back into the wave-front extensions,
//! the current MPI section, the tessellation shape, and the pack box.

use crate::context::StencilContext;
use crate::scan::{self, ScanSpan};
use crate::settings::{KernelSettings, STEP_POSN};
use data::error::{Error, Result};
use data::indices::Indices;
use data::math;
use rayon::prelude::*;
use std::sync::atomic::{fence, Ordering};

/// Per-dim flags selecting which dims a bridge shape spans
pub type BridgeMask = Vec<bool>;

impl StencilContext {
    /// Advance all vars by one step index
    pub fn run_solution_once(&mut self, step_index: i64) -> Result<()> {
        self.run_solution(step_index, step_index)
    }

    /// Advance all vars from `first_step_index` through `last_step_index`
    /// (inclusive; a reversed pair steps backward)
    pub fn run_solution(&mut self, first_step_index: i64, last_step_index: i64) -> Result<()> {
        self.run_run_hooks(|h| &mut h.before_run, first_step_index, last_step_index);
        if !self.prepared {
            return Err(Error::Preparation(
                "run_solution() called without calling prepare_solution() first".to_string(),
            ));
        }
        self.run_time.start();

        let nddims = self.dims.num_domain_dims();
        let step_dir: i64 = if last_step_index >= first_step_index {
            1
        } else {
            -1
        };
        let begin_t = first_step_index;
        let end_t = last_step_index + step_dir;

        // Region stride in the step dim: one wave-front depth.
        let stride_t = self.wf_steps.max(1) * step_dir;

        // Rank span: the extended box, plus the right wave-front shift where
        // no extension exists (the last rank in each dim).
        let mut rank_idxs = ScanSpan::new_for(&self.dims, true, Some(&self.rank_domain_offsets));
        rank_idxs.begin[STEP_POSN] = begin_t;
        rank_idxs.end[STEP_POSN] = end_t;
        for j in 0..nddims {
            let i = j + 1;
            rank_idxs.begin[i] = self.ext_bb.begin[j];
            rank_idxs.end[i] = self.ext_bb.end[j];
            rank_idxs.stride[i] = self.opts.region_sizes.vals()[i];
            if self.wf_steps > 0 && self.right_wf_exts[j] == 0 {
                rank_idxs.end[i] += self.wf_shift_pts[j];
            }
            // One stride covers the dim when a region spans the whole rank.
            if self.opts.region_sizes.vals()[i] >= self.opts.rank_sizes.vals()[i] {
                rank_idxs.stride[i] = rank_idxs.end[i] - rank_idxs.begin[i];
            }
        }
        rank_idxs.stride[STEP_POSN] = stride_t;
        log::trace!(
            "run_solution: [{} ... {}) by {}",
            rank_idxs.begin,
            rank_idxs.end,
            rank_idxs.stride
        );
        if self.ext_bb.size < 1 {
            self.run_time.stop();
            return Ok(());
        }

        // Initial halo exchange.
        self.exchange_halos()?;

        let num_t = math::ceil_div((end_t - begin_t).abs(), stride_t.abs());
        for index_t in 0..num_t {
            let start_t = begin_t + index_t * stride_t;
            let stop_t = if stride_t > 0 {
                (start_t + stride_t).min(end_t)
            } else {
                (start_t + stride_t).max(end_t)
            };
            let this_num_t = (stop_t - start_t).abs();

            rank_idxs.index[STEP_POSN] = index_t;
            rank_idxs.start[STEP_POSN] = start_t;
            rank_idxs.stop[STEP_POSN] = stop_t;

            if !self.use_pack_tuners {
                self.tuner.lock().expect("tuner state").timer.start();
            }

            if self.wf_steps == 0 {
                // No wave-fronts: one pack at a time through the regions.
                for pi in 0..self.packs.len() {
                    if !self.pack_in_valid_step(pi, start_t) {
                        log::trace!(
                            "run_solution: step {start_t} not valid for pack '{}'",
                            self.packs[pi].name
                        );
                        continue;
                    }
                    self.step_one_selection(Some(pi), &rank_idxs, start_t, stop_t)?;
                }
            } else {
                // Wave-fronts: every pack goes down into the regions.
                self.step_one_selection(None, &rank_idxs, start_t, stop_t)?;
            }

            // Account completed steps, respecting step predicates.
            self.steps_done += this_num_t;
            for pi in 0..self.packs.len() {
                let mut n = 0;
                let mut t = start_t;
                while t != stop_t {
                    if self.pack_in_valid_step(pi, t) {
                        n += 1;
                    }
                    t += step_dir;
                }
                self.packs[pi].add_steps(n);
                self.writes_done += self.packs[pi].num_writes_per_step * n;
                self.fpops_done += self.packs[pi].num_fpops_per_step * n;
            }

            if !self.use_pack_tuners {
                let t = self.tuner.get_mut().expect("tuner state");
                t.timer.stop();
                t.add_steps(this_num_t);
            }
            self.eval_auto_tuner();
        }

        self.run_time.stop();
        self.run_run_hooks(|h| &mut h.after_run, first_step_index, last_step_index);
        Ok(())
    }

    /// One (pack selection, step slab): exterior passes, exchange, interior
    fn step_one_selection(
        &mut self,
        sel_pack: Option<usize>,
        rank_idxs: &ScanSpan,
        start_t: i64,
        stop_t: i64,
    ) -> Result<()> {
        let nddims = self.dims.num_domain_dims();
        if self.is_overlap_active() {
            // Exterior passes first, trimming regions to exterior slabs.
            self.do_mpi_interior = false;
            for j in 0..nddims {
                for is_left in [true, false] {
                    if !self.does_exterior_exist(j, is_left) {
                        continue;
                    }
                    self.do_mpi_left = is_left;
                    self.do_mpi_right = !is_left;
                    self.mpi_exterior_dim = j as i64;
                    self.eval_rank(sel_pack, rank_idxs);
                }
            }
            self.update_vars(sel_pack, start_t, stop_t, true);

            // Exchange the freshly computed exterior.
            self.do_mpi_left = true;
            self.do_mpi_right = true;
            self.exchange_halos()?;

            // Interior-only pass next.
            self.do_mpi_left = false;
            self.do_mpi_right = false;
            self.do_mpi_interior = true;
        }

        self.eval_rank(sel_pack, rank_idxs);

        let mark_dirty = self.do_mpi_left || self.do_mpi_right;
        self.update_vars(sel_pack, start_t, stop_t, mark_dirty);
        self.exchange_halos()?;

        self.do_mpi_interior = true;
        self.do_mpi_left = true;
        self.do_mpi_right = true;
        Ok(())
    }

    /// Iterate region tiles of the rank span
    fn eval_rank(&self, sel_pack: Option<usize>, rank_idxs: &ScanSpan) {
        let nsd = rank_idxs.ndims();
        for region_tile in scan::collect_tiles(rank_idxs, 1..nsd) {
            self.calc_region(sel_pack, &region_tile);
        }
    }

    /// Whether the trimmed-region overlap machinery is engaged
    pub(crate) fn is_overlap_active(&self) -> bool {
        self.interior_valid
    }

    /// Whether an exterior slab exists on the given side of the given dim
    pub(crate) fn does_exterior_exist(&self, j: usize, is_left: bool) -> bool {
        if is_left {
            self.mpi_interior.begin[j] > self.ext_bb.begin[j]
        } else {
            self.mpi_interior.end[j] < self.ext_bb.end[j]
        }
    }

    /// Evaluate one region: the temporal wavefront
    ///
    /// Strides through time by the temporal-blocking depth; without TB the
    /// packs are iterated here and each dispatch covers one pack.
    fn calc_region(&self, sel_pack: Option<usize>, rank_tile: &ScanSpan) {
        log::trace!(
            "calc_region: [{} ... {})",
            rank_tile.start,
            rank_tile.stop
        );
        let timing_ext = !self.do_mpi_interior && (self.do_mpi_left || self.do_mpi_right);
        if timing_ext {
            self.ext_time.start();
        } else {
            self.int_time.start();
        }

        let nddims = self.dims.num_domain_dims();
        let mut region_idxs = ScanSpan::new_for(&self.dims, true, Some(&self.rank_domain_offsets));
        region_idxs.init_from_outer(rank_tile);

        let begin_t = region_idxs.begin[STEP_POSN];
        let end_t = region_idxs.end[STEP_POSN];
        let step_dir: i64 = if end_t >= begin_t { 1 } else { -1 };
        let stride_t = self.tb_steps.max(1) * step_dir;
        let num_t = math::ceil_div((end_t - begin_t).abs(), stride_t.abs());

        let mut region_shift_num: i64 = 0;
        for index_t in 0..num_t {
            let start_t = begin_t + index_t * stride_t;
            let stop_t = if stride_t > 0 {
                (start_t + stride_t).min(end_t)
            } else {
                (start_t + stride_t).max(end_t)
            };
            region_idxs.index[STEP_POSN] = index_t;
            region_idxs.start[STEP_POSN] = start_t;
            region_idxs.stop[STEP_POSN] = stop_t;

            if self.tb_steps == 0 {
                // One pack per dispatch; each (time, pack) shifts the
                // wavefront once, whether or not the step predicate admits
                // the pack.
                for pi in 0..self.packs.len() {
                    if sel_pack.is_some() && sel_pack != Some(pi) {
                        continue;
                    }
                    if !self.pack_in_valid_step(pi, start_t) {
                        region_shift_num += 1;
                        continue;
                    }
                    let settings = self.active_settings(pi);
                    for j in 0..nddims {
                        let i = j + 1;
                        region_idxs.stride[i] = settings.block_sizes.vals()[i];
                        region_idxs.group_size[i] = settings.block_group_sizes.vals()[i];
                    }
                    region_idxs.stride[STEP_POSN] = stride_t;

                    let ok = self.shift_region(
                        &rank_tile.start,
                        &rank_tile.stop,
                        region_shift_num,
                        Some(pi),
                        &mut region_idxs,
                    );
                    for j in 0..nddims {
                        let i = j + 1;
                        if settings.block_sizes.vals()[i] >= settings.region_sizes.vals()[i] {
                            region_idxs.stride[i] = region_idxs.end[i] - region_idxs.begin[i];
                        }
                    }
                    if ok {
                        self.eval_region_blocks(
                            Some(pi),
                            region_shift_num,
                            1,
                            0,
                            rank_tile,
                            &region_idxs,
                            &settings,
                        );
                    }
                    region_shift_num += 1;
                }
            } else {
                // Temporal blocking: all packs are handled inside the
                // mini-block loop; here we tessellate the region into
                // phases, synchronizing the region threads between phases.
                let settings = self.opts.clone();
                for j in 0..nddims {
                    let i = j + 1;
                    region_idxs.stride[i] = settings.block_sizes.vals()[i];
                    region_idxs.group_size[i] = settings.block_group_sizes.vals()[i];
                }
                region_idxs.stride[STEP_POSN] = stride_t;

                let ok = self.shift_region(
                    &rank_tile.start,
                    &rank_tile.stop,
                    region_shift_num,
                    None,
                    &mut region_idxs,
                );
                debug_assert!(ok, "unconstrained region shift cannot be empty");
                for j in 0..nddims {
                    let i = j + 1;
                    if settings.block_sizes.vals()[i] >= settings.region_sizes.vals()[i] {
                        region_idxs.stride[i] = region_idxs.end[i] - region_idxs.begin[i];
                    }
                }

                let nphases = nddims as i64 + 1;
                for phase in 0..nphases {
                    // The parallel dispatch joins before the next phase.
                    self.eval_region_blocks(
                        None,
                        region_shift_num,
                        nphases,
                        phase,
                        rank_tile,
                        &region_idxs,
                        &settings,
                    );
                }

                // One shift per (step, pack) evaluated in this slab.
                let mut t = start_t;
                while t != stop_t {
                    region_shift_num += self.packs.len() as i64;
                    t += step_dir;
                }
            }
        }

        if timing_ext {
            self.ext_time.stop();
        } else {
            self.int_time.stop();
        }
    }

    /// Dispatch the blocks of one region pass across the region threads
    #[allow(clippy::too_many_arguments)]
    fn eval_region_blocks(
        &self,
        sel_pack: Option<usize>,
        region_shift_num: i64,
        nphases: i64,
        phase: i64,
        rank_tile: &ScanSpan,
        region_idxs: &ScanSpan,
        settings: &KernelSettings,
    ) {
        let nsd = region_idxs.ndims();
        let tiles = scan::collect_tiles(region_idxs, 1..nsd);
        if tiles.is_empty() {
            return;
        }
        let pools = self.pools.as_ref().expect("thread pools exist after prepare");
        pools.region.install(|| {
            tiles.par_iter().for_each(|block_tile| {
                self.calc_block(
                    sel_pack,
                    region_shift_num,
                    nphases,
                    phase,
                    rank_tile,
                    region_idxs,
                    block_tile,
                    settings,
                );
            });
        });
    }

    /// Evaluate one block, owned by one region thread
    #[allow(clippy::too_many_arguments)]
    fn calc_block(
        &self,
        sel_pack: Option<usize>,
        region_shift_num: i64,
        nphases: i64,
        phase: i64,
        rank_tile: &ScanSpan,
        region_idxs: &ScanSpan,
        block_tile: &ScanSpan,
        settings: &KernelSettings,
    ) {
        let region_thread = rayon::current_thread_index().unwrap_or(0);
        log::trace!(
            "calc_block: phase {phase}, block [{} ... {}) by region thread {region_thread}",
            block_tile.start,
            block_tile.stop
        );
        let nddims = self.dims.num_domain_dims();
        let nsd = block_tile.ndims();

        let mut block_idxs = ScanSpan::new_for(&self.dims, true, Some(&self.rank_domain_offsets));
        block_idxs.init_from_outer(block_tile);
        let begin_t = block_idxs.begin[STEP_POSN];
        let end_t = block_idxs.end[STEP_POSN];
        let step_dir: i64 = if end_t >= begin_t { 1 } else { -1 };

        if self.tb_steps == 0 {
            debug_assert!(sel_pack.is_some());
            block_idxs.index[STEP_POSN] = 0;
            block_idxs.start[STEP_POSN] = begin_t;
            block_idxs.stop[STEP_POSN] = end_t;
            for j in 0..nddims {
                let i = j + 1;
                block_idxs.stride[i] = settings.mini_block_sizes.vals()[i];
                block_idxs.group_size[i] = settings.mini_block_group_sizes.vals()[i];
            }
            block_idxs.stride[STEP_POSN] = step_dir;

            let adj_block_idxs = block_idxs.clone();
            let bridge_mask: BridgeMask = vec![false; nddims];
            for mb_tile in scan::collect_tiles(&adj_block_idxs, 1..nsd) {
                self.calc_mini_block(
                    region_thread,
                    sel_pack,
                    region_shift_num,
                    nphases,
                    phase,
                    1,
                    0,
                    &bridge_mask,
                    rank_tile,
                    region_idxs,
                    &block_idxs,
                    &mb_tile,
                );
            }
            return;
        }

        // Temporal blocking: evaluate the shapes of this phase. Phase 0 is
        // the upward trapezoid; later phases bridge along each combination
        // of `phase` domain dims.
        let nshapes = math::choose(nddims, phase as usize) as i64;
        block_idxs.index[STEP_POSN] = 0;
        block_idxs.start[STEP_POSN] = begin_t;
        block_idxs.stop[STEP_POSN] = end_t;
        for j in 0..nddims {
            let i = j + 1;
            block_idxs.stride[i] = settings.mini_block_sizes.vals()[i];
            block_idxs.group_size[i] = settings.mini_block_group_sizes.vals()[i];
        }
        block_idxs.stride[STEP_POSN] = step_dir;

        // Widen the scanned range: TB shapes extend right as far as the
        // next block, so the adjusted ranges of neighboring blocks overlap
        // and each mini-block is trimmed to its active shape per step.
        let mut adj_block_idxs = block_idxs.clone();
        for j in 0..nddims {
            let i = j + 1;
            let width = block_tile.stop[i] - block_tile.start[i];
            adj_block_idxs.end[i] += width;
            adj_block_idxs.stop[i] = adj_block_idxs.end[i];
            if settings.mini_block_sizes.vals()[i] >= settings.block_sizes.vals()[i] {
                adj_block_idxs.stride[i] = adj_block_idxs.end[i] - adj_block_idxs.begin[i];
            }
        }

        let mut dims_to_bridge = vec![0i64; phase as usize];
        for shape in 0..nshapes {
            math::combination(&mut dims_to_bridge, nddims, (shape + 1) as usize);
            let mut bridge_mask: BridgeMask = vec![false; nddims];
            for &d in &dims_to_bridge {
                bridge_mask[(d - 1) as usize] = true;
            }
            for mb_tile in scan::collect_tiles(&adj_block_idxs, 1..nsd) {
                self.calc_mini_block(
                    region_thread,
                    None,
                    region_shift_num,
                    nphases,
                    phase,
                    nshapes,
                    shape,
                    &bridge_mask,
                    rank_tile,
                    region_idxs,
                    &block_idxs,
                    &mb_tile,
                );
            }
        }
    }

    /// Evaluate one mini-block: the (time, pack) loop with skew shifts
    #[allow(clippy::too_many_arguments)]
    fn calc_mini_block(
        &self,
        region_thread: usize,
        sel_pack: Option<usize>,
        region_shift_num: i64,
        nphases: i64,
        phase: i64,
        nshapes: i64,
        shape: i64,
        bridge_mask: &BridgeMask,
        rank_tile: &ScanSpan,
        base_region_idxs: &ScanSpan,
        base_block_idxs: &ScanSpan,
        mb_tile: &ScanSpan,
    ) {
        // Keep MPI moving while only interior work remains.
        if self.is_overlap_active() && self.do_mpi_interior && region_thread == 0 {
            self.poke_halo_exchange();
        }

        let nddims = self.dims.num_domain_dims();
        let mut mini_block_idxs =
            ScanSpan::new_for(&self.dims, true, Some(&self.rank_domain_offsets));
        mini_block_idxs.init_from_outer(mb_tile);

        let begin_t = mini_block_idxs.begin[STEP_POSN];
        let end_t = mini_block_idxs.end[STEP_POSN];
        let step_dir: i64 = if end_t >= begin_t { 1 } else { -1 };
        let num_t = (end_t - begin_t).abs();

        let mut shift_num: i64 = 0;
        for index_t in 0..num_t {
            let start_t = begin_t + index_t * step_dir;
            let stop_t = start_t + step_dir;
            mini_block_idxs.index[STEP_POSN] = index_t;
            mini_block_idxs.begin[STEP_POSN] = start_t;
            mini_block_idxs.end[STEP_POSN] = stop_t;
            mini_block_idxs.start[STEP_POSN] = start_t;
            mini_block_idxs.stop[STEP_POSN] = stop_t;

            for pi in 0..self.packs.len() {
                if sel_pack.is_some() && sel_pack != Some(pi) {
                    continue;
                }
                if !self.pack_in_valid_step(pi, start_t) {
                    shift_num += 1;
                    continue;
                }
                log::trace!(
                    "calc_mini_block: phase {phase}/{nphases}, shape {shape}/{nshapes}, \
                     step {start_t}, pack '{}', shift {}",
                    self.packs[pi].name,
                    region_shift_num + shift_num
                );
                if region_thread == 0 {
                    self.packs[pi].start_timers();
                }
                let settings = self.active_settings(pi);
                for j in 0..nddims {
                    let i = j + 1;
                    mini_block_idxs.stride[i] = settings.sub_block_sizes.vals()[i];
                    mini_block_idxs.group_size[i] = settings.sub_block_group_sizes.vals()[i];
                }
                mini_block_idxs.stride[STEP_POSN] = step_dir;

                // Shift and clamp: wave-front trim against the rank span,
                // then the tessellation shape, block, and region bounds.
                let mut ok = self.shift_region(
                    &rank_tile.start,
                    &rank_tile.stop,
                    region_shift_num + shift_num,
                    Some(pi),
                    &mut mini_block_idxs,
                );
                if ok {
                    ok = self.shift_mini_block(
                        &mb_tile.start,
                        &mb_tile.stop,
                        &mb_tile.begin,
                        &mb_tile.end,
                        &base_block_idxs.begin,
                        &base_block_idxs.end,
                        &base_region_idxs.begin,
                        &base_region_idxs.end,
                        shift_num,
                        nphases,
                        phase,
                        bridge_mask,
                        &mut mini_block_idxs,
                    );
                }

                if ok {
                    if !self.scratch_defs.is_empty() {
                        self.update_scratch_var_info(region_thread, &mini_block_idxs.begin);
                    }
                    for &bi in &self.packs[pi].bundle_ids {
                        if self.bundles[bi].bb.num_points > 0 {
                            self.calc_bundle_mini_block(
                                bi,
                                region_thread,
                                &settings,
                                &mini_block_idxs,
                            );
                        }
                    }
                    // Make stores visible to later packs and steps.
                    fence(Ordering::SeqCst);
                }

                shift_num += 1;
                if region_thread == 0 {
                    self.packs[pi].stop_timers();
                }
            }
        }
    }

    /// The settings that govern a pack right now
    pub(crate) fn active_settings(&self, pi: usize) -> KernelSettings {
        if self.use_pack_tuners {
            self.packs[pi].local_opts.clone()
        } else {
            self.opts.clone()
        }
    }

    /// Shift a span left by the wavefront skew and trim it to the pack box,
    /// the wave-front extensions, and the active MPI section
    ///
    /// Writes the result into `idxs.begin`/`idxs.end`; returns whether any
    /// work remains.
    pub(crate) fn shift_region(
        &self,
        base_start: &Indices,
        base_stop: &Indices,
        shift_num: i64,
        sel_pack: Option<usize>,
        idxs: &mut ScanSpan,
    ) -> bool {
        let nddims = self.dims.num_domain_dims();
        let mut ok = true;
        for j in 0..nddims {
            let i = j + 1;
            let angle = self.wf_angles[j];
            let shift_amt = angle * shift_num;

            // Regions shift left only, so region loops strictly increment.
            let mut rstart = base_start[i] - shift_amt;
            let mut rstop = base_stop[i] - shift_amt;

            if let Some(pi) = sel_pack {
                // Trim to the pack box (inside the extended rank box).
                let pbb = &self.packs[pi].bb;
                rstart = rstart.max(pbb.begin[j]);
                rstop = rstop.min(pbb.end[j]);

                let dbegin = self.rank_bb.begin[j];
                let dend = self.rank_bb.end[j];

                // Inside the left extension, the boundary advances with
                // each shift; inside the right extension it recedes.
                if rstart < dbegin && self.left_wf_exts[j] > 0 {
                    rstart = rstart.max(dbegin - self.left_wf_exts[j] + shift_amt);
                }
                if rstop > dend && self.right_wf_exts[j] > 0 {
                    rstop = rstop.min(dend + self.right_wf_exts[j] - shift_amt);
                }

                // Trim to the active MPI section.
                if self.is_overlap_active() && self.mpi_exterior_dim >= 0 {
                    let mut int_begin = self.mpi_interior.begin[j];
                    let mut int_end = self.mpi_interior.end[j];
                    if self.wf_steps > 0 {
                        // Each exterior shape is a trapezoid narrowing as
                        // time advances; the interior is the inverted
                        // trapezoid between them.
                        if self.does_exterior_exist(j, true) {
                            int_begin += self.wf_shift_pts[j];
                            int_begin -= shift_amt;
                        }
                        if self.does_exterior_exist(j, false) {
                            int_end -= self.wf_shift_pts[j];
                            int_end += shift_amt;
                        }
                    }

                    if self.do_mpi_interior {
                        rstart = rstart.max(int_begin);
                        rstop = rstop.min(int_end);
                    } else {
                        debug_assert_ne!(self.do_mpi_left, self.do_mpi_right);
                        let ext_dim = self.mpi_exterior_dim as usize;
                        if !self.does_exterior_exist(ext_dim, self.do_mpi_left) {
                            ok = false;
                            break;
                        }
                        if j == ext_dim {
                            if self.do_mpi_left {
                                rstop = rstop.min(int_begin);
                            } else {
                                rstart = rstart.max(int_end);
                                // Avoid overlapping the left section when
                                // the rank is narrower than two shifts;
                                // left always runs before right.
                                rstart = rstart.max(int_begin);
                            }
                        }
                        // Earlier dims were already handled by their own
                        // exterior passes; trim their overlap away.
                        if j < ext_dim {
                            rstart = rstart.max(int_begin);
                            rstop = rstop.min(int_end);
                        }
                    }
                }

                if rstop <= rstart {
                    ok = false;
                    break;
                }
            }

            idxs.begin[i] = rstart;
            idxs.end[i] = rstop;
        }
        log::trace!(
            "shift_region: shift {shift_num} -> [{} ... {}){}",
            idxs.begin,
            idxs.end,
            if ok { "" } else { " (empty)" }
        );
        ok
    }

    /// Clamp a shifted mini-block to its tessellation shape, block, and
    /// region bounds for the given phase
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn shift_mini_block(
        &self,
        mb_base_start: &Indices,
        mb_base_stop: &Indices,
        adj_block_base_start: &Indices,
        adj_block_base_stop: &Indices,
        block_base_start: &Indices,
        block_base_stop: &Indices,
        region_base_start: &Indices,
        region_base_stop: &Indices,
        mb_shift_num: i64,
        nphases: i64,
        phase: i64,
        bridge_mask: &BridgeMask,
        idxs: &mut ScanSpan,
    ) -> bool {
        let nddims = self.dims.num_domain_dims();
        let mut ok = true;
        for j in 0..nddims {
            let i = j + 1;
            let tb_angle = self.tb_angles[j];

            // Block position within the region.
            let is_first_blk = block_base_start[i] <= region_base_start[i];
            let is_last_blk = block_base_stop[i] >= region_base_stop[i];
            let is_one_blk = is_first_blk && is_last_blk;

            // Phase-0 trapezoid base and the start of the next block.
            let mut blk_start = block_base_start[i];
            let mut blk_stop = block_base_stop[i];
            if nphases > 1 && !is_one_blk {
                blk_stop = (blk_start + self.tb_widths[j]).min(block_base_stop[i]);
            }
            let mut next_blk_start = block_base_stop[i];

            // Shrink both sides by the skew, clamping the region edges.
            blk_start += tb_angle * mb_shift_num;
            if is_first_blk {
                blk_start = idxs.begin[i];
            }
            blk_stop -= tb_angle * mb_shift_num;
            if (nphases == 1 || is_one_blk) && is_last_blk {
                blk_stop = idxs.end[i];
            }
            next_blk_start += tb_angle * mb_shift_num;
            if is_last_blk {
                next_blk_start = idxs.end[i];
            }

            // Phase 0 evaluates the trapezoid itself; bridging phases span
            // from the trapezoid's right side to the next block's left.
            let mut shape_start = blk_start;
            let mut shape_stop = blk_stop;
            if phase > 0 && bridge_mask[j] {
                shape_start = blk_stop.max(blk_start);
                shape_stop = next_blk_start;
            }
            if shape_stop <= shape_start {
                ok = false;
                break;
            }

            // Mini-block position within the adjusted block.
            let is_first_mb = mb_base_start[i] <= adj_block_base_start[i];
            let is_last_mb = mb_base_stop[i] >= adj_block_base_stop[i];
            let is_one_mb = is_first_mb && is_last_mb;

            let mut mb_start = mb_base_start[i];
            let mut mb_stop = mb_base_stop[i];

            // Mini-blocks form a wave-front inside the block: shift left.
            if !is_one_mb {
                let mb_angle = self.mb_angles[j];
                mb_start -= mb_angle * mb_shift_num;
                mb_stop -= mb_angle * mb_shift_num;
            }
            if is_first_mb {
                mb_start = shape_start;
            }
            if is_last_mb {
                mb_stop = shape_stop;
            }

            // Clamp to the region, then to the shape.
            mb_start = mb_start.max(idxs.begin[i]);
            mb_stop = mb_stop.min(idxs.end[i]);
            mb_start = mb_start.max(shape_start);
            mb_stop = mb_stop.min(shape_stop);

            idxs.begin[i] = mb_start;
            idxs.end[i] = mb_stop;
            if mb_stop <= mb_start {
                ok = false;
                break;
            }
        }
        log::trace!(
            "shift_mini_block: phase {phase}/{nphases}, shift {mb_shift_num} -> \
             [{} ... {}){}",
            idxs.begin,
            idxs.end,
            if ok { "" } else { " (empty)" }
        );
        ok
    }

    /// Point scratch vars at the current mini-block for one region thread
    pub(crate) fn update_scratch_var_info(&self, region_thread: usize, begin: &Indices) {
        for map in &self.scratch_map {
            let sv = &self.svars[map[region_thread]];
            for j in 0..self.dims.num_domain_dims() {
                let dname = &self.dims.domain_dims()[j];
                if let Some(posn) = sv.dim_posn(dname) {
                    let rofs = self.rank_domain_offsets[j];
                    sv.set_local_offset(posn, begin[j + 1] - rofs);
                }
            }
        }
    }

    /// Evaluate with the reference scalar path: whole-rank tiles, no
    /// wave-fronts, no temporal blocking, every bundle in declaration order
    ///
    /// Used as the bit-exact oracle for scheduler correctness tests.
    pub fn run_ref(&mut self, first_step_index: i64, last_step_index: i64) -> Result<()> {
        if !self.prepared {
            return Err(Error::Preparation(
                "run_ref() called without calling prepare_solution() first".to_string(),
            ));
        }
        self.run_time.start();

        let step_dir: i64 = if last_step_index >= first_step_index {
            1
        } else {
            -1
        };
        let begin_t = first_step_index;
        let end_t = last_step_index + step_dir;

        // Whole-rank tiles so scratch vars are large enough; no temporal
        // tiling of any kind.
        self.opts.region_sizes.set_vals_same(0);
        self.opts.block_sizes.set_vals_same(0);
        self.opts.mini_block_sizes.set_vals_same(0);
        self.opts.sub_block_sizes.set_vals_same(0);
        let dims = self.dims.clone();
        self.opts.adjust_settings(&dims);
        self.update_var_info(true)?;
        for pi in 0..self.packs.len() {
            self.packs[pi].local_opts = self.opts.clone();
        }
        self.alloc_scratch_data()?;

        // Scratch offsets track the rank itself.
        let nddims = self.dims.num_domain_dims();
        let mut rank_begin = Indices::new(nddims + 1, 0);
        for j in 0..nddims {
            rank_begin[j + 1] = self.rank_bb.begin[j];
        }
        self.update_scratch_var_info(0, &rank_begin);

        self.exchange_halos()?;

        let num_t = (end_t - begin_t).abs();
        for index_t in 0..num_t {
            let start_t = begin_t + index_t * step_dir;
            let stop_t = start_t + step_dir;

            for bi in 0..self.bundles.len() {
                if self.bundles[bi].is_scratch {
                    continue;
                }
                if !self.bundles[bi].is_in_valid_step(start_t) {
                    continue;
                }
                self.exchange_halos()?;

                // Scratch prerequisites first, then the bundle itself.
                let mut todo = self.bundles[bi].scratch_children.clone();
                todo.push(bi);
                for sgi in todo {
                    let mut span =
                        ScanSpan::new_for(&self.dims, false, Some(&self.rank_domain_offsets));
                    span.begin[STEP_POSN] = start_t;
                    span.end[STEP_POSN] = stop_t;
                    for j in 0..nddims {
                        span.begin[j + 1] = self.rank_bb.begin[j];
                        span.end[j + 1] = self.rank_bb.end[j];
                    }
                    span.start = span.begin.clone();
                    span.stop = span.end.clone();
                    let span = self.adjust_span(0, sgi, &span);
                    self.eval_span_scalar(sgi, start_t, &span);
                }
                self.update_vars(None, start_t, stop_t, true);
            }
            self.steps_done += 1;
        }

        self.exchange_halos()?;
        self.run_time.stop();
        Ok(())
    }

    /// Scalar-evaluate every in-domain point of a span (reference path)
    fn eval_span_scalar(&self, bundle_id: usize, start_t: i64, span: &ScanSpan) {
        let nddims = self.dims.num_domain_dims();
        let bundle = &self.bundles[bundle_id];
        let ectx = crate::kernels::EvalCtx::new(&self.vars, &self.svars, &self.scratch_map, 0, 0);
        let mut point = Indices::new(nddims, 0);
        let mut idxs = vec![0i64; nddims + 1];
        idxs[STEP_POSN] = start_t;

        // Row-major scan over the domain dims.
        let mut cursor: Vec<i64> = (0..nddims).map(|j| span.begin[j + 1]).collect();
        if (0..nddims).any(|j| span.end[j + 1] <= span.begin[j + 1]) {
            return;
        }
        'outer: loop {
            for j in 0..nddims {
                point[j] = cursor[j];
                idxs[j + 1] = cursor[j];
            }
            if bundle.is_in_valid_domain(&point) {
                (bundle.kernels.scalar)(&ectx, &idxs);
            }
            let mut d = nddims;
            loop {
                if d == 0 {
                    break 'outer;
                }
                d -= 1;
                cursor[d] += 1;
                if cursor[d] < span.end[d + 1] {
                    break;
                }
                cursor[d] = span.begin[d + 1];
            }
        }
    }
}
