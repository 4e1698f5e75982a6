//! Memory planning
//!
//! A multi-pass planner by memory key (local NUMA, specific node,
//! interleave, none, shm, PMEM device). Vars spill to a PMEM key once the
//! preferred key's running total exceeds the configured cap; byte totals
//! are summed per key with cache-line rounding plus a pad at least the size
//! of a shared-memory lock record; offsets within each planned slab are
//! then handed out. Physical NUMA/PMEM placement is an allocator service
//! outside this crate; vars and buffers own their memory under the planned
//! layout, and shm buffers live in the transport's shared window.

use crate::context::StencilContext;
use crate::mpi::{BufDir, BufStorage, MpiData, RANK_NEXT, RANK_PREV};
use crate::settings::{PMEM_KEY, SHM_KEY};
use data::error::{Error, Result};
use data::indices::Indices;
use data::math;
use std::collections::HashMap;

/// Alignment of every planned allocation
pub const CACHELINE_BYTES: u64 = 64;

/// Pad between planned allocations; must hold a shm lock record
pub const DATA_BUF_PAD: u64 = 64;

/// Round a planned size up to the next allocation boundary
fn pad_bytes(nbytes: u64) -> u64 {
    math::round_up((nbytes + DATA_BUF_PAD) as i64, CACHELINE_BYTES as i64) as u64
}

impl StencilContext {
    /// Plan and allocate storage for every var that has none
    pub(crate) fn alloc_var_data(&mut self) -> Result<()> {
        // I/O vars first so they land at the front of the preferred key.
        let mut order: Vec<usize> = Vec::with_capacity(self.vars.len());
        let mut seen = vec![false; self.vars.len()];
        for &id in &self.output_var_ids {
            if !seen[id] {
                seen[id] = true;
                order.push(id);
            }
        }
        for id in 0..self.vars.len() {
            if !seen[id] {
                order.push(id);
            }
        }

        let pref_max_bytes = self.opts.numa_pref_max_gib as u64 * 1024 * 1024 * 1024;

        // Pass 0: spill overflow past the preferred-key cap to PMEM.
        let mut pref_total: u64 = 0;
        for &id in &order {
            if self.vars[id].is_storage_allocated() {
                continue;
            }
            if self.vars[id].numa_preferred() != self.opts.numa_pref {
                continue;
            }
            pref_total += pad_bytes(self.vars[id].num_storage_bytes() as u64);
            if pref_total > pref_max_bytes {
                log::debug!(
                    "var '{}' moved to PMEM key {PMEM_KEY} (preferred key is full)",
                    self.vars[id].name()
                );
                self.vars[id].set_numa_preferred(PMEM_KEY);
            }
        }

        // Pass 1: byte totals per key.
        let mut npbytes: HashMap<i32, u64> = HashMap::new();
        let mut nvars: HashMap<i32, usize> = HashMap::new();
        for &id in &order {
            if self.vars[id].is_storage_allocated() {
                continue;
            }
            let key = self.vars[id].numa_preferred();
            *npbytes.entry(key).or_default() +=
                pad_bytes(self.vars[id].num_storage_bytes() as u64);
            *nvars.entry(key).or_default() += 1;
        }
        for (key, nb) in &npbytes {
            log::debug!(
                "planning {} byte(s) for {} var(s) on mem key {key}",
                nb,
                nvars[key]
            );
        }

        // Pass 2: hand out offsets within each key and allocate.
        let mut offsets: HashMap<i32, u64> = HashMap::new();
        for &id in &order {
            if self.vars[id].is_storage_allocated() {
                continue;
            }
            let key = self.vars[id].numa_preferred();
            let ofs = offsets.entry(key).or_default();
            log::trace!(
                "var '{}' at offset {ofs} of mem key {key}",
                self.vars[id].name()
            );
            *ofs += pad_bytes(self.vars[id].num_storage_bytes() as u64);
            self.vars[id].alloc_storage()?;
        }
        Ok(())
    }

    /// Plan, size, and allocate the halo buffers for every (var, neighbor)
    pub(crate) fn alloc_mpi_data(&mut self) -> Result<()> {
        let comm = self.env.comm().clone();
        comm.barrier()?;
        self.mpi_data.get_mut().expect("exchange state").clear();
        self.mpi_interior = self.ext_bb.clone();
        self.interior_valid = false;
        if comm.num_ranks() < 2 {
            return Ok(());
        }

        let me = comm.rank();
        let nddims = self.dims.num_domain_dims();
        let my_vec_ok = self.mpi_info.has_all_vlen_mults[self.mpi_info.my_neighbor_index];
        let mut num_bufs = [0usize; 2];
        let mut num_elems = [0i64; 2];

        // Gather neighbor cells once so the planning loop below can take
        // &mut self for the interior box.
        let mut cells: Vec<(Indices, usize, usize)> = Vec::new();
        self.mpi_info.visit_neighbors(|ofs, rank, ni| {
            if let Some(nr) = rank {
                cells.push((ofs.clone(), nr, ni));
            }
        });

        let mut planned: std::collections::BTreeMap<String, MpiData> =
            std::collections::BTreeMap::new();

        // Interior trims are accumulated here and applied after planning so
        // the var borrows stay simple.
        let mut int_begin = self.mpi_interior.begin.clone();
        let mut int_end = self.mpi_interior.end.clone();

        for (neigh_offsets, neigh_rank, ni) in &cells {
            let vec_ok = my_vec_ok && self.mpi_info.has_all_vlen_mults[*ni];

            for &gi in &self.orig_var_ids {
                let v = &self.vars[gi];
                if v.is_scratch() {
                    continue;
                }
                let gname = v.name().to_string();
                let mut var_vec_ok = vec_ok;

                // Distance filter. Wave-fronts can touch edges and corners
                // even when the stencil alone would not.
                let mut maxdist = v.halo_exchange_l1_norm();
                if self.wf_steps > 0 {
                    maxdist = nddims as i64;
                }
                if self.mpi_info.man_dists[*ni] > maxdist {
                    continue;
                }

                // Ranges and halo widths per domain dim used by this var.
                let mut found_delta = false;
                let mut my_halo = vec![0i64; nddims];
                let mut neigh_halo = vec![0i64; nddims];
                let mut first_inner = vec![0i64; nddims];
                let mut last_inner = vec![0i64; nddims];
                let mut first_outer = vec![0i64; nddims];
                let mut last_outer = vec![0i64; nddims];
                let mut used = vec![false; nddims];
                for j in 0..nddims {
                    let dname = &self.dims.domain_dims()[j];
                    let Some(posn) = v.dim_posn(dname) else {
                        continue;
                    };
                    used[j] = true;
                    let vlen = self.dims.fold_len(j);
                    let lhalo = v.left_halo_size(posn);
                    let rhalo = v.right_halo_size(posn);

                    let mut fidx = v.first_rank_domain_index(posn);
                    let mut lidx = v.last_rank_domain_index(posn);
                    first_inner[j] = fidx;
                    last_inner[j] = lidx;
                    // Outermost ranks sync their own halo content too,
                    // which temporal tiling relies on.
                    if self.opts.is_first_rank(j) {
                        fidx -= lhalo;
                    }
                    if self.opts.is_last_rank(j) {
                        lidx += rhalo;
                    }
                    first_outer[j] = fidx;
                    last_outer[j] = lidx;

                    // Vector copies need the rounded range to stay inside
                    // the allocation.
                    let f_rounded = math::round_down(fidx, vlen);
                    let l_rounded = math::round_up(lidx + 1, vlen) - 1;
                    if f_rounded < v.first_rank_alloc_index(posn)
                        || l_rounded > v.last_rank_alloc_index(posn)
                    {
                        var_vec_ok = false;
                    }

                    // Exchange width: halo plus wave-front shifts; shifts
                    // apply regardless of this var's own halo because every
                    // bundle skews at each wave-front step.
                    let ext = self.wf_shift_pts[j];
                    match neigh_offsets[j] {
                        x if x == RANK_PREV => {
                            my_halo[j] = lhalo + ext;
                            neigh_halo[j] = rhalo + ext;
                            found_delta = true;
                        }
                        x if x == RANK_NEXT => {
                            my_halo[j] = rhalo + ext;
                            neigh_halo[j] = lhalo + ext;
                            found_delta = true;
                        }
                        _ => {}
                    }
                }
                if !found_delta {
                    continue;
                }

                if var_vec_ok {
                    for j in 0..nddims {
                        if !used[j] {
                            continue;
                        }
                        let vlen = self.dims.fold_len(j);
                        first_outer[j] = math::round_down(first_outer[j], vlen);
                        last_outer[j] = math::round_up(last_outer[j] + 1, vlen) - 1;
                        my_halo[j] = math::round_up(my_halo[j], vlen);
                        neigh_halo[j] = math::round_up(neigh_halo[j], vlen);
                    }
                }

                for dir in [BufDir::Send, BufDir::Recv] {
                    let v = &self.vars[gi];
                    let vdims = v.dim_names();
                    let nvd = vdims.len();
                    let mut copy_begin = vec![0i64; nvd];
                    let mut copy_end = vec![0i64; nvd];
                    let mut buf_sizes = vec![0i64; nvd];
                    let mut buf_vec_ok = var_vec_ok;

                    for (p, dname) in vdims.iter().enumerate() {
                        if let Some(j) = self.dims.domain_posn(dname) {
                            // Whole outer range by default; narrowed below
                            // toward the neighbor's side.
                            copy_begin[p] = first_outer[j];
                            copy_end[p] = last_outer[j] + 1;
                            let min_ext = self.opts.min_exterior;
                            match dir {
                                // Data from inside my domain, bound for the
                                // neighbor's halo: their halo width governs.
                                BufDir::Send => {
                                    if neigh_offsets[j] == RANK_PREV {
                                        copy_begin[p] = first_inner[j];
                                        copy_end[p] = first_inner[j] + neigh_halo[j];
                                        let ext_end = math::round_up(
                                            first_inner[j] + min_ext.max(neigh_halo[j]),
                                            self.dims.fold_len(j),
                                        );
                                        int_begin[j] = int_begin[j].max(ext_end);
                                    } else if neigh_offsets[j] == RANK_NEXT {
                                        copy_begin[p] = last_inner[j] + 1 - neigh_halo[j];
                                        copy_end[p] = last_inner[j] + 1;
                                        let ext_begin = math::round_down(
                                            last_inner[j] + 1 - min_ext.max(neigh_halo[j]),
                                            self.dims.fold_len(j),
                                        );
                                        int_end[j] = int_end[j].min(ext_begin);
                                    }
                                }
                                // Data bound for my own halo: my width.
                                BufDir::Recv => {
                                    if neigh_offsets[j] == RANK_PREV {
                                        copy_begin[p] = first_inner[j] - my_halo[j];
                                        copy_end[p] = first_inner[j];
                                    } else if neigh_offsets[j] == RANK_NEXT {
                                        copy_begin[p] = last_inner[j] + 1;
                                        copy_end[p] = last_inner[j] + 1 + my_halo[j];
                                    }
                                }
                            }
                            let dsize = copy_end[p] - copy_begin[p];
                            let vlen = self.dims.fold_len(j);
                            if math::mod_flr(dsize, vlen) != 0
                                || math::mod_flr(copy_begin[p], vlen) != 0
                            {
                                buf_vec_ok = false;
                            }
                            buf_sizes[p] = dsize;
                        } else if *dname == self.dims.step_dim() {
                            // Placeholder covering every step slot; actual
                            // bounds are filled per exchange.
                            let dsize = v.alloc_size(p);
                            copy_begin[p] = 0;
                            copy_end[p] = dsize;
                            buf_sizes[p] = dsize;
                        } else {
                            // Misc dims are copied wholesale.
                            copy_begin[p] = v.first_misc_index(p);
                            copy_end[p] = v.last_misc_index(p) + 1;
                            buf_sizes[p] = copy_end[p] - copy_begin[p];
                        }
                    }

                    if buf_sizes.iter().product::<i64>() == 0 {
                        continue;
                    }
                    let bname = match dir {
                        BufDir::Send => {
                            format!("{gname}_send_halo_from_{me}_to_{neigh_rank}")
                        }
                        BufDir::Recv => {
                            format!("{gname}_recv_halo_from_{neigh_rank}_to_{me}")
                        }
                    };
                    let copy_last: Vec<i64> = copy_end.iter().map(|e| e - 1).collect();

                    let entry = planned
                        .entry(gname.clone())
                        .or_insert_with(|| MpiData::new(self.mpi_info.neighborhood_size));
                    let buf = entry.bufs[*ni].buf_mut(dir);
                    buf.name = bname;
                    buf.begin_pt = copy_begin;
                    buf.last_pt = copy_last;
                    buf.num_pts = buf_sizes;
                    buf.vec_copy_ok = buf_vec_ok;
                    log::trace!(
                        "buffer '{}': {} element(s), vector-copy {}",
                        buf.name,
                        buf.size(),
                        if buf.vec_copy_ok { "enabled" } else { "disabled" }
                    );
                    let d = match dir {
                        BufDir::Send => 0,
                        BufDir::Recv => 1,
                    };
                    num_bufs[d] += 1;
                    num_elems[d] += buf.size();
                }
            }
        }
        log::debug!(
            "{} send buffer(s) with {} element(s); {} recv buffer(s) with {} element(s)",
            num_bufs[0],
            num_elems[0],
            num_bufs[1],
            num_elems[1]
        );

        // The interior only matters when overlap is possible.
        self.mpi_interior.begin = int_begin;
        self.mpi_interior.end = int_end;
        if self.opts.overlap_comms {
            self.mpi_interior
                .update(&self.dims, &self.rank_domain_offsets, true);
            self.interior_valid = true;
            log::debug!("MPI interior: {}", self.mpi_interior.make_range_string());
        }

        // Storage passes. Pass 0 assigns offsets within each memory key;
        // pass 1 allocates owned buffers and registers shm send buffers
        // (stamping sentinel bytes); pass 2 resolves peers' shm buffers
        // from the shared offset tables.
        let my_shm_rank = comm.shm_rank_of(me);
        let num_shm_ranks = comm.shm().map(|w| w.num_ranks()).unwrap_or(0);
        let mut offsets: HashMap<i32, u64> = HashMap::new();
        let mut sb_ofs: HashMap<String, Vec<Vec<i64>>> = HashMap::new();

        for (gname, data) in planned.iter_mut() {
            sb_ofs.insert(gname.clone(), vec![vec![0i64; num_shm_ranks]; num_shm_ranks]);
            for (_, _, ni) in &cells {
                let ni = *ni;
                let nshm_rank = self.mpi_info.shm_ranks[ni];
                let mem_key = if nshm_rank.is_some() && self.opts.use_shm {
                    SHM_KEY
                } else {
                    self.opts.numa_pref
                };
                for dir in [BufDir::Send, BufDir::Recv] {
                    let use_shm_here = self.opts.use_shm && nshm_rank.is_some();
                    let nbytes = {
                        let buf = data.bufs[ni].buf_mut(dir);
                        if !buf.is_active() {
                            continue;
                        }
                        buf.bytes() as u64
                    };
                    // Receive side of an shm pair lives in the peer's
                    // window, not in my memory.
                    let use_mine = !(dir == BufDir::Recv && use_shm_here);
                    if !use_mine {
                        continue;
                    }
                    let ofs = offsets.entry(mem_key).or_default();
                    let buf = data.bufs[ni].buf_mut(dir);
                    buf.plan_offset = *ofs;
                    if use_shm_here && dir == BufDir::Send {
                        let win = comm
                            .shm()
                            .ok_or_else(|| {
                                Error::Allocation(
                                    "shm requested but transport has no window".to_string(),
                                )
                            })?;
                        let shm_buf = win.register(me, *ofs, (nbytes as usize).div_ceil(
                            data::ELEMENT_BYTES,
                        ))?;
                        shm_buf.write_sentinels(me);
                        shm_buf.lock.init();
                        buf.storage = BufStorage::Shm(shm_buf);
                        if let (Some(mine), Some(theirs)) = (my_shm_rank, nshm_rank) {
                            sb_ofs.get_mut(gname).expect("table row")[mine][theirs] =
                                *ofs as i64;
                        }
                    } else {
                        buf.storage = BufStorage::Owned(vec![
                            0.0;
                            (nbytes as usize)
                                .div_ceil(data::ELEMENT_BYTES)
                        ]);
                    }
                    *ofs += pad_bytes(nbytes);
                }
            }

            // Publish my send-buffer offsets so each receiver can find its
            // matching buffer in the owner's window.
            if self.opts.use_shm && num_shm_ranks > 0 {
                let table = sb_ofs.get_mut(gname).expect("table row");
                for rn in 0..num_shm_ranks {
                    comm.broadcast_idx(rn, &mut table[rn])?;
                }
            }

            // Pass 2: resolve shm recv buffers and verify sentinels.
            for (_, neigh_rank, ni) in &cells {
                let ni = *ni;
                let nshm_rank = self.mpi_info.shm_ranks[ni];
                let use_shm_here = self.opts.use_shm && nshm_rank.is_some();
                if !use_shm_here {
                    continue;
                }
                let buf = data.bufs[ni].buf_mut(BufDir::Recv);
                if !buf.is_active() {
                    continue;
                }
                let (mine, theirs) = (
                    my_shm_rank.expect("self is in own shm group"),
                    nshm_rank.expect("checked above"),
                );
                let ofs = sb_ofs.get(gname).expect("table row")[theirs][mine] as u64;
                let win = comm.shm().expect("checked above");
                let shm_buf = win.lookup(*neigh_rank, ofs)?;
                if !shm_buf.check_sentinels(*neigh_rank) {
                    return Err(Error::Allocation(format!(
                        "sentinel check failed for shared buffer of var '{gname}' \
                         owned by rank {neigh_rank}"
                    )));
                }
                buf.storage = BufStorage::Shm(shm_buf);
            }
            comm.barrier()?;
        }

        *self.mpi_data.get_mut().expect("exchange state") = planned;
        comm.barrier()?;
        Ok(())
    }

    /// (Re)create and allocate the scratch vars: one per region thread per
    /// scratch definition, sized to the largest pack mini-block
    pub(crate) fn alloc_scratch_data(&mut self) -> Result<()> {
        self.svars.clear();
        self.scratch_map.clear();
        if self.scratch_defs.is_empty() {
            return Ok(());
        }
        let nddims = self.dims.num_domain_dims();
        let rthreads = self
            .pools
            .as_ref()
            .map(|p| p.num_region)
            .unwrap_or(1);

        // Largest mini-block across packs; they differ under per-pack
        // tuning.
        let mut mblksize = Indices::new(nddims, 0);
        for pi in 0..self.packs.len() {
            let s = self.active_settings(pi);
            for j in 0..nddims {
                let sz = math::round_up(s.mini_block_sizes.vals()[j + 1], self.dims.fold_len(j));
                mblksize[j] = mblksize[j].max(sz);
            }
        }
        log::trace!("scratch mini-block size: {mblksize}");

        for di in 0..self.scratch_defs.len() {
            let mut row = Vec::with_capacity(rthreads);
            for _thr in 0..rthreads {
                let def = &self.scratch_defs[di];
                let mut sv = def.build(&self.dims)?;
                sv.set_scratch(true);
                for j in 0..nddims {
                    let dname = self.dims.domain_dims()[j].clone();
                    let Some(posn) = sv.dim_posn(&dname) else {
                        continue;
                    };
                    sv.set_domain_size(&dname, mblksize[j])?;

                    // Generous allowance for wave-front and temporal-block
                    // shifts on both sides.
                    let shift_pts =
                        self.wf_shift_pts[j].max(self.tb_angles[j] * self.num_tb_shifts) * 2;
                    sv.set_wf_exts(posn, shift_pts, shift_pts);
                    sv.set_extra_pad_size(&dname, self.opts.extra_pad_sizes.vals()[j + 1])?;
                    sv.set_min_pad_size(&dname, self.opts.min_pad_sizes.vals()[j + 1])?;
                    sv.set_rank_offset(posn, self.rank_domain_offsets[j]);
                }
                sv.alloc_storage()?;
                row.push(self.svars.len());
                self.svars.push(sv);
            }
            self.scratch_map.push(row);
        }
        log::debug!(
            "{} scratch var(s) allocated for {rthreads} region thread(s)",
            self.svars.len()
        );
        Ok(())
    }
}
