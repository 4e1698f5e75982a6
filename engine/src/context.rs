//! The stencil context: the solution object
//!
//! Owns every var, bundle, and pack in arenas; sub-objects refer to vars by
//! index, never by pointer. This file covers construction, configuration,
//! and the preparation pipeline (rank setup, geometry, bounding boxes);
//! the stepping loops live in `scheduler.rs`, the sub-block evaluation in
//! `sub_block.rs`, memory planning in `alloc.rs`, and the halo exchange in
//! `exchange.rs`.

use crate::bundle::Bundle;
use crate::comm::assert_equality_over_ranks;
use crate::env::KernelEnv;
use crate::mpi::{MpiData, MpiInfo};
use crate::pack::Pack;
use crate::settings::KernelSettings;
use crate::solution::VarSpec;
use crate::stats::{Stats, Timer};
use crate::thread::ThreadPools;
use crate::tuner::AutoTuner;
use data::bounds::BoundingBox;
use data::dims::DimSet;
use data::error::{Error, Result};
use data::indices::{Indices, Tuple};
use data::math;
use data::var::Var;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Hook invoked around `prepare_solution`
pub type SolnHook = Box<dyn FnMut(&mut StencilContext) + Send>;

/// Hook invoked around `run_solution`, with the step range
pub type RunHook = Box<dyn FnMut(&mut StencilContext, i64, i64) + Send>;

/// Registered lifecycle hooks
#[derive(Default)]
pub(crate) struct Hooks {
    pub before_prepare: Vec<SolnHook>,
    pub after_prepare: Vec<SolnHook>,
    pub before_run: Vec<RunHook>,
    pub after_run: Vec<RunHook>,
}

/// The solution: vars, bundles, packs, geometry, and the run machinery
pub struct StencilContext {
    pub(crate) name: String,
    pub(crate) target: String,
    pub(crate) dims: DimSet,
    pub(crate) env: Arc<KernelEnv>,
    pub(crate) opts: KernelSettings,
    pub(crate) use_pack_tuners: bool,

    /// Var arena; everything else refers to vars by index
    pub(crate) vars: Vec<Var>,
    pub(crate) var_map: HashMap<String, usize>,
    /// Vars written by any bundle, in allocation-priority order
    pub(crate) output_var_ids: Vec<usize>,
    /// Vars created by the solution (not through the user API)
    pub(crate) orig_var_ids: Vec<usize>,
    /// Vars created through the user API
    pub(crate) user_var_ids: HashSet<usize>,

    pub(crate) bundles: Vec<Bundle>,
    pub(crate) packs: Vec<Pack>,

    /// Scratch definitions (templates) and the per-thread instances
    pub(crate) scratch_defs: Vec<VarSpec>,
    pub(crate) svars: Vec<Var>,
    /// `[def][region_thread]` -> index into `svars`
    pub(crate) scratch_map: Vec<Vec<usize>>,

    pub(crate) mpi_info: MpiInfo,
    /// Per-var exchange state, ordered by var name so all ranks agree
    pub(crate) mpi_data: Mutex<BTreeMap<String, MpiData>>,

    pub(crate) rank_bb: BoundingBox,
    pub(crate) ext_bb: BoundingBox,
    pub(crate) mpi_interior: BoundingBox,
    pub(crate) interior_valid: bool,
    pub(crate) rank_domain_offsets: Indices,

    // Wave-front and temporal-blocking geometry, all in domain dims.
    pub(crate) max_halos: Indices,
    pub(crate) wf_steps: i64,
    pub(crate) num_wf_shifts: i64,
    pub(crate) wf_angles: Indices,
    pub(crate) wf_shift_pts: Indices,
    pub(crate) left_wf_exts: Indices,
    pub(crate) right_wf_exts: Indices,
    pub(crate) tb_steps: i64,
    pub(crate) num_tb_shifts: i64,
    pub(crate) tb_angles: Indices,
    pub(crate) tb_widths: Indices,
    pub(crate) tb_tops: Indices,
    pub(crate) mb_angles: Indices,

    // Which MPI section the current pass covers.
    pub(crate) do_mpi_interior: bool,
    pub(crate) do_mpi_left: bool,
    pub(crate) do_mpi_right: bool,
    /// Domain dim of the current exterior pass; negative when inactive
    pub(crate) mpi_exterior_dim: i64,

    pub(crate) prepared: bool,
    pub(crate) pools: Option<ThreadPools>,

    // Counters drained by get_stats().
    pub(crate) steps_done: i64,
    pub(crate) writes_done: i64,
    pub(crate) fpops_done: i64,

    pub(crate) run_time: Timer,
    pub(crate) ext_time: Timer,
    pub(crate) int_time: Timer,
    pub(crate) halo_time: Timer,
    pub(crate) wait_time: Timer,
    pub(crate) test_time: Timer,

    /// Global auto-tuner, used when per-pack tuners are not
    pub(crate) tuner: Mutex<AutoTuner>,

    pub(crate) hooks: Mutex<Hooks>,
}
//
impl StencilContext {
    /// Bare context; populated by the solution factory
    pub(crate) fn new(
        name: String,
        target: String,
        dims: DimSet,
        env: Arc<KernelEnv>,
        opts: KernelSettings,
    ) -> Self {
        let nddims = dims.num_domain_dims();
        let zero = Indices::new(nddims, 0);
        Self {
            tuner: Mutex::new(AutoTuner::new(&name)),
            name,
            target,
            mpi_info: MpiInfo::new(nddims),
            dims,
            env,
            opts,
            use_pack_tuners: false,
            vars: Vec::new(),
            var_map: HashMap::new(),
            output_var_ids: Vec::new(),
            orig_var_ids: Vec::new(),
            user_var_ids: HashSet::new(),
            bundles: Vec::new(),
            packs: Vec::new(),
            scratch_defs: Vec::new(),
            svars: Vec::new(),
            scratch_map: Vec::new(),
            mpi_data: Mutex::new(BTreeMap::new()),
            rank_bb: BoundingBox::new_empty(nddims),
            ext_bb: BoundingBox::new_empty(nddims),
            mpi_interior: BoundingBox::new_empty(nddims),
            interior_valid: false,
            rank_domain_offsets: zero.clone(),
            max_halos: zero.clone(),
            wf_steps: 0,
            num_wf_shifts: 0,
            wf_angles: zero.clone(),
            wf_shift_pts: zero.clone(),
            left_wf_exts: zero.clone(),
            right_wf_exts: zero.clone(),
            tb_steps: 0,
            num_tb_shifts: 0,
            tb_angles: zero.clone(),
            tb_widths: zero.clone(),
            tb_tops: zero.clone(),
            mb_angles: zero,
            do_mpi_interior: true,
            do_mpi_left: true,
            do_mpi_right: true,
            mpi_exterior_dim: -1,
            prepared: false,
            pools: None,
            steps_done: 0,
            writes_done: 0,
            fpops_done: 0,
            run_time: Timer::new(),
            ext_time: Timer::new(),
            int_time: Timer::new(),
            halo_time: Timer::new(),
            wait_time: Timer::new(),
            test_time: Timer::new(),
            hooks: Mutex::new(Hooks::default()),
        }
    }

    // --- simple queries ---------------------------------------------------

    /// Solution name
    pub fn get_name(&self) -> &str {
        &self.name
    }

    /// Compile target description
    pub fn get_target(&self) -> &str {
        &self.target
    }

    /// Bytes per stored element
    pub fn get_element_bytes(&self) -> usize {
        data::ELEMENT_BYTES
    }

    /// The solution's dimension set
    pub fn get_dims(&self) -> &DimSet {
        &self.dims
    }

    /// Name of the step dim
    pub fn get_step_dim_name(&self) -> &str {
        self.dims.step_dim()
    }

    /// Names of the domain dims, in order
    pub fn get_domain_dim_names(&self) -> &[String] {
        self.dims.domain_dims()
    }

    /// Names of the misc dims
    pub fn get_misc_dim_names(&self) -> &[String] {
        self.dims.misc_dims()
    }

    /// The environment this solution runs in
    pub fn get_env(&self) -> &Arc<KernelEnv> {
        &self.env
    }

    /// The global settings
    pub fn get_settings(&self) -> &KernelSettings {
        &self.opts
    }

    /// Whether `prepare_solution` has completed
    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    // --- size configuration ----------------------------------------------

    fn set_size(&mut self, which: &str, dim: &str, size: i64, allow_step: bool) -> Result<()> {
        self.dims
            .check_dim_type(dim, which, allow_step, true, false)?;
        let tgt = match which {
            "set_overall_domain_size" => &mut self.opts.global_sizes,
            "set_rank_domain_size" => &mut self.opts.rank_sizes,
            "set_region_size" => &mut self.opts.region_sizes,
            "set_block_size" => &mut self.opts.block_sizes,
            "set_mini_block_size" => &mut self.opts.mini_block_sizes,
            "set_sub_block_size" => &mut self.opts.sub_block_sizes,
            "set_min_pad_size" => &mut self.opts.min_pad_sizes,
            "set_extra_pad_size" => &mut self.opts.extra_pad_sizes,
            _ => unreachable!("unknown size setter"),
        };
        tgt.set(dim, size)
            .map_err(|e| Error::Config(e.to_string()))?;
        Ok(())
    }

    /// Set the global problem size in a domain dim
    pub fn set_overall_domain_size(&mut self, dim: &str, size: i64) -> Result<()> {
        self.set_size("set_overall_domain_size", dim, size, false)
    }

    /// Set this rank's domain size in a domain dim
    pub fn set_rank_domain_size(&mut self, dim: &str, size: i64) -> Result<()> {
        self.set_size("set_rank_domain_size", dim, size, false)
    }

    /// Set the region size; the step dim sets the wave-front depth
    pub fn set_region_size(&mut self, dim: &str, size: i64) -> Result<()> {
        self.set_size("set_region_size", dim, size, true)
    }

    /// Set the block size; the step dim sets the temporal-blocking depth
    pub fn set_block_size(&mut self, dim: &str, size: i64) -> Result<()> {
        self.set_size("set_block_size", dim, size, true)
    }

    /// Set the mini-block size
    pub fn set_mini_block_size(&mut self, dim: &str, size: i64) -> Result<()> {
        self.set_size("set_mini_block_size", dim, size, false)
    }

    /// Set the sub-block size
    pub fn set_sub_block_size(&mut self, dim: &str, size: i64) -> Result<()> {
        self.set_size("set_sub_block_size", dim, size, false)
    }

    /// Set the minimum pad applied to every var in a domain dim
    pub fn set_min_pad_size(&mut self, dim: &str, size: i64) -> Result<()> {
        self.set_size("set_min_pad_size", dim, size, false)
    }

    /// Set the extra pad applied to every var in a domain dim
    pub fn set_extra_pad_size(&mut self, dim: &str, size: i64) -> Result<()> {
        self.set_size("set_extra_pad_size", dim, size, false)
    }

    /// Set the number of ranks in a domain dim (0 = solve automatically)
    pub fn set_num_ranks(&mut self, dim: &str, num: i64) -> Result<()> {
        self.dims
            .check_dim_type(dim, "set_num_ranks", false, true, false)?;
        self.opts
            .num_ranks
            .set(dim, num)
            .map_err(|e| Error::Config(e.to_string()))
    }

    /// Set this rank's coordinate in a domain dim
    pub fn set_rank_index(&mut self, dim: &str, index: i64) -> Result<()> {
        self.dims
            .check_dim_type(dim, "set_rank_index", false, true, false)?;
        self.opts.find_loc = false;
        self.opts
            .rank_indices
            .set(dim, index)
            .map_err(|e| Error::Config(e.to_string()))
    }

    /// Rank-grid shape in a domain dim
    pub fn get_num_ranks(&self, dim: &str) -> Result<i64> {
        self.dims
            .check_dim_type(dim, "get_num_ranks", false, true, false)?;
        Ok(self.opts.num_ranks.get(dim).unwrap_or(0))
    }

    /// This rank's coordinate in a domain dim
    pub fn get_rank_index(&self, dim: &str) -> Result<i64> {
        self.dims
            .check_dim_type(dim, "get_rank_index", false, true, false)?;
        Ok(self.opts.rank_indices.get(dim).unwrap_or(0))
    }

    /// Rank domain size in a domain dim
    pub fn get_rank_domain_size(&self, dim: &str) -> Result<i64> {
        self.dims
            .check_dim_type(dim, "get_rank_domain_size", false, true, false)?;
        Ok(self.opts.rank_sizes.get(dim).unwrap_or(0))
    }

    /// Global domain size in a domain dim
    pub fn get_overall_domain_size(&self, dim: &str) -> Result<i64> {
        self.dims
            .check_dim_type(dim, "get_overall_domain_size", false, true, false)?;
        Ok(self.opts.global_sizes.get(dim).unwrap_or(0))
    }

    /// Region size in a dim (the step dim reads the wave-front depth)
    pub fn get_region_size(&self, dim: &str) -> Result<i64> {
        self.dims
            .check_dim_type(dim, "get_region_size", true, true, false)?;
        Ok(self.opts.region_sizes.get(dim).unwrap_or(0))
    }

    /// Block size in a dim (the step dim reads the temporal-blocking depth)
    pub fn get_block_size(&self, dim: &str) -> Result<i64> {
        self.dims
            .check_dim_type(dim, "get_block_size", true, true, false)?;
        Ok(self.opts.block_sizes.get(dim).unwrap_or(0))
    }

    /// Mini-block size in a domain dim
    pub fn get_mini_block_size(&self, dim: &str) -> Result<i64> {
        self.dims
            .check_dim_type(dim, "get_mini_block_size", false, true, false)?;
        Ok(self.opts.mini_block_sizes.get(dim).unwrap_or(0))
    }

    /// Sub-block size in a domain dim
    pub fn get_sub_block_size(&self, dim: &str) -> Result<i64> {
        self.dims
            .check_dim_type(dim, "get_sub_block_size", false, true, false)?;
        Ok(self.opts.sub_block_sizes.get(dim).unwrap_or(0))
    }

    /// Default memory key applied to subsequently created vars
    pub fn set_default_numa_preferred(&mut self, key: i32) {
        self.opts.numa_pref = key;
    }

    /// Default memory key
    pub fn get_default_numa_preferred(&self) -> i32 {
        self.opts.numa_pref
    }

    /// Allow out-of-window step indices to alias into the window, for
    /// every var
    pub fn set_step_wrap(&mut self, wrap: bool) {
        self.opts.step_wrap = wrap;
        for v in &mut self.vars {
            v.set_step_wrap(wrap);
        }
    }

    /// Whether step wrapping is enabled
    pub fn get_step_wrap(&self) -> bool {
        self.opts.step_wrap
    }

    /// Apply command-line tokens to the settings, returning the residue
    pub fn apply_command_line_options(&mut self, args: &[String]) -> Result<Vec<String>> {
        let dims = self.dims.clone();
        self.opts.apply_command_line_options(&dims, args)
    }

    /// Apply a whitespace-separated option string, returning the residue
    pub fn apply_command_line_string(&mut self, line: &str) -> Result<Vec<String>> {
        let dims = self.dims.clone();
        self.opts.apply_command_line_string(&dims, line)
    }

    // --- var management ---------------------------------------------------

    pub(crate) fn add_var(&mut self, var: Var, from_user: bool) -> Result<usize> {
        if self.var_map.contains_key(var.name()) {
            return Err(Error::Config(format!(
                "var '{}' already exists",
                var.name()
            )));
        }
        let id = self.vars.len();
        self.var_map.insert(var.name().to_string(), id);
        if from_user {
            self.user_var_ids.insert(id);
        } else {
            self.orig_var_ids.push(id);
        }
        self.vars.push(var);
        Ok(id)
    }

    /// Create a var through the user API; not allowed after preparation
    pub fn new_var(&mut self, name: &str, dim_names: &[&str]) -> Result<usize> {
        if self.prepared {
            return Err(Error::Preparation(format!(
                "cannot create var '{name}' after prepare_solution()"
            )));
        }
        let mut var = Var::new(name, &self.dims, dim_names)?;
        var.set_numa_preferred(self.opts.numa_pref);
        var.set_step_wrap(self.opts.step_wrap);
        self.add_var(var, true)
    }

    /// Create a fixed-size var through the user API
    pub fn new_fixed_size_var(
        &mut self,
        name: &str,
        dim_names: &[&str],
        sizes: &[i64],
    ) -> Result<usize> {
        if self.prepared {
            return Err(Error::Preparation(format!(
                "cannot create var '{name}' after prepare_solution()"
            )));
        }
        let mut var = Var::new_fixed_size(name, &self.dims, dim_names, sizes)?;
        var.set_numa_preferred(self.opts.numa_pref);
        var.set_step_wrap(self.opts.step_wrap);
        self.add_var(var, true)
    }

    /// Number of vars
    pub fn get_num_vars(&self) -> usize {
        self.vars.len()
    }

    /// Names of all vars
    pub fn get_var_names(&self) -> Vec<&str> {
        self.vars.iter().map(|v| v.name()).collect()
    }

    /// Look up a var by name
    pub fn get_var(&self, name: &str) -> Option<&Var> {
        self.var_map.get(name).map(|&id| &self.vars[id])
    }

    /// Look up a var mutably by name
    pub fn get_var_mut(&mut self, name: &str) -> Option<&mut Var> {
        let id = *self.var_map.get(name)?;
        Some(&mut self.vars[id])
    }

    /// A var by arena id
    pub fn var_by_id(&self, id: usize) -> &Var {
        &self.vars[id]
    }

    /// Read-only view of the bundles (diagnostics)
    pub fn get_bundles(&self) -> &[crate::bundle::Bundle] {
        &self.bundles
    }

    /// A var by arena id, mutably
    pub fn var_by_id_mut(&mut self, id: usize) -> &mut Var {
        &mut self.vars[id]
    }

    /// Alias var `dst` onto var `src`'s storage
    pub fn fuse_vars(&mut self, dst: &str, src: &str) -> Result<()> {
        let di = *self
            .var_map
            .get(dst)
            .ok_or_else(|| Error::Config(format!("fuse_vars: no var named '{dst}'")))?;
        let si = *self
            .var_map
            .get(src)
            .ok_or_else(|| Error::Config(format!("fuse_vars: no var named '{src}'")))?;
        if di == si {
            return Err(Error::Config(format!(
                "fuse_vars: cannot fuse var '{dst}' onto itself"
            )));
        }
        // Split the arena to borrow both vars at once.
        let (lo, hi) = self.vars.split_at_mut(di.max(si));
        let (d, s) = if di < si {
            (&mut lo[di], &hi[0])
        } else {
            (&mut hi[0], &lo[si])
        };
        d.fuse_vars(s)
    }

    // --- hooks -------------------------------------------------------------

    /// Register a hook to run before `prepare_solution`
    pub fn call_before_prepare_solution(&mut self, hook: SolnHook) {
        self.hooks.get_mut().expect("hook registry").before_prepare.push(hook);
    }

    /// Register a hook to run after `prepare_solution`
    pub fn call_after_prepare_solution(&mut self, hook: SolnHook) {
        self.hooks.get_mut().expect("hook registry").after_prepare.push(hook);
    }

    /// Register a hook to run before `run_solution`
    pub fn call_before_run_solution(&mut self, hook: RunHook) {
        self.hooks.get_mut().expect("hook registry").before_run.push(hook);
    }

    /// Register a hook to run after `run_solution`
    pub fn call_after_run_solution(&mut self, hook: RunHook) {
        self.hooks.get_mut().expect("hook registry").after_run.push(hook);
    }

    /// Put a temporarily removed hook set back, keeping anything a hook
    /// registered while it ran
    fn restore_hooks(&mut self, mut hooks: Hooks) {
        let mut guard = self.hooks.lock().expect("hook registry");
        let added = std::mem::take(&mut *guard);
        hooks.before_prepare.extend(added.before_prepare);
        hooks.after_prepare.extend(added.after_prepare);
        hooks.before_run.extend(added.before_run);
        hooks.after_run.extend(added.after_run);
        *guard = hooks;
    }

    pub(crate) fn run_soln_hooks(&mut self, which: fn(&mut Hooks) -> &mut Vec<SolnHook>) {
        let mut hooks = std::mem::take(&mut *self.hooks.lock().expect("hook registry"));
        for h in which(&mut hooks).iter_mut() {
            h(self);
        }
        self.restore_hooks(hooks);
    }

    pub(crate) fn run_run_hooks(
        &mut self,
        which: fn(&mut Hooks) -> &mut Vec<RunHook>,
        first: i64,
        last: i64,
    ) {
        let mut hooks = std::mem::take(&mut *self.hooks.lock().expect("hook registry"));
        for h in which(&mut hooks).iter_mut() {
            h(self, first, last);
        }
        self.restore_hooks(hooks);
    }

    // --- preparation -------------------------------------------------------

    /// Allocate storage, plan buffers, and freeze the run geometry
    pub fn prepare_solution(&mut self) -> Result<()> {
        self.run_soln_hooks(|h| &mut h.before_prepare);

        // Thread pools must exist before scratch vars are sized.
        self.pools = Some(ThreadPools::new(
            self.opts.max_threads,
            self.opts.thread_divisor,
            self.opts.num_block_threads,
            self.env.max_threads,
        )?);

        self.setup_rank()?;
        self.opts.adjust_settings(&self.dims);
        self.update_var_info(false)?;
        for pi in 0..self.packs.len() {
            let opts = self.opts.clone();
            self.packs[pi].local_opts = opts;
        }
        self.alloc_var_data()?;
        self.find_bounding_boxes();
        self.alloc_mpi_data()?;
        self.alloc_scratch_data()?;
        self.init_work_stats()?;
        self.prepared = true;

        log::info!(
            "solution '{}' prepared: rank {} of {}, rank domain {}",
            self.name,
            self.env.rank_index(),
            self.env.num_ranks(),
            self.rank_bb.make_range_string()
        );
        self.run_soln_hooks(|h| &mut h.after_prepare);
        Ok(())
    }

    /// Release var storage and buffers; the solution may be re-prepared
    pub fn end_solution(&mut self) -> Result<()> {
        for v in &mut self.vars {
            v.release_storage();
        }
        self.svars.clear();
        self.scratch_map.clear();
        self.mpi_data.get_mut().expect("exchange state").clear();
        if let Some(shm) = self.env.comm().shm() {
            shm.clear();
        }
        self.prepared = false;
        Ok(())
    }

    /// Init MPI-related state: rank grid, coordinates, offsets, neighbors
    ///
    /// Called from `prepare_solution` even in single-rank runs.
    pub(crate) fn setup_rank(&mut self) -> Result<()> {
        let comm = self.env.comm().clone();
        let me = comm.rank();
        let nr = comm.num_ranks() as i64;
        let nddims = self.dims.num_domain_dims();

        // Settings that shape the problem must agree across ranks.
        assert_equality_over_ranks(comm.as_ref(), nr, "total number of MPI ranks")?;
        assert_equality_over_ranks(comm.as_ref(), self.opts.use_shm as i64, "use_shm setting")?;
        assert_equality_over_ranks(
            comm.as_ref(),
            self.opts.find_loc as i64,
            "defined rank indices",
        )?;
        for j in 0..nddims {
            let dname = self.dims.domain_dims()[j].clone();
            let i = j + 1;
            assert_equality_over_ranks(
                comm.as_ref(),
                self.opts.global_sizes.vals()[i],
                &format!("global-domain size in '{dname}' dimension"),
            )?;
            assert_equality_over_ranks(
                comm.as_ref(),
                self.opts.num_ranks.vals()[j],
                &format!("number of ranks in '{dname}' dimension"),
            )?;
            if self.opts.global_sizes.vals()[i] == 0 && self.opts.rank_sizes.vals()[i] == 0 {
                return Err(Error::Config(format!(
                    "both local-domain size and global-domain size are zero in '{dname}' \
                     dimension on rank {me}; specify one, and the other will be calculated"
                )));
            }
        }

        if nr == 1 {
            // Single rank: trivial layout.
            self.opts.num_ranks.set_vals_same(1);
            self.opts.rank_indices.set_vals_same(0);
            self.rank_domain_offsets.set_all(0);
            for j in 0..nddims {
                let dname = self.dims.domain_dims()[j].clone();
                let g = self.opts.global_sizes.get(&dname).unwrap();
                let l = self.opts.rank_sizes.get(&dname).unwrap();
                if l == 0 {
                    self.opts.rank_sizes.set(&dname, g).unwrap();
                } else if g == 0 {
                    self.opts.global_sizes.set(&dname, l).unwrap();
                } else if g != l {
                    return Err(Error::Config(format!(
                        "specified local-domain size of {l} does not equal specified \
                         global-domain size of {g} in '{dname}' dimension"
                    )));
                }
            }
            let idx = self.mpi_info.my_neighbor_index;
            self.mpi_info.my_neighbors[idx] = Some(me);
            self.mpi_info.has_all_vlen_mults[idx] = true;
            return Ok(());
        }

        // Solve for the rank-grid shape if any dim is unset: enumerate
        // factor combinations of the world size, derive the first dim, and
        // keep the most compact layout (smallest maximum per-dim count).
        if self.opts.num_ranks.product() == 0 {
            let facts: Vec<i64> = (1..=nr).filter(|n| nr % n == 0).collect();
            let mut combos = Tuple::new();
            for j in 0..nddims {
                let dname = &self.dims.domain_dims()[j];
                let sz = if j == 0 || self.opts.num_ranks.vals()[j] != 0 {
                    1
                } else {
                    facts.len() as i64
                };
                combos.add_dim_back(dname, sz).unwrap();
            }
            let mut best: Option<Vec<i64>> = None;
            combos.visit_all_points(|combo| {
                let mut layout: Vec<i64> = combo.iter().map(|&f| facts[f as usize]).collect();
                for j in 0..nddims {
                    if self.opts.num_ranks.vals()[j] != 0 {
                        layout[j] = self.opts.num_ranks.vals()[j];
                    } else if j == 0 {
                        layout[j] = 1;
                    }
                }
                // Derive the first dim from the others.
                if self.opts.num_ranks.vals()[0] == 0 {
                    let others: i64 = layout[1..].iter().product();
                    if others == 0 || nr % others != 0 {
                        return true;
                    }
                    layout[0] = nr / others;
                }
                if layout.iter().product::<i64>() == nr {
                    let max = layout.iter().copied().max().unwrap_or(1);
                    let better = best
                        .as_ref()
                        .map(|b| max < b.iter().copied().max().unwrap_or(1))
                        .unwrap_or(true);
                    if better {
                        best = Some(layout);
                    }
                }
                true
            });
            let best = best.ok_or_else(|| {
                Error::Config(format!("cannot factor {nr} rank(s) over {nddims} dimension(s)"))
            })?;
            for j in 0..nddims {
                let dname = self.dims.domain_dims()[j].clone();
                self.opts.num_ranks.set(&dname, best[j]).unwrap();
            }
            log::debug!(
                "rank layout {} selected",
                self.opts.num_ranks.make_dim_val_str(" * ")
            );
        }

        let req_ranks = self.opts.num_ranks.product();
        if req_ranks != nr {
            return Err(Error::Config(format!(
                "{req_ranks} rank(s) requested ({}), but {nr} rank(s) are active",
                self.opts.num_ranks.make_dim_val_str(" * ")
            )));
        }

        // Derive my coordinates from my rank index if not provided.
        if self.opts.find_loc {
            let coords = self.opts.num_ranks.unlayout(me as i64);
            for j in 0..nddims {
                let dname = self.dims.domain_dims()[j].clone();
                self.opts.rank_indices.set(&dname, coords[j]).unwrap();
            }
        }
        for j in 0..nddims {
            let ri = self.opts.rank_indices.vals()[j];
            let n = self.opts.num_ranks.vals()[j];
            if ri < 0 || ri >= n {
                return Err(Error::Config(format!(
                    "rank index of {ri} is not within allowed range [0 ... {}] in '{}' \
                     dimension on rank {me}",
                    n - 1,
                    self.dims.domain_dims()[j]
                )));
            }
        }

        self.rank_domain_offsets.set_all(0);
        let nr = nr as usize;

        // Share coordinates and rank sizes over two passes: the first pass
        // sums specified sizes (deriving unspecified ones), the second sets
        // final offsets and neighbor info.
        let mut coords = vec![vec![0i64; nddims]; nr];
        let mut rsizes = vec![vec![0i64; nddims]; nr];
        for pass in 0..2 {
            let mut rank_domain_sums = Indices::new(nddims, 0);
            for j in 0..nddims {
                coords[me][j] = self.opts.rank_indices.vals()[j];
                rsizes[me][j] = self.opts.rank_sizes.vals()[j + 1];
            }
            for rn in 0..nr {
                comm.broadcast_idx(rn, &mut coords[rn])?;
                comm.broadcast_idx(rn, &mut rsizes[rn])?;
            }

            for rn in 0..nr {
                let rdeltas: Vec<i64> = (0..nddims).map(|j| coords[rn][j] - coords[me][j]).collect();
                let mandist: i64 = rdeltas.iter().map(|d| d.abs()).sum();
                let maxdist: i64 = rdeltas.iter().map(|d| d.abs()).max().unwrap_or(0);

                if rn == me && mandist != 0 {
                    return Err(Error::Config(format!(
                        "internal error: distance to own rank == {mandist}"
                    )));
                }
                if rn != me && mandist == 0 {
                    return Err(Error::Config(format!(
                        "ranks {me} and {rn} at same coordinates"
                    )));
                }

                for di in 0..nddims {
                    // Rank rn is in-line with me in dim di when the deltas
                    // in all other dims are zero.
                    let is_inline = (0..nddims).all(|dj| dj == di || rdeltas[dj] == 0);
                    if !is_inline {
                        continue;
                    }
                    rank_domain_sums[di] += rsizes[rn][di];
                    if pass == 1 {
                        // Edges and corners must line up.
                        for dj in 0..nddims {
                            if di != dj && rsizes[me][dj] != rsizes[rn][dj] {
                                return Err(Error::Config(format!(
                                    "ranks {rn} and {me} are both at rank-index {} in the \
                                     '{}' dimension, but their local-domain sizes are {} \
                                     and {} (resp.) in the '{}' dimension, making them \
                                     unaligned",
                                    coords[me][di],
                                    self.dims.domain_dims()[di],
                                    rsizes[rn][dj],
                                    rsizes[me][dj],
                                    self.dims.domain_dims()[dj]
                                )));
                            }
                        }
                        // My offset accumulates the sizes of all ranks
                        // before me in this dim.
                        if rdeltas[di] < 0 {
                            self.rank_domain_offsets[di] += rsizes[rn][di];
                        }
                    }
                }

                // Record immediate neighbors (distance <= 1 in every dim).
                if pass == 1 && maxdist <= 1 {
                    let roffsets =
                        Indices::from_slice(&rdeltas.iter().map(|d| d + 1).collect::<Vec<_>>());
                    let rn_ofs = self.mpi_info.neighbor_index(&roffsets);
                    self.mpi_info.my_neighbors[rn_ofs] = Some(rn);
                    self.mpi_info.man_dists[rn_ofs] = mandist;
                    if rn == me {
                        self.mpi_info.shm_ranks[rn_ofs] = comm.shm_rank_of(me);
                    } else if self.opts.use_shm {
                        self.mpi_info.shm_ranks[rn_ofs] = comm.shm_rank_of(rn);
                    }
                    let vlen_mults = (0..nddims).all(|j| {
                        math::mod_flr(rsizes[rn][j], self.dims.fold_len(j)) == 0
                    });
                    self.mpi_info.has_all_vlen_mults[rn_ofs] = vlen_mults;
                }
            }

            if pass == 0 {
                // Derive unspecified sizes.
                for j in 0..nddims {
                    let dname = self.dims.domain_dims()[j].clone();
                    let nranks_j = self.opts.num_ranks.vals()[j];
                    let gsz = self.opts.global_sizes.get(&dname).unwrap();
                    let is_last = self.opts.is_last_rank(j);
                    if self.opts.rank_sizes.get(&dname).unwrap() == 0 {
                        if rank_domain_sums[j] != 0 {
                            return Err(Error::Config(format!(
                                "local-domain size is not specified in the '{dname}' \
                                 dimension on rank {me}, but it is specified on another \
                                 rank; it must be specified or unspecified consistently \
                                 across all ranks"
                            )));
                        }
                        let mut rsz = math::ceil_div(gsz, nranks_j);
                        rsz = math::round_up(rsz, self.dims.cluster_pts(j));
                        let rem = gsz - rsz * (nranks_j - 1);
                        if rem <= 0 {
                            return Err(Error::Config(format!(
                                "global-domain size of {gsz} is not large enough to \
                                 split across {nranks_j} ranks in the '{dname}' dimension"
                            )));
                        }
                        if is_last {
                            rsz = rem;
                        }
                        self.opts.rank_sizes.set(&dname, rsz).unwrap();
                    } else if gsz == 0 {
                        self.opts
                            .global_sizes
                            .set(&dname, rank_domain_sums[j])
                            .unwrap();
                    }
                }
            } else {
                for j in 0..nddims {
                    let dname = &self.dims.domain_dims()[j];
                    let gsz = self.opts.global_sizes.get(dname).unwrap();
                    if gsz != rank_domain_sums[j] {
                        return Err(Error::Config(format!(
                            "sum of local-domain sizes across {nr} ranks is {}, which \
                             does not equal global-domain size of {gsz} in '{dname}' \
                             dimension",
                            rank_domain_sums[j]
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Push sizes, pads, and offsets into the vars and refresh the
    /// wave-front geometry
    pub(crate) fn update_var_info(&mut self, force: bool) -> Result<()> {
        let nddims = self.dims.num_domain_dims();
        self.max_halos = Indices::new(nddims, 0);

        for id in 0..self.vars.len() {
            let is_user = self.user_var_ids.contains(&id);
            for j in 0..nddims {
                let dname = self.dims.domain_dims()[j].clone();
                if !self.vars[id].is_dim_used(&dname) {
                    continue;
                }
                let posn = self.vars[id].dim_posn(&dname).unwrap();
                let resize = !self.vars[id].is_fixed_size() || (!is_user && force);
                if resize && !self.vars[id].is_storage_allocated() {
                    let rank_size = self.opts.rank_sizes.get(&dname).unwrap();
                    let extra = self.opts.extra_pad_sizes.get(&dname).unwrap();
                    let min_pad = self.opts.min_pad_sizes.get(&dname).unwrap();
                    let v = &mut self.vars[id];
                    v.set_domain_size(&dname, rank_size)?;
                    v.set_extra_pad_size(&dname, extra)?;
                    v.set_min_pad_size(&dname, min_pad)?;
                }
                if !self.vars[id].is_fixed_size() {
                    self.vars[id].set_rank_offset(posn, self.rank_domain_offsets[j]);
                }
                if !is_user {
                    let v = &self.vars[id];
                    self.max_halos[j] = self.max_halos[j]
                        .max(v.left_halo_size(posn))
                        .max(v.right_halo_size(posn));
                }
            }
        }

        // Wave-front steps: the region's step size, rounded up to at least
        // the temporal-blocking depth.
        let tb_req = self.opts.tb_steps_requested().max(0);
        self.wf_steps = self.opts.wf_steps_requested().max(0).max(tb_req);
        self.num_wf_shifts = if self.wf_steps > 0 {
            (self.packs.len() as i64 * self.wf_steps - 1).max(0)
        } else {
            0
        };

        self.use_pack_tuners = self.opts.allow_pack_tuners && tb_req == 0 && self.packs.len() > 1;

        for j in 0..nddims {
            let dname = &self.dims.domain_dims()[j];
            let rnsize = self.opts.region_sizes.get(dname).unwrap();
            let rksize = self.opts.rank_sizes.get(dname).unwrap();
            let nranks = self.opts.num_ranks.get(dname).unwrap().max(1);

            // Shift per step, from the max halo rounded up to the fold.
            let angle = math::round_up(self.max_halos[j], self.dims.fold_len(j));

            // No wave-front skewing needed when one region covers the
            // whole global domain in this dim.
            let wf_angle = if rnsize < rksize || nranks > 1 { angle } else { 0 };
            self.wf_angles[j] = wf_angle;
            let shifts = wf_angle * self.num_wf_shifts;
            self.wf_shift_pts[j] = shifts;

            let min_size = self.max_halos[j] + shifts;
            if nranks > 1 && rksize < min_size {
                return Err(Error::Config(format!(
                    "local-domain size of {rksize} in '{dname}' dim is less than minimum \
                     size of {min_size}, which is based on stencil halos and temporal \
                     wave-front sizes"
                )));
            }
            self.left_wf_exts[j] = if self.opts.is_first_rank(j) { 0 } else { shifts };
            self.right_wf_exts[j] = if self.opts.is_last_rank(j) { 0 } else { shifts };
        }

        // Push wave-front extensions into the solution vars.
        for &id in &self.orig_var_ids.clone() {
            for j in 0..nddims {
                let dname = &self.dims.domain_dims()[j];
                if let Some(posn) = self.vars[id].dim_posn(dname) {
                    if !self.vars[id].is_storage_allocated() {
                        self.vars[id].set_wf_exts(
                            posn,
                            self.left_wf_exts[j],
                            self.right_wf_exts[j],
                        );
                    }
                }
            }
        }

        self.update_tb_info();
        Ok(())
    }

    /// Refresh the temporal-blocking geometry; called whenever block sizes
    /// change
    pub(crate) fn update_tb_info(&mut self) {
        let nddims = self.dims.num_domain_dims();
        self.tb_steps = self.opts.tb_steps_requested().max(0);
        self.num_tb_shifts = 0;
        self.tb_angles.set_all(0);
        self.tb_widths.set_all(0);
        self.tb_tops.set_all(0);
        self.mb_angles.set_all(0);

        if self.tb_steps > 0 {
            // TB runs inside a WF, so it cannot be deeper.
            let mut max_steps = self.tb_steps.min(self.wf_steps.max(1));
            for j in 0..nddims {
                let i = j + 1;
                let rnsize = self.opts.region_sizes.vals()[i];
                let blksize = self.opts.block_sizes.vals()[i];
                let mblksize = self.opts.mini_block_sizes.vals()[i];
                let fpts = self.dims.fold_len(j);
                let angle = math::round_up(self.max_halos[j], fpts);

                // Mini-blocks shift only if they tile the block.
                self.mb_angles[j] = if mblksize < blksize { angle } else { 0 };

                // Blocks shift only if they tile the region.
                let tb_angle = if blksize < rnsize { angle } else { 0 };
                self.tb_angles[j] = tb_angle;

                if tb_angle > 0 {
                    // Steps that fit the block: from
                    // blk_sz = top_sz + 2*angle*(npacks*nsteps - 1).
                    let top_sz = fpts;
                    let sh_pts = tb_angle * 2 * self.packs.len() as i64;
                    let nsteps = (blksize - top_sz + tb_angle * 2) / sh_pts;
                    max_steps = max_steps.min(nsteps);
                }
            }
            self.tb_steps = self.tb_steps.min(max_steps).max(0);
        }

        if self.tb_steps > 0 {
            self.num_tb_shifts = (self.packs.len() as i64 * self.tb_steps - 1).max(0);
        }

        // Phase-0 trapezoid base: half the block plus one total shift,
        // rounded to the fold; the bridge gets the rest.
        for j in 0..nddims {
            let i = j + 1;
            let blk_sz = self.opts.block_sizes.vals()[i];
            let tb_angle = self.tb_angles[j];
            self.tb_widths[j] = blk_sz;
            self.tb_tops[j] = blk_sz;
            if self.num_tb_shifts > 0 && tb_angle > 0 {
                let fpts = self.dims.fold_len(j);
                let min_top_sz = fpts;
                let sa = self.num_tb_shifts * tb_angle;
                let min_blk_width = min_top_sz + 2 * sa;
                let mut blk_width = math::round_up(math::ceil_div(blk_sz, 2) + sa, fpts);
                blk_width = blk_width.max(min_blk_width);
                self.tb_widths[j] = blk_width;
                self.tb_tops[j] = (blk_width - 2 * sa).max(0);
            }
        }
        log::trace!(
            "tb info: steps {} shifts {} widths {} tops {}",
            self.tb_steps,
            self.num_tb_shifts,
            self.tb_widths,
            self.tb_tops
        );
    }

    /// Compute the rank, extended, pack, and bundle bounding boxes
    pub(crate) fn find_bounding_boxes(&mut self) {
        let nddims = self.dims.num_domain_dims();
        let rank_sizes = Indices::from_slice(&self.opts.rank_sizes.vals()[1..=nddims]);
        self.rank_bb = BoundingBox::from_begin_end(
            self.rank_domain_offsets.clone(),
            self.rank_domain_offsets.add(&rank_sizes),
        );
        self.rank_bb
            .update(&self.dims, &self.rank_domain_offsets, true);

        self.ext_bb = BoundingBox::from_begin_end(
            self.rank_bb.begin.sub(&self.left_wf_exts),
            self.rank_bb.end.add(&self.right_wf_exts),
        );
        self.ext_bb
            .update(&self.dims, &self.rank_domain_offsets, true);

        // Bundles with identical predicates share their decomposition.
        let nthreads = self
            .pools
            .as_ref()
            .map(|p| p.num_region)
            .unwrap_or(1);
        let mut bb_descrs: HashMap<String, usize> = HashMap::new();
        for pi in 0..self.packs.len() {
            let mut pack_bb: Option<BoundingBox> = None;
            for bi in self.packs[pi].bundle_ids.clone() {
                let descr = self.bundles[bi].domain_description(&self.dims);
                if let Some(&src) = bb_descrs.get(&descr) {
                    if src != bi {
                        let (lo, hi) = self.bundles.split_at_mut(bi.max(src));
                        let (dst_b, src_b) = if bi < src {
                            (&mut lo[bi], &hi[0])
                        } else {
                            (&mut hi[0], &lo[src])
                        };
                        dst_b.copy_bounding_box(src_b);
                    }
                } else {
                    let ext_bb = self.ext_bb.clone();
                    let offsets = self.rank_domain_offsets.clone();
                    self.bundles[bi].find_bounding_box(&self.dims, &ext_bb, &offsets, nthreads);
                    bb_descrs.insert(descr, bi);
                }
                let bbb = &self.bundles[bi].bb;
                let merged = match pack_bb.take() {
                    None => bbb.clone(),
                    Some(mut p) => {
                        p.begin = p.begin.min_elements(&bbb.begin);
                        p.end = p.end.max_elements(&bbb.end);
                        p
                    }
                };
                pack_bb = Some(merged);
            }
            if let Some(mut p) = pack_bb {
                p.update(&self.dims, &self.rank_domain_offsets, true);
                self.packs[pi].bb = p;
            }
        }

        // Until buffers are planned, the interior is the whole box.
        self.mpi_interior = self.ext_bb.clone();
        self.interior_valid = false;
    }

    /// Per-pack work statistics; requires collective sums
    pub(crate) fn init_work_stats(&mut self) -> Result<()> {
        let comm = self.env.comm().clone();
        for pi in 0..self.packs.len() {
            let mut reads = 0i64;
            let mut writes = 0i64;
            let mut fpops = 0i64;
            for &bi in &self.packs[pi].bundle_ids {
                let b = &self.bundles[bi];
                let mut r1 = b.points_read;
                let mut w1 = b.points_written;
                let mut f1 = b.scalar_fp_ops;
                for &ci in &b.scratch_children {
                    let c = &self.bundles[ci];
                    r1 += c.points_read;
                    w1 += c.points_written;
                    f1 += c.scalar_fp_ops;
                }
                let pts = b.bb.num_points;
                reads += r1 * pts;
                writes += w1 * pts;
                fpops += f1 * pts;
            }
            let p = &mut self.packs[pi];
            p.num_reads_per_step = reads;
            p.num_writes_per_step = writes;
            p.num_fpops_per_step = fpops;
            p.tot_reads_per_step = comm.allgather_idx(reads)?.iter().sum();
            p.tot_writes_per_step = comm.allgather_idx(writes)?.iter().sum();
            p.tot_fpops_per_step = comm.allgather_idx(fpops)?.iter().sum();
            log::debug!(
                "pack '{}': {} bundle(s), {} write(s)/step, {} FP op(s)/step",
                p.name,
                p.bundle_ids.len(),
                p.num_writes_per_step,
                p.num_fpops_per_step
            );
        }
        Ok(())
    }

    // --- dirty tracking ----------------------------------------------------

    /// Whether a pack applies at the given step (all bundles in a pack
    /// share one step predicate)
    pub(crate) fn pack_in_valid_step(&self, pi: usize, t: i64) -> bool {
        self.packs[pi]
            .bundle_ids
            .first()
            .map(|&bi| self.bundles[bi].is_in_valid_step(t))
            .unwrap_or(false)
    }

    /// Slide valid-step windows and optionally mark output vars dirty for
    /// the steps written by the selected (or all) packs
    pub(crate) fn update_vars(
        &mut self,
        sel_pack: Option<usize>,
        start: i64,
        stop: i64,
        mark_dirty: bool,
    ) {
        let stride: i64 = if start > stop { -1 } else { 1 };
        let mut vars_done: HashMap<usize, HashSet<i64>> = HashMap::new();
        for pi in 0..self.packs.len() {
            if sel_pack.is_some() && sel_pack != Some(pi) {
                continue;
            }
            let mut t = start;
            while t != stop {
                for &bi in &self.packs[pi].bundle_ids {
                    let t_out = self.bundles[bi].output_step_index(t);
                    for out in self.bundles[bi].outputs.clone() {
                        // Scratch vars are never exchanged.
                        if let crate::kernels::VarRef::Id(id) = out {
                            let done = vars_done.entry(id).or_default();
                            if done.insert(t_out) {
                                let v = &mut self.vars[id];
                                v.update_valid_step(t_out);
                                if mark_dirty {
                                    v.set_dirty(true, t_out);
                                }
                            }
                        }
                    }
                }
                t += stride;
            }
        }
    }

    // --- stats and tuner ---------------------------------------------------

    /// Work and timing since the previous retrieval; retrieval resets
    pub fn get_stats(&mut self) -> Stats {
        let nddims = self.dims.num_domain_dims();
        let num_elements: i64 = (0..nddims)
            .map(|j| self.opts.rank_sizes.vals()[j + 1])
            .product();
        let stats = Stats {
            num_elements,
            num_steps_done: self.steps_done,
            num_writes_done: self.writes_done,
            est_fp_ops_done: self.fpops_done,
            elapsed_secs: self.run_time.elapsed_secs(),
        };
        self.steps_done = 0;
        self.writes_done = 0;
        self.fpops_done = 0;
        self.run_time.clear();
        for p in &self.packs {
            p.clear_steps();
            p.timer.clear();
        }
        stats
    }

    /// Restart (or disable) auto-tuning on every active tuner
    pub fn reset_auto_tuner(&mut self, enable: bool, verbose: bool) {
        self.opts.do_auto_tune = enable;
        if self.use_pack_tuners {
            for p in &mut self.packs {
                p.tuner.reset(enable, verbose);
            }
        } else {
            self.tuner
                .get_mut()
                .expect("tuner state")
                .reset(enable, verbose);
        }
    }

    /// Whether any tuner is still searching
    pub fn is_auto_tuner_enabled(&self) -> bool {
        if self.use_pack_tuners {
            self.packs.iter().any(|p| p.tuner.is_enabled())
        } else {
            self.tuner.lock().expect("tuner state").is_enabled()
        }
    }

    /// Judge tuner trials after a stride of steps
    pub(crate) fn eval_auto_tuner(&mut self) {
        let dims = self.dims.clone();
        let mut changed = false;
        if self.use_pack_tuners {
            for p in &mut self.packs {
                let mut opts = p.local_opts.clone();
                if p.tuner.eval(&mut opts, &dims) {
                    opts.adjust_settings(&dims);
                    p.local_opts = opts;
                    changed = true;
                }
            }
        } else {
            let mut opts = self.opts.clone();
            let did = self
                .tuner
                .get_mut()
                .expect("tuner state")
                .eval(&mut opts, &dims);
            if did {
                opts.adjust_settings(&dims);
                self.opts = opts;
                changed = true;
            }
        }
        if changed {
            self.update_tb_info();
        }
    }

    /// Run the solution in short bursts until the tuners converge
    pub fn run_auto_tuner_now(&mut self, verbose: bool) -> Result<()> {
        if !self.prepared {
            return Err(Error::Preparation(
                "run_auto_tuner_now() called without calling prepare_solution() first".to_string(),
            ));
        }
        self.reset_auto_tuner(true, verbose);
        let steps_per_trial = 2;
        let mut t = 0;
        let max_trials = 250;
        for _ in 0..max_trials {
            if !self.is_auto_tuner_enabled() {
                break;
            }
            self.run_solution(t, t + steps_per_trial - 1)?;
            t += steps_per_trial;
        }
        // A search that never converges only disables further tuning.
        self.reset_auto_tuner(false, verbose);
        Ok(())
    }
}
