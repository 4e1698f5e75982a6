//! User-tunable kernel settings
//!
//! One [`KernelSettings`] object holds every size knob of the tile
//! hierarchy plus the MPI, threading, tuning, and memory options. The
//! solution owns a global copy; each pack owns a local copy that its
//! auto-tuner may adjust independently.
//!
//! Size tuples span the "stencil dims": position 0 is the step dim, the
//! remaining positions are the domain dims in order. The step entry of the
//! region sizes is the wave-front depth; the step entry of the block sizes
//! is the temporal-blocking depth.

use data::dims::DimSet;
use data::error::{Error, Result};
use data::indices::Tuple;
use data::math;

/// Memory-key sentinel: prefer the local NUMA node
pub const NUMA_LOCAL: i32 = -1;
/// Memory-key sentinel: interleave across all NUMA nodes
pub const NUMA_INTERLEAVE: i32 = -2;
/// Memory-key sentinel: no NUMA policy
pub const NUMA_NONE: i32 = -9;
/// Memory key of the MPI shared-memory window
pub const SHM_KEY: i32 = 1000;
/// Base memory key of PMEM devices; device `i` is `PMEM_KEY + i`
pub const PMEM_KEY: i32 = 2000;

/// Position of the step dim in every stencil-dims tuple
pub const STEP_POSN: usize = 0;

/// Default block edge when the user leaves block sizes unset
const DEF_BLOCK: i64 = 32;

/// Names of the stencil dims: step first, then the domain dims
pub fn stencil_dim_names(dims: &DimSet) -> Vec<String> {
    let mut names = vec![dims.step_dim().to_string()];
    names.extend(dims.domain_dims().iter().cloned());
    names
}

/// A zeroed stencil-dims tuple
fn stencil_tuple(dims: &DimSet, val: i64) -> Tuple {
    Tuple::with_names(&stencil_dim_names(dims), val)
}

/// A zeroed domain-dims tuple
fn domain_tuple(dims: &DimSet, val: i64) -> Tuple {
    Tuple::with_names(dims.domain_dims(), val)
}

/// All user-tunable sizes and options of a solution
#[derive(Clone, Debug)]
pub struct KernelSettings {
    /// Overall problem sizes across all ranks
    pub global_sizes: Tuple,
    /// This rank's domain sizes
    pub rank_sizes: Tuple,
    /// Region sizes; the step entry is the wave-front depth
    pub region_sizes: Tuple,
    /// Block-group sizes (grouped region loops)
    pub block_group_sizes: Tuple,
    /// Block sizes; the step entry is the temporal-blocking depth
    pub block_sizes: Tuple,
    /// Mini-block-group sizes (grouped block loops)
    pub mini_block_group_sizes: Tuple,
    /// Mini-block sizes
    pub mini_block_sizes: Tuple,
    /// Sub-block-group sizes (grouped mini-block loops)
    pub sub_block_group_sizes: Tuple,
    /// Sub-block sizes
    pub sub_block_sizes: Tuple,
    /// Minimum total pads (including halos)
    pub min_pad_sizes: Tuple,
    /// Extra pads outside the halos
    pub extra_pad_sizes: Tuple,

    /// Rank-grid shape; zero entries are solved by the layout heuristic
    pub num_ranks: Tuple,
    /// This rank's coordinates in the rank grid
    pub rank_indices: Tuple,
    /// Whether rank coordinates still need to be derived from the rank index
    pub find_loc: bool,
    /// Rank that emits informational messages
    pub msg_rank: i64,
    /// Overlap interior computation with halo communication
    pub overlap_comms: bool,
    /// Use the shared-memory fast path between co-located ranks
    pub use_shm: bool,
    /// Minimum width of the MPI exterior slabs
    pub min_exterior: i64,

    /// Total threads to use; 0 picks the hardware default
    pub max_threads: usize,
    /// Divide the total thread count by this much
    pub thread_divisor: usize,
    /// Threads cooperating on one block
    pub num_block_threads: usize,
    /// Pin block threads to stable sub-block slabs
    pub bind_block_threads: bool,
    /// Stencil-dim position used for thread binding
    pub bind_posn: usize,

    /// Let step indices outside the valid window alias into it
    pub step_wrap: bool,

    /// Whether auto-tuning is active
    pub do_auto_tune: bool,
    /// Tune mini-block sizes instead of block sizes
    pub tune_mini_blks: bool,
    /// Allow one tuner per pack when the schedule permits
    pub allow_pack_tuners: bool,

    /// Evaluate sub-blocks with the scalar kernel only
    pub force_scalar: bool,
    /// Emit extra trace logging
    pub trace: bool,

    /// Default memory key for vars and buffers
    pub numa_pref: i32,
    /// GiB to place on the preferred key before spilling to PMEM
    pub numa_pref_max_gib: i64,
}
//
impl KernelSettings {
    /// Settings with every size unset and default options
    pub fn new(dims: &DimSet) -> Self {
        Self {
            global_sizes: stencil_tuple(dims, 0),
            rank_sizes: stencil_tuple(dims, 0),
            region_sizes: stencil_tuple(dims, 0),
            block_group_sizes: stencil_tuple(dims, 0),
            block_sizes: stencil_tuple(dims, 0),
            mini_block_group_sizes: stencil_tuple(dims, 0),
            mini_block_sizes: stencil_tuple(dims, 0),
            sub_block_group_sizes: stencil_tuple(dims, 0),
            sub_block_sizes: stencil_tuple(dims, 0),
            min_pad_sizes: stencil_tuple(dims, 0),
            extra_pad_sizes: stencil_tuple(dims, 0),
            num_ranks: domain_tuple(dims, 0),
            rank_indices: domain_tuple(dims, 0),
            find_loc: true,
            msg_rank: 0,
            overlap_comms: true,
            use_shm: false,
            min_exterior: 0,
            max_threads: 0,
            thread_divisor: 1,
            num_block_threads: 1,
            bind_block_threads: false,
            bind_posn: 1,
            step_wrap: false,
            do_auto_tune: false,
            tune_mini_blks: false,
            allow_pack_tuners: false,
            force_scalar: false,
            trace: false,
            numa_pref: NUMA_LOCAL,
            numa_pref_max_gib: 128,
        }
    }

    /// Wave-front depth requested through the region sizes
    pub fn wf_steps_requested(&self) -> i64 {
        self.region_sizes.vals()[STEP_POSN]
    }

    /// Temporal-blocking depth requested through the block sizes
    pub fn tb_steps_requested(&self) -> i64 {
        self.block_sizes.vals()[STEP_POSN]
    }

    /// Whether this rank is first in the given domain dim
    pub fn is_first_rank(&self, j: usize) -> bool {
        self.rank_indices.vals()[j] == 0
    }

    /// Whether this rank is last in the given domain dim
    pub fn is_last_rank(&self, j: usize) -> bool {
        self.rank_indices.vals()[j] == self.num_ranks.vals()[j] - 1
    }

    /// Round user-provided sizes up into a consistent hierarchy
    ///
    /// Called from `prepare_solution` and again whenever the auto-tuner
    /// adjusts a tile level. Every level defaults to (and is clamped to)
    /// the level above it; blocks and mini-blocks are rounded to whole
    /// vector clusters.
    pub fn adjust_settings(&mut self, dims: &DimSet) {
        let nddims = dims.num_domain_dims();
        for j in 0..nddims {
            let i = j + 1;
            let rank = self.rank_sizes.vals()[i];
            let cluster = dims.cluster_pts(j);

            // Region defaults to the whole rank.
            let mut region = self.region_sizes.vals()[i];
            if region == 0 || region > rank {
                region = rank;
            }

            // Block defaults to a modest edge, rounded to clusters.
            let mut block = self.block_sizes.vals()[i];
            if block == 0 {
                block = DEF_BLOCK.min(region.max(1));
            }
            block = math::round_up(block, cluster).clamp(cluster, math::round_up(region.max(cluster), cluster));

            // Mini-block defaults to the block.
            let mut mini = self.mini_block_sizes.vals()[i];
            if mini == 0 || mini > block {
                mini = block;
            }
            mini = math::round_up(mini, cluster);

            // Sub-block defaults to the mini-block.
            let mut sub = self.sub_block_sizes.vals()[i];
            if sub == 0 || sub > mini {
                sub = mini;
            }

            let name = self.region_sizes.names()[i].clone();
            self.region_sizes.set(&name, region).unwrap();
            self.block_sizes.set(&name, block).unwrap();
            self.mini_block_sizes.set(&name, mini).unwrap();
            self.sub_block_sizes.set(&name, sub).unwrap();

            // Group sizes default to one tile of the level below.
            for (group, tile) in [
                (&mut self.block_group_sizes, &self.block_sizes),
                (&mut self.mini_block_group_sizes, &self.mini_block_sizes),
                (&mut self.sub_block_group_sizes, &self.sub_block_sizes),
            ] {
                if group.vals()[i] == 0 {
                    let v = tile.vals()[i];
                    group.set(&name, v).unwrap();
                }
            }
        }

        // Temporal depths: non-negative, and a temporal-blocking request
        // rounds the wave-front depth up to cover it. The mini-block
        // temporal depth always equals the block's; sub-blocks never tile
        // in time.
        let step = self.region_sizes.names()[STEP_POSN].clone();
        let tb = self.block_sizes.vals()[STEP_POSN].max(0);
        let wf = self.region_sizes.vals()[STEP_POSN].max(0).max(tb);
        self.region_sizes.set(&step, wf).unwrap();
        self.block_sizes.set(&step, tb).unwrap();
        self.mini_block_sizes.set(&step, tb).unwrap();
        self.sub_block_sizes.set(&step, 1).unwrap();
    }
}

/// Outcome of applying one command-line token sequence
struct OptionTable<'s> {
    settings: &'s mut KernelSettings,
    dims: DimSet,
}
//
impl<'s> OptionTable<'s> {
    /// Try to apply a per-dim size option like `-b 64` or `-bx 64`
    ///
    /// Returns how many tokens were consumed (0 = not ours).
    fn try_domain_option(&mut self, args: &[String]) -> Result<usize> {
        let opt = &args[0];
        let Some(body) = opt.strip_prefix('-') else {
            return Ok(0);
        };

        // Longest prefix first so `-mb*` is not read as `-m` + junk.
        const PREFIXES: &[(&str, bool)] = &[
            ("mbg", false),
            ("sbg", false),
            ("bg", false),
            ("mb", false),
            ("sb", false),
            ("mp", false),
            ("ep", false),
            ("nr", false),
            ("ri", false),
            ("g", false),
            ("l", false),
            ("r", true),
            ("b", true),
        ];
        for &(prefix, allow_step) in PREFIXES {
            let Some(rest) = body.strip_prefix(prefix) else {
                continue;
            };
            // `-b` (all domain dims) or `-bx` (one dim); anything else
            // belongs to another option.
            let dim_names: Vec<String> = if rest.is_empty() {
                self.dims.domain_dims().to_vec()
            } else if self.dims.domain_posn(rest).is_some() {
                vec![rest.to_string()]
            } else if allow_step && rest == self.dims.step_dim() {
                vec![rest.to_string()]
            } else {
                continue;
            };
            let val = parse_value(args, opt)?;
            let tgt = match prefix {
                "g" => &mut self.settings.global_sizes,
                "l" => &mut self.settings.rank_sizes,
                "r" => &mut self.settings.region_sizes,
                "bg" => &mut self.settings.block_group_sizes,
                "b" => &mut self.settings.block_sizes,
                "mbg" => &mut self.settings.mini_block_group_sizes,
                "mb" => &mut self.settings.mini_block_sizes,
                "sbg" => &mut self.settings.sub_block_group_sizes,
                "sb" => &mut self.settings.sub_block_sizes,
                "mp" => &mut self.settings.min_pad_sizes,
                "ep" => &mut self.settings.extra_pad_sizes,
                "nr" => &mut self.settings.num_ranks,
                "ri" => &mut self.settings.rank_indices,
                _ => unreachable!(),
            };
            for dname in &dim_names {
                tgt.set(dname, val).map_err(|_| {
                    Error::Config(format!(
                        "option '{opt}': dimension '{dname}' is not valid for this option"
                    ))
                })?;
            }
            if prefix == "ri" {
                self.settings.find_loc = false;
            }
            return Ok(2);
        }
        Ok(0)
    }

    /// Try to apply a boolean flag like `-use_shm` / `-no-use_shm`
    fn try_bool_option(&mut self, opt: &str) -> bool {
        let Some(body) = opt.strip_prefix('-') else {
            return false;
        };
        let (name, val) = match body.strip_prefix("no-") {
            Some(rest) => (rest, false),
            None => (body, true),
        };
        let slot: &mut bool = match name {
            "overlap_comms" => &mut self.settings.overlap_comms,
            "use_shm" => &mut self.settings.use_shm,
            "bind_block_threads" => &mut self.settings.bind_block_threads,
            "step_wrap" => &mut self.settings.step_wrap,
            "auto_tune" => &mut self.settings.do_auto_tune,
            "tune_mini_blks" => &mut self.settings.tune_mini_blks,
            "allow_pack_tuners" => &mut self.settings.allow_pack_tuners,
            "force_scalar" => &mut self.settings.force_scalar,
            "trace" => &mut self.settings.trace,
            "find_loc" => &mut self.settings.find_loc,
            _ => return false,
        };
        *slot = val;
        true
    }

    /// Try to apply an integer option like `-max_threads 8`
    fn try_int_option(&mut self, args: &[String]) -> Result<usize> {
        let opt = args[0].as_str();
        macro_rules! set {
            ($slot:expr, $conv:ty) => {{
                let val = parse_value(args, opt)?;
                $slot = val as $conv;
                return Ok(2);
            }};
        }
        match opt {
            "-max_threads" => set!(self.settings.max_threads, usize),
            "-thread_divisor" => set!(self.settings.thread_divisor, usize),
            "-block_threads" => set!(self.settings.num_block_threads, usize),
            "-bind_posn" => set!(self.settings.bind_posn, usize),
            "-numa_pref" => set!(self.settings.numa_pref, i32),
            "-numa_pref_max" => set!(self.settings.numa_pref_max_gib, i64),
            "-min_exterior" => set!(self.settings.min_exterior, i64),
            "-msg_rank" => set!(self.settings.msg_rank, i64),
            _ => Ok(0),
        }
    }
}

/// Parse the value token following an option
fn parse_value(args: &[String], opt: &str) -> Result<i64> {
    let tok = args
        .get(1)
        .ok_or_else(|| Error::Config(format!("option '{opt}': missing value")))?;
    tok.parse::<i64>()
        .map_err(|_| Error::Config(format!("option '{opt}': invalid value '{tok}'")))
}
//
impl KernelSettings {
    /// Apply command-line tokens, returning the unrecognized residue
    /// verbatim and in order
    pub fn apply_command_line_options(
        &mut self,
        dims: &DimSet,
        args: &[String],
    ) -> Result<Vec<String>> {
        let mut residue = Vec::new();
        let mut table = OptionTable {
            settings: self,
            dims: dims.clone(),
        };
        let mut i = 0;
        while i < args.len() {
            let rest = &args[i..];
            let used = table.try_domain_option(rest)?;
            if used > 0 {
                i += used;
                continue;
            }
            let used = table.try_int_option(rest)?;
            if used > 0 {
                i += used;
                continue;
            }
            if table.try_bool_option(&args[i]) {
                i += 1;
                continue;
            }
            residue.push(args[i].clone());
            i += 1;
        }
        Ok(residue)
    }

    /// Like [`KernelSettings::apply_command_line_options`] but splitting one
    /// string on whitespace first
    pub fn apply_command_line_string(&mut self, dims: &DimSet, line: &str) -> Result<Vec<String>> {
        let args: Vec<String> = line.split_whitespace().map(|s| s.to_string()).collect();
        self.apply_command_line_options(dims, &args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims() -> DimSet {
        DimSet::with_layout("t", &["x", "y", "z"], &[], &[1, 1, 4], &[1, 1, 1]).unwrap()
    }

    fn strs(toks: &[&str]) -> Vec<String> {
        toks.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn per_dim_options_set_one_or_all_dims() {
        let d = dims();
        let mut s = KernelSettings::new(&d);
        let residue = s
            .apply_command_line_options(&d, &strs(&["-b", "48", "-bz", "16", "-rt", "4"]))
            .unwrap();
        assert!(residue.is_empty());
        assert_eq!(s.block_sizes.get("x"), Some(48));
        assert_eq!(s.block_sizes.get("y"), Some(48));
        assert_eq!(s.block_sizes.get("z"), Some(16));
        assert_eq!(s.region_sizes.get("t"), Some(4));
    }

    #[test]
    fn unknown_tokens_are_returned_verbatim() {
        let d = dims();
        let mut s = KernelSettings::new(&d);
        let residue = s
            .apply_command_line_string(&d, "-b 32 --mystery 9 -use_shm stray")
            .unwrap();
        assert_eq!(residue, strs(&["--mystery", "9", "stray"]));
        assert!(s.use_shm);
    }

    #[test]
    fn no_prefix_clears_flags() {
        let d = dims();
        let mut s = KernelSettings::new(&d);
        assert!(s.overlap_comms);
        s.apply_command_line_string(&d, "-no-overlap_comms").unwrap();
        assert!(!s.overlap_comms);
    }

    #[test]
    fn bad_value_is_a_config_error() {
        let d = dims();
        let mut s = KernelSettings::new(&d);
        let err = s.apply_command_line_string(&d, "-b lots").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn adjust_cascades_and_rounds_to_clusters() {
        let d = dims();
        let mut s = KernelSettings::new(&d);
        s.rank_sizes.set("x", 100).unwrap();
        s.rank_sizes.set("y", 100).unwrap();
        s.rank_sizes.set("z", 100).unwrap();
        s.block_sizes.set("z", 30).unwrap();
        s.adjust_settings(&d);
        assert_eq!(s.region_sizes.get("x"), Some(100));
        // z blocks rounded up to the fold of 4.
        assert_eq!(s.block_sizes.get("z"), Some(32));
        assert_eq!(s.mini_block_sizes.get("z"), Some(32));
        assert_eq!(s.sub_block_sizes.get("z"), Some(32));
        // Sub-blocks never tile in time.
        assert_eq!(s.sub_block_sizes.get("t"), Some(1));
    }
}
