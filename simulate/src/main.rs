//! Run a seven-point Laplacian diffusion on the gridwave engine
//!
//! Plays the role the stencil compiler would: it assembles a
//! `SolutionSpec` with hand-written kernels, then drives the engine with
//! user-selected sizes and tile options.

use clap::Parser;
use data::dims::DimSet;
use data::Precision;
use engine::kernels::{KernelTable, ScalarFn, VarRef};
use engine::solution::{BundleSpec, PackSpec, SolutionSpec, VarSpec};
use engine::{new_solution, KernelEnv};
use indicatif::{ProgressBar, ProgressFinish, ProgressStyle};
use std::sync::Arc;
use std::time::Duration;

/// Var id of `u` (the only var in this solution)
const U: VarRef = VarRef::Id(0);

/// Perform a Laplacian diffusion simulation
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Cubic domain edge length
    #[arg(short, long, default_value_t = 128)]
    size: i64,

    /// Number of time steps to perform
    #[arg(short = 'n', long, default_value_t = 100)]
    steps: i64,

    /// Weight of the center point in the stencil
    #[arg(long, default_value_t = 0.4)]
    center_weight: Precision,

    /// Weight of each neighbor point in the stencil
    #[arg(long, default_value_t = 0.1)]
    neighbor_weight: Precision,

    /// Engine tile/threading options, passed through verbatim
    /// (e.g. "-b 64 -rt 4 -block_threads 2")
    #[arg(short = 'o', long, default_value = "")]
    engine_options: String,
}

fn laplacian_kernel(c0: Precision, c1: Precision) -> ScalarFn {
    Arc::new(move |ctx, idxs| {
        let (t, x, y, z) = (idxs[0], idxs[1], idxs[2], idxs[3]);
        let c = ctx.read(U, &[t, x, y, z]);
        let s = ctx.read(U, &[t, x - 1, y, z])
            + ctx.read(U, &[t, x + 1, y, z])
            + ctx.read(U, &[t, x, y - 1, z])
            + ctx.read(U, &[t, x, y + 1, z])
            + ctx.read(U, &[t, x, y, z - 1])
            + ctx.read(U, &[t, x, y, z + 1]);
        ctx.write(U, &[t + 1, x, y, z], c0 * c + c1 * s);
    })
}

fn build_spec(args: &Args) -> SolutionSpec {
    let dims = DimSet::with_layout("t", &["x", "y", "z"], &[], &[1, 1, 4], &[1, 1, 1])
        .expect("valid dimension set");
    let kernels = KernelTable::from_scalar(
        &dims,
        laplacian_kernel(args.center_weight, args.neighbor_weight),
    );
    SolutionSpec {
        name: "diffusion".to_string(),
        target: "generic".to_string(),
        dims,
        vars: vec![VarSpec::new("u", &["t", "x", "y", "z"])
            .with_halo("x", 1, 1)
            .with_halo("y", 1, 1)
            .with_halo("z", 1, 1)
            .with_step_alloc(2)
            .with_l1_norm(1)],
        scratch_vars: Vec::new(),
        bundles: vec![BundleSpec::new("laplacian")
            .reads(&["u"])
            .writes(&["u"])
            .with_kernels(kernels)
            .with_work(8, 7, 1)],
        packs: vec![PackSpec::new("main", &["laplacian"])],
    }
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    // Set up the solution.
    let env = KernelEnv::new();
    let spec = build_spec(&args);
    let mut soln = new_solution(&env, &spec).expect("Failed to create solution");
    for d in ["x", "y", "z"] {
        soln.set_rank_domain_size(d, args.size)
            .expect("Failed to set domain size");
    }
    let residue = soln
        .apply_command_line_string(&args.engine_options)
        .expect("Failed to parse engine options");
    if !residue.is_empty() {
        log::warn!("unrecognized engine options: {residue:?}");
    }
    soln.prepare_solution().expect("Failed to prepare solution");

    // A hot center in a cold domain.
    let u = soln.get_var_mut("u").expect("var u exists");
    u.set_all_elements_same(0.0)
        .expect("Failed to initialize grid");
    let c = args.size / 2;
    u.set_element(1000.0, &[0, c, c, c], false)
        .expect("Failed to seed grid");

    // Set up progress reporting.
    let progress = ProgressBar::new(args.steps as u64)
        .with_message("Stepping")
        .with_style(
            ProgressStyle::with_template("{msg} {pos}/{len} {wide_bar} {elapsed}/~{duration}")
                .expect("Failed to parse style"),
        )
        .with_finish(ProgressFinish::AndClear);
    progress.enable_steady_tick(Duration::from_millis(100));

    // Run in modest windows so the bar stays live.
    let window = 10.min(args.steps.max(1));
    let mut t = 0;
    while t < args.steps {
        let last = (t + window - 1).min(args.steps - 1);
        soln.run_solution(t, last).expect("Failed to run solution");
        progress.inc((last - t + 1) as u64);
        t = last + 1;
    }

    let stats = soln.get_stats();
    let center = soln
        .get_var("u")
        .expect("var u exists")
        .get_element(&[args.steps, c, c, c])
        .expect("Failed to read result");
    println!(
        "{} steps over {}^3 points in {:.3}s ({:.1}M writes/s); center = {center:.6}",
        stats.num_steps_done,
        args.size,
        stats.elapsed_secs,
        stats.writes_per_sec() / 1e6,
    );
}
