//! Scratch-var pipelines
//!
//! A scratch bundle computes an intermediate into thread-private storage
//! (including the halo the consumer reads), then the main bundle consumes
//! it. The tiled schedule must match the reference scalar path bit for
//! bit, across mini-block relocations of the scratch storage.

use data::dims::DimSet;
use engine::kernels::{KernelTable, VarRef};
use engine::solution::{BundleSpec, PackSpec, SolutionSpec, VarSpec};
use engine::{new_solution, KernelEnv};
use std::sync::Arc;

const U: VarRef = VarRef::Id(0);
const S: VarRef = VarRef::Scratch(0);

const SIZE: i64 = 24;
const STEPS: i64 = 5;

/// Two-stage smoother: `s = u_left + u_right`, then
/// `u' = 0.5 u + 0.25 (s_below + s_above)`
fn two_stage_spec(name: &str) -> SolutionSpec {
    let dims = DimSet::new("t", &["x", "y"], &[]).expect("valid dims");

    let pre = KernelTable::from_scalar(
        &dims,
        Arc::new(|ctx, idxs| {
            let (t, x, y) = (idxs[0], idxs[1], idxs[2]);
            let v = ctx.read(U, &[t, x - 1, y]) + ctx.read(U, &[t, x + 1, y]);
            ctx.write(S, &[x, y], v);
        }),
    );
    let main = KernelTable::from_scalar(
        &dims,
        Arc::new(|ctx, idxs| {
            let (t, x, y) = (idxs[0], idxs[1], idxs[2]);
            let c = ctx.read(U, &[t, x, y]);
            let s = ctx.read(S, &[x, y - 1]) + ctx.read(S, &[x, y + 1]);
            ctx.write(U, &[t + 1, x, y], 0.5 * c + 0.25 * s);
        }),
    );

    SolutionSpec {
        name: name.to_string(),
        target: "generic".to_string(),
        dims,
        vars: vec![VarSpec::new("u", &["t", "x", "y"])
            .with_halo("x", 1, 1)
            .with_halo("y", 1, 1)
            .with_step_alloc(2)
            .with_l1_norm(1)],
        // The consumer reads s one point up and down, so the scratch var
        // carries a y halo that each mini-block evaluation must fill.
        scratch_vars: vec![VarSpec::new("s", &["x", "y"]).with_halo("y", 1, 1)],
        bundles: vec![
            BundleSpec::new("pre")
                .reads(&["u"])
                .writes(&["s"])
                .scratch()
                .with_kernels(pre)
                .with_work(1, 2, 1),
            BundleSpec::new("main")
                .reads(&["u", "s"])
                .writes(&["u"])
                .needs_scratch(&["pre"])
                .with_kernels(main)
                .with_work(4, 3, 1),
        ],
        packs: vec![PackSpec::new("main", &["main"])],
    }
}

fn make(options: &str) -> engine::StencilContext {
    let env = KernelEnv::new();
    let spec = two_stage_spec("two_stage");
    let mut soln = new_solution(&env, &spec).expect("solution builds");
    for d in ["x", "y"] {
        soln.set_rank_domain_size(d, SIZE).expect("size");
    }
    let residue = soln.apply_command_line_string(options).expect("options");
    assert!(residue.is_empty());
    soln.prepare_solution().expect("prepare");

    let u = soln.get_var_mut("u").expect("var u");
    u.set_all_elements_same(0.25).expect("fill");
    u.set_element(3.0, &[0, SIZE / 2, SIZE / 2], false)
        .expect("seed");
    soln
}

fn snapshot(soln: &engine::StencilContext, t: i64) -> Vec<f64> {
    let u = soln.get_var("u").expect("var u");
    let (x, y) = (u.dim_posn("x").unwrap(), u.dim_posn("y").unwrap());
    let first = [t, u.first_rank_domain_index(x), u.first_rank_domain_index(y)];
    let last = [t, u.last_rank_domain_index(x), u.last_rank_domain_index(y)];
    let mut out = vec![0.0; data::var::Var::slice_len(&first, &last)];
    u.get_elements_in_slice(&mut out, &first, &last)
        .expect("snapshot");
    out
}

#[test]
fn scratch_pipeline_matches_reference() {
    let mut oracle = make("");
    oracle.run_ref(0, STEPS - 1).expect("reference run");
    let expected = snapshot(&oracle, STEPS);

    // Small mini-blocks force the scratch storage to relocate many times
    // per step.
    let mut soln = make("-b 8 -mb 4");
    soln.run_solution(0, STEPS - 1).expect("run");
    assert_eq!(snapshot(&soln, STEPS), expected);
}

#[test]
fn scratch_storage_is_per_thread_and_transient() {
    let soln = make("-b 8");
    // One scratch instance per region thread was allocated, none of them
    // reachable (or exchangeable) as solution vars.
    assert!(soln.get_var("s").is_none());
    assert!(soln.get_var("u").is_some());
}
