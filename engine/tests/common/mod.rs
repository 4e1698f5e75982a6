//! Shared test fixtures: a seven-point Laplacian solution
#![allow(dead_code)]

use data::dims::DimSet;
use data::Precision;
use engine::expr::PredExpr;
use engine::kernels::{KernelTable, ScalarFn, VarRef};
use engine::solution::{BundleSpec, PackSpec, SolutionSpec, VarSpec};
use std::sync::Arc;

/// Var id of `u` in the Laplacian spec (first declared var)
pub const U: VarRef = VarRef::Id(0);

/// Weight of the center point
pub const C0: Precision = 0.4;
/// Weight of each of the six neighbors
pub const C1: Precision = 0.1;

/// The scalar seven-point Laplacian kernel: writes step t+1 from step t
pub fn laplacian_kernel() -> ScalarFn {
    Arc::new(|ctx, idxs| {
        let (t, x, y, z) = (idxs[0], idxs[1], idxs[2], idxs[3]);
        let c = ctx.read(U, &[t, x, y, z]);
        let s = ctx.read(U, &[t, x - 1, y, z])
            + ctx.read(U, &[t, x + 1, y, z])
            + ctx.read(U, &[t, x, y - 1, z])
            + ctx.read(U, &[t, x, y + 1, z])
            + ctx.read(U, &[t, x, y, z - 1])
            + ctx.read(U, &[t, x, y, z + 1]);
        ctx.write(U, &[t + 1, x, y, z], C0 * c + C1 * s);
    })
}

/// A 3-D Laplacian solution over one var `u` with halo 1 and two step slots
///
/// The folds of `y` and `z` are adjustable so tests can exercise the
/// unit-fold, cluster, and masked-vector paths. A fold in `z` (the inner
/// dim) drives the cluster loop and the scalar fringe; a fold in `y` drives
/// the peel/remainder masks.
pub fn laplacian_spec(name: &str, fold_y: i64, fold_z: i64) -> SolutionSpec {
    let dims = DimSet::with_layout("t", &["x", "y", "z"], &[], &[1, fold_y, fold_z], &[1, 1, 1])
        .expect("valid dims");
    let kernels = KernelTable::from_scalar(&dims, laplacian_kernel());
    SolutionSpec {
        name: name.to_string(),
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
            .over(PredExpr::All)
            .with_kernels(kernels)
            .with_work(8, 7, 1)],
        packs: vec![PackSpec::new("main", &["laplacian"])],
    }
}

/// Fill `u` with `background` and put `spike` at the center of the global
/// domain (a no-op on ranks that do not own the center)
pub fn seed_u(
    soln: &mut engine::StencilContext,
    size: i64,
    background: Precision,
    spike: Precision,
) {
    let u = soln.get_var_mut("u").expect("var u");
    u.set_all_elements_same(background).expect("fill");
    let c = size / 2;
    u.set_element(spike, &[0, c, c, c], false).expect("seed");
}

/// Read the rank-domain values of `u` at one step, row-major
pub fn domain_snapshot(soln: &engine::StencilContext, t: i64) -> Vec<Precision> {
    let u = soln.get_var("u").expect("var u");
    let (x, y, z) = (
        u.dim_posn("x").unwrap(),
        u.dim_posn("y").unwrap(),
        u.dim_posn("z").unwrap(),
    );
    let first = [
        t,
        u.first_rank_domain_index(x),
        u.first_rank_domain_index(y),
        u.first_rank_domain_index(z),
    ];
    let last = [
        t,
        u.last_rank_domain_index(x),
        u.last_rank_domain_index(y),
        u.last_rank_domain_index(z),
    ];
    let n = data::var::Var::slice_len(&first, &last);
    let mut out = vec![0.0; n];
    u.get_elements_in_slice(&mut out, &first, &last)
        .expect("snapshot");
    out
}
