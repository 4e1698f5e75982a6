//! Whole-step throughput of the tiled scheduler

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use data::dims::DimSet;
use engine::kernels::{KernelTable, ScalarFn, VarRef};
use engine::solution::{BundleSpec, PackSpec, SolutionSpec, VarSpec};
use engine::{new_solution, KernelEnv};
use std::sync::Arc;

const U: VarRef = VarRef::Id(0);

fn laplacian_kernel() -> ScalarFn {
    Arc::new(|ctx, idxs| {
        let (t, x, y, z) = (idxs[0], idxs[1], idxs[2], idxs[3]);
        let c = ctx.read(U, &[t, x, y, z]);
        let s = ctx.read(U, &[t, x - 1, y, z])
            + ctx.read(U, &[t, x + 1, y, z])
            + ctx.read(U, &[t, x, y - 1, z])
            + ctx.read(U, &[t, x, y + 1, z])
            + ctx.read(U, &[t, x, y, z - 1])
            + ctx.read(U, &[t, x, y, z + 1]);
        ctx.write(U, &[t + 1, x, y, z], 0.4 * c + 0.1 * s);
    })
}

fn spec() -> SolutionSpec {
    let dims =
        DimSet::with_layout("t", &["x", "y", "z"], &[], &[1, 1, 4], &[1, 1, 1]).unwrap();
    let kernels = KernelTable::from_scalar(&dims, laplacian_kernel());
    SolutionSpec {
        name: "bench".to_string(),
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

fn step_throughput(c: &mut Criterion) {
    let _ = env_logger::try_init();
    let mut group = c.benchmark_group("laplacian_step");
    for size in [32i64, 64] {
        let env = KernelEnv::new();
        let mut soln = new_solution(&env, &spec()).expect("solution builds");
        for d in ["x", "y", "z"] {
            soln.set_rank_domain_size(d, size).unwrap();
        }
        soln.prepare_solution().expect("prepare");
        soln.get_var_mut("u")
            .unwrap()
            .set_all_elements_same(0.5)
            .unwrap();

        group.throughput(Throughput::Elements((size * size * size) as u64));
        let mut t = 0i64;
        group.bench_function(BenchmarkId::from_parameter(format!("{size}^3")), |b| {
            b.iter(|| {
                soln.run_solution_once(t).expect("step");
                t += 1;
            });
        });
    }
    group.finish();
}

criterion_group!(benches, step_throughput);
criterion_main!(benches);
