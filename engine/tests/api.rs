//! Public-API behavior: element access, slices, fusion, bounding-box
//! decomposition, option parsing, and error surfaces

mod common;

use common::laplacian_spec;
use data::error::Error;
use engine::expr::{LinearForm, PredExpr};
use engine::kernels::KernelTable;
use engine::solution::{BundleSpec, PackSpec, SolutionSpec, VarSpec};
use engine::{new_solution, new_solution_from, KernelEnv};
use std::sync::Arc;

fn prepared_laplacian() -> engine::StencilContext {
    let env = KernelEnv::new();
    let spec = laplacian_spec("api_test", 1, 1);
    let mut soln = new_solution(&env, &spec).expect("solution builds");
    for d in ["x", "y", "z"] {
        soln.set_rank_domain_size(d, 16).expect("size set");
    }
    soln.prepare_solution().expect("prepare");
    soln
}

#[test]
fn strict_access_one_past_alloc_fails() {
    let mut soln = prepared_laplacian();
    let u = soln.get_var_mut("u").expect("var u");
    let x = u.dim_posn("x").unwrap();
    let past = u.last_rank_alloc_index(x) + 1;

    let err = u.set_element(2.0, &[0, past, 0, 0], true).unwrap_err();
    assert!(matches!(err, Error::IndexOutOfRange(_)));
    // Permissive mode writes nothing and reports zero elements.
    assert_eq!(u.set_element(2.0, &[0, past, 0, 0], false).unwrap(), 0);

    // Exactly on the allocation boundaries succeeds.
    let first = u.first_rank_alloc_index(x);
    let last = u.last_rank_alloc_index(x);
    assert_eq!(u.set_element(1.0, &[0, first, 0, 0], true).unwrap(), 1);
    assert_eq!(u.set_element(1.0, &[0, last, 0, 0], true).unwrap(), 1);
}

#[test]
fn fixed_size_var_slice_reads_back() {
    // A fixed-size var of dims {t, x, y, m} sized {2, 5, 5, 3}: fill with
    // 1.0 and read the last m plane as a row-major slice.
    let env = KernelEnv::new();
    let dims = data::dims::DimSet::new("t", &["x", "y"], &["m"]).unwrap();
    let kernels = KernelTable::from_scalar(&dims, Arc::new(|_, _| {}));
    let spec = SolutionSpec {
        name: "fixed".to_string(),
        target: "generic".to_string(),
        dims,
        vars: vec![VarSpec::new("a", &["t", "x", "y"]).with_step_alloc(2)],
        scratch_vars: Vec::new(),
        bundles: vec![BundleSpec::new("noop")
            .reads(&["a"])
            .writes(&["a"])
            .with_kernels(kernels)],
        packs: vec![PackSpec::new("main", &["noop"])],
    };
    let mut soln = new_solution(&env, &spec).expect("solution builds");
    for d in ["x", "y"] {
        soln.set_rank_domain_size(d, 16).unwrap();
    }
    soln.new_fixed_size_var("p", &["t", "x", "y", "m"], &[2, 5, 5, 3])
        .expect("fixed-size var");
    soln.prepare_solution().expect("prepare");

    let p = soln.get_var_mut("p").expect("var p");
    p.set_all_elements_same(1.0).unwrap();
    let mut out = vec![0.0; 25];
    let n = p
        .get_elements_in_slice(&mut out, &[0, 0, 0, 2], &[0, 4, 4, 2])
        .unwrap();
    assert_eq!(n, 25);
    assert!(out.iter().all(|&v| v == 1.0));
}

#[test]
fn slice_round_trip_through_solution_vars() {
    let mut soln = prepared_laplacian();
    let u = soln.get_var_mut("u").expect("var u");
    let buf: Vec<f64> = (0..4 * 4 * 4).map(|i| i as f64 * 0.25).collect();
    let first = [0, 2, 2, 2];
    let last = [0, 5, 5, 5];
    assert_eq!(u.set_elements_in_slice(&buf, &first, &last).unwrap(), 64);
    let mut out = vec![0.0; 64];
    assert_eq!(u.get_elements_in_slice(&mut out, &first, &last).unwrap(), 64);
    assert_eq!(out, buf);
}

#[test]
fn fused_var_reads_the_source_values() {
    let env = KernelEnv::new();
    let spec = laplacian_spec("fuse_test", 1, 1);
    let mut soln = new_solution(&env, &spec).expect("solution builds");
    for d in ["x", "y", "z"] {
        soln.set_rank_domain_size(d, 8).unwrap();
    }
    soln.new_var("alias", &["t", "x", "y", "z"]).expect("var");
    soln.prepare_solution().expect("prepare");

    soln.get_var_mut("u")
        .unwrap()
        .set_element(6.5, &[0, 3, 3, 3], true)
        .unwrap();
    soln.fuse_vars("alias", "u").expect("fuse");
    let alias = soln.get_var("alias").unwrap();
    assert_eq!(alias.get_element(&[0, 3, 3, 3]).unwrap(), 6.5);
}

#[test]
fn step_wrap_aliases_by_step_alloc() {
    let env = KernelEnv::new();
    let spec = laplacian_spec("wrap_test", 1, 1);
    let mut soln = new_solution(&env, &spec).expect("solution builds");
    for d in ["x", "y", "z"] {
        soln.set_rank_domain_size(d, 8).unwrap();
    }
    soln.set_step_wrap(true);
    soln.prepare_solution().expect("prepare");

    let u = soln.get_var_mut("u").unwrap();
    u.set_element(1.25, &[1, 4, 4, 4], true).unwrap();
    // Step alloc is 2: t and t + 2 address the same slot.
    assert_eq!(u.get_element(&[3, 4, 4, 4]).unwrap(), 1.25);
}

#[test]
fn checkerboard_bundle_covers_exactly_half_the_region() {
    // Sub-domain predicate "x + y even" on a 16x16 region.
    let env = KernelEnv::new();
    let dims = data::dims::DimSet::new("t", &["x", "y"], &[]).unwrap();
    let kernels = KernelTable::from_scalar(&dims, Arc::new(|_, _| {}));
    let spec = SolutionSpec {
        name: "checkerboard".to_string(),
        target: "generic".to_string(),
        dims,
        vars: vec![VarSpec::new("a", &["t", "x", "y"]).with_step_alloc(2)],
        scratch_vars: Vec::new(),
        bundles: vec![BundleSpec::new("even_sites")
            .reads(&["a"])
            .writes(&["a"])
            .over(PredExpr::ModEq {
                form: LinearForm::sum(2),
                modulus: 2,
                remainder: 0,
            })
            .with_kernels(kernels)
            .with_work(1, 1, 1)],
        packs: vec![PackSpec::new("main", &["even_sites"])],
    };
    let mut soln = new_solution(&env, &spec).expect("solution builds");
    for d in ["x", "y"] {
        soln.set_rank_domain_size(d, 16).unwrap();
    }
    soln.prepare_solution().expect("prepare");

    // The box list tiles exactly the 128 valid points.
    let b = &soln.get_bundles()[0];
    assert!(!b.bb_list.is_empty());
    let total: i64 = b.bb_list.iter().map(|bb| bb.size).sum();
    assert_eq!(total, 128);
    assert_eq!(b.bb.num_points, 128);
}

#[test]
fn run_before_prepare_is_a_preparation_error() {
    let env = KernelEnv::new();
    let spec = laplacian_spec("unprepared", 1, 1);
    let mut soln = new_solution(&env, &spec).expect("solution builds");
    for d in ["x", "y", "z"] {
        soln.set_rank_domain_size(d, 8).unwrap();
    }
    let err = soln.run_solution(0, 1).unwrap_err();
    assert!(matches!(err, Error::Preparation(_)));
}

#[test]
fn var_creation_after_prepare_is_rejected() {
    let mut soln = prepared_laplacian();
    let err = soln.new_var("late", &["t", "x"]).unwrap_err();
    assert!(matches!(err, Error::Preparation(_)));
}

#[test]
fn missing_sizes_are_a_config_error() {
    let env = KernelEnv::new();
    let spec = laplacian_spec("sizeless", 1, 1);
    let mut soln = new_solution(&env, &spec).expect("solution builds");
    let err = soln.prepare_solution().unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[test]
fn settings_copy_into_a_new_solution() {
    let env = KernelEnv::new();
    let spec = laplacian_spec("copy_src", 1, 1);
    let mut first = new_solution(&env, &spec).expect("solution builds");
    first.set_rank_domain_size("x", 48).unwrap();
    first.set_block_size("x", 24).unwrap();

    let second = new_solution_from(&env, &spec, &first).expect("copied solution");
    assert_eq!(second.get_rank_domain_size("x").unwrap(), 48);
    assert_eq!(second.get_settings().block_sizes.get("x"), Some(24));
}

#[test]
fn misc_dim_rejected_in_domain_size_setter() {
    let env = KernelEnv::new();
    let dims = data::dims::DimSet::new("t", &["x"], &["m"]).unwrap();
    let kernels = KernelTable::from_scalar(&dims, Arc::new(|_, _| {}));
    let spec = SolutionSpec {
        name: "misc".to_string(),
        target: "generic".to_string(),
        dims,
        vars: vec![VarSpec::new("a", &["t", "x"]).with_step_alloc(2)],
        scratch_vars: Vec::new(),
        bundles: vec![BundleSpec::new("noop")
            .reads(&["a"])
            .writes(&["a"])
            .with_kernels(kernels)],
        packs: vec![PackSpec::new("main", &["noop"])],
    };
    let mut soln = new_solution(&env, &spec).expect("solution builds");
    let err = soln.set_rank_domain_size("m", 8).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
    let err = soln.set_rank_domain_size("nope", 8).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[test]
fn hooks_fire_around_prepare_and_run() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    let counter = Arc::new(AtomicUsize::new(0));

    let env = KernelEnv::new();
    let spec = laplacian_spec("hooks", 1, 1);
    let mut soln = new_solution(&env, &spec).expect("solution builds");
    for d in ["x", "y", "z"] {
        soln.set_rank_domain_size(d, 8).unwrap();
    }
    let c1 = counter.clone();
    soln.call_after_prepare_solution(Box::new(move |_s| {
        c1.fetch_add(1, Ordering::SeqCst);
    }));
    let c2 = counter.clone();
    soln.call_after_run_solution(Box::new(move |_s, first, last| {
        assert_eq!((first, last), (0, 1));
        c2.fetch_add(10, Ordering::SeqCst);
    }));

    soln.prepare_solution().expect("prepare");
    soln.get_var_mut("u")
        .unwrap()
        .set_all_elements_same(0.0)
        .unwrap();
    soln.run_solution(0, 1).expect("run");
    assert_eq!(counter.load(Ordering::SeqCst), 11);
}

#[test]
fn end_solution_releases_storage() {
    let mut soln = prepared_laplacian();
    assert!(soln.get_var("u").unwrap().is_storage_allocated());
    soln.end_solution().expect("end");
    assert!(!soln.get_var("u").unwrap().is_storage_allocated());
}
