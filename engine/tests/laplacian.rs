//! Scheduler correctness on a seven-point Laplacian
//!
//! The tiled, vectorized, wavefront, and temporal-blocking schedules must
//! all produce results bit-for-bit identical to the reference scalar path.

mod common;

use common::{domain_snapshot, laplacian_spec, seed_u};
use engine::{new_solution, KernelEnv};

const SIZE: i64 = 32;
const STEPS: i64 = 10;

/// Build, size, and seed one solution instance
fn make(fold_y: i64, fold_z: i64, extra_options: &str) -> engine::StencilContext {
    let env = KernelEnv::new();
    let spec = laplacian_spec("laplacian_test", fold_y, fold_z);
    let mut soln = new_solution(&env, &spec).expect("solution builds");
    for d in ["x", "y", "z"] {
        soln.set_rank_domain_size(d, SIZE).expect("size set");
    }
    let residue = soln
        .apply_command_line_string(extra_options)
        .expect("options parse");
    assert!(residue.is_empty(), "unexpected residue: {residue:?}");
    soln.prepare_solution().expect("prepare");
    seed_u(&mut soln, SIZE, 0.5, 2.0);
    soln
}

/// The oracle: the same problem evaluated by the reference scalar path
fn reference_result(fold_y: i64, fold_z: i64) -> Vec<f64> {
    let mut oracle = make(fold_y, fold_z, "");
    oracle.run_ref(0, STEPS - 1).expect("reference run");
    domain_snapshot(&oracle, STEPS)
}

#[test]
fn tiled_run_matches_reference() {
    let expected = reference_result(1, 1);
    let mut soln = make(1, 1, "-b 8 -mb 8 -sb 4");
    soln.run_solution(0, STEPS - 1).expect("run");
    let got = domain_snapshot(&soln, STEPS);
    assert_eq!(got, expected);

    // The perturbation spread: the center is no longer the background
    // fixed point, and the far corner still is (0.5 is stationary when all
    // neighbors are 0.5, so only the spike's light cone differs).
    let c = (SIZE / 2) as usize;
    let n = SIZE as usize;
    let center = got[(c * n + c) * n + c];
    assert_ne!(center, 0.5);
    assert_eq!(got[0], 0.5);
}

#[test]
fn vector_folded_run_matches_reference() {
    // Fold 4 in z exercises the cluster loop and fold-aligned geometry.
    let expected = reference_result(1, 4);
    let mut soln = make(1, 4, "-b 16 -mb 8 -sb 8");
    soln.run_solution(0, STEPS - 1).expect("run");
    assert_eq!(domain_snapshot(&soln, STEPS), expected);
}

#[test]
fn inner_fringe_uses_scalars() {
    // Odd sub-blocks in the inner dim with a fold of 4 leave a scalar
    // fringe after the clusters.
    let expected = reference_result(1, 4);
    let mut soln = make(1, 4, "-b 12 -mb 12 -sb 5");
    soln.run_solution(0, STEPS - 1).expect("run");
    assert_eq!(domain_snapshot(&soln, STEPS), expected);
}

#[test]
fn masked_vectors_cover_outer_fold_faces() {
    // A fold in y (an outer dim) with sub-blocks that are not multiples of
    // it forces peel/remainder vectors with write masks.
    let expected = reference_result(4, 1);
    let mut soln = make(4, 1, "-b 12 -mb 12 -sb 6");
    soln.run_solution(0, STEPS - 1).expect("run");
    assert_eq!(domain_snapshot(&soln, STEPS), expected);
}

#[test]
fn force_scalar_matches_reference() {
    let expected = reference_result(1, 4);
    let mut soln = make(1, 4, "-b 8 -force_scalar");
    soln.run_solution(0, STEPS - 1).expect("run");
    assert_eq!(domain_snapshot(&soln, STEPS), expected);
}

#[test]
fn wavefront_and_temporal_blocking_match_plain_run() {
    // Scenario: wf_steps = 4, tb_steps = 2 against wf = 0, tb = 0.
    let expected = reference_result(1, 1);

    let mut wf = make(1, 1, "-r 16 -rt 4 -b 8 -bt 2 -mb 4");
    wf.run_solution(0, STEPS - 1).expect("wavefront run");
    assert_eq!(domain_snapshot(&wf, STEPS), expected);
}

#[test]
fn wavefront_without_temporal_blocking_matches() {
    let expected = reference_result(1, 1);
    let mut wf = make(1, 1, "-r 16 -rt 4 -b 8");
    wf.run_solution(0, STEPS - 1).expect("wavefront run");
    assert_eq!(domain_snapshot(&wf, STEPS), expected);
}

#[test]
fn multiple_windows_accumulate_like_one() {
    let expected = reference_result(1, 1);
    let mut soln = make(1, 1, "-b 8");
    soln.run_solution(0, 3).expect("first window");
    soln.run_solution(4, STEPS - 1).expect("second window");
    assert_eq!(domain_snapshot(&soln, STEPS), expected);
}

#[test]
fn stats_count_steps_and_writes() {
    let mut soln = make(1, 1, "-b 8");
    soln.run_solution(0, STEPS - 1).expect("run");
    let stats = soln.get_stats();
    assert_eq!(stats.num_elements, SIZE * SIZE * SIZE);
    assert_eq!(stats.num_steps_done, STEPS);
    assert_eq!(stats.num_writes_done, SIZE * SIZE * SIZE * STEPS);
    assert!(stats.elapsed_secs > 0.0);

    // Retrieval resets the counters.
    let again = soln.get_stats();
    assert_eq!(again.num_steps_done, 0);
    assert_eq!(again.num_writes_done, 0);
}
