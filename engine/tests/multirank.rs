//! Multi-rank correctness over the in-process transport
//!
//! Two ranks split the domain along x and exchange halos; after any run the
//! per-rank domains must equal a single-rank run on the same initial state,
//! bit for bit. Covers the overlapped and non-overlapped protocols, the
//! shared-memory fast path, and wavefront schedules across ranks.

mod common;

use common::{domain_snapshot, laplacian_spec, seed_u};
use engine::comm::ThreadComm;
use engine::{new_solution, KernelEnv};
use std::thread;

const SIZE: i64 = 32;

/// Single-rank oracle over the whole domain
fn solo_result(fold_z: i64, steps: i64, options: &str) -> Vec<f64> {
    let env = KernelEnv::new();
    let spec = laplacian_spec("solo", 1, fold_z);
    let mut soln = new_solution(&env, &spec).expect("solution builds");
    for d in ["x", "y", "z"] {
        soln.set_rank_domain_size(d, SIZE).expect("size");
    }
    let residue = soln.apply_command_line_string(options).expect("options");
    assert!(residue.is_empty());
    soln.prepare_solution().expect("prepare");
    seed_u(&mut soln, SIZE, 0.5, 2.0);
    soln.run_solution(0, steps - 1).expect("run");
    domain_snapshot(&soln, steps)
}

/// Run `nranks` ranks along x on threads; returns the concatenated
/// per-rank domain snapshots in rank order
fn multirank_result(fold_z: i64, steps: i64, nranks: usize, options: &'static str) -> Vec<f64> {
    let comms = ThreadComm::create_group(nranks);
    let handles: Vec<_> = comms
        .into_iter()
        .map(|comm| {
            thread::spawn(move || {
                let env = KernelEnv::with_comm(std::sync::Arc::new(comm));
                let spec = laplacian_spec("pair", 1, fold_z);
                let mut soln = new_solution(&env, &spec).expect("solution builds");
                for d in ["x", "y", "z"] {
                    soln.set_overall_domain_size(d, SIZE).expect("size");
                }
                soln.set_num_ranks("x", nranks as i64).expect("ranks");
                for d in ["y", "z"] {
                    soln.set_num_ranks(d, 1).expect("ranks");
                }
                let residue = soln.apply_command_line_string(options).expect("options");
                assert!(residue.is_empty());
                soln.prepare_solution().expect("prepare");
                seed_u(&mut soln, SIZE, 0.5, 2.0);
                soln.run_solution(0, steps - 1).expect("run");
                soln.get_env().global_barrier().expect("final barrier");
                domain_snapshot(&soln, steps)
            })
        })
        .collect();
    let mut out = Vec::new();
    for h in handles {
        out.extend(h.join().expect("rank thread"));
    }
    out
}

#[test]
fn two_ranks_with_overlap_match_single_rank() {
    let solo = solo_result(1, 4, "");
    let pair = multirank_result(1, 4, 2, "");
    assert_eq!(pair, solo);
}

#[test]
fn two_ranks_without_overlap_match_single_rank() {
    let solo = solo_result(1, 4, "");
    let pair = multirank_result(1, 4, 2, "-no-overlap_comms");
    assert_eq!(pair, solo);
}

#[test]
fn vector_folded_exchange_matches_single_rank() {
    // Fold 4 in z with vector-multiple rank sizes enables vec_copy_ok
    // packing on both peers.
    let solo = solo_result(4, 4, "");
    let pair = multirank_result(4, 4, 2, "");
    assert_eq!(pair, solo);
}

#[test]
fn shared_memory_fast_path_matches_single_rank() {
    let solo = solo_result(1, 4, "");
    let pair = multirank_result(1, 4, 2, "-use_shm");
    assert_eq!(pair, solo);
}

#[test]
fn wavefront_across_ranks_matches_single_rank() {
    // wf_steps = 2 skews the region across the rank boundary; extensions
    // let each rank compute into its neighbors' territory.
    let solo = solo_result(1, 6, "");
    let pair = multirank_result(1, 6, 2, "-rt 2 -r 8 -b 8");
    assert_eq!(pair, solo);
}

#[test]
fn four_ranks_match_single_rank() {
    let solo = solo_result(1, 3, "");
    let quad = multirank_result(1, 3, 4, "");
    assert_eq!(quad, solo);
}

#[test]
fn rank_layout_heuristic_solves_unset_grids() {
    // Leave the rank grid unset: the layout heuristic must pick 2x1x1 for
    // two ranks (most compact over the first dim).
    let comms = ThreadComm::create_group(2);
    let handles: Vec<_> = comms
        .into_iter()
        .map(|comm| {
            thread::spawn(move || {
                let env = KernelEnv::with_comm(std::sync::Arc::new(comm));
                let spec = laplacian_spec("layout", 1, 1);
                let mut soln = new_solution(&env, &spec).expect("solution builds");
                for d in ["x", "y", "z"] {
                    soln.set_overall_domain_size(d, 16).expect("size");
                }
                soln.prepare_solution().expect("prepare");
                (
                    soln.get_num_ranks("x").unwrap(),
                    soln.get_num_ranks("y").unwrap(),
                    soln.get_num_ranks("z").unwrap(),
                    soln.get_rank_domain_size("x").unwrap(),
                )
            })
        })
        .collect();
    for h in handles {
        let (nx, ny, nz, lx) = h.join().expect("rank thread");
        assert_eq!((nx, ny, nz), (2, 1, 1));
        assert_eq!(lx, 8);
    }
}
