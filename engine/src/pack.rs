//! Bundle packs
//!
//! A pack is an independent set of bundles tuned and scheduled as a unit.
//! Bundles in a pack may be evaluated in any order within a (time, tile)
//! slot. Each pack carries its own settings copy (so a per-pack auto-tuner
//! can adjust it), a timer, and per-step work counters.

use crate::settings::KernelSettings;
use crate::stats::Timer;
use crate::tuner::AutoTuner;
use data::bounds::BoundingBox;
use std::sync::atomic::{AtomicI64, Ordering};

/// One independent set of bundles
pub struct Pack {
    pub name: String,

    /// Bundle ids in evaluation order
    pub bundle_ids: Vec<usize>,

    /// Union of the member bundles' bounding boxes
    pub bb: BoundingBox,

    /// Local settings; active when per-pack tuners are in use
    pub local_opts: KernelSettings,

    /// This pack's auto-tuner
    pub tuner: AutoTuner,

    /// Wall-clock spent evaluating this pack
    pub timer: Timer,

    /// Steps this pack has advanced (counts step-predicate hits only);
    /// atomic because thread 0 bumps it from inside a sweep
    steps_done: AtomicI64,

    /// Work per step across this rank
    pub num_reads_per_step: i64,
    pub num_writes_per_step: i64,
    pub num_fpops_per_step: i64,

    /// Work per step across all ranks
    pub tot_reads_per_step: i64,
    pub tot_writes_per_step: i64,
    pub tot_fpops_per_step: i64,
}
//
impl Pack {
    /// A pack over the given bundles, starting from a copy of the solution
    /// settings
    pub fn new(name: impl Into<String>, bundle_ids: Vec<usize>, opts: &KernelSettings) -> Self {
        let name = name.into();
        Self {
            tuner: AutoTuner::new(&name),
            name,
            bundle_ids,
            bb: BoundingBox::default(),
            local_opts: opts.clone(),
            timer: Timer::new(),
            steps_done: AtomicI64::new(0),
            num_reads_per_step: 0,
            num_writes_per_step: 0,
            num_fpops_per_step: 0,
            tot_reads_per_step: 0,
            tot_writes_per_step: 0,
            tot_fpops_per_step: 0,
        }
    }

    /// Start the pack and tuner timers (thread 0 only)
    pub fn start_timers(&self) {
        self.timer.start();
        self.tuner.timer.start();
    }

    /// Stop the pack and tuner timers (thread 0 only)
    pub fn stop_timers(&self) {
        self.timer.stop();
        self.tuner.timer.stop();
    }

    /// Credit completed steps to the pack and its tuner
    pub fn add_steps(&self, num_steps: i64) {
        self.steps_done.fetch_add(num_steps, Ordering::Relaxed);
        self.tuner.add_steps(num_steps);
    }

    /// Steps completed so far
    pub fn steps_done(&self) -> i64 {
        self.steps_done.load(Ordering::Relaxed)
    }

    /// Zero the step counter
    pub fn clear_steps(&self) {
        self.steps_done.store(0, Ordering::Relaxed);
    }
}
