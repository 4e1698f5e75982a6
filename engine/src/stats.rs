//! Timers and run statistics

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Accumulating wall-clock timer
///
/// Interior-mutable so packs can be timed from inside parallel sections
/// (only thread 0 of a region touches a pack's timer).
#[derive(Debug, Default)]
pub struct Timer {
    inner: Mutex<TimerInner>,
}
//
#[derive(Debug, Default)]
struct TimerInner {
    accum: Duration,
    started: Option<Instant>,
}
//
impl Timer {
    /// A stopped, zeroed timer
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or restart) timing
    pub fn start(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.started = Some(Instant::now());
        }
    }

    /// Stop timing; returns the seconds of the stopped interval
    pub fn stop(&self) -> f64 {
        let Ok(mut inner) = self.inner.lock() else {
            return 0.0;
        };
        match inner.started.take() {
            Some(t0) => {
                let delta = t0.elapsed();
                inner.accum += delta;
                delta.as_secs_f64()
            }
            None => 0.0,
        }
    }

    /// Total accumulated seconds
    pub fn elapsed_secs(&self) -> f64 {
        self.inner
            .lock()
            .map(|inner| inner.accum.as_secs_f64())
            .unwrap_or(0.0)
    }

    /// Zero the accumulator and stop timing
    pub fn clear(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            *inner = TimerInner::default();
        }
    }
}

/// Snapshot of the work performed since the previous retrieval
///
/// Returned by the solution's `get_stats`; retrieval resets the counters.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Stats {
    /// Points in the rank domain
    pub num_elements: i64,

    /// Step-dim indices advanced
    pub num_steps_done: i64,

    /// Var element writes performed
    pub num_writes_done: i64,

    /// Estimated floating-point operations performed
    pub est_fp_ops_done: i64,

    /// Wall-clock seconds inside `run_solution`
    pub elapsed_secs: f64,
}
//
impl Stats {
    /// Writes per second, or 0 when no time was recorded
    pub fn writes_per_sec(&self) -> f64 {
        if self.elapsed_secs > 0.0 {
            self.num_writes_done as f64 / self.elapsed_secs
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_accumulates_across_intervals() {
        let t = Timer::new();
        t.start();
        std::thread::sleep(Duration::from_millis(2));
        let first = t.stop();
        assert!(first > 0.0);
        t.start();
        std::thread::sleep(Duration::from_millis(2));
        t.stop();
        assert!(t.elapsed_secs() >= first);
        t.clear();
        assert_eq!(t.elapsed_secs(), 0.0);
    }

    #[test]
    fn stop_without_start_is_harmless() {
        let t = Timer::new();
        assert_eq!(t.stop(), 0.0);
        assert_eq!(t.elapsed_secs(), 0.0);
    }
}
