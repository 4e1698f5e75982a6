//! Rank-to-rank transport
//!
//! The engine talks to its peers through the [`Comm`] trait: non-blocking
//! sends, blocking/polling receives, barriers, and the small collectives the
//! setup code needs. Wiring to a real MPI library is an external
//! collaborator; this crate ships two implementations:
//!
//! - [`SoloComm`]: the single-rank no-op transport.
//! - [`ThreadComm`]: in-process ranks over shared mailboxes, including a
//!   true shared-memory window with per-buffer lock words. This is what the
//!   multi-rank tests run on, and it exercises the same exchange protocol a
//!   network transport would.

pub mod shm;

use crate::comm::shm::ShmWindow;
use data::error::{Error, Result};
use data::Precision;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// How long a blocking transport call may stall before erroring out
const COMM_TIMEOUT: Duration = Duration::from_secs(60);

/// Rank-to-rank transport used by the engine
pub trait Comm: Send + Sync {
    /// Total number of ranks
    fn num_ranks(&self) -> usize;

    /// This rank's index
    fn rank(&self) -> usize;

    /// Block until every rank has arrived
    fn barrier(&self) -> Result<()>;

    /// Non-blocking send of an element payload
    fn send(&self, to: usize, tag: u64, payload: Vec<Precision>) -> Result<()>;

    /// Non-blocking probe for a matching message
    fn try_recv(&self, from: usize, tag: u64) -> Result<Option<Vec<Precision>>>;

    /// Blocking receive of a matching message
    fn recv(&self, from: usize, tag: u64) -> Result<Vec<Precision>>;

    /// Broadcast index values from `root` into `vals` on every rank
    fn broadcast_idx(&self, root: usize, vals: &mut [i64]) -> Result<()>;

    /// Gather one index value from every rank, in rank order
    fn allgather_idx(&self, val: i64) -> Result<Vec<i64>>;

    /// The shared-memory window, if this transport provides one
    fn shm(&self) -> Option<&ShmWindow> {
        None
    }

    /// Shared-memory rank of a global rank, if it is in this rank's group
    fn shm_rank_of(&self, _rank: usize) -> Option<usize> {
        None
    }
}

/// Verify that `val` is identical on every rank
///
/// Configuration-affecting settings must be set identically everywhere;
/// this is the collective probe that enforces it.
pub fn assert_equality_over_ranks(comm: &dyn Comm, val: i64, descr: &str) -> Result<()> {
    let all = comm.allgather_idx(val)?;
    for (rn, &v) in all.iter().enumerate() {
        if v != val {
            return Err(Error::Config(format!(
                "{descr} is {val} on rank {} but {v} on rank {rn}",
                comm.rank()
            )));
        }
    }
    Ok(())
}

/// The single-rank transport: every operation is trivial
#[derive(Debug, Default)]
pub struct SoloComm;
//
impl Comm for SoloComm {
    fn num_ranks(&self) -> usize {
        1
    }

    fn rank(&self) -> usize {
        0
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }

    fn send(&self, _to: usize, _tag: u64, _payload: Vec<Precision>) -> Result<()> {
        Err(Error::Comm(
            "single-rank transport cannot send messages".to_string(),
        ))
    }

    fn try_recv(&self, _from: usize, _tag: u64) -> Result<Option<Vec<Precision>>> {
        Ok(None)
    }

    fn recv(&self, _from: usize, _tag: u64) -> Result<Vec<Precision>> {
        Err(Error::Comm(
            "single-rank transport cannot receive messages".to_string(),
        ))
    }

    fn broadcast_idx(&self, _root: usize, _vals: &mut [i64]) -> Result<()> {
        Ok(())
    }

    fn allgather_idx(&self, val: i64) -> Result<Vec<i64>> {
        Ok(vec![val])
    }
}

/// Shared state behind all ranks of a [`ThreadComm`] group
struct CommState {
    nranks: usize,

    /// (from, to, tag) -> queued payloads
    mail: Mutex<HashMap<(usize, usize, u64), VecDeque<Vec<Precision>>>>,
    mail_cv: Condvar,

    /// Generation barrier
    barrier: Mutex<(usize, u64)>,
    barrier_cv: Condvar,

    /// In-flight collectives, keyed by sequence number
    coll: Mutex<CollState>,
    coll_cv: Condvar,

    /// The shared-memory window
    shm: ShmWindow,
}
//
#[derive(Default)]
struct CollState {
    /// (root, seq) -> (payload, reads so far)
    bcast: HashMap<(usize, u64), (Vec<i64>, usize)>,
    /// seq -> (per-rank slots, reads so far)
    gather: HashMap<u64, (Vec<Option<i64>>, usize)>,
}

/// One rank's handle onto an in-process transport group
pub struct ThreadComm {
    me: usize,
    state: Arc<CommState>,

    /// Local sequence counters; collectives are called in the same order on
    /// every rank, so these agree across the group
    bcast_seq: AtomicU64,
    gather_seq: AtomicU64,
}
//
impl ThreadComm {
    /// Create a group of `nranks` connected handles, one per rank
    pub fn create_group(nranks: usize) -> Vec<ThreadComm> {
        let state = Arc::new(CommState {
            nranks,
            mail: Mutex::new(HashMap::new()),
            mail_cv: Condvar::new(),
            barrier: Mutex::new((0, 0)),
            barrier_cv: Condvar::new(),
            coll: Mutex::new(CollState::default()),
            coll_cv: Condvar::new(),
            shm: ShmWindow::new(nranks),
        });
        (0..nranks)
            .map(|me| ThreadComm {
                me,
                state: state.clone(),
                bcast_seq: AtomicU64::new(0),
                gather_seq: AtomicU64::new(0),
            })
            .collect()
    }

    fn timeout_err(what: &str) -> Error {
        Error::Comm(format!("{what} timed out after {COMM_TIMEOUT:?}"))
    }
}
//
impl Comm for ThreadComm {
    fn num_ranks(&self) -> usize {
        self.state.nranks
    }

    fn rank(&self) -> usize {
        self.me
    }

    fn barrier(&self) -> Result<()> {
        let mut guard = self
            .state
            .barrier
            .lock()
            .map_err(|_| Error::Comm("poisoned barrier lock".to_string()))?;
        let gen = guard.1;
        guard.0 += 1;
        if guard.0 == self.state.nranks {
            guard.0 = 0;
            guard.1 += 1;
            self.state.barrier_cv.notify_all();
            return Ok(());
        }
        while guard.1 == gen {
            let (g, timeout) = self
                .state
                .barrier_cv
                .wait_timeout(guard, COMM_TIMEOUT)
                .map_err(|_| Error::Comm("poisoned barrier lock".to_string()))?;
            guard = g;
            if timeout.timed_out() && guard.1 == gen {
                return Err(Self::timeout_err("barrier"));
            }
        }
        Ok(())
    }

    fn send(&self, to: usize, tag: u64, payload: Vec<Precision>) -> Result<()> {
        let mut mail = self
            .state
            .mail
            .lock()
            .map_err(|_| Error::Comm("poisoned mailbox lock".to_string()))?;
        mail.entry((self.me, to, tag)).or_default().push_back(payload);
        self.state.mail_cv.notify_all();
        Ok(())
    }

    fn try_recv(&self, from: usize, tag: u64) -> Result<Option<Vec<Precision>>> {
        let mut mail = self
            .state
            .mail
            .lock()
            .map_err(|_| Error::Comm("poisoned mailbox lock".to_string()))?;
        Ok(mail
            .get_mut(&(from, self.me, tag))
            .and_then(|q| q.pop_front()))
    }

    fn recv(&self, from: usize, tag: u64) -> Result<Vec<Precision>> {
        let mut mail = self
            .state
            .mail
            .lock()
            .map_err(|_| Error::Comm("poisoned mailbox lock".to_string()))?;
        loop {
            if let Some(p) = mail
                .get_mut(&(from, self.me, tag))
                .and_then(|q| q.pop_front())
            {
                return Ok(p);
            }
            let (g, timeout) = self
                .state
                .mail_cv
                .wait_timeout(mail, COMM_TIMEOUT)
                .map_err(|_| Error::Comm("poisoned mailbox lock".to_string()))?;
            mail = g;
            if timeout.timed_out() {
                return Err(Self::timeout_err("receive"));
            }
        }
    }

    fn broadcast_idx(&self, root: usize, vals: &mut [i64]) -> Result<()> {
        let seq = self.bcast_seq.fetch_add(1, Ordering::Relaxed);
        let mut coll = self
            .state
            .coll
            .lock()
            .map_err(|_| Error::Comm("poisoned collective lock".to_string()))?;
        if self.me == root {
            coll.bcast.insert((root, seq), (vals.to_vec(), 0));
            self.state.coll_cv.notify_all();
            return Ok(());
        }
        loop {
            if let Some((payload, reads)) = coll.bcast.get_mut(&(root, seq)) {
                vals.copy_from_slice(payload);
                *reads += 1;
                if *reads == self.state.nranks - 1 {
                    coll.bcast.remove(&(root, seq));
                }
                return Ok(());
            }
            let (g, timeout) = self
                .state
                .coll_cv
                .wait_timeout(coll, COMM_TIMEOUT)
                .map_err(|_| Error::Comm("poisoned collective lock".to_string()))?;
            coll = g;
            if timeout.timed_out() {
                return Err(Self::timeout_err("broadcast"));
            }
        }
    }

    fn allgather_idx(&self, val: i64) -> Result<Vec<i64>> {
        let seq = self.gather_seq.fetch_add(1, Ordering::Relaxed);
        let nranks = self.state.nranks;
        let mut coll = self
            .state
            .coll
            .lock()
            .map_err(|_| Error::Comm("poisoned collective lock".to_string()))?;
        {
            let entry = coll
                .gather
                .entry(seq)
                .or_insert_with(|| (vec![None; nranks], 0));
            entry.0[self.me] = Some(val);
        }
        self.state.coll_cv.notify_all();
        loop {
            let complete = coll
                .gather
                .get(&seq)
                .map(|(slots, _)| slots.iter().all(|s| s.is_some()))
                .unwrap_or(false);
            if complete {
                let result: Vec<i64> = {
                    let (slots, reads) = coll.gather.get_mut(&seq).unwrap();
                    let out = slots.iter().map(|s| s.unwrap()).collect();
                    *reads += 1;
                    if *reads == nranks {
                        coll.gather.remove(&seq);
                    }
                    out
                };
                return Ok(result);
            }
            let (g, timeout) = self
                .state
                .coll_cv
                .wait_timeout(coll, COMM_TIMEOUT)
                .map_err(|_| Error::Comm("poisoned collective lock".to_string()))?;
            coll = g;
            if timeout.timed_out() {
                return Err(Self::timeout_err("allgather"));
            }
        }
    }

    fn shm(&self) -> Option<&ShmWindow> {
        Some(&self.state.shm)
    }

    fn shm_rank_of(&self, rank: usize) -> Option<usize> {
        // All ranks of a thread group share one address space.
        (rank < self.state.nranks).then_some(rank)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn messages_are_matched_by_source_and_tag() {
        let comms = ThreadComm::create_group(2);
        let [c0, c1]: [ThreadComm; 2] = comms.try_into().map_err(|_| ()).unwrap();
        let t = thread::spawn(move || {
            c1.send(0, 7, vec![1.0, 2.0]).unwrap();
            c1.send(0, 8, vec![3.0]).unwrap();
        });
        // Tag 8 first, then 7; matching is by tag, not arrival order.
        assert_eq!(c0.recv(1, 8).unwrap(), vec![3.0]);
        assert_eq!(c0.recv(1, 7).unwrap(), vec![1.0, 2.0]);
        assert!(c0.try_recv(1, 7).unwrap().is_none());
        t.join().unwrap();
    }

    #[test]
    fn collectives_agree_across_ranks() {
        let comms = ThreadComm::create_group(3);
        let handles: Vec<_> = comms
            .into_iter()
            .map(|c| {
                thread::spawn(move || {
                    let all = c.allgather_idx(c.rank() as i64 * 10).unwrap();
                    assert_eq!(all, vec![0, 10, 20]);
                    let mut buf = [0i64; 2];
                    if c.rank() == 1 {
                        buf = [5, 6];
                    }
                    c.broadcast_idx(1, &mut buf).unwrap();
                    assert_eq!(buf, [5, 6]);
                    c.barrier().unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn equality_probe_detects_divergence() {
        let comms = ThreadComm::create_group(2);
        let handles: Vec<_> = comms
            .into_iter()
            .map(|c| {
                thread::spawn(move || {
                    let val = if c.rank() == 0 { 1 } else { 2 };
                    assert_equality_over_ranks(&c, val, "test setting").is_err()
                })
            })
            .collect();
        for h in handles {
            assert!(h.join().unwrap());
        }
    }
}
