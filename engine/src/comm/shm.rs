//! Shared-memory window and buffer locks
//!
//! Ranks that share an address space bypass explicit send/receive: the
//! sender packs directly into a buffer in its own window segment and flips
//! a lock word; the receiver reads the buffer in place and flips it back.
//! Each buffer carries exactly one machine word of synchronization, polled
//! with a bounded backoff.

use data::error::{Error, Result};
use data::Precision;
use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Sentinel value written into the last element of a fresh shared buffer
pub const SHM_SENTINEL: Precision = 26.0;

/// Spins between yields while polling a lock word
const SPINS_PER_YIELD: u32 = 64;

/// One-word read/write lock over a shared buffer
///
/// State 0: writable (empty). State 1: readable (full). The writer waits
/// for 0, fills the buffer, and stores 1 with release ordering; the reader
/// waits for 1, drains the buffer, and stores 0.
#[derive(Debug, Default)]
pub struct ShmLock {
    word: AtomicU64,
}
//
impl ShmLock {
    /// Reset to the writable state
    pub fn init(&self) {
        self.word.store(0, Ordering::Release);
    }

    /// Whether the buffer currently holds unread data
    pub fn is_ok_to_read(&self) -> bool {
        self.word.load(Ordering::Acquire) == 1
    }

    /// Poll until the buffer holds unread data
    pub fn wait_for_ok_to_read(&self) {
        let mut spins = 0u32;
        while !self.is_ok_to_read() {
            backoff(&mut spins);
        }
    }

    /// Release the buffer back to the writer
    pub fn mark_read_done(&self) {
        self.word.store(0, Ordering::Release);
    }

    /// Whether the buffer is free for the writer
    pub fn is_ok_to_write(&self) -> bool {
        self.word.load(Ordering::Acquire) == 0
    }

    /// Poll until the buffer is free for the writer
    pub fn wait_for_ok_to_write(&self) {
        let mut spins = 0u32;
        while !self.is_ok_to_write() {
            backoff(&mut spins);
        }
    }

    /// Publish the buffer contents to the reader
    pub fn mark_write_done(&self) {
        self.word.store(1, Ordering::Release);
    }
}

#[inline]
fn backoff(spins: &mut u32) {
    *spins += 1;
    if *spins % SPINS_PER_YIELD == 0 {
        std::thread::yield_now();
    } else {
        std::hint::spin_loop();
    }
}

/// One buffer inside a rank's window segment
///
/// Element access is raw under the lock protocol: the side holding the
/// write (resp. read) permission is the only one touching the data.
pub struct ShmBuf {
    data: UnsafeCell<Vec<Precision>>,
    /// Lock word governing the data
    pub lock: ShmLock,
    len: usize,
}
//
// SAFETY: data access is serialized by the lock protocol above.
unsafe impl Sync for ShmBuf {}
unsafe impl Send for ShmBuf {}
//
impl ShmBuf {
    fn new(len: usize) -> Self {
        Self {
            data: UnsafeCell::new(vec![0.0; len]),
            lock: ShmLock::default(),
            len,
        }
    }

    /// Capacity in elements
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer has zero capacity
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy `src` into the buffer; caller must hold the write permission
    pub fn write_from(&self, src: &[Precision]) {
        debug_assert!(src.len() <= self.len);
        // SAFETY: exclusive by the lock protocol.
        unsafe {
            (&mut *self.data.get())[..src.len()].copy_from_slice(src);
        }
    }

    /// Copy the buffer into `dst`; caller must hold the read permission
    pub fn read_into(&self, dst: &mut [Precision]) {
        debug_assert!(dst.len() <= self.len);
        // SAFETY: exclusive by the lock protocol.
        unsafe {
            dst.copy_from_slice(&(&*self.data.get())[..dst.len()]);
        }
    }

    /// Stamp the owner's test pattern into a fresh buffer
    pub fn write_sentinels(&self, owner_rank: usize) {
        // SAFETY: called once by the owner before the buffer is shared.
        unsafe {
            let data = &mut *self.data.get();
            data[0] = owner_rank as Precision;
            data[self.len - 1] = SHM_SENTINEL;
        }
    }

    /// Verify the owner's test pattern from the peer side
    pub fn check_sentinels(&self, owner_rank: usize) -> bool {
        // SAFETY: read-only peek during setup, before any payload traffic.
        unsafe {
            let data = &*self.data.get();
            data[0] == owner_rank as Precision && data[self.len - 1] == SHM_SENTINEL
        }
    }
}

/// The window of shared buffers across a group of co-located ranks
///
/// Each rank registers its send buffers into its own segment under a byte
/// offset; after offsets are exchanged, a receiver locates its peer's send
/// buffer by (owner rank, offset).
pub struct ShmWindow {
    segments: Mutex<HashMap<(usize, u64), Arc<ShmBuf>>>,
    nranks: usize,
}
//
impl ShmWindow {
    /// An empty window for `nranks` co-located ranks
    pub fn new(nranks: usize) -> Self {
        Self {
            segments: Mutex::new(HashMap::new()),
            nranks,
        }
    }

    /// Number of ranks sharing the window
    pub fn num_ranks(&self) -> usize {
        self.nranks
    }

    /// Register (or replace) a buffer of `len` elements at `offset` inside
    /// `rank`'s segment
    pub fn register(&self, rank: usize, offset: u64, len: usize) -> Result<Arc<ShmBuf>> {
        if len == 0 {
            return Err(Error::Allocation(
                "cannot register an empty shared buffer".to_string(),
            ));
        }
        let buf = Arc::new(ShmBuf::new(len));
        buf.lock.init();
        let mut seg = self
            .segments
            .lock()
            .map_err(|_| Error::Comm("poisoned window lock".to_string()))?;
        seg.insert((rank, offset), buf.clone());
        Ok(buf)
    }

    /// Locate a peer's buffer by (owner rank, offset)
    pub fn lookup(&self, rank: usize, offset: u64) -> Result<Arc<ShmBuf>> {
        let seg = self
            .segments
            .lock()
            .map_err(|_| Error::Comm("poisoned window lock".to_string()))?;
        seg.get(&(rank, offset)).cloned().ok_or_else(|| {
            Error::Allocation(format!(
                "no shared buffer registered at offset {offset} of rank {rank}'s segment"
            ))
        })
    }

    /// Drop every registered buffer
    pub fn clear(&self) {
        if let Ok(mut seg) = self.segments.lock() {
            seg.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn lock_protocol_hands_data_across_threads() {
        let buf = Arc::new(ShmBuf::new(4));
        buf.lock.init();
        let writer = {
            let buf = buf.clone();
            thread::spawn(move || {
                for round in 0..10 {
                    buf.lock.wait_for_ok_to_write();
                    buf.write_from(&[round as Precision; 4]);
                    buf.lock.mark_write_done();
                }
            })
        };
        let mut out = [0.0; 4];
        for round in 0..10 {
            buf.lock.wait_for_ok_to_read();
            buf.read_into(&mut out);
            buf.lock.mark_read_done();
            assert_eq!(out, [round as Precision; 4]);
        }
        writer.join().unwrap();
    }

    #[test]
    fn window_lookup_by_owner_and_offset() {
        let win = ShmWindow::new(2);
        let owned = win.register(0, 128, 8).unwrap();
        owned.write_sentinels(0);
        let found = win.lookup(0, 128).unwrap();
        assert!(found.check_sentinels(0));
        assert!(win.lookup(1, 128).is_err());
    }
}
