//! The halo-exchange engine
//!
//! Exchanges dirty halo data for all vars and all valid steps, as a state
//! sequence per neighbor: post receives, pack and send, wait and unpack,
//! finalize. Vars are visited in name order so every rank drives the same
//! sequence with the same deterministic tags. Between co-located ranks the
//! shared-memory fast path packs straight into the peer-visible buffer
//! under its lock word instead of sending a message.

use crate::context::StencilContext;
use crate::mpi::{BufStorage, MpiData};
use data::error::Result;
use data::Precision;
use std::collections::BTreeMap;

/// The per-neighbor protocol states, in order
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum HaloStep {
    /// Post non-blocking receives for non-shm peers
    Irecv,
    /// Pack dirty data and send (or publish through shm)
    PackIsend,
    /// Wait for and unpack inbound data
    Unpack,
    /// Wait for sends to finish and mark vars clean
    Final,
}

impl StencilContext {
    /// Exchange dirty halo data with every neighbor
    ///
    /// Which protocol states run depends on what was just computed: after
    /// exterior passes the data is posted and sent; after the interior it
    /// is received and finalized. Without overlap, all four states run.
    pub(crate) fn exchange_halos(&mut self) -> Result<()> {
        let comm = self.env.comm().clone();
        if comm.num_ranks() < 2 {
            return Ok(());
        }
        self.halo_time.start();

        // Take the exchange state so var access stays unentangled.
        let mut mpi: BTreeMap<String, MpiData> =
            std::mem::take(self.mpi_data.get_mut().expect("exchange state"));

        // Vars with out-of-date halos, in name order, with the step range
        // to swap. Dirty information is kept identical on all ranks, so
        // every rank assembles the same list and the same tags.
        let mut to_swap: Vec<(String, usize, i64, i64)> = Vec::new();
        for gname in mpi.keys() {
            let Some(&gi) = self.var_map.get(gname) else {
                continue;
            };
            let v = &self.vars[gi];
            if v.is_scratch() {
                continue;
            }
            let (start_t, stop_t) = if v.step_posn().is_some() {
                (v.first_valid_step_index(), v.last_valid_step_index() + 1)
            } else {
                (0, 1)
            };
            let mut first: Option<i64> = None;
            let mut last: Option<i64> = None;
            for t in start_t..stop_t {
                if v.is_dirty(t) {
                    first = Some(first.map_or(t, |f| f.min(t)));
                    last = Some(last.map_or(t, |l| l.max(t)));
                }
            }
            if let (Some(f), Some(l)) = (first, last) {
                to_swap.push((gname.clone(), gi, f, l));
            }
        }
        log::trace!("exchange_halos: {} var(s) to swap", to_swap.len());

        let mut steps_to_do: Vec<HaloStep> = Vec::new();
        if !to_swap.is_empty() {
            if self.do_mpi_left || self.do_mpi_right {
                steps_to_do.push(HaloStep::Irecv);
                steps_to_do.push(HaloStep::PackIsend);
            }
            if self.do_mpi_interior {
                steps_to_do.push(HaloStep::Unpack);
                steps_to_do.push(HaloStep::Final);
            }
        }

        let mut cells: Vec<(usize, usize)> = Vec::new();
        self.mpi_info.visit_neighbors(|_, rank, ni| {
            if let Some(nr) = rank {
                cells.push((nr, ni));
            }
        });

        let mut pack_buf: Vec<Precision> = Vec::new();
        for halo_step in &steps_to_do {
            let mut tag: u64 = 0;
            for (gname, gi, first_t, last_t) in &to_swap {
                tag += 1;
                let Some(data) = mpi.get_mut(gname) else {
                    continue;
                };
                let has_step = self.vars[*gi].step_posn().is_some();

                for &(neigh_rank, ni) in &cells {
                    let using_shm = self.opts.use_shm && self.mpi_info.shm_ranks[ni].is_some();
                    match halo_step {
                        HaloStep::Irecv => {
                            if data.bufs[ni].recv.is_active() && !using_shm {
                                data.recv_pending[ni] = Some(tag);
                            }
                        }

                        HaloStep::PackIsend => {
                            let buf = &data.bufs[ni].send;
                            if !buf.is_active() {
                                continue;
                            }
                            let (first, last) =
                                step_window(&self.vars[*gi], buf, has_step, *first_t, *last_t);
                            let n = data::var::Var::slice_len(&first, &last);
                            pack_buf.resize(n, 0.0);
                            let v = &self.vars[*gi];
                            let copied = if buf.vec_copy_ok {
                                v.get_vecs_in_slice(&mut pack_buf, &first, &last)?
                            } else {
                                v.get_elements_in_slice(&mut pack_buf, &first, &last)?
                            };
                            debug_assert_eq!(copied, n);

                            match &buf.storage {
                                BufStorage::Shm(shm) => {
                                    self.wait_time.start();
                                    shm.lock.wait_for_ok_to_write();
                                    self.wait_time.stop();
                                    shm.write_from(&pack_buf[..n]);
                                    shm.lock.mark_write_done();
                                }
                                _ => {
                                    comm.send(neigh_rank, tag, pack_buf[..n].to_vec())?;
                                }
                            }
                        }

                        HaloStep::Unpack => {
                            if !data.bufs[ni].recv.is_active() {
                                continue;
                            }
                            let (first, last) = step_window(
                                &self.vars[*gi],
                                &data.bufs[ni].recv,
                                has_step,
                                *first_t,
                                *last_t,
                            );
                            let n = data::var::Var::slice_len(&first, &last);
                            let vec_ok = data.bufs[ni].recv.vec_copy_ok;
                            let shm_handle = match &data.bufs[ni].recv.storage {
                                BufStorage::Shm(shm) => Some(shm.clone()),
                                _ => None,
                            };

                            let payload: Vec<Precision> = if let Some(shm) = shm_handle {
                                self.wait_time.start();
                                shm.lock.wait_for_ok_to_read();
                                self.wait_time.stop();
                                let mut out = vec![0.0; n];
                                shm.read_into(&mut out);
                                shm.lock.mark_read_done();
                                out
                            } else {
                                // Use anything a poke already pulled off
                                // the transport; block otherwise.
                                let ready = data.recv_ready[ni].take();
                                data.recv_pending[ni] = None;
                                match ready {
                                    Some(p) => p,
                                    None => {
                                        self.wait_time.start();
                                        let p = comm.recv(neigh_rank, tag)?;
                                        self.wait_time.stop();
                                        p
                                    }
                                }
                            };
                            debug_assert_eq!(payload.len(), n);
                            let v = &mut self.vars[*gi];
                            if vec_ok {
                                v.set_vecs_in_slice(&payload, &first, &last)?;
                            } else {
                                v.set_elements_in_slice(&payload, &first, &last)?;
                            }
                        }

                        HaloStep::Final => {
                            // Transport sends are buffered; nothing to wait
                            // on. Mark the swapped steps clean below.
                        }
                    }
                }

                if *halo_step == HaloStep::Final {
                    let v = &mut self.vars[*gi];
                    for t in *first_t..=*last_t {
                        if v.is_dirty(t) {
                            v.set_dirty(false, t);
                            log::trace!("var '{gname}' clean at step {t}");
                        }
                    }
                }
            }
        }

        *self.mpi_data.get_mut().expect("exchange state") = mpi;
        self.halo_time.stop();
        Ok(())
    }

    /// Opportunistically progress pending receives
    ///
    /// Called by thread 0 during interior-only mini-block passes; pulls any
    /// already-arrived payloads off the transport so the later unpack does
    /// not block.
    pub(crate) fn poke_halo_exchange(&self) {
        let comm = self.env.comm();
        if comm.num_ranks() < 2 {
            return;
        }
        self.test_time.start();
        if let Ok(mut mpi) = self.mpi_data.try_lock() {
            for data in mpi.values_mut() {
                for ni in 0..data.recv_pending.len() {
                    let Some(tag) = data.recv_pending[ni] else {
                        continue;
                    };
                    let Some(nr) = self.mpi_info.my_neighbors[ni] else {
                        continue;
                    };
                    if let Ok(Some(payload)) = comm.try_recv(nr, tag) {
                        data.recv_ready[ni] = Some(payload);
                        data.recv_pending[ni] = None;
                    }
                }
            }
        }
        self.test_time.stop();
    }
}

/// The copy window of a buffer with the step placeholder replaced by the
/// actual dirty range
fn step_window(
    var: &data::var::Var,
    buf: &crate::mpi::MpiBuf,
    has_step: bool,
    first_t: i64,
    last_t: i64,
) -> (Vec<i64>, Vec<i64>) {
    let mut first = buf.begin_pt.clone();
    let mut last = buf.last_pt.clone();
    if has_step {
        let p = var.step_posn().expect("step dim present");
        first[p] = first_t;
        last[p] = last_t;
    }
    (first, last)
}
