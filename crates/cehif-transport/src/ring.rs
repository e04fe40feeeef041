//! Host-side ring operations.
//!
//! `CeRing` wraps one direction of shared ring memory with the host's
//! private consumer state: `sw_index`, the host's reap position trailing
//! the target's `read_index`, and the per-slot `TransferCtx` table. The
//! shared memory itself (`SharedRingMem`) carries only what both sides
//! need; contexts never cross the interconnect.

use std::sync::Arc;
use std::sync::Mutex;

use cehif_core::callbacks::TransferCtx;
use cehif_core::error::{CeError, Result};
use cehif_core::ring_mem::{CeDesc, SharedRingMem};
use std::sync::atomic::Ordering;

/// Which direction of a pipe's ring pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingDir {
    /// Host-to-target (send) ring.
    Src,
    /// Target-to-host (receive) ring.
    Dest,
}

struct RingCtl {
    /// Host reap position; trails the target's `read_index`.
    sw_index: u32,
    /// Context per slot, present while the slot is in flight.
    ctxs: Box<[Option<TransferCtx>]>,
}

pub struct CeRing {
    mem: Arc<SharedRingMem>,
    ctl: Mutex<RingCtl>,
}

impl CeRing {
    pub fn new(nentries: u32) -> Self {
        let mem = Arc::new(SharedRingMem::new(nentries));
        let ctxs = (0..nentries).map(|_| None).collect::<Vec<_>>().into_boxed_slice();
        Self {
            mem,
            ctl: Mutex::new(RingCtl { sw_index: 0, ctxs }),
        }
    }

    pub fn mem(&self) -> Arc<SharedRingMem> {
        Arc::clone(&self.mem)
    }

    pub fn capacity(&self) -> u32 {
        self.mem.capacity()
    }

    /// Publish one descriptor. `Err(RingFull)` leaves the ring untouched.
    pub fn enqueue(&self, desc: CeDesc, ctx: TransferCtx) -> Result<()> {
        self.enqueue_list(&[(desc, ctx)])
    }

    /// Publish a batch of descriptors contiguously, all or nothing.
    /// Sendlist fragments rely on this: the gather chain must not be
    /// interleaved with descriptors from another caller.
    pub fn enqueue_list(&self, items: &[(CeDesc, TransferCtx)]) -> Result<()> {
        let mut ctl = self.ctl.lock().unwrap();
        let w = self.mem.write_index().load(Ordering::Relaxed);
        let in_flight = w.wrapping_sub(ctl.sw_index);
        // One slot stays empty to disambiguate full from empty.
        if in_flight + items.len() as u32 > self.mem.mask() {
            return Err(CeError::RingFull);
        }
        for (i, (desc, ctx)) in items.iter().enumerate() {
            let idx = w.wrapping_add(i as u32);
            self.mem.write_desc(idx, *desc);
            ctl.ctxs[(idx & self.mem.mask()) as usize] = Some(*ctx);
        }
        self.mem
            .write_index()
            .store(w.wrapping_add(items.len() as u32), Ordering::Release);
        Ok(())
    }

    /// Reap the next target-consumed entry, if any. Returns the context
    /// together with the descriptor as the target left it (a destination
    /// ring carries the written-back fill length).
    pub fn completed_next(&self) -> Option<(TransferCtx, CeDesc)> {
        let mut ctl = self.ctl.lock().unwrap();
        loop {
            let r = self.mem.read_index().load(Ordering::Acquire);
            if ctl.sw_index == r {
                return None;
            }
            let idx = ctl.sw_index;
            let desc = self.mem.read_desc(idx);
            let slot = (idx & self.mem.mask()) as usize;
            let ctx = ctl.ctxs[slot].take();
            ctl.sw_index = idx.wrapping_add(1);
            match ctx {
                Some(ctx) => return Some((ctx, desc)),
                None => {
                    // Slot reaped without a context: accounting bug
                    // upstream. Skip it; later completions still count.
                    eprintln!("cehif: ring slot {} completed with no context", slot);
                }
            }
        }
    }

    /// Entries the host published that the target has not consumed yet.
    pub fn in_flight_unconsumed(&self) -> u32 {
        self.mem.pending()
    }

    /// Slots occupied from the host's point of view (unconsumed plus
    /// consumed-but-unreaped).
    pub fn occupied(&self) -> u32 {
        let ctl = self.ctl.lock().unwrap();
        self.mem
            .write_index()
            .load(Ordering::Relaxed)
            .wrapping_sub(ctl.sw_index)
    }

    /// Teardown: pull back the next occupied slot regardless of whether
    /// the target consumed it. Only valid once the target is quiesced.
    pub fn cancel_next(&self) -> Option<(TransferCtx, CeDesc)> {
        let mut ctl = self.ctl.lock().unwrap();
        let w = self.mem.write_index().load(Ordering::Relaxed);
        if ctl.sw_index == w {
            return None;
        }
        let idx = ctl.sw_index;
        let desc = self.mem.read_desc(idx);
        let slot = (idx & self.mem.mask()) as usize;
        let ctx = ctl.ctxs[slot].take();
        ctl.sw_index = idx.wrapping_add(1);
        // Keep read_index in step so a restarted ring starts clean.
        self.mem.read_index().store(idx.wrapping_add(1), Ordering::Release);
        ctx.map(|c| (c, desc))
    }
}
