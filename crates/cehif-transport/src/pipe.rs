//! Pipes: flow control, buffer pools, and completion-state records.
//!
//! A pipe pairs up to two rings (send, receive) with the host-side
//! bookkeeping the rings themselves don't carry: the send-credit counter,
//! fixed buffer pools carved out of the DMA arena, and the free list of
//! completion-state records the dispatcher recycles.

use std::sync::Mutex;

use crossbeam_queue::ArrayQueue;

use cehif_core::callbacks::{BufferId, TransferCtx};
use cehif_core::config::CeAttr;
use cehif_core::dma::DmaArena;
use cehif_core::error::{CeError, Result};
use cehif_core::ring_mem::CeDesc;

use crate::ring::CeRing;

/// Fixed pool of same-sized arena buffers, addressed by `BufferId`.
pub struct BufferPool {
    buf_sz: u32,
    addrs: Box<[u32]>,
    free: ArrayQueue<u32>,
}

impl BufferPool {
    /// Carve `count` buffers of `buf_sz` bytes out of the arena.
    pub fn new(arena: &DmaArena, count: u32, buf_sz: u32) -> Result<Self> {
        let slab = arena.alloc(count as usize * buf_sz as usize, 8)?;
        let addrs = (0..count).map(|i| slab + i * buf_sz).collect::<Vec<_>>().into_boxed_slice();
        let free = ArrayQueue::new(count as usize);
        for i in 0..count {
            let _ = free.push(i);
        }
        Ok(Self { buf_sz, addrs, free })
    }

    pub fn alloc(&self) -> Option<BufferId> {
        self.free.pop().map(BufferId)
    }

    pub fn release(&self, buf: BufferId) {
        debug_assert!((buf.0 as usize) < self.addrs.len());
        if self.free.push(buf.0).is_err() {
            // Double release; the slot is already free.
            eprintln!("cehif: buffer {} released twice", buf.0);
        }
    }

    pub fn addr_of(&self, buf: BufferId) -> u32 {
        self.addrs[buf.0 as usize]
    }

    pub fn buf_sz(&self) -> u32 {
        self.buf_sz
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.addrs.len()
    }
}

/// What a reaped ring entry meant, queued through the device-wide FIFO.
#[derive(Debug, Clone, Copy)]
pub enum ComplKind {
    Send,
    Recv,
}

/// One completion-state record. Records are recycled through each pipe's
/// `compl_free` queue; exhaustion means a completion gets dropped rather
/// than blocking interrupt servicing.
#[derive(Debug, Clone, Copy)]
pub struct ComplState {
    pub kind: ComplKind,
    pub pipe_id: u8,
    pub ctx: TransferCtx,
    pub nbytes: u32,
    pub transfer_id: u16,
}

pub struct Pipe {
    pub id: u8,
    pub attr: CeAttr,
    pub src: Option<CeRing>,
    pub dest: Option<CeRing>,
    pub tx_pool: Option<BufferPool>,
    pub rx_pool: Option<BufferPool>,
    /// Free completion-state records for this pipe.
    pub compl_free: Option<ArrayQueue<ComplState>>,
    /// Send credits: `src_nentries - 1`, debited per descriptor at
    /// submission, credited back per reaped send completion.
    sends_allowed: Mutex<u32>,
}

impl Pipe {
    pub fn new(id: u8, attr: CeAttr, arena: &DmaArena, rx_pool_factor: u32, pooled: bool) -> Result<Self> {
        let src = (attr.src_nentries > 0).then(|| CeRing::new(attr.src_nentries));
        let dest = (attr.dest_nentries > 0).then(|| CeRing::new(attr.dest_nentries));
        let tx_pool = match attr.src_nentries {
            0 => None,
            n => Some(BufferPool::new(arena, n, attr.buf_sz)?),
        };
        let rx_pool = match attr.dest_nentries {
            0 => None,
            n => Some(BufferPool::new(arena, n * rx_pool_factor, attr.buf_sz)?),
        };
        let compl_free = if pooled {
            let cap = (attr.src_nentries + attr.dest_nentries) as usize;
            (cap > 0).then(|| {
                let q = ArrayQueue::new(cap);
                for _ in 0..cap {
                    let _ = q.push(ComplState {
                        kind: ComplKind::Send,
                        pipe_id: id,
                        ctx: TransferCtx::SendlistItem,
                        nbytes: 0,
                        transfer_id: 0,
                    });
                }
                q
            })
        } else {
            None
        };
        let window = attr.src_nentries.saturating_sub(1);
        Ok(Self {
            id,
            attr,
            src,
            dest,
            tx_pool,
            rx_pool,
            compl_free,
            sends_allowed: Mutex::new(window),
        })
    }

    /// Take `n` send credits, or `Busy` without taking any.
    pub fn debit(&self, n: u32) -> Result<()> {
        let mut sa = self.sends_allowed.lock().unwrap();
        if *sa < n {
            return Err(CeError::Busy);
        }
        *sa -= n;
        Ok(())
    }

    pub fn credit(&self, n: u32) {
        let mut sa = self.sends_allowed.lock().unwrap();
        *sa += n;
        debug_assert!(*sa <= self.attr.src_nentries.saturating_sub(1));
    }

    /// Free send slots as seen by flow control.
    pub fn free_queue_depth(&self) -> u32 {
        *self.sends_allowed.lock().unwrap()
    }

    /// Post `n` empty receive buffers from the pool onto the receive ring.
    pub fn post_recv_buffers(&self, arena: &DmaArena, n: u32) -> Result<()> {
        let dest = self.dest.as_ref().ok_or(CeError::NotStarted)?;
        let pool = self.rx_pool.as_ref().ok_or(CeError::NotStarted)?;
        for _ in 0..n {
            let buf = pool.alloc().ok_or(CeError::NoDmaMemory)?;
            let addr = pool.addr_of(buf);
            arena.clear(addr, pool.buf_sz() as usize);
            if let Err(e) = dest.enqueue(CeDesc::new(addr, pool.buf_sz(), 0, 0), TransferCtx::Buffer(buf)) {
                pool.release(buf);
                return Err(e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cehif_core::config::HOST_CE_CONFIG;

    fn arena() -> DmaArena {
        DmaArena::new(1 << 20).unwrap()
    }

    #[test]
    fn test_pool_alloc_release_cycle() {
        let arena = arena();
        let pool = BufferPool::new(&arena, 4, 256).unwrap();
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert_ne!(pool.addr_of(a), pool.addr_of(b));
        assert_eq!(pool.available(), 2);
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn test_pool_exhaustion() {
        let arena = arena();
        let pool = BufferPool::new(&arena, 2, 64).unwrap();
        let _a = pool.alloc().unwrap();
        let _b = pool.alloc().unwrap();
        assert!(pool.alloc().is_none());
    }

    #[test]
    fn test_send_window_is_nentries_minus_one() {
        let arena = arena();
        // CE0: 16-entry send ring.
        let pipe = Pipe::new(0, HOST_CE_CONFIG[0], &arena, 2, true).unwrap();
        assert_eq!(pipe.free_queue_depth(), 15);
        pipe.debit(15).unwrap();
        assert!(matches!(pipe.debit(1), Err(CeError::Busy)));
        // Failed debit took nothing.
        assert_eq!(pipe.free_queue_depth(), 0);
        pipe.credit(1);
        assert_eq!(pipe.free_queue_depth(), 1);
    }

    #[test]
    fn test_multi_credit_debit_is_atomic() {
        let arena = arena();
        let pipe = Pipe::new(0, HOST_CE_CONFIG[0], &arena, 2, true).unwrap();
        pipe.debit(10).unwrap();
        // 5 left; a 6-fragment sendlist must be refused whole.
        assert!(matches!(pipe.debit(6), Err(CeError::Busy)));
        assert_eq!(pipe.free_queue_depth(), 5);
    }

    #[test]
    fn test_post_recv_fills_ring_from_pool() {
        let arena = arena();
        // CE2: 32-entry receive ring.
        let pipe = Pipe::new(2, HOST_CE_CONFIG[2], &arena, 2, true).unwrap();
        pipe.post_recv_buffers(&arena, 31).unwrap();
        let dest = pipe.dest.as_ref().unwrap();
        assert_eq!(dest.occupied(), 31);
        assert_eq!(pipe.rx_pool.as_ref().unwrap().available(), 64 - 31);
        // Ring keeps one slot back even though the pool has more buffers.
        assert!(pipe.post_recv_buffers(&arena, 1).is_err());
    }
}
