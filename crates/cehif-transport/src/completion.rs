//! Deferred completion servicing.
//!
//! Two stages. `per_engine_service` runs in tasklet context, reaps a
//! pipe's rings and queues `ComplState` records on the device-wide FIFO.
//! `check_process_ce` / `process_ce` drain that FIFO and invoke the
//! upper-layer callbacks, serialized by the `compl_processing` flag so
//! exactly one thread dispatches at a time and completions stay in
//! hardware order across the whole device.

use std::sync::atomic::Ordering;

use cehif_core::callbacks::TransferCtx;
use cehif_core::config::DIAG_CE_ID;
use cehif_core::regs::{
    FW_INDICATOR_ADDRESS, FW_IND_EVENT_PENDING, PCIE_INTR_CE_MASK_ALL, PCIE_INTR_ENABLE_ADDRESS,
    PCIE_INTR_FIRMWARE_MASK,
};

use crate::device::DeviceCore;
use crate::pipe::{ComplKind, ComplState};

impl DeviceCore {
    /// Reap everything the target has consumed or filled on one pipe.
    /// Tasklet context; never blocks on the dispatch stage.
    pub(crate) fn per_engine_service(&self, ce_id: u8) {
        // The diagnostic pipe is reaped synchronously by its caller.
        if ce_id == DIAG_CE_ID {
            return;
        }
        let Some(pipe) = self.pipes.get(ce_id as usize) else {
            eprintln!("cehif: service request for unknown pipe {}", ce_id);
            return;
        };
        let Some(compl_free) = pipe.compl_free.as_ref() else {
            return;
        };

        // Ring indices live in shared memory; hold a wake reference for
        // the duration of the scan as register-backed indices require.
        let _wake = match self.wake.keep_awake() {
            Ok(g) => Some(g),
            Err(e) => {
                eprintln!("cehif: pipe {} service without wake: {}", ce_id, e);
                None
            }
        };

        if let Some(src) = pipe.src.as_ref() {
            while let Some((ctx, desc)) = src.completed_next() {
                match ctx {
                    TransferCtx::SendlistItem => pipe.credit(1),
                    TransferCtx::Buffer(_) => {
                        let Some(mut rec) = compl_free.pop() else {
                            eprintln!(
                                "cehif: pipe {} completion records exhausted, dropping send",
                                ce_id
                            );
                            self.stats.compl_dropped.fetch_add(1, Ordering::Relaxed);
                            pipe.credit(1);
                            continue;
                        };
                        rec.kind = ComplKind::Send;
                        rec.pipe_id = ce_id;
                        rec.ctx = ctx;
                        rec.nbytes = desc.nbytes;
                        rec.transfer_id = desc.transfer_id();
                        self.queue_completion(ce_id, rec);
                    }
                    TransferCtx::Diag => {
                        eprintln!("cehif: diag context on data pipe {}", ce_id)
                    }
                }
            }
        }

        if let Some(dest) = pipe.dest.as_ref() {
            while let Some((ctx, desc)) = dest.completed_next() {
                match ctx {
                    TransferCtx::Buffer(buf) => {
                        let Some(mut rec) = compl_free.pop() else {
                            eprintln!(
                                "cehif: pipe {} completion records exhausted, dropping recv",
                                ce_id
                            );
                            self.stats.compl_dropped.fetch_add(1, Ordering::Relaxed);
                            if let Some(pool) = pipe.rx_pool.as_ref() {
                                pool.release(buf);
                            }
                            continue;
                        };
                        rec.kind = ComplKind::Recv;
                        rec.pipe_id = ce_id;
                        rec.ctx = ctx;
                        rec.nbytes = desc.nbytes;
                        rec.transfer_id = desc.transfer_id();
                        self.queue_completion(ce_id, rec);
                    }
                    other => eprintln!("cehif: non-buffer context {:?} on recv ring {}", other, ce_id),
                }
            }
        }

        self.check_process_ce();
    }

    fn queue_completion(&self, ce_id: u8, rec: ComplState) {
        if self.pending.push(rec).is_err() {
            // FIFO is sized for every ring slot; reaching here means an
            // accounting bug, not load.
            eprintln!("cehif: completion FIFO overflow on pipe {}", ce_id);
            self.stats.compl_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drain the completion FIFO unless another thread already is.
    pub(crate) fn check_process_ce(&self) {
        if self.compl_processing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.process_ce();
    }

    fn process_ce(&self) {
        loop {
            let Some(rec) = self.pending.pop() else {
                self.compl_processing.store(false, Ordering::Release);
                // A producer may have queued between the failed pop and
                // the flag clear; re-claim and keep draining if so.
                if self.pending.is_empty() {
                    return;
                }
                if self.compl_processing.swap(true, Ordering::AcqRel) {
                    return;
                }
                continue;
            };
            self.dispatch_one(rec);
        }
    }

    fn dispatch_one(&self, rec: ComplState) {
        let cbs = self.callbacks.lock().unwrap().clone();
        let pipe = &self.pipes[rec.pipe_id as usize];
        let TransferCtx::Buffer(buf) = rec.ctx else {
            return;
        };
        match rec.kind {
            ComplKind::Send => {
                cbs.tx_complete(buf, rec.transfer_id);
                pipe.credit(1);
                self.stats.tx_completed.fetch_add(1, Ordering::Relaxed);
            }
            ComplKind::Recv => {
                // Put a fresh buffer on the ring before handing this one
                // up, so a slow consumer never starves the receive ring.
                if let Err(e) = pipe.post_recv_buffers(&self.arena, 1) {
                    eprintln!("cehif: pipe {} replenish failed: {}", rec.pipe_id, e);
                }
                cbs.rx_data(buf, rec.nbytes as usize, rec.pipe_id);
                self.stats.rx_delivered.fetch_add(1, Ordering::Relaxed);
            }
        }
        if let Some(q) = pipe.compl_free.as_ref() {
            let _ = q.push(rec);
        }
    }

    /// Check and acknowledge the firmware event indicator.
    pub(crate) fn fw_interrupt_check(&self) {
        let guard = match self.wake.keep_awake() {
            Ok(g) => g,
            Err(e) => {
                eprintln!("cehif: firmware check without wake: {}", e);
                return;
            }
        };
        let ind = self.bus.read32(FW_INDICATOR_ADDRESS);
        if ind & FW_IND_EVENT_PENDING == 0 {
            return;
        }
        self.bus.write32(FW_INDICATOR_ADDRESS, ind & !FW_IND_EVENT_PENDING);
        drop(guard);

        self.stats.fw_events.fetch_add(1, Ordering::Relaxed);
        if self.started.load(Ordering::Acquire) {
            self.dump_crash_area();
            let cbs = self.callbacks.lock().unwrap().clone();
            cbs.fw_event();
        } else {
            eprintln!("cehif: early firmware event, indicator {:#x}", ind);
        }
    }

    /// Unmask the shared legacy line (firmware + all engines).
    pub(crate) fn legacy_irq_enable(&self) {
        self.bus.write32(
            PCIE_INTR_ENABLE_ADDRESS,
            PCIE_INTR_FIRMWARE_MASK | PCIE_INTR_CE_MASK_ALL,
        );
        // Read back to flush the posted write.
        let _ = self.bus.read32(PCIE_INTR_ENABLE_ADDRESS);
    }

    pub(crate) fn legacy_irq_disable(&self) {
        self.bus.write32(PCIE_INTR_ENABLE_ADDRESS, 0);
        let _ = self.bus.read32(PCIE_INTR_ENABLE_ADDRESS);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::{Arc, Mutex};

    use cehif_core::bus::TargetBus;
    use cehif_core::callbacks::{BufferId, TransportCallbacks};
    use cehif_core::regs::{RTC_STATE_ADDRESS, RTC_STATE_V_ON};
    use cehif_core::ring_mem::CeDesc;

    use crate::config::TransportConfig;
    use crate::device::CeTransport;

    /// Always-awake bus with inert registers.
    struct IdleBus;

    impl TargetBus for IdleBus {
        fn read32(&self, addr: u32) -> u32 {
            if addr == RTC_STATE_ADDRESS {
                RTC_STATE_V_ON
            } else {
                0
            }
        }
        fn write32(&self, _addr: u32, _val: u32) {}
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(char, u8, u32)>>,
    }

    impl TransportCallbacks for Recorder {
        fn tx_complete(&self, buf: BufferId, _transfer_id: u16) {
            self.events.lock().unwrap().push(('t', 0, buf.0));
        }
        fn rx_data(&self, buf: BufferId, _nbytes: usize, pipe_id: u8) {
            self.events.lock().unwrap().push(('r', pipe_id, buf.0));
        }
        fn fw_event(&self) {
            self.events.lock().unwrap().push(('f', 0, 0));
        }
    }

    fn harness() -> (CeTransport, Arc<Recorder>) {
        let arena = Arc::new(cehif_core::dma::DmaArena::new(4 << 20).unwrap());
        let t = CeTransport::new(Arc::new(IdleBus), arena, TransportConfig::default()).unwrap();
        let rec = Arc::new(Recorder::default());
        t.start(rec.clone()).unwrap();
        (t, rec)
    }

    /// Pretend the target consumed `n` entries of a ring, optionally
    /// writing back a fill length.
    fn consume(t: &CeTransport, ce: u8, dir: crate::ring::RingDir, n: u32, fill: Option<u32>) {
        let mem = t.ring_mem(ce, dir).unwrap();
        for _ in 0..n {
            let r = mem.read_index().load(Ordering::Relaxed);
            if let Some(len) = fill {
                let d = mem.read_desc(r);
                mem.write_desc(r, CeDesc::new(d.addr, len, d.transfer_id(), 0));
            }
            mem.read_index().store(r.wrapping_add(1), Ordering::Release);
        }
    }

    #[test]
    fn test_send_completion_restores_credit_and_fires_once() {
        let (t, rec) = harness();
        let buf = t.alloc_tx_buffer(0).unwrap();
        t.submit(0, buf, 32, 7).unwrap();
        assert_eq!(t.free_queue_depth(0).unwrap(), 14);

        consume(&t, 0, crate::ring::RingDir::Src, 1, None);
        t.core().per_engine_service(0);

        assert_eq!(t.free_queue_depth(0).unwrap(), 15);
        let ev = rec.events.lock().unwrap();
        assert_eq!(ev.as_slice(), &[('t', 0, buf.0)]);
    }

    #[test]
    fn test_recv_replenishes_before_delivery() {
        let (t, rec) = harness();
        // CE2 starts with dest_nentries-1 = 31 posted buffers.
        let dest = t.ring_mem(2, crate::ring::RingDir::Dest).unwrap();
        assert_eq!(dest.pending(), 31);

        consume(&t, 2, crate::ring::RingDir::Dest, 1, Some(128));
        t.core().per_engine_service(2);

        // One consumed, one reposted: ring is full again.
        assert_eq!(
            dest.write_index().load(Ordering::Relaxed)
                .wrapping_sub(dest.read_index().load(Ordering::Relaxed)),
            31
        );
        let ev = rec.events.lock().unwrap();
        assert_eq!(ev.len(), 1);
        assert_eq!(ev[0].0, 'r');
        assert_eq!(ev[0].1, 2);
    }

    #[test]
    fn test_completions_dispatch_in_reap_order() {
        let (t, rec) = harness();
        let b0 = t.alloc_tx_buffer(0).unwrap();
        let b3 = t.alloc_tx_buffer(3).unwrap();
        t.submit(0, b0, 16, 1).unwrap();
        t.submit(3, b3, 16, 2).unwrap();

        consume(&t, 0, crate::ring::RingDir::Src, 1, None);
        consume(&t, 3, crate::ring::RingDir::Src, 1, None);
        // Service order defines FIFO order.
        t.core().per_engine_service(3);
        t.core().per_engine_service(0);

        let ev = rec.events.lock().unwrap();
        assert_eq!(ev.as_slice(), &[('t', 0, b3.0), ('t', 0, b0.0)]);
    }

    #[test]
    fn test_sendlist_fragments_credit_without_callback() {
        let (t, rec) = harness();
        let b = t.alloc_tx_buffer(3).unwrap();
        t.submit_list(3, &[(b, 100), (b, 50)], 9).unwrap();
        assert_eq!(t.free_queue_depth(3).unwrap(), 31 - 2);

        consume(&t, 3, crate::ring::RingDir::Src, 2, None);
        t.core().per_engine_service(3);

        assert_eq!(t.free_queue_depth(3).unwrap(), 31);
        // One callback for the whole list, on the final fragment.
        let ev = rec.events.lock().unwrap();
        assert_eq!(ev.as_slice(), &[('t', 0, b.0)]);
    }
}
