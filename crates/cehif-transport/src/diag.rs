//! Synchronous diagnostic window.
//!
//! A side channel into target memory that works without the interrupt
//! path: each chunk is staged through a host bounce buffer, pushed
//! through the diagnostic pipe's ring pair, and reaped by bounded
//! busy-polling. Addresses below `DRAM_BASE_ADDRESS` are registers and
//! are accessed directly over the bus instead, 4-byte aligned only.
//!
//! One transfer at a time: callers serialize on `diag_lock`, and the
//! poll loops assume every reaped completion belongs to the current
//! chunk (verified against address and length).

use std::thread;

use cehif_core::callbacks::TransferCtx;
use cehif_core::config::{DIAG_CE_ID, DIAG_TRANSFER_LIMIT};
use cehif_core::error::{CeError, Result};
use cehif_core::regs::{DRAM_BASE_ADDRESS, HI_FAILURE_STATE, REG_DUMP_COUNT};
use cehif_core::ring_mem::CeDesc;

use crate::device::DeviceCore;
use crate::ring::CeRing;

impl DeviceCore {
    fn diag_rings(&self) -> (&CeRing, &CeRing) {
        let pipe = &self.pipes[DIAG_CE_ID as usize];
        // The diagnostic pipe always has both rings.
        (pipe.src.as_ref().unwrap(), pipe.dest.as_ref().unwrap())
    }

    /// Busy-poll one ring until the current chunk's completion shows up,
    /// verifying it describes the expected transfer.
    fn diag_poll(&self, ring: &CeRing, expect_addr: u32, expect_len: u32, what: &'static str) -> Result<()> {
        let mut polls = 0;
        loop {
            if let Some((ctx, desc)) = ring.completed_next() {
                debug_assert_eq!(ctx, TransferCtx::Diag);
                if desc.addr != expect_addr || desc.nbytes != expect_len {
                    return Err(CeError::ProtocolMismatch {
                        pipe: DIAG_CE_ID,
                        expected_addr: expect_addr,
                        got_addr: desc.addr,
                        expected_len: expect_len,
                        got_len: desc.nbytes,
                    });
                }
                return Ok(());
            }
            polls += 1;
            if polls > self.cfg.diag_poll_limit {
                return Err(CeError::Timeout { what });
            }
            thread::sleep(self.cfg.diag_poll_interval);
        }
    }

    /// Read `nbytes` of target memory at `address`.
    pub fn diag_read_mem(&self, address: u32, nbytes: usize) -> Result<Vec<u8>> {
        if address < DRAM_BASE_ADDRESS {
            return self.diag_read_regs(address, nbytes);
        }

        let _serial = self.diag_lock.lock().unwrap();
        let (src, dest) = self.diag_rings();
        let mut out = vec![0u8; nbytes];
        let mut done = 0usize;
        while done < nbytes {
            let n = (nbytes - done).min(DIAG_TRANSFER_LIMIT as usize) as u32;
            let target = address + done as u32;

            // Landing buffer first, then the copy request that fills it.
            dest.enqueue(CeDesc::new(self.diag_bounce, n, 0, 0), TransferCtx::Diag)?;
            src.enqueue(CeDesc::new(target, n, 0, 0), TransferCtx::Diag)?;

            self.diag_poll(src, target, n, "diag read send completion")?;
            self.diag_poll(dest, self.diag_bounce, n, "diag read recv completion")?;

            self.arena.read(self.diag_bounce, &mut out[done..done + n as usize]);
            done += n as usize;
        }
        Ok(out)
    }

    /// Write `data` into target memory at `address`.
    pub fn diag_write_mem(&self, address: u32, data: &[u8]) -> Result<()> {
        if address < DRAM_BASE_ADDRESS {
            return self.diag_write_regs(address, data);
        }

        let _serial = self.diag_lock.lock().unwrap();
        let (src, dest) = self.diag_rings();
        let mut done = 0usize;
        while done < data.len() {
            let n = (data.len() - done).min(DIAG_TRANSFER_LIMIT as usize) as u32;
            let target = address + done as u32;

            self.arena.write(self.diag_bounce, &data[done..done + n as usize]);
            dest.enqueue(CeDesc::new(target, n, 0, 0), TransferCtx::Diag)?;
            src.enqueue(CeDesc::new(self.diag_bounce, n, 0, 0), TransferCtx::Diag)?;

            self.diag_poll(src, self.diag_bounce, n, "diag write send completion")?;
            self.diag_poll(dest, target, n, "diag write recv completion")?;

            done += n as usize;
        }
        Ok(())
    }

    /// Register-space read: direct bus access under a wake reference.
    fn diag_read_regs(&self, address: u32, nbytes: usize) -> Result<Vec<u8>> {
        if address % 4 != 0 || nbytes % 4 != 0 {
            return Err(CeError::Unaligned(address));
        }
        let _wake = self.wake.keep_awake()?;
        let mut out = Vec::with_capacity(nbytes);
        for i in (0..nbytes).step_by(4) {
            out.extend_from_slice(&self.bus.read32(address + i as u32).to_le_bytes());
        }
        Ok(out)
    }

    fn diag_write_regs(&self, address: u32, data: &[u8]) -> Result<()> {
        if address % 4 != 0 || data.len() % 4 != 0 {
            return Err(CeError::Unaligned(address));
        }
        let _wake = self.wake.keep_awake()?;
        for (i, w) in data.chunks_exact(4).enumerate() {
            let val = u32::from_le_bytes([w[0], w[1], w[2], w[3]]);
            self.bus.write32(address + 4 * i as u32, val);
        }
        Ok(())
    }

    pub fn diag_read32(&self, address: u32) -> Result<u32> {
        let bytes = self.diag_read_mem(address, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn diag_write32(&self, address: u32, value: u32) -> Result<()> {
        self.diag_write_mem(address, &value.to_le_bytes())
    }

    /// On a firmware event, pull the crash area out of target DRAM and
    /// log it before notifying the upper layer.
    pub(crate) fn dump_crash_area(&self) {
        let area = match self.diag_read32(HI_FAILURE_STATE) {
            Ok(a) => a,
            Err(e) => {
                eprintln!("cehif: failure-state pointer unreadable: {}", e);
                return;
            }
        };
        if area == 0 {
            return;
        }
        match self.diag_read_mem(area, REG_DUMP_COUNT * 4) {
            Ok(bytes) => {
                let words: Vec<String> = bytes
                    .chunks_exact(4)
                    .map(|w| format!("{:#010x}", u32::from_le_bytes([w[0], w[1], w[2], w[3]])))
                    .collect();
                eprintln!("cehif: target crash dump at {:#x}: {}", area, words.join(" "));
            }
            Err(e) => eprintln!("cehif: crash dump read failed: {}", e),
        }
    }
}
