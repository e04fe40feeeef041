//! Shared descriptor ring memory.
//!
//! One `SharedRingMem` is the memory both sides of the interconnect see
//! for one ring direction: a power-of-two descriptor array plus two
//! monotonically increasing indices.
//!
//! ```text
//! producer side:  claims slot (write_index & mask), fills the
//!                 descriptor, then publishes write_index + 1 (Release)
//! consumer side:  observes write_index (Acquire), services the slot,
//!                 may write back a result into the descriptor, then
//!                 publishes read_index + 1 (Release)
//! ```
//!
//! For a source ring the host produces and the target consumes; for a
//! destination ring the host produces empty buffers and the target
//! consumes them as it fills. In both cases the host reaps completions by
//! trailing `read_index` with its private `sw_index` (kept one layer up,
//! in `cehif-transport`).
//!
//! # Atomics
//!
//! Indices are u32 and wrap; the live count is `write - read` in wrapping
//! arithmetic. Descriptor slots are written with volatile stores before
//! the owning index is published with Release, so the other side never
//! observes a torn descriptor.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

/// One transfer descriptor as it appears in ring memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct CeDesc {
    /// Bus address of the data (arena buffer or target DRAM).
    pub addr: u32,
    /// Transfer length; on a destination ring the consumer writes back
    /// the number of bytes actually filled.
    pub nbytes: u32,
    /// Transfer id in the low half, flags in the high half.
    pub meta: u32,
}

/// Set on every sendlist fragment except the last.
pub const CE_FLAG_GATHER: u16 = 0x1;

impl CeDesc {
    pub fn new(addr: u32, nbytes: u32, transfer_id: u16, flags: u16) -> Self {
        Self {
            addr,
            nbytes,
            meta: (flags as u32) << 16 | transfer_id as u32,
        }
    }

    pub fn transfer_id(&self) -> u16 {
        self.meta as u16
    }

    pub fn flags(&self) -> u16 {
        (self.meta >> 16) as u16
    }
}

pub struct SharedRingMem {
    descs: Box<[UnsafeCell<CeDesc>]>,
    write_index: AtomicU32,
    read_index: AtomicU32,
    mask: u32,
}

// Safety: slots are exclusively owned by one side at a time — the
// producer between claim and publish, the consumer between observing the
// published index and advancing its own. Index publication uses
// Release/Acquire pairs.
unsafe impl Send for SharedRingMem {}
unsafe impl Sync for SharedRingMem {}

impl SharedRingMem {
    /// Allocate ring memory with `nentries` slots (power of two).
    pub fn new(nentries: u32) -> Self {
        assert!(
            nentries.is_power_of_two(),
            "ring entries must be a power of two, got {}",
            nentries
        );
        let descs = (0..nentries)
            .map(|_| UnsafeCell::new(CeDesc::new(0, 0, 0, 0)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            descs,
            write_index: AtomicU32::new(0),
            read_index: AtomicU32::new(0),
            mask: nentries - 1,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.mask + 1
    }

    pub fn mask(&self) -> u32 {
        self.mask
    }

    /// Producer position, monotonic.
    pub fn write_index(&self) -> &AtomicU32 {
        &self.write_index
    }

    /// Consumer position, monotonic.
    pub fn read_index(&self) -> &AtomicU32 {
        &self.read_index
    }

    /// Entries published but not yet consumed.
    pub fn pending(&self) -> u32 {
        self.write_index
            .load(Ordering::Acquire)
            .wrapping_sub(self.read_index.load(Ordering::Acquire))
    }

    /// Read the descriptor at a monotonic index.
    pub fn read_desc(&self, index: u32) -> CeDesc {
        let slot = (index & self.mask) as usize;
        unsafe { ptr::read_volatile(self.descs[slot].get()) }
    }

    /// Write the descriptor at a monotonic index.
    ///
    /// The caller must own the slot: either it is the producer and the
    /// slot is between `read_index` and an unpublished `write_index`, or
    /// it is the consumer writing back a result before advancing
    /// `read_index`.
    pub fn write_desc(&self, index: u32, desc: CeDesc) {
        let slot = (index & self.mask) as usize;
        unsafe { ptr::write_volatile(self.descs[slot].get(), desc) }
    }
}
