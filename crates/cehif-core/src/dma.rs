//! `DmaArena` — the DMA-visible memory region shared with the target.
//!
//! One page-aligned anonymous mapping stands in for DMA-coherent memory.
//! A "bus address" is `DMA_BUS_BASE + offset`; both the host transport
//! (which owns buffers) and the target (which DMAs into/out of them)
//! resolve descriptor addresses through the same arena.
//!
//! Allocation is a bump pointer: every slab and bounce buffer is carved
//! out once at device init, so there is no free path and no allocator on
//! the hot path. Buffer reuse happens above this layer, in fixed pools of
//! `BufferId` handles.
//!
//! Bus addresses start above the register window and above target DRAM,
//! so the three address ranges never collide and any descriptor address
//! resolves unambiguously by value alone.

use crate::error::{CeError, Result};

use std::ptr;
use std::sync::Mutex;

/// Base bus address of the arena, clear of the register window and of
/// target DRAM (`DRAM_BASE_ADDRESS + DRAM_SIZE`).
pub const DMA_BUS_BASE: u32 = 0x0100_0000;

pub struct DmaArena {
    base: *mut u8,
    len: usize,
    /// Bump offset for `alloc`.
    next: Mutex<usize>,
}

// Safety: the mapping lives as long as the arena. Concurrent access to a
// buffer's bytes is governed by ring ownership (a slot belongs to exactly
// one side between publish and completion), the same discipline real DMA
// hardware relies on.
unsafe impl Send for DmaArena {}
unsafe impl Sync for DmaArena {}

impl DmaArena {
    /// Map a new arena of at least `len` bytes (rounded up to pages).
    pub fn new(len: usize) -> Result<Self> {
        let len = (len + 4095) & !4095;
        // Every byte must have a representable bus address.
        if DMA_BUS_BASE as u64 + len as u64 > u32::MAX as u64 + 1 {
            return Err(CeError::NoDmaMemory);
        }
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(CeError::MmapFailed(unsafe { *libc::__errno_location() }));
        }
        Ok(Self {
            base: ptr as *mut u8,
            len,
            next: Mutex::new(0),
        })
    }

    /// Carve `size` bytes (4-byte aligned minimum) out of the arena.
    /// Returns the bus address of the allocation.
    pub fn alloc(&self, size: usize, align: usize) -> Result<u32> {
        let align = align.max(4);
        let mut next = self.next.lock().unwrap();
        let start = (*next + align - 1) & !(align - 1);
        let end = start.checked_add(size).ok_or(CeError::NoDmaMemory)?;
        if end > self.len {
            return Err(CeError::NoDmaMemory);
        }
        *next = end;
        Ok(DMA_BUS_BASE + start as u32)
    }

    /// True if `addr..addr+len` lies inside the arena.
    pub fn contains(&self, addr: u32, len: usize) -> bool {
        let Some(off) = addr.checked_sub(DMA_BUS_BASE) else {
            return false;
        };
        (off as usize)
            .checked_add(len)
            .map(|end| end <= self.len)
            .unwrap_or(false)
    }

    fn offset_of(&self, addr: u32, len: usize) -> usize {
        assert!(self.contains(addr, len), "bus address {:#x}+{} outside arena", addr, len);
        (addr - DMA_BUS_BASE) as usize
    }

    /// Copy bytes out of the arena.
    pub fn read(&self, addr: u32, out: &mut [u8]) {
        let off = self.offset_of(addr, out.len());
        unsafe {
            ptr::copy_nonoverlapping(self.base.add(off), out.as_mut_ptr(), out.len());
        }
    }

    /// Copy bytes into the arena.
    pub fn write(&self, addr: u32, data: &[u8]) {
        let off = self.offset_of(addr, data.len());
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.base.add(off), data.len());
        }
    }

    /// Zero a range.
    pub fn clear(&self, addr: u32, len: usize) {
        let off = self.offset_of(addr, len);
        unsafe {
            ptr::write_bytes(self.base.add(off), 0, len);
        }
    }
}

impl Drop for DmaArena {
    fn drop(&mut self) {
        if !self.base.is_null() && self.len > 0 {
            unsafe {
                libc::munmap(self.base as *mut libc::c_void, self.len);
            }
            self.base = ptr::null_mut();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::{DRAM_BASE_ADDRESS, DRAM_SIZE};

    #[test]
    fn test_alloc_and_roundtrip() {
        let arena = DmaArena::new(8192).unwrap();
        let a = arena.alloc(256, 4).unwrap();
        let b = arena.alloc(256, 4).unwrap();
        assert_ne!(a, b);
        assert!(arena.contains(a, 256));

        arena.write(a, &[0xaa; 256]);
        arena.write(b, &[0xbb; 256]);

        let mut buf = [0u8; 256];
        arena.read(a, &mut buf);
        assert_eq!(buf, [0xaa; 256]);
        arena.read(b, &mut buf);
        assert_eq!(buf, [0xbb; 256]);
    }

    #[test]
    fn test_alloc_exhaustion() {
        let arena = DmaArena::new(4096).unwrap();
        arena.alloc(4000, 4).unwrap();
        assert!(matches!(arena.alloc(200, 4), Err(CeError::NoDmaMemory)));
    }

    #[test]
    fn test_addresses_clear_of_registers_and_dram() {
        let arena = DmaArena::new(65536).unwrap();
        let a = arena.alloc(2048, 8).unwrap();
        assert!(a >= DRAM_BASE_ADDRESS + DRAM_SIZE);
        assert_eq!(a % 8, 0);
    }

    #[test]
    fn test_production_sized_arena_maps() {
        // Big enough for every pipe's pools plus the diagnostic bounce.
        let arena = DmaArena::new(8 << 20).unwrap();
        let a = arena.alloc(2048, 8).unwrap();
        assert!(arena.contains(a, 2048));
    }
}
