//! Target bus abstraction.
//!
//! The host transport never touches target hardware directly; every
//! register access goes through a `TargetBus`, and every interrupt the
//! target raises arrives through an `IrqSink` the host registers.
//!
//! # Implementors
//!
//! - `cehif-sim::SimTarget` — software register file + copy engines,
//!   used by tests and the smoke binary.
//! - A memory-mapped BAR window on real hardware.

/// Memory-mapped register access to the target.
///
/// **Contract:**
/// - Accesses are 32-bit, naturally aligned.
/// - Reads may be used to flush posted writes (read-after-write ordering
///   is preserved per address).
/// - Callers must hold the target awake (see the wake gate in
///   `cehif-transport`) for any access that the target services from its
///   sleepable domain.
pub trait TargetBus: Send + Sync {
    fn read32(&self, addr: u32) -> u32;
    fn write32(&self, addr: u32, val: u32);
}

/// Interrupt delivery from the target into the host.
///
/// Methods are called from the target's own context (the hardware
/// interrupt analogue) and must do minimal work: mask and schedule,
/// never block, never call back into the raiser.
pub trait IrqSink: Send + Sync {
    /// Shared legacy line: all sources multiplexed onto one handler.
    fn legacy_line(&self);
    /// Per-engine vector for one copy engine.
    fn ce_vector(&self, ce_id: u32);
    /// Dedicated firmware-event vector.
    fn fw_vector(&self);
}

/// Interrupt topology, chosen at configure time and mirrored by the
/// target side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqMode {
    /// One shared line; the handler masks all sources and one deferred
    /// task services everything.
    Legacy,
    /// One vector per copy engine plus one for firmware events.
    MsiPerEngine,
}
