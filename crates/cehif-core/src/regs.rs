//! Target register map.
//!
//! Addresses below [`DRAM_BASE_ADDRESS`] are register space and are reached
//! with direct `TargetBus` accesses; addresses at or above it are target
//! DRAM and are reached through the diagnostic copy engine.
//!
//! The layout is fixed and must match the target firmware. Changing any
//! value here requires a matching firmware change.

/// Start of target DRAM in target address space.
pub const DRAM_BASE_ADDRESS: u32 = 0x0010_0000;
/// Size of target DRAM modeled by the software target.
pub const DRAM_SIZE: u32 = 0x0010_0000;

// ── PCIe local registers (wake/sleep handshake) ──────────────────────

pub const PCIE_LOCAL_BASE_ADDRESS: u32 = 0x0008_0000;

/// RTC power state, read-only from the host.
pub const RTC_STATE_ADDRESS: u32 = PCIE_LOCAL_BASE_ADDRESS + 0x0000;
pub const RTC_STATE_V_MASK: u32 = 0x7;
pub const RTC_STATE_V_ON: u32 = 3;

/// SoC wake request, write-only from the host.
pub const PCIE_SOC_WAKE_ADDRESS: u32 = PCIE_LOCAL_BASE_ADDRESS + 0x0004;
pub const PCIE_SOC_WAKE_V_MASK: u32 = 1;
pub const PCIE_SOC_WAKE_RESET: u32 = 0;

pub fn rtc_state_v(val: u32) -> u32 {
    val & RTC_STATE_V_MASK
}

// ── SoC core registers (interrupts, target CPU control) ─────────────

pub const SOC_CORE_BASE_ADDRESS: u32 = 0x0009_0000;

pub const CORE_CTRL_ADDRESS: u32 = SOC_CORE_BASE_ADDRESS + 0x0000;
/// Raises an interrupt on the target CPU when set.
pub const CORE_CTRL_CPU_INTR_MASK: u32 = 0x0000_4000;

pub const PCIE_INTR_ENABLE_ADDRESS: u32 = SOC_CORE_BASE_ADDRESS + 0x0008;
pub const PCIE_INTR_CLR_ADDRESS: u32 = SOC_CORE_BASE_ADDRESS + 0x0014;

pub const PCIE_INTR_FIRMWARE_MASK: u32 = 0x0000_0400;
/// One bit per copy engine, CE0 at bit 11.
pub const PCIE_INTR_CE_MASK_ALL: u32 = 0x0007_f800;

pub fn pcie_intr_ce_bit(ce_id: u32) -> u32 {
    1 << (11 + ce_id)
}

// ── Firmware indicator ───────────────────────────────────────────────

pub const FW_INDICATOR_ADDRESS: u32 = SOC_CORE_BASE_ADDRESS + 0x0040;
pub const FW_IND_EVENT_PENDING: u32 = 0x1;
pub const FW_IND_INITIALIZED: u32 = 0x2;

// ── Host-interest area (fixed DRAM addresses) ───────────────────────
//
// The firmware publishes bring-up pointers at fixed DRAM offsets; the host
// reads them through the diagnostic window before normal operation starts.

pub const HI_INTERCONNECT_STATE: u32 = DRAM_BASE_ADDRESS + 0x40;
pub const HI_FAILURE_STATE: u32 = DRAM_BASE_ADDRESS + 0x44;
pub const HI_EARLY_ALLOC: u32 = DRAM_BASE_ADDRESS + 0x48;
pub const HI_OPTION_FLAG2: u32 = DRAM_BASE_ADDRESS + 0x4c;

pub const HI_EARLY_ALLOC_MAGIC: u32 = 0x6d8a;
pub const HI_EARLY_ALLOC_MAGIC_SHIFT: u32 = 16;
pub const HI_EARLY_ALLOC_IRAM_BANKS_SHIFT: u32 = 0;
pub const HI_OPTION_EARLY_CFG_DONE: u32 = 0x1;

/// Offsets into the target's interconnect (pcie_state) block.
pub const PCIE_STATE_PIPE_CFG_OFFSET: u32 = 0x0;
pub const PCIE_STATE_SVC_MAP_OFFSET: u32 = 0x4;
pub const PCIE_STATE_CONFIG_FLAGS_OFFSET: u32 = 0x8;

pub const PCIE_CONFIG_FLAG_ENABLE_L1: u32 = 0x1;

/// Number of words dumped from the target's failure-state area.
pub const REG_DUMP_COUNT: usize = 8;
