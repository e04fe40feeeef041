//! Transport error types.

use std::fmt;

#[derive(Debug)]
pub enum CeError {
    /// Pipe has no free send slot. Recoverable — caller backs off or drops.
    Busy,
    /// Descriptor ring has no free slot (same condition, one layer down).
    RingFull,
    /// A bounded wait expired. `what` names the wait, for bring-up logs.
    Timeout { what: &'static str },
    /// No free completion-state record; the completion was dropped.
    ResourceExhausted,
    /// Diagnostic completion did not match the request.
    ProtocolMismatch {
        pipe: u8,
        expected_addr: u32,
        got_addr: u32,
        expected_len: u32,
        got_len: u32,
    },
    /// Diagnostic access with bad alignment (register path is 4-byte only).
    Unaligned(u32),
    /// Service id with no pipe assignment.
    UnknownService(u16),
    /// Pipe id outside the configured engine set.
    UnknownPipe(u8),
    /// DMA arena could not satisfy an allocation.
    NoDmaMemory,
    /// Operation requires a started transport.
    NotStarted,
    /// mmap failed.
    MmapFailed(i32),
    /// Bring-up read produced an invalid (zero) target pointer.
    BadTargetPointer(&'static str),
    /// Rejected by `TransportConfig::validate`.
    InvalidConfig(&'static str),
}

impl fmt::Display for CeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy => write!(f, "pipe busy (no send credit)"),
            Self::RingFull => write!(f, "descriptor ring full"),
            Self::Timeout { what } => write!(f, "timeout waiting for {}", what),
            Self::ResourceExhausted => write!(f, "completion pool exhausted"),
            Self::ProtocolMismatch {
                pipe,
                expected_addr,
                got_addr,
                expected_len,
                got_len,
            } => write!(
                f,
                "diag completion mismatch on pipe {}: addr {:#x} (expected {:#x}) \
                 len {} (expected {})",
                pipe, got_addr, expected_addr, got_len, expected_len
            ),
            Self::Unaligned(addr) => write!(f, "unaligned diagnostic access at {:#x}", addr),
            Self::UnknownService(id) => write!(f, "no pipe mapping for service {}", id),
            Self::UnknownPipe(id) => write!(f, "no such pipe {}", id),
            Self::NoDmaMemory => write!(f, "DMA arena exhausted"),
            Self::NotStarted => write!(f, "transport not started"),
            Self::MmapFailed(e) => write!(f, "mmap failed: errno {}", e),
            Self::BadTargetPointer(what) => write!(f, "target reported null {} pointer", what),
            Self::InvalidConfig(what) => write!(f, "invalid configuration: {}", what),
        }
    }
}

impl std::error::Error for CeError {}

pub type Result<T> = std::result::Result<T, CeError>;
