//! # cehif-transport — host side of the Copy Engine interconnect
//!
//! Moves opaque byte buffers between the host and an attached
//! co-processor over shared-memory descriptor rings. One `CeTransport`
//! owns the full pipe set for one device:
//!
//! ```text
//! upper layer ──submit──▶ Pipe ──▶ source ring ──▶ target
//! target ──▶ dest ring ──▶ irq ──▶ tasklet ──▶ completion FIFO
//!                                   └──▶ callbacks (tx/rx/fw-event)
//! ```
//!
//! Concurrency model: interrupt-context entry points (`IrqSink`) only
//! mask and schedule; a dedicated tasklet thread reaps ring completions
//! and drains the device-wide completion FIFO; caller threads submit and
//! run the synchronous diagnostic channel. Pipe state sits behind
//! pipe-local locks, the completion FIFO is its own domain, and the two
//! are never held together.

pub mod completion;
pub mod config;
pub mod device;
pub mod diag;
pub mod irq;
pub mod pipe;
pub mod ring;
pub mod wake;

pub use config::TransportConfig;
pub use device::{CeTransport, StatsSnapshot};
pub use irq::IrqDispatcher;
