//! # cehif-core — shared definitions for the Copy Engine transport
//!
//! Everything that BOTH sides of the interconnect must agree on lives in
//! this crate: the descriptor/ring memory layout, the register map, the
//! per-pipe attribute tables and the service-to-pipe map, plus the trait
//! boundaries between the host transport and its collaborators.
//!
//! ## Design principle
//!
//! > "Program to the interface. The host transport never names a concrete
//! >  target — it sees a `TargetBus`, raises work through an `IrqSink`,
//! >  and reports upward through `TransportCallbacks`."
//!
//! The host-side logic is in `cehif-transport`; a software model of the
//! target (register file + copy engines) is in `cehif-sim`.

pub mod bus;
pub mod callbacks;
pub mod config;
pub mod dma;
pub mod error;
pub mod regs;
pub mod ring_mem;
pub mod service;
