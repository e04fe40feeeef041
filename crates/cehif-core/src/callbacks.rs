//! Upper-layer callback boundary and transfer-context handles.
//!
//! The ring never owns buffer memory: it carries a `TransferCtx` per
//! occupied slot, and the context is a typed handle into a fixed buffer
//! slab, reclaimed by the upper layer (or by teardown) after the
//! completion fires.

/// Handle into a pipe's buffer slab. Pool-local: pair it with the pipe id
/// when crossing the callback boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferId(pub u32);

/// Per-slot context carried through a descriptor ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferCtx {
    /// A caller buffer; the callback reports this handle.
    Buffer(BufferId),
    /// Intermediate sendlist fragment. Completion only restores one send
    /// credit; no callback fires.
    SendlistItem,
    /// Diagnostic-window transfer, reaped synchronously by the caller.
    Diag,
}

/// Completion delivery to the upper transport/message layers.
///
/// **Contract:**
/// - Invoked from deferred (non-interrupt) context, strictly FIFO in
///   hardware completion order across the whole device.
/// - `rx_data` hands over ownership of `buf`; the receiver must return
///   it to the pipe when done.
/// - `tx_complete` fires exactly once per accepted submission (once per
///   logical sendlist, on its final fragment).
/// - `fw_event` reports a target-side fatal/asynchronous event.
pub trait TransportCallbacks: Send + Sync {
    fn tx_complete(&self, buf: BufferId, transfer_id: u16);
    fn rx_data(&self, buf: BufferId, nbytes: usize, pipe_id: u8);
    fn fw_event(&self);
}

/// Discards everything. For tests and pre-registration windows.
pub struct NullCallbacks;

impl TransportCallbacks for NullCallbacks {
    fn tx_complete(&self, _buf: BufferId, _transfer_id: u16) {}
    fn rx_data(&self, _buf: BufferId, _nbytes: usize, _pipe_id: u8) {}
    fn fw_event(&self) {}
}
