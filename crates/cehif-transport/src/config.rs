//! Transport tuning knobs.

use std::time::Duration;

use cehif_core::bus::IrqMode;
use cehif_core::config::{CeAttr, CE_COUNT, HOST_CE_CONFIG};

/// Configuration for one `CeTransport` instance.
///
/// `Default` gives the production shape; tests shrink rings or swap the
/// interrupt topology through the builder setters.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Interrupt delivery topology.
    pub irq_mode: IrqMode,
    /// Per-pipe ring shapes. Entry counts must be powers of two.
    pub ce_config: [CeAttr; CE_COUNT],
    /// `send_complete_check` skips the ring scan while more than this
    /// percentage of the send window is still free.
    pub complete_check_threshold_pct: u32,
    /// Upper bound on waiting for the target to report awake.
    pub wake_timeout_us: u64,
    /// Polling iterations per diagnostic descriptor completion.
    pub diag_poll_limit: u32,
    /// Delay between diagnostic polling iterations.
    pub diag_poll_interval: Duration,
    /// Attempts when waiting for the firmware-initialized indicator.
    pub fw_init_retries: u32,
    pub fw_init_interval: Duration,
    /// Receive buffers per pipe, as a multiple of `dest_nentries`.
    pub rx_pool_factor: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            irq_mode: IrqMode::Legacy,
            ce_config: HOST_CE_CONFIG,
            complete_check_threshold_pct: 50,
            wake_timeout_us: 20_000,
            diag_poll_limit: 100,
            diag_poll_interval: Duration::from_millis(1),
            fw_init_retries: 300,
            fw_init_interval: Duration::from_millis(10),
            rx_pool_factor: 2,
        }
    }
}

impl TransportConfig {
    pub fn with_irq_mode(mut self, mode: IrqMode) -> Self {
        self.irq_mode = mode;
        self
    }

    pub fn with_ce_config(mut self, cfg: [CeAttr; CE_COUNT]) -> Self {
        self.ce_config = cfg;
        self
    }

    pub fn with_complete_check_threshold_pct(mut self, pct: u32) -> Self {
        self.complete_check_threshold_pct = pct;
        self
    }

    pub fn with_wake_timeout_us(mut self, us: u64) -> Self {
        self.wake_timeout_us = us;
        self
    }

    pub fn with_rx_pool_factor(mut self, factor: u32) -> Self {
        self.rx_pool_factor = factor;
        self
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.complete_check_threshold_pct == 0 || self.complete_check_threshold_pct > 100 {
            return Err("complete_check_threshold_pct must be in 1..=100");
        }
        if self.rx_pool_factor == 0 {
            return Err("rx_pool_factor must be at least 1");
        }
        if self.diag_poll_limit == 0 {
            return Err("diag_poll_limit must be at least 1");
        }
        for attr in &self.ce_config {
            for n in [attr.src_nentries, attr.dest_nentries] {
                if n != 0 && !n.is_power_of_two() {
                    return Err("ring entry counts must be powers of two");
                }
            }
            if (attr.src_nentries > 0 || attr.dest_nentries > 0) && attr.buf_sz == 0 {
                return Err("active pipes need a nonzero buffer size");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        assert!(TransportConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_non_power_of_two_ring() {
        let mut cfg = TransportConfig::default();
        cfg.ce_config[0].src_nentries = 24;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_threshold() {
        let cfg = TransportConfig::default().with_complete_check_threshold_pct(0);
        assert!(cfg.validate().is_err());
    }
}
