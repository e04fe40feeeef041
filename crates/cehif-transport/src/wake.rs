//! Refcounted target wake gate.
//!
//! Register access is only safe while the target's power domain is up.
//! Every accessor takes a `WakeGuard`; the first guard asserts the wake
//! request and verifies the target actually came up, the last one drops
//! the request and lets the target sleep again.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cehif_core::bus::TargetBus;
use cehif_core::error::{CeError, Result};
use cehif_core::regs::{
    rtc_state_v, PCIE_SOC_WAKE_ADDRESS, RTC_STATE_ADDRESS, RTC_STATE_V_ON, PCIE_SOC_WAKE_RESET,
    PCIE_SOC_WAKE_V_MASK,
};

pub struct WakeGate {
    bus: Arc<dyn TargetBus>,
    /// Outstanding wake requests.
    count: AtomicU32,
    /// Set once the target has been seen awake for the current assertion.
    verified: AtomicBool,
    timeout_us: u64,
}

/// Holds one wake reference; dropping it releases the reference and, at
/// zero, lets the target sleep.
pub struct WakeGuard<'a> {
    gate: &'a WakeGate,
}

impl WakeGate {
    pub fn new(bus: Arc<dyn TargetBus>, timeout_us: u64) -> Self {
        Self {
            bus,
            count: AtomicU32::new(0),
            verified: AtomicBool::new(false),
            timeout_us,
        }
    }

    fn target_is_awake(&self) -> bool {
        rtc_state_v(self.bus.read32(RTC_STATE_ADDRESS)) == RTC_STATE_V_ON
    }

    /// Take a wake reference, asserting the wake request on 0 -> 1 and
    /// waiting (bounded, with a growing poll interval) until the target
    /// reports awake.
    pub fn keep_awake(&self) -> Result<WakeGuard<'_>> {
        if self.count.fetch_add(1, Ordering::AcqRel) == 0 {
            self.bus.write32(PCIE_SOC_WAKE_ADDRESS, PCIE_SOC_WAKE_V_MASK);
        }

        if !self.verified.load(Ordering::Acquire) {
            let mut waited_us: u64 = 0;
            let mut interval_us: u64 = 5;
            loop {
                if self.target_is_awake() {
                    self.verified.store(true, Ordering::Release);
                    break;
                }
                if waited_us >= self.timeout_us {
                    // Unwind our reference before failing.
                    self.release();
                    return Err(CeError::Timeout { what: "target wakeup" });
                }
                thread::sleep(Duration::from_micros(interval_us));
                waited_us += interval_us;
                if interval_us < 50 {
                    interval_us += 5;
                }
            }
        }
        Ok(WakeGuard { gate: self })
    }

    fn release(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.verified.store(false, Ordering::Release);
            self.bus.write32(PCIE_SOC_WAKE_ADDRESS, PCIE_SOC_WAKE_RESET);
        }
    }

    #[cfg(test)]
    fn refcount(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }
}

impl Drop for WakeGuard<'_> {
    fn drop(&mut self) {
        self.gate.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Bus double that models wake latency: reports ON only after the
    /// wake request has been asserted and polled a few times.
    struct SlowWakeBus {
        state: Mutex<SlowWakeState>,
    }

    struct SlowWakeState {
        asserted: bool,
        polls: u32,
        polls_needed: u32,
        wake_writes: u32,
        sleep_writes: u32,
    }

    impl SlowWakeBus {
        fn new(polls_needed: u32) -> Self {
            Self {
                state: Mutex::new(SlowWakeState {
                    asserted: false,
                    polls: 0,
                    polls_needed,
                    wake_writes: 0,
                    sleep_writes: 0,
                }),
            }
        }
    }

    impl TargetBus for SlowWakeBus {
        fn read32(&self, addr: u32) -> u32 {
            let mut s = self.state.lock().unwrap();
            if addr == RTC_STATE_ADDRESS && s.asserted {
                s.polls += 1;
                if s.polls > s.polls_needed {
                    return RTC_STATE_V_ON;
                }
            }
            0
        }

        fn write32(&self, addr: u32, val: u32) {
            let mut s = self.state.lock().unwrap();
            if addr == PCIE_SOC_WAKE_ADDRESS {
                if val & PCIE_SOC_WAKE_V_MASK != 0 {
                    s.asserted = true;
                    s.wake_writes += 1;
                } else {
                    s.asserted = false;
                    s.polls = 0;
                    s.sleep_writes += 1;
                }
            }
        }
    }

    #[test]
    fn test_nested_guards_single_assert() {
        let bus = Arc::new(SlowWakeBus::new(2));
        let gate = WakeGate::new(bus.clone(), 100_000);

        let g1 = gate.keep_awake().unwrap();
        let g2 = gate.keep_awake().unwrap();
        assert_eq!(gate.refcount(), 2);
        {
            let s = bus.state.lock().unwrap();
            assert_eq!(s.wake_writes, 1);
            assert_eq!(s.sleep_writes, 0);
        }

        drop(g2);
        assert_eq!(bus.state.lock().unwrap().sleep_writes, 0);
        drop(g1);
        let s = bus.state.lock().unwrap();
        assert_eq!(s.sleep_writes, 1);
        assert!(!s.asserted);
    }

    #[test]
    fn test_reassert_after_sleep() {
        let bus = Arc::new(SlowWakeBus::new(1));
        let gate = WakeGate::new(bus.clone(), 100_000);

        drop(gate.keep_awake().unwrap());
        drop(gate.keep_awake().unwrap());
        let s = bus.state.lock().unwrap();
        assert_eq!(s.wake_writes, 2);
        assert_eq!(s.sleep_writes, 2);
    }

    #[test]
    fn test_wake_timeout_unwinds_refcount() {
        // Never reports awake.
        let bus = Arc::new(SlowWakeBus::new(u32::MAX));
        let gate = WakeGate::new(bus.clone(), 200);

        assert!(matches!(
            gate.keep_awake(),
            Err(CeError::Timeout { what: "target wakeup" })
        ));
        assert_eq!(gate.refcount(), 0);
        // The failed attempt released the wake request.
        assert!(!bus.state.lock().unwrap().asserted);
    }
}
