//! Copy Engine Transport End-to-End Smoke Test
//!
//! Walks the full stack against the software target:
//!   Part A — Bring-up: wake handshake, firmware init, config download
//!   Part B — Diagnostic window: word and bulk DRAM access
//!   Part C — Data path: echo traffic, gather sends, polled pipe
//!   Part D — Events and teardown: firmware event, cancel/revoke
//!
//! Run: ./target/release/cehif-smoke

use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use cehif_core::bus::{IrqMode, TargetBus};
use cehif_core::callbacks::{BufferId, TransportCallbacks};
use cehif_core::config::CE_COUNT;
use cehif_core::dma::DmaArena;
use cehif_core::error::CeError;
use cehif_core::regs::DRAM_BASE_ADDRESS;
use cehif_core::service::service_map_bytes;
use cehif_sim::{SimConfig, SimTarget, SIM_SVC_MAP_ADDR};
use cehif_transport::ring::RingDir;
use cehif_transport::{CeTransport, TransportConfig};

// ── Test harness ──

struct TestRunner {
    total: usize,
    passed: usize,
    failed: usize,
}

const LINE: &str = "────────────────────────────────────────────────────────────";

impl TestRunner {
    fn new() -> Self {
        Self { total: 0, passed: 0, failed: 0 }
    }

    fn section(&self, name: &str) {
        println!("\n{}", LINE);
        println!("  {}", name);
        println!("{}", LINE);
    }

    fn pass(&mut self, name: &str) {
        self.total += 1;
        self.passed += 1;
        println!("  [{:2}] {:<52} PASS", self.total, name);
    }

    fn fail(&mut self, name: &str, reason: &str) {
        self.total += 1;
        self.failed += 1;
        println!("  [{:2}] {:<52} FAIL: {}", self.total, name, reason);
    }

    fn check(&mut self, name: &str, ok: bool, reason: &str) {
        if ok { self.pass(name); } else { self.fail(name, reason); }
    }

    fn summary(&self) {
        println!("\n{}", LINE);
        println!(
            "  Total: {}  Passed: {}  Failed: {}",
            self.total, self.passed, self.failed
        );
        println!("{}", LINE);
    }
}

// ── Upper-layer double ──

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Tx(u16),
    Rx(u8, Vec<u8>),
    Fw,
}

struct Recorder {
    transport: Mutex<Option<Weak<CeTransport>>>,
    events: Mutex<Vec<Event>>,
}

impl Recorder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            transport: Mutex::new(None),
            events: Mutex::new(Vec::new()),
        })
    }

    fn upgrade(&self) -> Option<Arc<CeTransport>> {
        self.transport.lock().unwrap().as_ref().and_then(Weak::upgrade)
    }

    fn count(&self, f: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| f(*e)).count()
    }
}

impl TransportCallbacks for Recorder {
    fn tx_complete(&self, buf: BufferId, transfer_id: u16) {
        if let Some(t) = self.upgrade() {
            t.release_tx_buffer((transfer_id >> 8) as u8, buf);
        }
        self.events.lock().unwrap().push(Event::Tx(transfer_id));
    }

    fn rx_data(&self, buf: BufferId, nbytes: usize, pipe_id: u8) {
        let payload = match self.upgrade() {
            Some(t) => {
                let bytes = t.read_rx_buffer(pipe_id, buf, nbytes).unwrap_or_default();
                t.return_rx_buffer(pipe_id, buf);
                bytes
            }
            None => Vec::new(),
        };
        self.events.lock().unwrap().push(Event::Rx(pipe_id, payload));
    }

    fn fw_event(&self) {
        self.events.lock().unwrap().push(Event::Fw);
    }
}

fn tid(pipe: u8, seq: u16) -> u16 {
    (pipe as u16) << 8 | (seq & 0xff)
}

fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
    true
}

// ════════════════════════════════════════════════════════════
// Part A: Bring-up
// ════════════════════════════════════════════════════════════

fn bring_up(t: &mut TestRunner) -> (Arc<SimTarget>, Arc<CeTransport>, Arc<Recorder>) {
    t.section("Part A: Bring-up");

    let arena = Arc::new(DmaArena::new(8 << 20).expect("dma arena"));
    let sim = SimTarget::new(Arc::clone(&arena), SimConfig::default());
    let transport = Arc::new(
        CeTransport::new(
            sim.clone() as Arc<dyn TargetBus>,
            arena,
            TransportConfig::default().with_irq_mode(IrqMode::Legacy),
        )
        .expect("transport"),
    );

    for ce in 0..CE_COUNT as u8 {
        if let Some(mem) = transport.ring_mem(ce, RingDir::Src) {
            sim.attach_src_ring(ce, mem);
        }
        if let Some(mem) = transport.ring_mem(ce, RingDir::Dest) {
            sim.attach_dest_ring(ce, mem);
        }
    }
    let sink = transport.irq_sink();
    sim.set_irq_sink(&sink);
    sim.start();

    match transport.configure() {
        Ok(()) => t.pass("configure: fw init + config download"),
        Err(e) => t.fail("configure: fw init + config download", &e.to_string()),
    }
    t.check(
        "service map downloaded",
        sim.read_dram(SIM_SVC_MAP_ADDR, service_map_bytes().len()) == service_map_bytes(),
        "service map bytes differ",
    );
    t.check("target CPU kicked", sim.target_cpu_woken(), "no CPU interrupt");

    let recorder = Recorder::new();
    *recorder.transport.lock().unwrap() = Some(Arc::downgrade(&transport));
    match transport.start(recorder.clone()) {
        Ok(()) => t.pass("start: receive rings primed"),
        Err(e) => t.fail("start: receive rings primed", &e.to_string()),
    }
    t.check(
        "CE2 receive ring primed",
        transport.ring_mem(2, RingDir::Dest).map(|m| m.pending()) == Some(31),
        "expected 31 posted buffers",
    );

    (sim, transport, recorder)
}

// ════════════════════════════════════════════════════════════
// Part B: Diagnostic window
// ════════════════════════════════════════════════════════════

fn test_diag(t: &mut TestRunner, transport: &CeTransport, sim: &SimTarget) {
    t.section("Part B: Diagnostic window");

    let word_ok = transport
        .diag_write32(DRAM_BASE_ADDRESS, 0xddccbbaa)
        .and_then(|_| transport.diag_read32(DRAM_BASE_ADDRESS))
        .map(|v| v == 0xddccbbaa)
        .unwrap_or(false);
    t.check("word roundtrip through DRAM", word_ok, "mismatch");
    t.check(
        "target observed the write",
        sim.read_dram(DRAM_BASE_ADDRESS, 4) == vec![0xaa, 0xbb, 0xcc, 0xdd],
        "DRAM bytes differ",
    );

    let blob: Vec<u8> = (0..6000u32).map(|i| (i * 13) as u8).collect();
    let bulk_ok = transport
        .diag_write_mem(DRAM_BASE_ADDRESS + 0x8000, &blob)
        .and_then(|_| transport.diag_read_mem(DRAM_BASE_ADDRESS + 0x8000, blob.len()))
        .map(|v| v == blob)
        .unwrap_or(false);
    t.check("bulk transfer across chunk limit", bulk_ok, "mismatch");

    let unaligned = transport.diag_read_mem(0x0009_0002, 4);
    t.check(
        "register access rejects misalignment",
        matches!(unaligned, Err(CeError::Unaligned(_))),
        "expected Unaligned",
    );
}

// ════════════════════════════════════════════════════════════
// Part C: Data path
// ════════════════════════════════════════════════════════════

fn test_data_path(t: &mut TestRunner, transport: &Arc<CeTransport>, rec: &Arc<Recorder>) {
    t.section("Part C: Data path");

    let msg = b"smoke test payload".to_vec();
    let send_ok = transport
        .alloc_tx_buffer(3)
        .and_then(|buf| {
            transport.write_tx_buffer(3, buf, &msg)?;
            transport.submit(3, buf, msg.len() as u32, tid(3, 1))
        })
        .is_ok();
    t.check("submit on command pipe", send_ok, "submit failed");

    let echoed = wait_for(|| rec.count(|e| matches!(e, Event::Rx(2, _))) == 1);
    t.check("echo delivered on reply pipe", echoed, "no delivery");
    t.check(
        "payload intact",
        rec.events.lock().unwrap().contains(&Event::Rx(2, msg)),
        "payload differs",
    );
    let tx_done = wait_for(|| rec.count(|e| matches!(e, Event::Tx(_))) == 1);
    t.check("transmit completion fired", tx_done, "no completion");
    t.check(
        "send window restored",
        wait_for(|| matches!(transport.free_queue_depth(3), Ok(31))),
        "credits missing",
    );

    // Gather send.
    let mut intermediate = None;
    let gather_ok = (|| -> Result<(), CeError> {
        let b1 = transport.alloc_tx_buffer(3)?;
        let b2 = transport.alloc_tx_buffer(3)?;
        transport.write_tx_buffer(3, b1, b"gather|")?;
        transport.write_tx_buffer(3, b2, b"send")?;
        transport.submit_list(3, &[(b1, 7), (b2, 4)], tid(3, 2))?;
        intermediate = Some(b1);
        Ok(())
    })()
    .is_ok();
    t.check("sendlist accepted", gather_ok, "submit_list failed");
    let gathered = wait_for(|| {
        rec.events
            .lock()
            .unwrap()
            .contains(&Event::Rx(2, b"gather|send".to_vec()))
    });
    t.check("fragments gathered into one message", gathered, "no gathered echo");
    // Only the final fragment reports a completion; the intermediate
    // fragment's buffer comes back by hand.
    if let Some(b1) = intermediate {
        transport.release_tx_buffer(3, b1);
    }

    // Polled pipe.
    let polled_ok = transport
        .alloc_tx_buffer(4)
        .and_then(|buf| transport.submit(4, buf, 16, tid(4, 1)))
        .is_ok();
    t.check("polled-pipe submit", polled_ok, "submit failed");
    let consumed = wait_for(|| {
        transport
            .ring_mem(4, RingDir::Src)
            .map(|m| m.pending() == 0)
            .unwrap_or(false)
    });
    t.check("target consumed polled frame", consumed, "still pending");
    let poll_ok = transport.send_complete_check(4, true).is_ok()
        && wait_for(|| matches!(transport.free_queue_depth(4), Ok(255)));
    t.check("poll reaped the completion", poll_ok, "credit missing");
}

// ════════════════════════════════════════════════════════════
// Part D: Events and teardown
// ════════════════════════════════════════════════════════════

fn test_events_and_teardown(
    t: &mut TestRunner,
    sim: &Arc<SimTarget>,
    transport: &Arc<CeTransport>,
    rec: &Arc<Recorder>,
) {
    t.section("Part D: Events and teardown");

    sim.raise_fw_event();
    t.check(
        "firmware event surfaced",
        wait_for(|| rec.count(|e| matches!(e, Event::Fw)) == 1),
        "no fw_event callback",
    );

    // Leave sends outstanding, then tear down.
    sim.pause();
    let tx_before = rec.count(|e| matches!(e, Event::Tx(_)));
    for i in 0..3u16 {
        if let Ok(buf) = transport.alloc_tx_buffer(3) {
            let _ = transport.submit(3, buf, 32, tid(3, 10 + i));
        }
    }
    transport.stop();
    t.check(
        "cancelled sends completed exactly once",
        rec.count(|e| matches!(e, Event::Tx(_))) == tx_before + 3,
        "wrong completion count",
    );
    t.check(
        "send window restored after teardown",
        matches!(transport.free_queue_depth(3), Ok(31)),
        "credits missing",
    );
    t.check(
        "transmit pool whole after teardown",
        transport.tx_pool_available(3) == 32,
        "buffers missing",
    );
    t.check(
        "submit refused after stop",
        matches!(
            transport.alloc_tx_buffer(3).and_then(|b| transport.submit(3, b, 8, 0)),
            Err(CeError::NotStarted)
        ),
        "expected NotStarted",
    );
    sim.stop();
}

fn main() {
    let mut t = TestRunner::new();
    println!("Copy Engine Transport Smoke Test");

    let (sim, transport, recorder) = bring_up(&mut t);
    test_diag(&mut t, &transport, &sim);
    test_data_path(&mut t, &transport, &recorder);
    test_events_and_teardown(&mut t, &sim, &transport, &recorder);

    t.summary();
    std::process::exit(if t.failed == 0 { 0 } else { 1 });
}
