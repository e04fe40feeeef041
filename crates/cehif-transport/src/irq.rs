//! Interrupt entry points and the deferred-service tasklet.
//!
//! Interrupt context does the minimum: acknowledge/mask and queue a
//! task. A dedicated thread (`TaskletRunner`) does the actual ring
//! servicing, and for the legacy topology re-enables the shared line
//! once a full service pass is done.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_queue::ArrayQueue;

use cehif_core::bus::{IrqMode, IrqSink};
use cehif_core::config::CE_COUNT;
use cehif_core::regs::{PCIE_INTR_CLR_ADDRESS, PCIE_INTR_CE_MASK_ALL, PCIE_INTR_FIRMWARE_MASK};

use crate::device::DeviceCore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Task {
    /// Legacy line fired: check firmware, service every engine, unmask.
    ServiceAll,
    /// Per-engine vector fired.
    ServicePipe(u8),
    /// Firmware vector fired.
    FwEvent,
}

const TASK_QUEUE_DEPTH: usize = 64;

struct RunnerShared {
    tasks: ArrayQueue<Task>,
    shutdown: AtomicBool,
    /// Service thread handle for unparking, set once at spawn.
    thread: Mutex<Option<thread::Thread>>,
}

struct TaskletRunner {
    shared: Arc<RunnerShared>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl TaskletRunner {
    fn spawn(core: Arc<DeviceCore>, mode: IrqMode) -> Self {
        let shared = Arc::new(RunnerShared {
            tasks: ArrayQueue::new(TASK_QUEUE_DEPTH),
            shutdown: AtomicBool::new(false),
            thread: Mutex::new(None),
        });
        let shared2 = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("cehif-tasklet".into())
            .spawn(move || {
                *shared2.thread.lock().unwrap() = Some(thread::current());
                loop {
                    if shared2.shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    match shared2.tasks.pop() {
                        Some(task) => run_task(&core, mode, task),
                        None => thread::park_timeout(Duration::from_millis(1)),
                    }
                }
            })
            .expect("spawn tasklet thread");
        Self {
            shared,
            handle: Mutex::new(Some(handle)),
        }
    }

    fn schedule(&self, task: Task) {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        // A full queue means many service passes already pending; each
        // pass drains everything, so a coalesced trigger is enough.
        let _ = self.shared.tasks.push(task);
        if let Some(t) = self.shared.thread.lock().unwrap().as_ref() {
            t.unpark();
        }
    }

    /// Stop and join the service thread. Queued tasks are discarded.
    fn kill(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        if let Some(t) = self.shared.thread.lock().unwrap().as_ref() {
            t.unpark();
        }
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn run_task(core: &DeviceCore, mode: IrqMode, task: Task) {
    match task {
        Task::ServiceAll => {
            core.fw_interrupt_check();
            for ce in 0..CE_COUNT as u8 {
                core.per_engine_service(ce);
            }
            if mode == IrqMode::Legacy {
                core.legacy_irq_enable();
            }
        }
        Task::ServicePipe(ce) => core.per_engine_service(ce),
        Task::FwEvent => core.fw_interrupt_check(),
    }
}

/// The device's interrupt sink. Methods are the "hard irq" half: they
/// only mask/ack and schedule; all real work happens on the tasklet.
pub struct IrqDispatcher {
    core: Arc<DeviceCore>,
    runner: TaskletRunner,
    mode: IrqMode,
}

impl IrqDispatcher {
    pub(crate) fn new(core: Arc<DeviceCore>, mode: IrqMode) -> Arc<Self> {
        let runner = TaskletRunner::spawn(Arc::clone(&core), mode);
        Arc::new(Self { core, runner, mode })
    }

    /// Stop interrupt servicing and join the tasklet thread.
    pub(crate) fn shutdown(&self) {
        self.runner.kill();
    }
}

impl IrqSink for IrqDispatcher {
    fn legacy_line(&self) {
        if self.mode != IrqMode::Legacy {
            return;
        }
        // Mask the shared line and ack the sources; the tasklet unmasks
        // after its service pass.
        self.core.legacy_irq_disable();
        self.core.bus.write32(
            PCIE_INTR_CLR_ADDRESS,
            PCIE_INTR_FIRMWARE_MASK | PCIE_INTR_CE_MASK_ALL,
        );
        let _ = self.core.bus.read32(PCIE_INTR_CLR_ADDRESS);
        self.runner.schedule(Task::ServiceAll);
    }

    fn ce_vector(&self, ce_id: u32) {
        self.runner.schedule(Task::ServicePipe(ce_id as u8));
    }

    fn fw_vector(&self) {
        self.runner.schedule(Task::FwEvent);
    }
}
