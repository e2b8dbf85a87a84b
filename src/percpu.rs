// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use axerrno::{ax_err, AxResult};
use spin::Mutex;

use crate::{Cell, GuestPhysAddr};

/// Capacity of the per-CPU pending interrupt queue.
pub const PENDING_IRQS: usize = 16;

/// A bounded circular queue of interrupt ids waiting to be injected.
///
/// One slot is kept free to tell a full queue from an empty one, so the queue
/// holds at most `PENDING_IRQS - 1` entries.
#[derive(Debug)]
pub struct PendingIrqs {
    irqs: [u32; PENDING_IRQS],
    head: usize,
    tail: usize,
}

impl PendingIrqs {
    const fn new() -> Self {
        Self {
            irqs: [0; PENDING_IRQS],
            head: 0,
            tail: 0,
        }
    }

    fn push(&mut self, irq: u32) -> bool {
        let next = (self.tail + 1) % PENDING_IRQS;
        if next == self.head {
            return false;
        }
        self.irqs[self.tail] = irq;
        self.tail = next;
        true
    }

    fn pop(&mut self) -> Option<u32> {
        if self.head == self.tail {
            return None;
        }
        let irq = self.irqs[self.head];
        self.head = (self.head + 1) % PENDING_IRQS;
        Some(irq)
    }

    fn is_empty(&self) -> bool {
        self.head == self.tail
    }
}

/// Requests posted to a CPU by other CPUs. Protected by the CPU's control
/// lock.
#[derive(Debug)]
pub(crate) struct ControlRequests {
    pub park: bool,
    pub reset: bool,
    /// Entry address for the next reset. `None` parks the CPU instead.
    pub cpu_on_entry: Option<GuestPhysAddr>,
    pub flush_vcpu_caches: bool,
    /// The CPU sits in the parking loop until it is reset with a valid entry.
    pub wait_for_poweron: bool,
    pub pending_irqs: PendingIrqs,
}

impl ControlRequests {
    const fn new() -> Self {
        Self {
            park: false,
            reset: false,
            cpu_on_entry: None,
            flush_vcpu_caches: false,
            wait_for_poweron: false,
            pending_irqs: PendingIrqs::new(),
        }
    }

    pub fn enter_cpu_off(&mut self) {
        self.park = false;
        self.wait_for_poweron = true;
    }
}

/// Per-CPU exit counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuStat {
    /// Every exit into the hypervisor.
    VmExitsTotal = 0,
    /// Exits caused by a trapped MMIO access.
    VmExitsMmio = 1,
    /// Exits caused by a cross-CPU management event.
    VmExitsManagement = 2,
}

const NUM_CPU_STATS: usize = 3;

/// The state of a physical CPU as reported to the root cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuState {
    Running,
    /// The CPU hit a fatal fault of its cell and was halted.
    Failed,
}

/// Control state of one physical CPU.
///
/// Allocated once per CPU when the hypervisor boots and kept for its whole
/// lifetime. The request fields are written by other CPUs under
/// `control_lock`; the acknowledgement fields are written only by the CPU
/// itself.
pub struct PerCpuControl {
    cpu_id: usize,
    /// The cell this CPU is currently assigned to. Rewritten on cell create
    /// and destroy while the CPU is suspended.
    cell: Mutex<Weak<Cell>>,
    pub(crate) control_lock: Mutex<ControlRequests>,
    /// Set by another CPU to hold this one in the hypervisor.
    pub(crate) suspend_cpu: AtomicBool,
    /// Set by this CPU once it is spinning in the hypervisor on behalf of
    /// `suspend_cpu`.
    pub(crate) cpu_suspended: AtomicBool,
    failed: AtomicBool,
    stats: [AtomicU64; NUM_CPU_STATS],
}

impl PerCpuControl {
    /// Create the control block of `cpu_id`, not yet assigned to any cell.
    pub fn new(cpu_id: usize) -> Self {
        Self {
            cpu_id,
            cell: Mutex::new(Weak::new()),
            control_lock: Mutex::new(ControlRequests::new()),
            suspend_cpu: AtomicBool::new(false),
            cpu_suspended: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            stats: Default::default(),
        }
    }

    pub const fn cpu_id(&self) -> usize {
        self.cpu_id
    }

    /// The cell owning this CPU, if it still exists.
    pub fn cell(&self) -> Option<Arc<Cell>> {
        self.cell.lock().upgrade()
    }

    pub(crate) fn set_cell(&self, cell: &Arc<Cell>) {
        *self.cell.lock() = Arc::downgrade(cell);
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub(crate) fn set_failed(&self, failed: bool) {
        self.failed.store(failed, Ordering::Release);
    }

    pub fn state(&self) -> CpuState {
        if self.is_failed() {
            CpuState::Failed
        } else {
            CpuState::Running
        }
    }

    /// Whether another CPU has asked this one to hold.
    pub fn suspend_requested(&self) -> bool {
        self.suspend_cpu.load(Ordering::Acquire)
    }

    /// Whether this CPU acknowledged a suspend request and is holding.
    pub fn is_suspended(&self) -> bool {
        self.cpu_suspended.load(Ordering::Acquire)
    }

    /// Whether this CPU is parked, waiting for a reset with a valid entry.
    pub fn is_parked(&self) -> bool {
        self.control_lock.lock().wait_for_poweron
    }

    /// Queue `irq` for injection the next time this CPU enters its cell.
    pub fn queue_irq(&self, irq: u32) -> AxResult {
        if self.control_lock.lock().pending_irqs.push(irq) {
            Ok(())
        } else {
            ax_err!(ResourceBusy, "pending IRQ queue overflow")
        }
    }

    /// Take the oldest pending interrupt.
    pub fn take_pending_irq(&self) -> Option<u32> {
        self.control_lock.lock().pending_irqs.pop()
    }

    pub fn has_pending_irqs(&self) -> bool {
        !self.control_lock.lock().pending_irqs.is_empty()
    }

    pub(crate) fn count(&self, stat: CpuStat) {
        self.stats[stat as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Read one of this CPU's exit counters.
    pub fn stat(&self, stat: CpuStat) -> u64 {
        self.stats[stat as usize].load(Ordering::Relaxed)
    }
}

impl core::fmt::Debug for PerCpuControl {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PerCpuControl")
            .field("cpu_id", &self.cpu_id)
            .field("suspend_cpu", &self.suspend_requested())
            .field("cpu_suspended", &self.is_suspended())
            .field("failed", &self.is_failed())
            .finish_non_exhaustive()
    }
}
