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

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use axerrno::{ax_err, AxError, AxResult};
use spin::{Mutex, RwLock};

use crate::percpu::CpuStat;
use crate::{
    AxCellHal, Cell, CellConfig, CellId, CellState, CpuState, EmulationUnit, MmioAccess,
    MmioResult, PerCpuControl, SystemConfig,
};

/// Progress of a hypervisor shutdown as seen by one root cell CPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ShutdownState {
    None,
    Started,
    Denied,
}

/// Diagnostic emitted when a cell touches an address nobody emulates, or a
/// handler rejects the access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionFault {
    pub cell: CellId,
    pub cpu_id: usize,
    pub address: usize,
    pub size: usize,
    pub is_write: bool,
    pub result: MmioResult,
}

impl fmt::Display for PartitionFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} MMIO {} at {:#x} (size {}) in cell {} on CPU {}",
            if self.result == MmioResult::Error {
                "invalid"
            } else {
                "unhandled"
            },
            if self.is_write { "write" } else { "read" },
            self.address,
            self.size,
            self.cell,
            self.cpu_id,
        )
    }
}

/// The hypervisor-wide context: per-CPU control blocks, the cell registry
/// and the platform layer.
///
/// Created once when the hypervisor is enabled and shared by all physical
/// CPUs. Every core operation takes the id of the physical CPU it runs on.
pub struct Hypervisor<H: AxCellHal> {
    pub(crate) hal: H,
    pub(crate) cpus: Box<[PerCpuControl]>,
    /// All cells, root cell first.
    pub(crate) cells: RwLock<Vec<Arc<Cell>>>,
    pub(crate) units: Vec<Box<dyn EmulationUnit>>,
    /// Indexed by CPU id; serializes shutdown requests.
    pub(crate) shutdown_lock: Mutex<Vec<ShutdownState>>,
}

impl<H: AxCellHal> Hypervisor<H> {
    /// Create the hypervisor context and its root cell, which owns every CPU
    /// listed in the root cell configuration.
    pub fn new(
        config: SystemConfig,
        hal: H,
        units: Vec<Box<dyn EmulationUnit>>,
    ) -> AxResult<Self> {
        let SystemConfig {
            num_cpus,
            root_cell,
        } = config;

        if root_cell.cpus.is_empty()
            || !root_cell.cpus.is_subset_of(&crate::CpuSet::with_first(num_cpus))
        {
            return ax_err!(InvalidInput, "root cell CPUs outside of the system");
        }

        let cpus = (0..num_cpus).map(PerCpuControl::new).collect();
        let mut hv = Self {
            hal,
            cpus,
            cells: RwLock::new(Vec::new()),
            units,
            shutdown_lock: Mutex::new(alloc::vec![ShutdownState::None; num_cpus]),
        };

        let capacity = hv.mmio_capacity(&root_cell);
        let root = Arc::new(Cell::new(CellId::ROOT, root_cell, capacity));
        hv.init_units(&root)?;
        root.set_state(CellState::Running);
        for cpu in root.cpu_set().iter() {
            hv.cpus[cpu].set_cell(&root);
        }
        info!(
            "Initialized root cell \"{}\" with CPUs {:?}, {} MMIO regions",
            root.name(),
            root.cpu_set(),
            capacity
        );
        hv.cells.get_mut().push(root);

        Ok(hv)
    }

    pub fn hal(&self) -> &H {
        &self.hal
    }

    pub fn num_cpus(&self) -> usize {
        self.cpus.len()
    }

    /// The control block of `cpu_id`.
    pub fn per_cpu(&self, cpu_id: usize) -> Option<&PerCpuControl> {
        self.cpus.get(cpu_id)
    }

    /// Control block of a CPU id taken from a validated cell CPU set.
    pub(crate) fn cpu(&self, cpu_id: usize) -> &PerCpuControl {
        &self.cpus[cpu_id]
    }

    pub fn root_cell(&self) -> Arc<Cell> {
        self.cells.read()[0].clone()
    }

    pub fn cell(&self, id: CellId) -> Option<Arc<Cell>> {
        self.cells.read().iter().find(|cell| cell.id() == id).cloned()
    }

    pub fn cell_by_name(&self, name: &str) -> Option<Arc<Cell>> {
        self.cells
            .read()
            .iter()
            .find(|cell| cell.name() == name)
            .cloned()
    }

    pub fn num_cells(&self) -> usize {
        self.cells.read().len()
    }

    /// All cells except the root cell.
    pub(crate) fn non_root_cells(&self) -> Vec<Arc<Cell>> {
        self.cells.read()[1..].to_vec()
    }

    /// The cell `cpu_id` is currently assigned to.
    pub fn this_cell(&self, cpu_id: usize) -> AxResult<Arc<Cell>> {
        self.per_cpu(cpu_id)
            .ok_or(AxError::InvalidInput)?
            .cell()
            .ok_or(AxError::BadState)
    }

    pub(crate) fn free_cell_id(&self) -> CellId {
        let cells = self.cells.read();
        let mut id = 0;
        while cells.iter().any(|cell| cell.id().as_usize() == id) {
            id += 1;
        }
        CellId::new(id)
    }

    /// Number of MMIO table slots a cell described by `config` needs.
    pub(crate) fn mmio_capacity(&self, config: &CellConfig) -> usize {
        config.num_subpage_windows()
            + self
                .units
                .iter()
                .map(|unit| unit.mmio_count_regions(config))
                .sum::<usize>()
    }

    /// Run `cell_init` of every unit, undoing the already initialized ones
    /// if one fails.
    pub(crate) fn init_units(&self, cell: &Cell) -> AxResult {
        for (n, unit) in self.units.iter().enumerate() {
            if let Err(err) = unit.cell_init(cell) {
                warn!(
                    "unit {} failed to initialize cell \"{}\": {:?}",
                    unit.name(),
                    cell.name(),
                    err
                );
                for unit in self.units[..n].iter().rev() {
                    unit.cell_exit(cell);
                }
                return Err(err);
            }
        }
        Ok(())
    }

    pub(crate) fn exit_units(&self, cell: &Cell) {
        for unit in self.units.iter().rev() {
            unit.cell_exit(cell);
        }
    }

    /// Handle a trapped MMIO access of `cpu_id` against the MMIO table of its
    /// cell.
    ///
    /// An unhandled or rejected access is fatal for the cell: a
    /// [`PartitionFault`] is reported, the cell is marked failed and the
    /// faulting CPU is parked.
    pub fn handle_mmio_access(&self, cpu_id: usize, access: &mut MmioAccess) -> MmioResult {
        let Some(cpu_data) = self.per_cpu(cpu_id) else {
            error!(
                "FATAL: MMIO access at {:#x} from unknown CPU {}",
                access.address, cpu_id
            );
            return MmioResult::Unhandled;
        };
        cpu_data.count(CpuStat::VmExitsTotal);
        cpu_data.count(CpuStat::VmExitsMmio);

        let Some(cell) = cpu_data.cell() else {
            error!(
                "FATAL: MMIO access at {:#x} from CPU {} outside of any cell",
                access.address, cpu_id
            );
            return MmioResult::Unhandled;
        };

        let trapped = *access;
        let result = cell.mmio().dispatch(access);
        if result != MmioResult::Handled {
            let fault = PartitionFault {
                cell: cell.id(),
                cpu_id,
                address: trapped.address,
                size: trapped.size,
                is_write: trapped.is_write,
                result,
            };
            error!("FATAL: {}", fault);
            cell.set_state(CellState::Failed);
            self.halt_cpu(cpu_id);
        }
        result
    }

    /// Stop the calling CPU after an unrecoverable error of its cell.
    ///
    /// The cell is marked failed once all of its CPUs have failed.
    pub fn panic_halt(&self, cpu_id: usize) {
        let Some(cell) = self.per_cpu(cpu_id).and_then(PerCpuControl::cell) else {
            return;
        };
        error!("Parking CPU {}", cpu_id);
        self.cpu(cpu_id).set_failed(true);
        if cell.cpu_set().iter().all(|cpu| self.cpu(cpu).is_failed()) {
            cell.set_state(CellState::Failed);
        }
        self.halt_cpu(cpu_id);
    }

    fn halt_cpu(&self, cpu_id: usize) {
        let cpu_data = self.cpu(cpu_id);
        cpu_data.set_failed(true);
        cpu_data.control_lock.lock().enter_cpu_off();
        self.hal.park_cpu(cpu_id);
    }

    /// Lock or unlock the non-root cell running on `cpu_id` against
    /// reconfiguration of other cells, as the cell announces it through its
    /// communication region.
    ///
    /// Only a running cell can change its lock.
    pub fn cell_set_locked(&self, cpu_id: usize, locked: bool) -> AxResult {
        let cell = self.this_cell(cpu_id)?;
        if cell.is_root() {
            return ax_err!(InvalidInput, "the root cell cannot be locked");
        }
        match cell.state() {
            CellState::Running | CellState::RunningLocked => {}
            _ => return ax_err!(BadState, "cell is not running"),
        }
        cell.set_state(if locked {
            CellState::RunningLocked
        } else {
            CellState::Running
        });
        debug!(
            "Cell \"{}\" {}",
            cell.name(),
            if locked { "locked" } else { "unlocked" }
        );
        Ok(())
    }

    /// State of `id`, queried from a root cell CPU.
    pub fn cell_get_state(&self, caller_cpu: usize, id: CellId) -> AxResult<CellState> {
        if !self.this_cell(caller_cpu)?.is_root() {
            return ax_err!(PermissionDenied);
        }
        self.cell(id).map(|cell| cell.state()).ok_or(AxError::NotFound)
    }

    /// State of `cpu_id`. Non-root cells may only query their own CPUs.
    pub fn cpu_get_state(&self, caller_cpu: usize, cpu_id: usize) -> AxResult<CpuState> {
        let target = self.per_cpu(cpu_id).ok_or(AxError::InvalidInput)?;
        let cell = self.this_cell(caller_cpu)?;
        if !cell.is_root() && !cell.cpu_set().contains(cpu_id) {
            return ax_err!(PermissionDenied);
        }
        Ok(target.state())
    }
}
