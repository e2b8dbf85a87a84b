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

//! Cell management operations issued from the root cell.
//!
//! Each operation suspends every other CPU of the root cell (and of the
//! target cell, where there is one), mutates CPU assignment, memory mappings
//! and MMIO tables, and then resumes them. There is no partial-failure path
//! for the rendezvous itself: either every target is reached or the calling
//! CPU hangs.

use alloc::sync::Arc;

use axerrno::{ax_err, AxError, AxResult};

use crate::hypervisor::ShutdownState;
use crate::{
    AxCellHal, Cell, CellConfig, CellFlags, CellId, CellState, Hypervisor, MemFlags, MemRegion,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ManagementTask {
    Start,
    Destroy,
}

/// Regions that stay mapped in the root cell while a cell owns them.
fn shared_with_root(mem: &MemRegion) -> bool {
    mem.flags.intersects(MemFlags::COMM_REGION | MemFlags::ROOTSHARED)
}

impl<H: AxCellHal> Hypervisor<H> {
    fn check_root_caller(&self, caller_cpu: usize) -> AxResult<Arc<Cell>> {
        let cell = self.this_cell(caller_cpu)?;
        if !cell.is_root() {
            return ax_err!(PermissionDenied, "management request from a non-root cell");
        }
        Ok(cell)
    }

    /// Whether `cell` agrees to be shut down. Cells that are not running, or
    /// that never answer on their communication region, always agree.
    fn cell_shutdown_ok(&self, cell: &Cell) -> bool {
        if cell.config().flags.contains(CellFlags::PASSIVE_COMMREG)
            || matches!(cell.state(), CellState::ShutDown | CellState::Failed)
        {
            return true;
        }
        self.hal.cell_shutdown_ok(cell)
    }

    /// Whether no non-root cell other than `excluded` is locked against
    /// reconfiguration.
    fn cell_reconfig_ok(&self, excluded: Option<CellId>) -> bool {
        self.non_root_cells()
            .iter()
            .all(|cell| Some(cell.id()) == excluded || cell.state() != CellState::RunningLocked)
    }

    fn cell_reconfig_completed(&self) {
        for cell in self.non_root_cells() {
            self.hal.cell_reconfig_completed(&cell);
        }
    }

    /// Unmap `mem` from the root cell, where it is always identity mapped.
    fn unmap_from_root_cell(&self, root: &Cell, mem: &MemRegion) -> AxResult {
        let identity = MemRegion {
            virt_start: crate::GuestPhysAddr::from_usize(mem.phys_start.as_usize()),
            ..*mem
        };
        self.hal.unmap_memory_region(root, &identity)
    }

    /// Give the parts of `mem` that are backed by root cell memory back to
    /// the root cell, using the root cell's own mapping attributes.
    fn remap_to_root_cell(&self, root: &Cell, mem: &MemRegion) {
        for root_mem in root.config().mem_regions.iter() {
            let Some(overlap) = root_mem.phys_overlap(mem) else {
                continue;
            };
            if let Err(err) = self.hal.map_memory_region(root, &overlap) {
                warn!(
                    "Failed to re-assign memory region {:?} to root cell: {:?}",
                    overlap.phys_start, err
                );
            }
        }
    }

    fn restore_root_cell(&self, root: &Cell, cell: &Cell) {
        for mem in cell.config().mem_regions.iter() {
            if !shared_with_root(mem) {
                self.remap_to_root_cell(root, mem);
            }
        }
        root.update_cpu_set(|set| {
            for cpu in cell.cpu_set().iter() {
                set.set(cpu);
            }
        });
    }

    /// Create a new cell from `config`, taking its CPUs and memory from the
    /// root cell. Its CPUs are parked until [`cell_start`](Self::cell_start).
    pub fn cell_create(&self, caller_cpu: usize, config: CellConfig) -> AxResult<CellId> {
        let root = self.check_root_caller(caller_cpu)?;

        self.cell_suspend(&root, caller_cpu);
        let result = self.create_cell_suspended(&root, caller_cpu, config);
        self.cell_resume(&root, caller_cpu);

        result
    }

    fn create_cell_suspended(
        &self,
        root: &Arc<Cell>,
        caller_cpu: usize,
        config: CellConfig,
    ) -> AxResult<CellId> {
        if !self.cell_reconfig_ok(None) {
            return ax_err!(PermissionDenied, "a cell is locked against reconfiguration");
        }
        if self.cell_by_name(&config.name).is_some() {
            return ax_err!(AlreadyExists, format!("cell \"{}\" exists", config.name));
        }
        if let Some(mem) = config.first_invalid_region() {
            error!(
                "FATAL: Invalid memory region ({:?}, {:?}, {:#x}, {:?})",
                mem.phys_start, mem.virt_start, mem.size, mem.flags
            );
            return Err(AxError::InvalidInput);
        }
        if config.cpus.is_empty() {
            return ax_err!(InvalidInput, "cell without CPUs");
        }
        // Neither the calling CPU nor CPUs of other cells can be assigned.
        if config.cpus.contains(caller_cpu) || !config.cpus.is_subset_of(&root.cpu_set()) {
            return ax_err!(ResourceBusy, "CPUs not available for the new cell");
        }

        let capacity = self.mmio_capacity(&config);
        let cell = Arc::new(Cell::new(self.free_cell_id(), config, capacity));

        root.update_cpu_set(|set| {
            for cpu in cell.cpu_set().iter() {
                set.clear(cpu);
            }
        });

        if let Err(err) = self.setup_cell_memory(root, &cell) {
            self.restore_root_cell(root, &cell);
            return Err(err);
        }
        if let Err(err) = self.hal.cell_create(&cell) {
            self.restore_root_cell(root, &cell);
            return Err(err);
        }
        if let Err(err) = self.init_units(&cell) {
            self.hal.cell_destroy(&cell);
            self.restore_root_cell(root, &cell);
            return Err(err);
        }

        cell.set_state(CellState::ShutDown);
        self.cells.write().push(cell.clone());

        for cpu in cell.cpu_set().iter() {
            self.cpu(cpu).set_cell(&cell);
            self.park_cpu(cpu);
        }

        self.cell_reconfig_completed();

        info!(
            "Created cell \"{}\" (id {}, CPUs {:?}, {} MMIO regions)",
            cell.name(),
            cell.id(),
            cell.cpu_set(),
            capacity
        );
        Ok(cell.id())
    }

    /// Move the memory of `cell` out of the root cell and into the new cell.
    fn setup_cell_memory(&self, root: &Cell, cell: &Cell) -> AxResult {
        for mem in cell.config().mem_regions.iter() {
            // The communication region is not backed by root cell memory,
            // shared regions stay with the root cell.
            if !shared_with_root(mem) {
                self.unmap_from_root_cell(root, mem)?;
            }
            // Sub-page windows are trapped and emulated, never mapped.
            if !(mem.flags.contains(MemFlags::IO) && mem.is_subpage()) {
                self.hal.map_memory_region(cell, mem)?;
            }
        }
        Ok(())
    }

    /// Suspend the root cell, look up the managed cell and suspend it as well.
    fn cell_management_prologue(
        &self,
        task: ManagementTask,
        caller_cpu: usize,
        id: CellId,
    ) -> AxResult<Arc<Cell>> {
        let root = self.check_root_caller(caller_cpu)?;

        self.cell_suspend(&root, caller_cpu);

        let cell = match self.cell(id) {
            None => Err(AxError::NotFound),
            Some(cell) if cell.is_root() => Err(AxError::InvalidInput),
            Some(cell)
                if task == ManagementTask::Destroy && !self.cell_reconfig_ok(Some(cell.id())) =>
            {
                Err(AxError::PermissionDenied)
            }
            Some(cell) if !self.cell_shutdown_ok(&cell) => Err(AxError::PermissionDenied),
            Some(cell) => Ok(cell),
        };
        match cell {
            Ok(cell) => {
                self.cell_suspend(&cell, caller_cpu);
                Ok(cell)
            }
            Err(err) => {
                self.cell_resume(&root, caller_cpu);
                Err(err)
            }
        }
    }

    /// (Re)start cell `id`: its first CPU enters at the configured reset
    /// address, the others wait parked for the cell to bring them up.
    pub fn cell_start(&self, caller_cpu: usize, id: CellId) -> AxResult {
        let cell = self.cell_management_prologue(ManagementTask::Start, caller_cpu, id)?;

        cell.set_state(CellState::Running);

        let first = cell.cpu_set().first();
        for cpu in cell.cpu_set().iter() {
            self.cpu(cpu).set_failed(false);
            let entry = (Some(cpu) == first).then_some(cell.config().cpu_reset_address);
            self.reset_cpu(cpu, entry);
        }

        info!("Started cell \"{}\"", cell.name());

        self.cell_resume(&self.root_cell(), caller_cpu);
        Ok(())
    }

    /// Destroy cell `id` and hand its CPUs and memory back to the root cell.
    pub fn cell_destroy(&self, caller_cpu: usize, id: CellId) -> AxResult {
        let cell = self.cell_management_prologue(ManagementTask::Destroy, caller_cpu, id)?;
        let root = self.root_cell();

        info!("Closing cell \"{}\"", cell.name());
        cell.set_state(CellState::Destroying);

        for cpu in cell.cpu_set().iter() {
            self.park_cpu(cpu);

            root.update_cpu_set(|set| set.set(cpu));
            let cpu_data = self.cpu(cpu);
            cpu_data.set_cell(&root);
            cpu_data.set_failed(false);
        }

        for mem in cell.config().mem_regions.iter() {
            // This cannot fail: the region was mapped as a whole before.
            if !(mem.flags.contains(MemFlags::IO) && mem.is_subpage()) {
                let _ = self.hal.unmap_memory_region(&cell, mem);
            }
            if !shared_with_root(mem) {
                self.remap_to_root_cell(&root, mem);
            }
        }

        self.exit_units(&cell);
        self.hal.cell_destroy(&cell);

        self.cells.write().retain(|c| c.id() != id);
        self.cell_reconfig_completed();

        self.cell_resume(&root, caller_cpu);
        Ok(())
    }

    /// Disable the hypervisor, requested by every CPU of the root cell in
    /// turn. The first request decides, later ones collect the verdict.
    pub fn shutdown(&self, caller_cpu: usize) -> AxResult {
        let root = self.check_root_caller(caller_cpu)?;

        let mut states = self.shutdown_lock.lock();

        if states[caller_cpu] == ShutdownState::None {
            let cells = self.non_root_cells();
            let state = if cells.iter().all(|cell| self.cell_shutdown_ok(cell)) {
                ShutdownState::Started
            } else {
                ShutdownState::Denied
            };

            if state == ShutdownState::Started {
                info!("Shutting down hypervisor");

                for cell in cells.iter() {
                    self.cell_suspend(cell, caller_cpu);

                    info!("Closing cell \"{}\"", cell.name());

                    for cpu in cell.cpu_set().iter() {
                        info!(" Releasing CPU {}", cpu);
                        self.hal.shutdown_cpu(cpu);
                    }
                }

                info!("Closing root cell \"{}\"", root.name());
                self.hal.shutdown();
            }

            for cpu in root.cpu_set().iter() {
                states[cpu] = state;
            }
        }

        let result = match states[caller_cpu] {
            ShutdownState::Denied => Err(AxError::PermissionDenied),
            _ => {
                info!(" Releasing CPU {}", caller_cpu);
                Ok(())
            }
        };
        states[caller_cpu] = ShutdownState::None;

        result
    }
}
