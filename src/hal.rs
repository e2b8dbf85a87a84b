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

use axerrno::{ax_err, AxResult};

use crate::{Cell, CellConfig, GuestPhysAddr, MemRegion};

/// The interfaces which the architecture and platform layer must implement.
///
/// Everything the portable core cannot do by itself goes through this trait:
/// delivering cross-CPU events, handing a CPU over to the parking loop or to a
/// fresh guest context, and programming second-level address translation.
pub trait AxCellHal: Send + Sync {
    /// Force `cpu_id` out of guest mode so that it runs
    /// [`Hypervisor::handle_exit_event`](crate::Hypervisor::handle_exit_event).
    ///
    /// Delivery is best effort and may be arbitrarily delayed, but must
    /// eventually happen at least once.
    fn send_event(&self, cpu_id: usize);

    /// Put `cpu_id`, which is the calling CPU, into the low-power parking
    /// loop. The CPU leaves it only through another cross-CPU event.
    fn park_cpu(&self, cpu_id: usize);

    /// Build an initial guest state on `cpu_id`, which is the calling CPU, and
    /// resume guest execution at `entry`.
    fn reset_cpu(&self, cpu_id: usize, entry: GuestPhysAddr);

    /// Flush the guest TLBs and other second-level translation caches of the
    /// calling CPU.
    fn flush_vcpu_caches(&self, _cpu_id: usize) {}

    /// Map `region` into the second-level address space of `cell`.
    fn map_memory_region(&self, cell: &Cell, region: &MemRegion) -> AxResult;

    /// Unmap `region` from the second-level address space of `cell`.
    fn unmap_memory_region(&self, cell: &Cell, region: &MemRegion) -> AxResult;

    /// Architecture-specific part of cell creation, called while the root
    /// cell is suspended. Sub-page MMIO windows of the cell are registered
    /// here.
    fn cell_create(&self, _cell: &Cell) -> AxResult {
        Ok(())
    }

    /// Architecture-specific part of cell destruction.
    fn cell_destroy(&self, _cell: &Cell) {}

    /// Ask `cell` through its communication region whether it may be shut
    /// down. Passive cells are never asked.
    fn cell_shutdown_ok(&self, _cell: &Cell) -> bool {
        true
    }

    /// Tell `cell` through its communication region that a cell was created
    /// or destroyed.
    fn cell_reconfig_completed(&self, _cell: &Cell) {}

    /// Return `cpu_id` to the host while the hypervisor is disabled.
    fn shutdown_cpu(&self, _cpu_id: usize) {}

    /// Final architecture-specific step of disabling the hypervisor.
    fn shutdown(&self) {}

    /// Read and validate a cell configuration handed over by the root cell.
    fn load_cell_config(&self, _config_address: usize) -> AxResult<CellConfig> {
        ax_err!(Unsupported, "no cell configuration loader")
    }
}
