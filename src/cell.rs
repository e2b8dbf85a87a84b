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

use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};

use spin::Mutex;

use crate::{CellConfig, CpuSet, MmioRegionTable};

/// Identifier of a cell. The root cell always has id 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CellId(usize);

impl CellId {
    pub const ROOT: CellId = CellId(0);

    pub const fn new(id: usize) -> Self {
        Self(id)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CellState {
    /// Being set up by `cell_create`; not visible outside the suspended root cell.
    Creating = 0,
    /// Created (or stopped) but none of its CPUs runs.
    ShutDown = 1,
    Running = 2,
    /// Running, and refusing any reconfiguration of other cells.
    RunningLocked = 3,
    /// Being torn down by `cell_destroy`.
    Destroying = 4,
    /// A CPU of the cell hit a fatal fault.
    Failed = 5,
}

impl CellState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Creating,
            1 => Self::ShutDown,
            2 => Self::Running,
            3 => Self::RunningLocked,
            4 => Self::Destroying,
            _ => Self::Failed,
        }
    }
}

/// A partition of the machine: a set of physical CPUs, memory regions and
/// emulated devices, isolated from every other cell.
pub struct Cell {
    id: CellId,
    config: CellConfig,
    /// CPUs currently owned. Only the root cell's set changes over time.
    cpu_set: Mutex<CpuSet>,
    state: AtomicU8,
    mmio: MmioRegionTable,
}

impl Cell {
    /// Create a cell in [`CellState::Creating`] with an MMIO table sized for
    /// `mmio_capacity` regions.
    pub(crate) fn new(id: CellId, config: CellConfig, mmio_capacity: usize) -> Self {
        Self {
            id,
            cpu_set: Mutex::new(config.cpus),
            config,
            state: AtomicU8::new(CellState::Creating as u8),
            mmio: MmioRegionTable::new(mmio_capacity),
        }
    }

    pub const fn id(&self) -> CellId {
        self.id
    }

    pub fn is_root(&self) -> bool {
        self.id == CellId::ROOT
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &CellConfig {
        &self.config
    }

    /// A snapshot of the CPUs currently owned by the cell.
    pub fn cpu_set(&self) -> CpuSet {
        *self.cpu_set.lock()
    }

    pub(crate) fn update_cpu_set<F: FnOnce(&mut CpuSet)>(&self, f: F) {
        f(&mut self.cpu_set.lock())
    }

    pub fn state(&self) -> CellState {
        CellState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: CellState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// The MMIO dispatch table of this cell.
    pub fn mmio(&self) -> &MmioRegionTable {
        &self.mmio
    }
}

impl fmt::Debug for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cell")
            .field("id", &self.id)
            .field("name", &self.config.name)
            .field("cpus", &self.cpu_set())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
