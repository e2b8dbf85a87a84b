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

//! Management hypercall interface of the root cell.

use axerrno::{AxError, AxResult, LinuxError};

use crate::{AxCellHal, CellId, CellState, CpuState, Hypervisor};

/// Hypercall numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum HypercallCode {
    /// Disable the hypervisor.
    Disable = 0,
    /// Create a cell; the argument is the address of its configuration.
    CellCreate = 1,
    CellStart = 2,
    CellDestroy = 3,
    HypervisorGetInfo = 4,
    CellGetState = 5,
    CpuGetState = 6,
}

impl TryFrom<usize> for HypercallCode {
    type Error = AxError;

    fn try_from(code: usize) -> AxResult<Self> {
        Ok(match code {
            0 => Self::Disable,
            1 => Self::CellCreate,
            2 => Self::CellStart,
            3 => Self::CellDestroy,
            4 => Self::HypervisorGetInfo,
            5 => Self::CellGetState,
            6 => Self::CpuGetState,
            _ => return Err(AxError::Unsupported),
        })
    }
}

/// Information that can be queried with [`HypercallCode::HypervisorGetInfo`].
/// Memory pool statistics are kept by the memory manager, not here.
pub const INFO_NUM_CELLS: usize = 4;

/// Cell states as reported to the root cell.
pub const CELL_RUNNING: usize = 0;
pub const CELL_RUNNING_LOCKED: usize = 1;
pub const CELL_SHUT_DOWN: usize = 2;
pub const CELL_FAILED: usize = 3;

/// CPU states as reported to the root cell.
pub const CPU_RUNNING: usize = 0;
pub const CPU_FAILED: usize = 2;

/// Linux errno reported to the guest for `err`.
fn errno(err: AxError) -> LinuxError {
    match err {
        // Management requests from non-root cells are refused with EPERM.
        AxError::PermissionDenied => LinuxError::EPERM,
        err => LinuxError::from(err),
    }
}

impl<H: AxCellHal> Hypervisor<H> {
    /// Handle hypercall `code` with argument `arg` issued on `cpu_id`.
    ///
    /// Returns a non-negative result, or a negated Linux errno.
    pub fn hypercall(&self, cpu_id: usize, code: usize, arg: usize) -> isize {
        match self.do_hypercall(cpu_id, code, arg) {
            Ok(value) => value as isize,
            Err(err) => -(errno(err).code() as isize),
        }
    }

    fn do_hypercall(&self, cpu_id: usize, code: usize, arg: usize) -> AxResult<usize> {
        match HypercallCode::try_from(code)? {
            HypercallCode::Disable => self.shutdown(cpu_id).map(|_| 0),
            HypercallCode::CellCreate => {
                let config = self.hal.load_cell_config(arg)?;
                self.cell_create(cpu_id, config).map(CellId::as_usize)
            }
            HypercallCode::CellStart => self.cell_start(cpu_id, CellId::new(arg)).map(|_| 0),
            HypercallCode::CellDestroy => self.cell_destroy(cpu_id, CellId::new(arg)).map(|_| 0),
            HypercallCode::HypervisorGetInfo => match arg {
                INFO_NUM_CELLS => Ok(self.num_cells()),
                _ => Err(AxError::InvalidInput),
            },
            HypercallCode::CellGetState => {
                match self.cell_get_state(cpu_id, CellId::new(arg))? {
                    CellState::Running => Ok(CELL_RUNNING),
                    CellState::RunningLocked => Ok(CELL_RUNNING_LOCKED),
                    CellState::ShutDown => Ok(CELL_SHUT_DOWN),
                    CellState::Failed => Ok(CELL_FAILED),
                    CellState::Creating | CellState::Destroying => Err(AxError::InvalidInput),
                }
            }
            HypercallCode::CpuGetState => match self.cpu_get_state(cpu_id, arg)? {
                CpuState::Running => Ok(CPU_RUNNING),
                CpuState::Failed => Ok(CPU_FAILED),
            },
        }
    }
}
