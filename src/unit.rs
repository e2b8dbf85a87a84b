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

use axerrno::AxResult;

use crate::{Cell, CellConfig};

/// A device emulation unit.
///
/// Units are registered once when the hypervisor is created. For every cell
/// they declare how many MMIO regions they may register, so that the cell's
/// [`MmioRegionTable`](crate::MmioRegionTable) can be sized up front, and they
/// register those regions from [`EmulationUnit::cell_init`].
pub trait EmulationUnit: Send + Sync {
    /// Name of the unit, for diagnostics.
    fn name(&self) -> &str;

    /// Upper bound of MMIO regions the unit registers for a cell described by
    /// `config`.
    fn mmio_count_regions(&self, config: &CellConfig) -> usize;

    /// Set up the unit's state for a new cell, including its MMIO regions.
    fn cell_init(&self, cell: &Cell) -> AxResult;

    /// Release the unit's state for a cell under destruction.
    fn cell_exit(&self, _cell: &Cell) {}
}
