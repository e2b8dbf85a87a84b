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

//! Static cell descriptions, as produced by the external configuration parser.

use alloc::string::String;
use alloc::vec::Vec;

use memory_addr::{is_aligned_4k, PhysAddr};

use crate::{CpuSet, GuestPhysAddr};

bitflags::bitflags! {
    /// Access and ownership attributes of a cell memory region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemFlags: u64 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        const DMA = 1 << 3;
        /// Device memory. Sub-page windows of this kind are trapped and emulated.
        const IO = 1 << 4;
        /// The cell's communication region, not backed by root cell memory.
        const COMM_REGION = 1 << 5;
        /// The region stays mapped in the root cell while the cell exists.
        const ROOTSHARED = 1 << 6;
    }
}

bitflags::bitflags! {
    /// Cell-wide flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CellFlags: u32 {
        /// The cell never answers on its communication region; management
        /// requests are approved on its behalf.
        const PASSIVE_COMMREG = 1 << 0;
    }
}

/// A memory region assigned to a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRegion {
    /// Host physical start address.
    pub phys_start: PhysAddr,
    /// Start address as seen by the cell.
    pub virt_start: GuestPhysAddr,
    pub size: usize,
    pub flags: MemFlags,
}

impl MemRegion {
    pub const fn new(phys_start: usize, virt_start: usize, size: usize, flags: MemFlags) -> Self {
        Self {
            phys_start: PhysAddr::from_usize(phys_start),
            virt_start: GuestPhysAddr::from_usize(virt_start),
            size,
            flags,
        }
    }

    /// A window smaller than a page, or not page aligned, that has to be
    /// emulated through the MMIO dispatcher instead of being mapped.
    pub fn is_subpage(&self) -> bool {
        !is_aligned_4k(self.virt_start.as_usize())
            || !is_aligned_4k(self.phys_start.as_usize())
            || !is_aligned_4k(self.size)
    }

    /// Whether the host physical address `addr` lies inside this region.
    pub fn contains_phys(&self, addr: PhysAddr) -> bool {
        let start = self.phys_start.as_usize();
        let addr = addr.as_usize();
        addr >= start && addr - start < self.size
    }

    fn phys_end(&self) -> usize {
        self.phys_start.as_usize() + self.size
    }

    /// The part of `self` that overlaps `other` in host physical space,
    /// placed at the matching position of `self`'s cell address range.
    pub fn phys_overlap(&self, other: &MemRegion) -> Option<MemRegion> {
        let start = self.phys_start.as_usize().max(other.phys_start.as_usize());
        let end = self.phys_end().min(other.phys_end());
        if start >= end {
            return None;
        }
        let offset = start - self.phys_start.as_usize();
        Some(MemRegion {
            phys_start: PhysAddr::from_usize(start),
            virt_start: self.virt_start + offset,
            size: end - start,
            flags: self.flags,
        })
    }
}

/// The static description of one cell.
#[derive(Debug, Clone)]
pub struct CellConfig {
    pub name: String,
    pub cpus: CpuSet,
    pub mem_regions: Vec<MemRegion>,
    /// Entry address of the first CPU when the cell is started.
    pub cpu_reset_address: GuestPhysAddr,
    pub flags: CellFlags,
}

impl CellConfig {
    pub fn new(name: &str, cpus: CpuSet) -> Self {
        Self {
            name: String::from(name),
            cpus,
            mem_regions: Vec::new(),
            cpu_reset_address: GuestPhysAddr::from_usize(0),
            flags: CellFlags::empty(),
        }
    }

    pub fn with_mem_region(mut self, region: MemRegion) -> Self {
        self.mem_regions.push(region);
        self
    }

    pub fn with_reset_address(mut self, entry: usize) -> Self {
        self.cpu_reset_address = GuestPhysAddr::from_usize(entry);
        self
    }

    pub fn with_flags(mut self, flags: CellFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Number of sub-page MMIO windows that need a dispatcher slot.
    pub fn num_subpage_windows(&self) -> usize {
        self.mem_regions
            .iter()
            .filter(|mem| mem.flags.contains(MemFlags::IO) && mem.is_subpage())
            .count()
    }

    /// Regions of non-root cells must be page granular unless they are
    /// emulated I/O windows.
    pub fn first_invalid_region(&self) -> Option<&MemRegion> {
        self.mem_regions
            .iter()
            .find(|mem| mem.is_subpage() && !mem.flags.contains(MemFlags::IO))
    }
}

/// The system-wide configuration handed to the hypervisor at boot.
#[derive(Debug, Clone)]
pub struct SystemConfig {
    /// Number of physical CPUs brought up under the hypervisor.
    pub num_cpus: usize,
    pub root_cell: CellConfig,
}
