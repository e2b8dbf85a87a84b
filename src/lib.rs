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

//! AxCell - Cell partitioning control core for ArceOS hypervisors.
//!
//! This crate statically divides a multicore machine into isolated cells, each
//! owning a fixed set of physical CPUs, memory regions and emulated devices,
//! and provides the two mechanisms that make reconfiguring such a system safe
//! while it runs:
//!
//! - a cross-CPU control rendezvous that lets one CPU suspend, resume, park or
//!   reset another CPU's cell execution, and
//! - a lock-free, per-cell MMIO region table that routes every trapped device
//!   access to its emulation handler while the table may be changing.
//!
//! Architecture-specific operations are delegated to an implementation of the
//! [`AxCellHal`] trait.
//!
//! # Features
//!
//! - Busy-wait suspend/resume rendezvous, no scheduler required
//! - Sequence-locked MMIO dispatch with binary search over sorted regions
//! - Cell lifecycle management (create → start → destroy) from the root cell
//! - Management hypercall interface

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate alloc;
#[macro_use]
extern crate log;

// Core modules
mod addr; // Guest and host physical address types
mod cell; // Cell data model
mod config; // Static cell configuration
mod control; // Cross-CPU suspend/resume rendezvous
mod cpuset; // CPU bitmaps
mod exit; // Actions taken after a management event
mod hal; // Hardware abstraction layer interfaces
mod hypercall; // Root cell management hypercalls
mod hypervisor; // Hypervisor-wide context and cell registry
mod mmio; // MMIO region table and dispatch
mod percpu; // Per-CPU control state
mod reconfig; // Cell create/start/destroy and shutdown
mod unit; // Device emulation units

// Public API exports
pub use addr::{GuestPhysAddr, HostPhysAddr};
pub use cell::{Cell, CellId, CellState};
pub use config::{CellConfig, CellFlags, MemFlags, MemRegion, SystemConfig};
pub use cpuset::{CpuSet, MAX_CPUS};
pub use exit::CpuEvent;
pub use hal::AxCellHal;
pub use hypercall::*;
pub use hypervisor::{Hypervisor, PartitionFault};
pub use mmio::{MmioAccess, MmioDevice, MmioHandler, MmioRegion, MmioRegionTable, MmioResult};
pub use percpu::{CpuStat, CpuState, PerCpuControl, PENDING_IRQS};
pub use unit::EmulationUnit;
