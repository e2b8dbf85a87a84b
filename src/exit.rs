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

use crate::GuestPhysAddr;

#[allow(unused_imports)] // used in doc
use crate::AxCellHal;

/// The result of [`Hypervisor::handle_exit_event`](crate::Hypervisor::handle_exit_event):
/// what the CPU does once no other CPU holds it in the hypervisor any more.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuEvent {
    /// Continue guest execution where it was interrupted.
    Resume,
    /// The CPU was handed to [`AxCellHal::park_cpu`]. It stays parked until it
    /// is reset with a valid entry address.
    Park,
    /// The CPU was handed to [`AxCellHal::reset_cpu`] and restarts its cell
    /// at the given address.
    Reset(GuestPhysAddr),
}
