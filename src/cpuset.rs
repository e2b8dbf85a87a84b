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

use bitvec::prelude::*;

/// The maximum number of physical CPUs a [`CpuSet`] can describe.
pub const MAX_CPUS: usize = 256;

type CpuBits = BitArr!(for MAX_CPUS, in u64, Lsb0);

/// A fixed-size bitmap of physical CPU indices.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuSet {
    bits: CpuBits,
}

impl CpuSet {
    /// Create an empty set.
    pub const fn new() -> Self {
        Self {
            bits: BitArray::ZERO,
        }
    }

    /// Create a set containing the CPUs in `0..count`.
    pub fn with_first(count: usize) -> Self {
        let mut set = Self::new();
        set.bits[..count.min(MAX_CPUS)].fill(true);
        set
    }

    /// Add `cpu` to the set. Indices beyond [`MAX_CPUS`] are ignored.
    pub fn set(&mut self, cpu: usize) {
        if cpu < MAX_CPUS {
            self.bits.set(cpu, true);
        }
    }

    /// Remove `cpu` from the set.
    pub fn clear(&mut self, cpu: usize) {
        if cpu < MAX_CPUS {
            self.bits.set(cpu, false);
        }
    }

    pub fn contains(&self, cpu: usize) -> bool {
        self.bits.get(cpu).as_deref() == Some(&true)
    }

    pub fn is_empty(&self) -> bool {
        self.bits.not_any()
    }

    pub fn len(&self) -> usize {
        self.bits.count_ones()
    }

    /// The lowest CPU index in the set.
    pub fn first(&self) -> Option<usize> {
        self.bits.first_one()
    }

    /// Whether every CPU of `self` is also in `other`.
    pub fn is_subset_of(&self, other: &CpuSet) -> bool {
        self.bits.iter_ones().all(|cpu| other.bits[cpu])
    }

    /// Iterate over the CPU indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter_ones()
    }
}

impl FromIterator<usize> for CpuSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut set = Self::new();
        for cpu in iter {
            set.set(cpu);
        }
        set
    }
}

impl fmt::Debug for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}
