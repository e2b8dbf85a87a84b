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

//! Per-cell MMIO region table and trapped-access dispatch.
//!
//! Each cell owns one [`MmioRegionTable`]: a fixed-capacity array of
//! `(region, handler)` bindings kept sorted by start address. Writers
//! serialize on the table lock. Readers never take a lock: they follow a
//! sequence-lock protocol on the table's generation counter, which is odd
//! while a writer is moving entries and even while the table is stable.
//! A lookup that observes an odd generation, or a generation change while it
//! was reading, starts over.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::hint::spin_loop;
use core::sync::atomic::{fence, AtomicPtr, AtomicUsize, Ordering};
use core::{fmt, mem, ptr};

use axerrno::{ax_err, AxError, AxResult};
use spin::Mutex;

use crate::GuestPhysAddr;

/// Description of one trapped MMIO access, as decoded by the architecture
/// trap handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmioAccess {
    /// Cell-relative address on entry. When a handler is invoked it holds
    /// the offset into the matched region instead.
    pub address: usize,
    /// Access width in bytes.
    pub size: usize,
    pub is_write: bool,
    /// Value to write, or the value read on return of a read access.
    pub value: u64,
}

impl MmioAccess {
    pub const fn read(address: usize, size: usize) -> Self {
        Self {
            address,
            size,
            is_write: false,
            value: 0,
        }
    }

    pub const fn write(address: usize, size: usize, value: u64) -> Self {
        Self {
            address,
            size,
            is_write: true,
            value,
        }
    }
}

/// Outcome of an MMIO dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmioResult {
    /// The access was emulated; for reads, [`MmioAccess::value`] is valid.
    Handled,
    /// No region covers the access.
    Unhandled,
    /// A handler rejected the access (permission, alignment, width).
    Error,
}

/// An MMIO access handler. `arg` is the opaque argument given at
/// registration; `access.address` is relative to the region start.
pub type MmioHandler = fn(arg: usize, access: &mut MmioAccess) -> MmioResult;

/// An emulated device that can be bound to MMIO regions with
/// [`MmioRegionTable::register_device`].
pub trait MmioDevice: Sync {
    /// Emulate one access. `access.address` is relative to the region start.
    fn handle_access(&self, access: &mut MmioAccess) -> MmioResult;
}

fn device_handler<D: MmioDevice>(arg: usize, access: &mut MmioAccess) -> MmioResult {
    // SAFETY: `arg` was produced from a `&'static D` in `register_device`.
    let device = unsafe { &*(arg as *const D) };
    device.handle_access(access)
}

/// A consistent copy of one table entry.
#[derive(Clone, Copy)]
pub struct MmioRegion {
    /// Cell-relative start address.
    pub start: GuestPhysAddr,
    pub size: usize,
    pub handler: MmioHandler,
    pub arg: usize,
}

impl MmioRegion {
    fn end(&self) -> usize {
        self.start.as_usize() + self.size
    }

    fn covers(&self, address: usize, end: usize) -> bool {
        self.start.as_usize() <= address && end <= self.end()
    }

    /// Invoke the bound handler with `access` translated to a region offset.
    pub fn handle(&self, access: &mut MmioAccess) -> MmioResult {
        access.address -= self.start.as_usize();
        (self.handler)(self.arg, access)
    }
}

impl fmt::Debug for MmioRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MmioRegion")
            .field("start", &self.start)
            .field("size", &format_args!("{:#x}", self.size))
            .field("handler", &(self.handler as *const ()))
            .field("arg", &format_args!("{:#x}", self.arg))
            .finish()
    }
}

/// Storage of one entry. Every field is an atomic so that readers racing a
/// writer never perform a data race; consistency across fields is provided by
/// the generation counter.
struct MmioSlot {
    start: AtomicUsize,
    size: AtomicUsize,
    handler: AtomicPtr<()>,
    arg: AtomicUsize,
}

impl MmioSlot {
    const fn empty() -> Self {
        Self {
            start: AtomicUsize::new(0),
            size: AtomicUsize::new(0),
            handler: AtomicPtr::new(ptr::null_mut()),
            arg: AtomicUsize::new(0),
        }
    }

    fn location(&self) -> (usize, usize) {
        (
            self.start.load(Ordering::Relaxed),
            self.size.load(Ordering::Relaxed),
        )
    }

    fn store(&self, region: &MmioRegion) {
        self.start.store(region.start.as_usize(), Ordering::Relaxed);
        self.size.store(region.size, Ordering::Relaxed);
        self.handler.store(region.handler as *mut (), Ordering::Relaxed);
        self.arg.store(region.arg, Ordering::Relaxed);
    }

    fn store_empty(&self) {
        self.start.store(0, Ordering::Relaxed);
        self.size.store(0, Ordering::Relaxed);
        self.handler.store(ptr::null_mut(), Ordering::Relaxed);
        self.arg.store(0, Ordering::Relaxed);
    }

    fn copy_from(&self, src: &MmioSlot) {
        self.start.store(src.start.load(Ordering::Relaxed), Ordering::Relaxed);
        self.size.store(src.size.load(Ordering::Relaxed), Ordering::Relaxed);
        self.handler.store(src.handler.load(Ordering::Relaxed), Ordering::Relaxed);
        self.arg.store(src.arg.load(Ordering::Relaxed), Ordering::Relaxed);
    }

    /// Read the entry. Must only be used for values that are subsequently
    /// validated against the generation counter, or under the table lock.
    fn load(&self) -> Option<MmioRegion> {
        let (start, size) = self.location();
        let handler = self.handler.load(Ordering::Relaxed);
        let arg = self.arg.load(Ordering::Relaxed);
        if handler.is_null() {
            return None;
        }
        Some(MmioRegion {
            start: GuestPhysAddr::from_usize(start),
            size,
            // SAFETY: non-null handler words are only ever written from a
            // valid `MmioHandler`, and the caller validates that the slot was
            // read while the table was quiescent.
            handler: unsafe { mem::transmute::<*mut (), MmioHandler>(handler) },
            arg,
        })
    }
}

#[cfg(test)]
pub(crate) static MUTATION_DELAY_SPINS: AtomicUsize = AtomicUsize::new(0);

#[inline]
fn mutation_delay() {
    #[cfg(test)]
    for _ in 0..MUTATION_DELAY_SPINS.load(Ordering::Relaxed) {
        spin_loop();
    }
}

/// The MMIO region table of one cell.
pub struct MmioRegionTable {
    /// Serializes writers. Readers never take it.
    lock: Mutex<()>,
    /// Even: quiescent. Odd: a mutation is in progress.
    generation: AtomicUsize,
    num_regions: AtomicUsize,
    slots: Box<[MmioSlot]>,
}

impl MmioRegionTable {
    /// Create a table able to hold `capacity` regions. The capacity never
    /// changes afterwards.
    pub fn new(capacity: usize) -> Self {
        Self {
            lock: Mutex::new(()),
            generation: AtomicUsize::new(0),
            num_regions: AtomicUsize::new(0),
            slots: (0..capacity).map(|_| MmioSlot::empty()).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of registered regions.
    pub fn len(&self) -> usize {
        self.num_regions.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current value of the generation counter.
    pub fn generation(&self) -> usize {
        self.generation.load(Ordering::Acquire)
    }

    /// Publish "mutation in progress" before any slot is touched.
    fn begin_update(&self) {
        self.generation.fetch_add(1, Ordering::Acquire);
        fence(Ordering::Release);
        mutation_delay();
    }

    /// Publish "stable" after every slot write.
    fn end_update(&self) {
        mutation_delay();
        self.generation.fetch_add(1, Ordering::Release);
    }

    /// Register `handler` for `[start, start + size)`.
    ///
    /// Fails with `NoMemory` when the table is full (the table is left
    /// untouched), with `AlreadyExists` when the region overlaps a registered
    /// one and with `InvalidInput` for empty or wrapping regions.
    pub fn register(
        &self,
        start: GuestPhysAddr,
        size: usize,
        handler: MmioHandler,
        arg: usize,
    ) -> AxResult {
        let end = match start.as_usize().checked_add(size) {
            Some(end) if size > 0 => end,
            _ => return ax_err!(InvalidInput, "invalid MMIO region size"),
        };

        let _guard = self.lock.lock();

        let num = self.num_regions.load(Ordering::Relaxed);
        if num >= self.slots.len() {
            return ax_err!(NoMemory, "overflow during MMIO region registration");
        }

        let index = self.slots[..num]
            .iter()
            .position(|slot| slot.location().0 > start.as_usize())
            .unwrap_or(num);

        let overlaps_prev = index > 0 && {
            let (prev_start, prev_size) = self.slots[index - 1].location();
            prev_start + prev_size > start.as_usize()
        };
        let overlaps_next = index < num && self.slots[index].location().0 < end;
        if overlaps_prev || overlaps_next {
            warn!(
                "MMIO region [{:#x}, {:#x}) overlaps a registered region",
                start.as_usize(),
                end
            );
            return Err(AxError::AlreadyExists);
        }

        self.begin_update();
        for n in (index + 1..=num).rev() {
            self.slots[n].copy_from(&self.slots[n - 1]);
        }
        self.slots[index].store(&MmioRegion {
            start,
            size,
            handler,
            arg,
        });
        self.num_regions.store(num + 1, Ordering::Relaxed);
        self.end_update();

        trace!(
            "registered MMIO region [{:#x}, {:#x}) at slot {}",
            start.as_usize(),
            end,
            index
        );
        Ok(())
    }

    /// Bind a `'static` device to `[start, start + size)`.
    pub fn register_device<D: MmioDevice>(
        &self,
        start: GuestPhysAddr,
        size: usize,
        device: &'static D,
    ) -> AxResult {
        self.register(
            start,
            size,
            device_handler::<D>,
            device as *const D as usize,
        )
    }

    /// Remove the region registered at exactly `start`.
    ///
    /// Returns `NotFound` if there is none, which makes repeated removal a
    /// harmless no-op.
    pub fn unregister(&self, start: GuestPhysAddr) -> AxResult {
        let _guard = self.lock.lock();

        let num = self.num_regions.load(Ordering::Relaxed);
        let index = self.slots[..num]
            .binary_search_by_key(&start.as_usize(), |slot| slot.location().0)
            .map_err(|_| AxError::NotFound)?;

        self.begin_update();
        for n in index..num - 1 {
            self.slots[n].copy_from(&self.slots[n + 1]);
        }
        self.slots[num - 1].store_empty();
        self.num_regions.store(num - 1, Ordering::Relaxed);
        self.end_update();

        trace!("unregistered MMIO region at {:#x}", start.as_usize());
        Ok(())
    }

    /// Whether nothing was written since `generation` was sampled.
    #[inline]
    fn unchanged_since(&self, generation: usize) -> bool {
        fence(Ordering::Acquire);
        self.generation.load(Ordering::Relaxed) == generation
    }

    /// Find the region fully covering `[address, address + size)`.
    ///
    /// Never blocks. Every returned region was read in full while the table
    /// was quiescent.
    pub fn lookup(&self, address: GuestPhysAddr, size: usize) -> Option<MmioRegion> {
        let address = address.as_usize();
        let end = address.checked_add(size)?;

        'retry: loop {
            let generation = self.generation.load(Ordering::Acquire);
            if generation & 1 != 0 {
                spin_loop();
                continue;
            }

            let num = self.num_regions.load(Ordering::Relaxed);
            if num > self.slots.len() {
                continue;
            }

            let mut range_start = 0;
            let mut range_size = num;
            while range_size > 0 {
                let index = range_start + range_size / 2;
                let (start, len) = self.slots[index].location();
                if !self.unchanged_since(generation) {
                    continue 'retry;
                }

                if address < start {
                    range_size = index - range_start;
                } else if start + len < end {
                    range_size -= index + 1 - range_start;
                    range_start = index + 1;
                } else {
                    let candidate = self.slots[index].load();
                    if !self.unchanged_since(generation) {
                        continue 'retry;
                    }
                    return candidate.filter(|region| region.covers(address, end));
                }
            }

            if !self.unchanged_since(generation) {
                continue 'retry;
            }
            return None;
        }
    }

    /// Route a trapped access to its handler.
    pub fn dispatch(&self, access: &mut MmioAccess) -> MmioResult {
        match self.lookup(GuestPhysAddr::from_usize(access.address), access.size) {
            Some(region) => region.handle(access),
            None => MmioResult::Unhandled,
        }
    }

    /// A copy of all registered regions in address order.
    pub fn regions(&self) -> Vec<MmioRegion> {
        let _guard = self.lock.lock();
        let num = self.num_regions.load(Ordering::Relaxed);
        self.slots[..num].iter().filter_map(MmioSlot::load).collect()
    }
}

impl fmt::Debug for MmioRegionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MmioRegionTable")
            .field("capacity", &self.capacity())
            .field("generation", &self.generation())
            .field("regions", &self.regions())
            .finish()
    }
}
