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

//! Cross-CPU control rendezvous.
//!
//! Any CPU can hold another one in the hypervisor with
//! [`Hypervisor::suspend_cpu`], mutate state the target depends on, and let it
//! go again with [`Hypervisor::resume_cpu`], optionally redirecting it to the
//! parking loop or to a reset. The target reacts in
//! [`Hypervisor::handle_exit_event`], which it runs whenever a cross-CPU event
//! forced it out of guest mode.
//!
//! There is no scheduler below the hypervisor, so every wait here is a plain
//! spin. A target that never takes the event wedges the suspending CPU.

use core::hint::spin_loop;
use core::mem;
use core::sync::atomic::{fence, Ordering};

use crate::percpu::CpuStat;
use crate::{AxCellHal, Cell, CpuEvent, GuestPhysAddr, Hypervisor};

impl<H: AxCellHal> Hypervisor<H> {
    /// Hold `cpu_id` in the hypervisor. Returns only once the target has
    /// acknowledged, which may be never if it does not take the event.
    pub fn suspend_cpu(&self, cpu_id: usize) {
        let target = self.cpu(cpu_id);

        let target_suspended = {
            let _requests = target.control_lock.lock();
            target.suspend_cpu.store(true, Ordering::Relaxed);
            target.cpu_suspended.load(Ordering::Relaxed)
        };

        if !target_suspended {
            // The request has to be visible before the event can arrive.
            fence(Ordering::SeqCst);
            self.hal.send_event(cpu_id);

            while !target.cpu_suspended.load(Ordering::Acquire) {
                spin_loop();
            }
        }
        trace!("CPU {} suspended", cpu_id);
    }

    /// Release `cpu_id` from a previous [`suspend_cpu`](Self::suspend_cpu).
    /// Does not wait for the target to leave the hypervisor.
    pub fn resume_cpu(&self, cpu_id: usize) {
        let target = self.cpu(cpu_id);
        let _requests = target.control_lock.lock();
        // Every state change made while the target was held becomes visible
        // before it can observe the release.
        target.suspend_cpu.store(false, Ordering::Release);
        trace!("CPU {} resumed", cpu_id);
    }

    /// Restart the suspended `cpu_id` at `entry` once it is released, or park
    /// it if `entry` is `None`.
    pub fn reset_cpu(&self, cpu_id: usize, entry: Option<GuestPhysAddr>) {
        {
            let mut requests = self.cpu(cpu_id).control_lock.lock();
            requests.reset = true;
            requests.cpu_on_entry = entry;
        }
        self.resume_cpu(cpu_id);
    }

    /// Send the suspended `cpu_id` to the parking loop once it is released.
    pub fn park_cpu(&self, cpu_id: usize) {
        self.cpu(cpu_id).control_lock.lock().park = true;
        self.resume_cpu(cpu_id);
    }

    /// Suspend every CPU of `cell` except the calling one.
    pub fn cell_suspend(&self, cell: &Cell, this_cpu: usize) {
        for cpu in cell.cpu_set().iter().filter(|cpu| *cpu != this_cpu) {
            self.suspend_cpu(cpu);
        }
    }

    /// Resume every CPU of `cell` except the calling one.
    pub fn cell_resume(&self, cell: &Cell, this_cpu: usize) {
        for cpu in cell.cpu_set().iter().filter(|cpu| *cpu != this_cpu) {
            self.resume_cpu(cpu);
        }
    }

    /// Invalidate second-level translation caches on all CPUs of `cell`.
    ///
    /// The calling CPU flushes immediately, the others on their next
    /// management event. Meant to be used while the other CPUs are suspended.
    pub fn flush_cell_vcpu_caches(&self, cell: &Cell, this_cpu: usize) {
        for cpu in cell.cpu_set().iter() {
            if cpu == this_cpu {
                self.hal.flush_vcpu_caches(cpu);
            } else {
                self.cpu(cpu).control_lock.lock().flush_vcpu_caches = true;
            }
        }
    }

    /// Process pending control requests of the calling CPU `this_cpu`.
    ///
    /// Spins for as long as another CPU holds this one, then decides what the
    /// CPU does next. Does not hand the CPU to the platform layer; see
    /// [`handle_exit_event`](Self::handle_exit_event).
    pub fn check_events(&self, this_cpu: usize) -> CpuEvent {
        let cpu_data = self.cpu(this_cpu);
        let mut event = CpuEvent::Resume;

        let mut requests = cpu_data.control_lock.lock();

        while cpu_data.suspend_cpu.load(Ordering::Relaxed) {
            cpu_data.cpu_suspended.store(true, Ordering::Release);

            drop(requests);

            while cpu_data.suspend_cpu.load(Ordering::Acquire) {
                spin_loop();
            }

            requests = cpu_data.control_lock.lock();
        }

        cpu_data.cpu_suspended.store(false, Ordering::Relaxed);

        if requests.park {
            requests.enter_cpu_off();
        } else if requests.reset {
            requests.reset = false;
            match requests.cpu_on_entry {
                Some(entry) => {
                    requests.wait_for_poweron = false;
                    event = CpuEvent::Reset(entry);
                }
                None => requests.enter_cpu_off(),
            }
        }

        let flush = mem::take(&mut requests.flush_vcpu_caches);

        // wait_for_poweron is only modified by this CPU.
        if requests.wait_for_poweron {
            event = CpuEvent::Park;
        }

        drop(requests);

        if flush {
            self.hal.flush_vcpu_caches(this_cpu);
        }
        event
    }

    /// Entry point of the calling CPU `this_cpu` after a cross-CPU event
    /// forced it out of guest mode.
    ///
    /// Parking and resetting are handed to the platform layer before
    /// returning the action taken.
    pub fn handle_exit_event(&self, this_cpu: usize) -> CpuEvent {
        let cpu_data = self.cpu(this_cpu);
        cpu_data.count(CpuStat::VmExitsTotal);
        cpu_data.count(CpuStat::VmExitsManagement);

        let event = self.check_events(this_cpu);
        match event {
            CpuEvent::Resume => {}
            CpuEvent::Park => {
                debug!("CPU {} parked", this_cpu);
                self.hal.park_cpu(this_cpu);
            }
            CpuEvent::Reset(entry) => {
                debug!("CPU {} reset to {:?}", this_cpu, entry);
                self.hal.reset_cpu(this_cpu, entry);
            }
        }
        event
    }
}
