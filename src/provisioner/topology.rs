/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use super::ProvisionError;
use crate::campaign::{dimensions::Hyperthreading, Configuration};
use std::ops::RangeInclusive;

/// Guest sizing and placement for one campaign entry. CPU numbers are host logical CPUs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topology {
    pub guest_vcpus: u32,
    pub host_cpus: u32,
    pub first_cpu: u32,
    pub pool_size: u32,
}

impl Topology {
    /// # Arguments
    ///
    /// * `host_cores` - physical cores on the host
    /// * `dom0_cores` - cores set aside for dom0 when the entry pins dom0 away from guests
    pub fn for_entry(
        config: &Configuration,
        host_cores: u32,
        dom0_cores: u32,
    ) -> Result<Self, ProvisionError> {
        let threads_per_core = match config.hyperthreading {
            Hyperthreading::On => 2,
            Hyperthreading::Off => 1,
        };

        let guest_vcpus = (host_cores / config.vm_count.guests()) * threads_per_core;
        if guest_vcpus == 0 {
            return Err(ProvisionError::Topology(format!(
                "{host_cores} host cores cannot be split into {} guests",
                config.vm_count.guests()
            )));
        }
        let host_cpus = host_cores * threads_per_core;

        // guests start on the first guest-sized block boundary past the dom0 reservation
        let first_cpu = if config.dom0_cpus.reserves_cpus() {
            (dom0_cores * threads_per_core).div_ceil(guest_vcpus) * guest_vcpus
        } else {
            0
        };

        let pool_size = host_cpus.saturating_sub(first_cpu) / guest_vcpus;
        if pool_size == 0 {
            return Err(ProvisionError::Topology(format!(
                "no room for a {guest_vcpus} vCPU guest after reserving CPUs 0-{}",
                first_cpu.saturating_sub(1)
            )));
        }

        Ok(Self {
            guest_vcpus,
            host_cpus,
            first_cpu,
            pool_size,
        })
    }

    /// Inclusive physical CPU range for the guest in 0-based `slot`.
    pub fn pin_range(&self, slot: u32) -> RangeInclusive<u32> {
        let lowest = self.first_cpu + slot * self.guest_vcpus;
        lowest..=lowest + self.guest_vcpus - 1
    }
}
