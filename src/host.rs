/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    barrier::BarrierController,
    campaign::{Campaign, Configuration},
    protocol::Transport,
    provisioner::{GuestDescriptor, Provisioner},
};
use anyhow::Context;
use colored::Colorize;
use tracing::info;

/// Walks a campaign one entry at a time: provision the pool, run the barrier, mark the entry
/// done. Strictly single-flight since each entry owns the whole host.
pub struct CampaignRunner<'a> {
    provisioner: &'a Provisioner,
    barrier: BarrierController<'a>,
}

impl<'a> CampaignRunner<'a> {
    pub fn new(provisioner: &'a Provisioner, transport: &'a dyn Transport) -> Self {
        let host = provisioner.host();
        let barrier = BarrierController::new(transport, provisioner, host.benchmarks.clone())
            .with_stage_timeout(host.barrier_timeout());

        Self {
            provisioner,
            barrier,
        }
    }

    /// Writes the descriptors for the next entry this host can run without starting anything.
    pub fn write_next_descriptors(
        &self,
        campaign: &Campaign,
    ) -> anyhow::Result<Option<(Configuration, Vec<GuestDescriptor>)>> {
        write_next_descriptors(self.provisioner, campaign)
    }

    /// Runs the next runnable entry to completion. Returns `None` once nothing runnable is left.
    pub async fn run_next(&self, campaign: &mut Campaign) -> anyhow::Result<Option<Configuration>> {
        let Some((config, guests)) = self.write_next_descriptors(campaign)? else {
            return Ok(None);
        };

        println!("> running {}", config.to_string().green());
        info!(
            "{} entries remain, pool of {} guests",
            campaign.remaining(),
            guests.len()
        );

        self.provisioner
            .create_pool(&config, &guests)
            .await
            .context(format!("Error creating guest pool for {config}"))?;

        self.barrier
            .run_entry(&config, &guests)
            .await
            .context(format!("Error running {config}"))?;

        campaign
            .mark_done(&config)
            .context(format!("Error marking {config} as done"))?;

        Ok(Some(config))
    }

    /// Runs entries until none are runnable on this host. Returns how many were run.
    pub async fn run(&self, campaign: &mut Campaign) -> anyhow::Result<usize> {
        let mut completed = 0;
        while self.run_next(campaign).await?.is_some() {
            completed += 1;
        }

        println!(
            "> {} entries completed, {} remain in the campaign",
            completed,
            campaign.remaining()
        );
        Ok(completed)
    }
}

/// Writes the descriptors for the next entry this host can run. Needs no control socket, so
/// config-only runs work while another host run holds the port.
pub fn write_next_descriptors(
    provisioner: &Provisioner,
    campaign: &Campaign,
) -> anyhow::Result<Option<(Configuration, Vec<GuestDescriptor>)>> {
    let Some(entry) = campaign.next_runnable(&provisioner.host().profile) else {
        return Ok(None);
    };
    let config = entry.config;

    let guests = provisioner
        .prepare(&config)
        .context(format!("Error preparing guests for {config}"))?;

    Ok(Some((config, guests)))
}
