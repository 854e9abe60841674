/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

pub mod status;

use crate::{
    campaign::Configuration,
    protocol::{self, GuestMessage, HostMessage, StartRound, Transport},
    provisioner::{GuestDescriptor, Provisioner},
};
use colored::Colorize;
use std::{fmt, future::Future, io::ErrorKind, time::Duration};
use status::{GuestStatus, Pool};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    WaitReady,
    StartSent,
    WaitFinished,
    ContinueSent,
    WaitUploaded,
    ResetSent,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::WaitReady => "WAIT_READY",
            Stage::StartSent => "START_SENT",
            Stage::WaitFinished => "WAIT_FINISHED",
            Stage::ContinueSent => "CONTINUE_SENT",
            Stage::WaitUploaded => "WAIT_UPLOADED",
            Stage::ResetSent => "RESET_SENT",
        })
    }
}

#[derive(Error, Debug)]
pub enum BarrierError {
    #[error("{stage} timed out after {limit:?}, still waiting on {waiting:?}")]
    Timeout {
        stage: Stage,
        limit: Duration,
        waiting: Vec<String>,
    },
    #[error("control socket failed while in {stage}")]
    Receive {
        stage: Stage,
        #[source]
        source: std::io::Error,
    },
}

/// Host side of the lockstep protocol. Drives one campaign entry at a time through every
/// (open VM count, benchmark) round, shrinking the pool by one guest per open VM count.
pub struct BarrierController<'a> {
    transport: &'a dyn Transport,
    provisioner: &'a Provisioner,
    benchmarks: Vec<String>,
    stage_timeout: Option<Duration>,
}

impl<'a> BarrierController<'a> {
    pub fn new(
        transport: &'a dyn Transport,
        provisioner: &'a Provisioner,
        benchmarks: Vec<String>,
    ) -> Self {
        Self {
            transport,
            provisioner,
            benchmarks,
            stage_timeout: None,
        }
    }

    /// Bounds every wait stage. Without a limit an unresponsive guest stalls the entry forever.
    pub fn with_stage_timeout(mut self, stage_timeout: Option<Duration>) -> Self {
        self.stage_timeout = stage_timeout;
        self
    }

    /// Runs every round of `config` against an already created pool and tears the pool down,
    /// also when a round fails.
    pub async fn run_entry(
        &self,
        config: &Configuration,
        guests: &[GuestDescriptor],
    ) -> Result<(), BarrierError> {
        let mut pool = Pool::new(guests);

        let outcome = self.sweep(&mut pool, config).await;
        match &outcome {
            Ok(()) => println!("{}", "> benchmark suite complete".green()),
            Err(e) => warn!("Entry {config} failed: {e}. Tearing down the pool"),
        }

        // whatever is still up goes down now, the leader last
        while let Some(guest) = pool.highest_online().cloned() {
            self.provisioner.shutdown_guest(&guest).await;
            pool.take_offline(guest.slot);
        }

        outcome
    }

    /// Every benchmark at every open VM count, shutting down one guest after each count.
    async fn sweep(&self, pool: &mut Pool, config: &Configuration) -> Result<(), BarrierError> {
        for open_vms in (1..=pool.size()).rev() {
            for benchmark in &self.benchmarks {
                self.run_round(pool, config, benchmark, open_vms).await?;
            }

            if open_vms > 1 {
                if let Some(guest) = pool.highest_online().cloned() {
                    self.provisioner.shutdown_guest(&guest).await;
                    pool.take_offline(guest.slot);
                    info!("{} is offline, {} guests remain", guest.name, open_vms - 1);
                }
            }
        }

        Ok(())
    }

    async fn run_round(
        &self,
        pool: &mut Pool,
        config: &Configuration,
        benchmark: &str,
        open_vms: u32,
    ) -> Result<(), BarrierError> {
        self.wait_for_all(pool, GuestMessage::Ready, Stage::WaitReady)
            .await?;
        println!(
            "> all guests ready, starting {} with {} open VMs",
            benchmark.green(),
            open_vms
        );

        let start = HostMessage::Start(StartRound {
            benchmark: benchmark.to_string(),
            open_vms,
            taskset: config.taskset,
            entry: *config,
        });
        self.broadcast(pool, &start, Stage::StartSent).await;

        self.wait_for_all(pool, GuestMessage::Finished, Stage::WaitFinished)
            .await?;
        println!("> all guests finished, collecting results");

        self.broadcast(pool, &HostMessage::Continue, Stage::ContinueSent)
            .await;
        self.wait_for_upload(pool).await?;
        println!("> upload finished");

        self.broadcast(pool, &HostMessage::Reset, Stage::ResetSent)
            .await;

        Ok(())
    }

    /// Fire-and-forget send to every online guest. A failed send is logged and skipped.
    async fn broadcast(&self, pool: &Pool, message: &HostMessage, stage: Stage) {
        let payload = message.to_string();
        debug!("{stage}: broadcasting `{payload}`");

        for guest in pool.online() {
            if let Err(e) = self.transport.send_to(&payload, guest.address).await {
                warn!("{stage}: failed to reach {} at {}: {e}", guest.name, guest.address);
            }
        }
    }

    /// Blocks until every online guest has reported `expected`.
    async fn wait_for_all(
        &self,
        pool: &mut Pool,
        expected: GuestMessage,
        stage: Stage,
    ) -> Result<(), BarrierError> {
        let target = GuestStatus::from(expected);
        info!("{stage}: {}", pool.render());

        let converge = async {
            while !pool.converged(target) {
                let Some((slot, message)) = self.next_message(pool, stage).await? else {
                    continue;
                };

                if message == expected && pool.record(slot, target) {
                    info!("{stage}: {}", pool.render());
                } else {
                    debug!("{stage}: ignoring {message} from guest {slot}");
                }
            }
            Ok::<(), BarrierError>(())
        };

        let outcome = self.bounded(converge).await;
        outcome.unwrap_or_else(|limit| {
            Err(BarrierError::Timeout {
                stage,
                limit,
                waiting: pool.unconverged(target),
            })
        })
    }

    /// Blocks until a single UPLOADED arrives. Only the leader uploads, so this is a
    /// handshake rather than a convergence check.
    async fn wait_for_upload(&self, pool: &Pool) -> Result<(), BarrierError> {
        let stage = Stage::WaitUploaded;

        let handshake = async {
            loop {
                let Some((slot, message)) = self.next_message(pool, stage).await? else {
                    continue;
                };

                if message == GuestMessage::Uploaded {
                    if pool.leader_slot() != Some(slot) {
                        warn!("{stage}: upload acknowledged by non-leader guest {slot}");
                    }
                    return Ok::<(), BarrierError>(());
                }
                debug!("{stage}: ignoring {message} from guest {slot}");
            }
        };

        let outcome = self.bounded(handshake).await;
        outcome.unwrap_or_else(|limit| {
            Err(BarrierError::Timeout {
                stage,
                limit,
                waiting: pool.leader_name().into_iter().collect(),
            })
        })
    }

    /// Applies the stage timeout, if any. `Err` carries the limit that elapsed.
    async fn bounded<T>(&self, fut: impl Future<Output = T>) -> Result<T, Duration> {
        match self.stage_timeout {
            None => Ok(fut.await),
            Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| limit),
        }
    }

    /// Receives one datagram and resolves it to a guest slot. Datagrams from unknown senders
    /// or with unparsable payloads are dropped and yield `None`.
    async fn next_message(
        &self,
        pool: &Pool,
        stage: Stage,
    ) -> Result<Option<(u32, GuestMessage)>, BarrierError> {
        let (payload, sender) = match self.transport.recv_from().await {
            Ok(received) => received,
            // stale ICMP errors from guests that were just shut down
            Err(e) if matches!(e.kind(), ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset) => {
                debug!("{stage}: ignoring socket error {e}");
                return Ok(None);
            }
            Err(source) => return Err(BarrierError::Receive { stage, source }),
        };

        let Some(slot) = pool.resolve(sender) else {
            debug!("{stage}: dropping datagram from unknown sender {sender}");
            return Ok(None);
        };

        match protocol::decode(&payload).and_then(str::parse::<GuestMessage>) {
            Ok(message) => Ok(Some((slot, message))),
            Err(e) => {
                debug!("{stage}: dropping datagram from guest {slot}: {e}");
                Ok(None)
            }
        }
    }
}
