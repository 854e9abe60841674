/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

mod archive;

use crate::{
    campaign::dimensions::Taskset,
    config::GuestConfig,
    protocol::{self, GuestMessage, HostMessage, StartRound, Transport},
    store::ObjectStore,
};
use anyhow::{anyhow, Context};
use futures_util::future::join_all;
use std::{io::ErrorKind, path::PathBuf};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Where the agent is in the current round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Idle,
    Running,
    FinishedSent,
    Uploading,
    UploadedSent,
}

/// Guest side of the lockstep protocol. Runs one round per START and reports back to the
/// host after each phase.
pub struct GuestAgent<'a> {
    transport: &'a dyn Transport,
    config: GuestConfig,
    store: Option<Box<dyn ObjectStore>>,
    state: AgentState,
}

impl<'a> GuestAgent<'a> {
    pub fn new(
        transport: &'a dyn Transport,
        config: GuestConfig,
        store: Option<Box<dyn ObjectStore>>,
    ) -> anyhow::Result<Self> {
        if config.leader && store.is_none() {
            return Err(anyhow!("the leader guest needs a result store to upload to"));
        }

        Ok(Self {
            transport,
            config,
            store,
            state: AgentState::Idle,
        })
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    /// Serves rounds until an error occurs. Only upload and socket failures end the loop.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        loop {
            self.run_cycle().await?;
        }
    }

    /// Announces readiness and serves exactly one round, returning once RESET arrives.
    pub async fn run_cycle(&mut self) -> anyhow::Result<StartRound> {
        self.state = AgentState::Idle;
        self.send(GuestMessage::Ready).await?;

        info!("Waiting on START");
        let round = self
            .wait_for(|message| match message {
                HostMessage::Start(round) => Some(round),
                _ => None,
            })
            .await?;
        info!(
            "Starting {} with {} open VMs for {}",
            round.benchmark, round.open_vms, round.entry
        );

        self.state = AgentState::Running;
        self.run_workers(&round).await;

        self.send(GuestMessage::Finished).await?;
        self.state = AgentState::FinishedSent;

        // keeps UPLOADED from racing the FINISHED barrier on the host
        self.wait_for(|message| (message == HostMessage::Continue).then_some(()))
            .await?;

        if self.config.leader {
            self.state = AgentState::Uploading;
            self.upload_results(&round).await?;
            self.send(GuestMessage::Uploaded).await?;
            self.state = AgentState::UploadedSent;
        } else {
            self.state = AgentState::Idle;
        }

        self.wait_for(|message| (message == HostMessage::Reset).then_some(()))
            .await?;
        self.state = AgentState::Idle;

        Ok(round)
    }

    async fn send(&self, message: GuestMessage) -> anyhow::Result<()> {
        debug!("Sending {message} to {}", self.config.host_address);
        self.transport
            .send_to(&message.to_string(), self.config.host_address)
            .await
            .context(format!("Error sending {message} to host"))
    }

    /// Receives until `accept` picks a host message. Everything else is logged and dropped.
    async fn wait_for<T>(&self, accept: impl Fn(HostMessage) -> Option<T>) -> anyhow::Result<T> {
        loop {
            let (payload, sender) = self
                .transport
                .recv_from()
                .await
                .context("Error receiving from control socket")?;

            match protocol::decode(&payload).and_then(str::parse::<HostMessage>) {
                Ok(message) => {
                    let description = message.to_string();
                    match accept(message) {
                        Some(accepted) => return Ok(accepted),
                        None => debug!(
                            "Ignoring `{description}` from {sender} in state {:?}",
                            self.state
                        ),
                    }
                }
                Err(e) => debug!("Dropping datagram from {sender}: {e}"),
            }
        }
    }

    fn output_path(&self, benchmark: &str, worker: usize) -> PathBuf {
        self.config
            .results_dir
            .join(format!("{benchmark}{worker}.out"))
    }

    /// Runs one worker per logical CPU and waits for all of them. Exit status is not
    /// inspected and a worker that can't be spawned counts as exited.
    async fn run_workers(&self, round: &StartRound) {
        let program = self.config.benchmark_dir.join(&round.benchmark);
        let pin = pins_workers(round, &self.config.benchmarks);

        if self.config.leader {
            if let Err(e) = tokio::fs::create_dir_all(&self.config.results_dir).await {
                warn!("Can't create {:?}: {e}", self.config.results_dir);
            }
            self.clear_outputs(&round.benchmark).await;
        }

        let workers = (0..self.config.worker_count())
            .filter_map(|worker| {
                let mut command = Command::new(&program);
                if self.config.leader {
                    command.arg(self.output_path(&round.benchmark, worker));
                }

                match command.kill_on_drop(true).spawn() {
                    Ok(child) => Some(child),
                    Err(e) => {
                        warn!("Failed to spawn worker {worker} ({program:?}): {e}");
                        None
                    }
                }
            })
            .collect::<Vec<Child>>();

        if pin {
            for child in &workers {
                if let Some(pid) = child.id() {
                    set_full_affinity(pid);
                }
            }
        }

        info!("Waiting on {} workers to finish", workers.len());
        let statuses = join_all(workers.into_iter().map(|mut child| async move {
            child.wait().await
        }))
        .await;

        for status in statuses.iter().filter_map(|status| status.as_ref().err()) {
            debug!("Worker wait failed: {status}");
        }
    }

    /// Removes the previous round's output files so a worker that writes nothing can't have
    /// stale results uploaded in its name.
    async fn clear_outputs(&self, benchmark: &str) {
        for worker in 0..self.config.worker_count() {
            let path = self.output_path(benchmark, worker);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!("Removed stale result file {path:?}"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("Can't remove stale result file {path:?}: {e}"),
            }
        }
    }

    async fn upload_results(&self, round: &StartRound) -> anyhow::Result<()> {
        let store = self
            .store
            .as_ref()
            .context("the leader guest has no result store")?;

        let outputs = (0..self.config.worker_count())
            .map(|worker| self.output_path(&round.benchmark, worker))
            .collect::<Vec<_>>();
        let archive_path = self
            .config
            .results_dir
            .join(format!("{}.tar.gz", round.benchmark));

        info!("Compressing {} result files", outputs.len());
        let written = archive::pack(archive_path.clone(), outputs).await?;

        let remote = format!(
            "{}/{}/{}.tar.gz",
            round.entry.remote_key(),
            round.open_vms,
            round.benchmark
        );
        info!("Uploading {written} result files to {remote}");
        store.upload(&archive_path, &remote).await
    }
}

/// Workers are pinned only for `taskset-on` rounds of a benchmark this guest knows about.
fn pins_workers(round: &StartRound, benchmarks: &[String]) -> bool {
    round.taskset == Taskset::On && benchmarks.iter().any(|b| *b == round.benchmark)
}

#[cfg(target_os = "linux")]
fn set_full_affinity(pid: u32) {
    use nix::{sched::CpuSet, unistd::Pid};

    let mut cpu_set = CpuSet::new();
    for cpu in 0..num_cpus::get() {
        if let Err(e) = cpu_set.set(cpu) {
            warn!("Can't add CPU {cpu} to the affinity mask: {e}");
        }
    }

    if let Err(e) = nix::sched::sched_setaffinity(Pid::from_raw(pid as i32), &cpu_set) {
        warn!("Can't change affinity of worker {pid}: {e}");
    }
}

#[cfg(not(target_os = "linux"))]
fn set_full_affinity(pid: u32) {
    warn!("CPU affinity is not supported on this platform, worker {pid} left unpinned");
}
