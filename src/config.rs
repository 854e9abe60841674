/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    io::Read,
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_PORT: u16 = 44544;

// ******** ******** ********
// **    CONFIGURATION     **
// ******** ******** ********
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    pub host: Option<HostConfig>,
    pub guest: Option<GuestConfig>,
}
impl Config {
    pub fn try_from_path(path: &Path) -> anyhow::Result<Config> {
        let mut config_str = String::new();
        fs::File::open(path)
            .context(format!("Unable to open config file {:?}", path))?
            .read_to_string(&mut config_str)?;
        Config::try_from_str(&config_str)
    }

    pub fn try_from_str(conf_str: &str) -> anyhow::Result<Config> {
        let config = toml::from_str::<Config>(conf_str)
            .map_err(|e| anyhow::anyhow!("TOML parsing error: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Every benchmark name travels in a START datagram, so it must fit in one.
    fn validate(&self) -> anyhow::Result<()> {
        let host = self.host.iter().flat_map(|host| &host.benchmarks);
        let guest = self.guest.iter().flat_map(|guest| &guest.benchmarks);

        for name in host.chain(guest) {
            crate::protocol::check_benchmark_name(name).context("Invalid benchmarks list")?;
        }
        Ok(())
    }

    pub fn host(&self) -> anyhow::Result<&HostConfig> {
        self.host
            .as_ref()
            .context("Config file has no [host] section")
    }

    pub fn guest(&self) -> anyhow::Result<&GuestConfig> {
        self.guest
            .as_ref()
            .context("Config file has no [guest] section")
    }
}

/// The hypervisor's current boot configuration. Only campaign entries matching it can run.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Default)]
#[serde(default)]
pub struct HostProfile {
    pub null_scheduler: bool,
    pub low_slop: bool,
    pub dom0: Dom0Profile,
    pub hyperthreading: bool,
    pub skip_hvm: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Default)]
#[serde(tag = "cpus", rename_all = "lowercase")]
pub enum Dom0Profile {
    #[default]
    #[serde(rename = "all")]
    AllCpus,
    Restricted {
        pinned: bool,
    },
}
impl Dom0Profile {
    pub fn is_restricted_pinned(&self) -> bool {
        matches!(self, Dom0Profile::Restricted { pinned: true })
    }

    pub fn is_restricted_unpinned(&self) -> bool {
        matches!(self, Dom0Profile::Restricted { pinned: false })
    }
}

/// Network identity of one guest slot. Slot `n` (1-based) in the list hosts guest `n`.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct GuestSlot {
    pub mac: String,
    /// HVM guests boot with their own MAC so their leases don't collide with PV ones.
    pub hvm_mac: Option<String>,
    pub address: IpAddr,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HostConfig {
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    #[serde(default = "default_port")]
    pub guest_port: u16,

    /// Physical cores on the host, before hyperthreading.
    pub host_cpus: u32,
    /// Cores reserved for dom0 when it is restricted and pinned.
    #[serde(default = "default_dom0_cpus")]
    pub dom0_cpus: u32,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u32,

    #[serde(default = "default_name_prefix")]
    pub guest_name_prefix: String,
    pub guest_cfg_dir: PathBuf,
    pub image_dir: PathBuf,
    #[serde(rename = "guest")]
    pub guests: Vec<GuestSlot>,

    #[serde(default = "default_benchmarks")]
    pub benchmarks: Vec<String>,

    /// Command prefix used to talk to the hypervisor toolstack.
    #[serde(default = "default_xl")]
    pub xl: String,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
    #[serde(default = "default_settle_delay")]
    pub settle_delay_secs: u64,
    /// Unset means barrier stages wait indefinitely.
    pub barrier_timeout_secs: Option<u64>,

    #[serde(default)]
    pub profile: HostProfile,
}
impl HostConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }

    pub fn barrier_timeout(&self) -> Option<Duration> {
        self.barrier_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GuestConfig {
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    pub host_address: SocketAddr,
    /// Only the leader persists worker output and uploads it.
    #[serde(default)]
    pub leader: bool,
    pub benchmark_dir: PathBuf,
    pub results_dir: PathBuf,
    /// Benchmarks that honour the taskset flag.
    #[serde(default = "default_benchmarks")]
    pub benchmarks: Vec<String>,
    /// Worker count, defaults to the number of logical CPUs.
    pub workers: Option<usize>,
    pub store: Option<StoreConfig>,
}
impl GuestConfig {
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(num_cpus::get)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    Http {
        url: String,
        token: Option<String>,
    },
    Directory {
        path: PathBuf,
    },
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT))
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_dom0_cpus() -> u32 {
    8
}

fn default_memory_mb() -> u32 {
    8192
}

fn default_name_prefix() -> String {
    "xen-benchmark-vm-".to_string()
}

fn default_benchmarks() -> Vec<String> {
    ["timesyscall", "timectxsw", "timetctxsw", "timetctxsw2"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_xl() -> String {
    "xl".to_string()
}

fn default_shutdown_timeout() -> u64 {
    120
}

fn default_settle_delay() -> u64 {
    30
}
