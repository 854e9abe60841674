/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

pub mod dimensions;

use crate::config::HostProfile;
use dimensions::*;
use itertools::{iproduct, Itertools};
use std::{
    fmt,
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    str::FromStr,
};
use thiserror::Error;
use tracing::{debug, info};

pub const PENDING_MARKER: &str = "| |";
pub const DONE_MARKER: &str = "|X|";
const MARKER_GAP: &str = "    ";

#[derive(Error, Debug)]
pub enum CampaignError {
    #[error("line {line}: malformed campaign entry `{content}`: {reason}")]
    Malformed {
        line: usize,
        content: String,
        reason: String,
    },
    #[error("campaign file {0:?} already exists")]
    AlreadyExists(PathBuf),
    #[error("entry {0} is not part of this campaign")]
    UnknownEntry(String),
    #[error("campaign file I/O failed")]
    Io(#[from] std::io::Error),
}

/// One point in the configuration space. Its rendered tag string is its identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Configuration {
    pub vm_count: VmCount,
    pub virt_method: VirtMethod,
    pub vcpu_pinning: VcpuPinning,
    pub taskset: Taskset,
    pub scheduler: Scheduler,
    pub hyperthreading: Hyperthreading,
    pub mem_management: MemManagement,
    pub dom0_cpus: Dom0Cpus,
    pub slop: Slop,
}

impl Configuration {
    /// True if this configuration carries the given dimension value.
    pub fn has(&self, value: DimensionValue) -> bool {
        match value {
            DimensionValue::VmCount(v) => self.vm_count == v,
            DimensionValue::VirtMethod(v) => self.virt_method == v,
            DimensionValue::VcpuPinning(v) => self.vcpu_pinning == v,
            DimensionValue::Taskset(v) => self.taskset == v,
            DimensionValue::Scheduler(v) => self.scheduler == v,
            DimensionValue::Hyperthreading(v) => self.hyperthreading == v,
            DimensionValue::MemManagement(v) => self.mem_management == v,
            DimensionValue::Dom0Cpus(v) => self.dom0_cpus == v,
            DimensionValue::Slop(v) => self.slop == v,
        }
    }

    /// Whether this configuration can run on a hypervisor booted as `profile`.
    pub fn runnable_on(&self, profile: &HostProfile) -> bool {
        let restricted = self.dom0_cpus == Dom0Cpus::LessCpus;
        let restricted_pinned = self.dom0_cpus == Dom0Cpus::LessCpusPinned;

        profile.null_scheduler == (self.scheduler == Scheduler::Null)
            && profile.low_slop == (self.slop == Slop::Low)
            && profile.hyperthreading == (self.hyperthreading == Hyperthreading::On)
            && profile.dom0.is_restricted_pinned() == restricted_pinned
            && profile.dom0.is_restricted_unpinned() == restricted
            && !(profile.skip_hvm && self.virt_method == VirtMethod::Hvm)
    }

    /// Path-safe rendering used for remote result locations: `[` and `]` become `(` and `)`.
    pub fn remote_key(&self) -> String {
        self.to_string().replace('[', "(").replace(']', ")")
    }
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}][{}][{}][{}][{}][{}][{}][{}][{}]",
            self.vm_count,
            self.virt_method,
            self.vcpu_pinning,
            self.taskset,
            self.scheduler,
            self.hyperthreading,
            self.mem_management,
            self.dom0_cpus,
            self.slop
        )
    }
}

impl FromStr for Configuration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let inner = s
            .trim()
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .ok_or_else(|| "expected bracketed dimension tags".to_string())?;

        match &inner.split("][").collect_vec()[..] {
            [vm_count, virt_method, vcpu_pinning, taskset, scheduler, hyperthreading, mem_management, dom0_cpus, slop] => {
                Ok(Configuration {
                    vm_count: vm_count.parse()?,
                    virt_method: virt_method.parse()?,
                    vcpu_pinning: vcpu_pinning.parse()?,
                    taskset: taskset.parse()?,
                    scheduler: scheduler.parse()?,
                    hyperthreading: hyperthreading.parse()?,
                    mem_management: mem_management.parse()?,
                    dom0_cpus: dom0_cpus.parse()?,
                    slop: slop.parse()?,
                })
            }
            tags => Err(format!("expected 9 dimension tags, found {}", tags.len())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Pending,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CampaignEntry {
    pub config: Configuration,
    pub state: EntryState,
}

impl CampaignEntry {
    pub fn pending(config: Configuration) -> Self {
        Self {
            config,
            state: EntryState::Pending,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == EntryState::Done
    }

    fn render(&self) -> String {
        let marker = match self.state {
            EntryState::Pending => PENDING_MARKER,
            EntryState::Done => DONE_MARKER,
        };
        format!("{marker}{MARKER_GAP}{}", self.config)
    }

    fn parse(line: &str) -> Result<Self, String> {
        let state = if line.starts_with(PENDING_MARKER) {
            EntryState::Pending
        } else if line.starts_with(DONE_MARKER) {
            EntryState::Done
        } else {
            return Err(format!(
                "expected `{PENDING_MARKER}` or `{DONE_MARKER}` marker"
            ));
        };

        let config = line[PENDING_MARKER.len()..].parse()?;
        Ok(Self { config, state })
    }
}

/// A biconditional coupling: for every entry either all members hold or none do.
#[derive(Debug, Clone)]
pub struct Coupling(pub Vec<DimensionValue>);

impl Coupling {
    pub fn holds(&self, config: &Configuration) -> bool {
        let matches = self.0.iter().filter(|value| config.has(**value)).count();
        matches == 0 || matches == self.0.len()
    }
}

/// The couplings every campaign uses: the null scheduler only runs with null pinning in the
/// guests and dom0, and paravirtualized guests always use the PV MMU.
pub fn default_couplings() -> Vec<Coupling> {
    vec![
        Coupling(vec![
            DimensionValue::Scheduler(Scheduler::Null),
            DimensionValue::VcpuPinning(VcpuPinning::NullPinning),
            DimensionValue::Dom0Cpus(Dom0Cpus::NullPinning),
        ]),
        Coupling(vec![
            DimensionValue::VirtMethod(VirtMethod::Pv),
            DimensionValue::MemManagement(MemManagement::PvMmu),
        ]),
    ]
}

/// Value sets to sweep for each dimension.
#[derive(Debug, Clone)]
pub struct Domains {
    pub vm_count: Vec<VmCount>,
    pub virt_method: Vec<VirtMethod>,
    pub vcpu_pinning: Vec<VcpuPinning>,
    pub taskset: Vec<Taskset>,
    pub scheduler: Vec<Scheduler>,
    pub hyperthreading: Vec<Hyperthreading>,
    pub mem_management: Vec<MemManagement>,
    pub dom0_cpus: Vec<Dom0Cpus>,
    pub slop: Vec<Slop>,
}

impl Default for Domains {
    fn default() -> Self {
        Self {
            vm_count: VmCount::ALL.to_vec(),
            virt_method: VirtMethod::ALL.to_vec(),
            vcpu_pinning: VcpuPinning::ALL.to_vec(),
            taskset: Taskset::ALL.to_vec(),
            scheduler: Scheduler::ALL.to_vec(),
            hyperthreading: Hyperthreading::ALL.to_vec(),
            mem_management: MemManagement::ALL.to_vec(),
            dom0_cpus: Dom0Cpus::ALL.to_vec(),
            slop: Slop::ALL.to_vec(),
        }
    }
}

/// Enumerates every configuration in `domains` that satisfies all `couplings`, without
/// duplicates. Slop varies slowest and the VM-count class fastest.
pub fn generate(domains: &Domains, couplings: &[Coupling]) -> Vec<CampaignEntry> {
    iproduct!(
        domains.slop.iter(),
        domains.dom0_cpus.iter(),
        domains.mem_management.iter(),
        domains.hyperthreading.iter(),
        domains.scheduler.iter(),
        domains.taskset.iter(),
        domains.vcpu_pinning.iter(),
        domains.virt_method.iter(),
        domains.vm_count.iter()
    )
    .map(
        |(slop, dom0, mem, ht, sched, taskset, pinning, virt, vms)| Configuration {
            vm_count: *vms,
            virt_method: *virt,
            vcpu_pinning: *pinning,
            taskset: *taskset,
            scheduler: *sched,
            hyperthreading: *ht,
            mem_management: *mem,
            dom0_cpus: *dom0,
            slop: *slop,
        },
    )
    .filter(|config| couplings.iter().all(|coupling| coupling.holds(config)))
    .unique()
    .map(CampaignEntry::pending)
    .collect()
}

/// A campaign persisted as one marked entry per line.
#[derive(Debug)]
pub struct Campaign {
    path: PathBuf,
    entries: Vec<CampaignEntry>,
}

impl Campaign {
    /// Writes a fresh campaign file. Refuses to clobber an existing one unless `force` is set.
    pub fn create(
        path: &Path,
        entries: Vec<CampaignEntry>,
        force: bool,
    ) -> Result<Self, CampaignError> {
        if path.exists() && !force {
            return Err(CampaignError::AlreadyExists(path.to_path_buf()));
        }

        let campaign = Self {
            path: path.to_path_buf(),
            entries,
        };
        campaign.save()?;
        info!(
            "wrote {} campaign entries to {:?}",
            campaign.entries.len(),
            path
        );

        Ok(campaign)
    }

    /// Restores a campaign, including completion markers. Any malformed line aborts the load.
    pub fn load(path: &Path) -> Result<Self, CampaignError> {
        let contents = fs::read_to_string(path)?;
        let entries = Self::parse(&contents)?;
        debug!("loaded {} campaign entries from {:?}", entries.len(), path);

        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    fn parse(contents: &str) -> Result<Vec<CampaignEntry>, CampaignError> {
        contents
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(idx, line)| {
                CampaignEntry::parse(line).map_err(|reason| CampaignError::Malformed {
                    line: idx + 1,
                    content: line.to_string(),
                    reason,
                })
            })
            .collect()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &[CampaignEntry] {
        &self.entries
    }

    pub fn next_pending(&self) -> Option<&CampaignEntry> {
        self.entries.iter().find(|entry| !entry.is_done())
    }

    /// First pending entry the hypervisor, as currently booted, is able to run.
    pub fn next_runnable(&self, profile: &HostProfile) -> Option<&CampaignEntry> {
        self.entries
            .iter()
            .filter(|entry| !entry.is_done())
            .find(|entry| entry.config.runnable_on(profile))
    }

    pub fn remaining(&self) -> usize {
        self.entries.iter().filter(|entry| !entry.is_done()).count()
    }

    /// Flips the entry to done and rewrites the campaign file before returning.
    pub fn mark_done(&mut self, config: &Configuration) -> Result<(), CampaignError> {
        let entry = self
            .entries
            .iter_mut()
            .find(|entry| entry.config == *config)
            .ok_or_else(|| CampaignError::UnknownEntry(config.to_string()))?;
        entry.state = EntryState::Done;

        self.save()
    }

    fn save(&self) -> Result<(), CampaignError> {
        let mut tmp_name = self.path.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(".tmp");
        let tmp_path = self.path.with_file_name(tmp_name);

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        for entry in &self.entries {
            writeln!(file, "{}", entry.render())?;
        }
        file.sync_all()?;
        fs::rename(&tmp_path, &self.path)?;

        Ok(())
    }
}
