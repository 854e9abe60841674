/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

pub mod hypervisor;
pub mod topology;

use crate::{
    campaign::{
        dimensions::{MemManagement, VcpuPinning, VirtMethod},
        Configuration,
    },
    config::HostConfig,
};
use hypervisor::Hypervisor;
use std::{
    fs,
    net::SocketAddr,
    ops::RangeInclusive,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use topology::Topology;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("invalid topology: {0}")]
    Topology(String),
    #[error("pool needs {needed} guest slots but only {configured} are configured")]
    NotEnoughSlots { needed: u32, configured: usize },
    #[error("failed to write guest descriptors in {dir:?}")]
    Descriptor {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("hypervisor failed to {op} {target}: {reason}")]
    Hypervisor {
        op: &'static str,
        target: String,
        reason: String,
    },
}

/// Everything needed to create one guest of the current entry.
#[derive(Debug, Clone, PartialEq)]
pub struct GuestDescriptor {
    /// 1-based slot; guest 1 is always the leader.
    pub slot: u32,
    pub name: String,
    pub vcpus: u32,
    pub cpus: Option<RangeInclusive<u32>>,
    pub mac: String,
    pub address: SocketAddr,
    pub disk: PathBuf,
    pub leader: bool,
    pub cfg_path: PathBuf,
}

impl GuestDescriptor {
    /// Renders the xl key=value descriptor for this guest.
    pub fn render(&self, config: &Configuration, memory_mb: u32) -> String {
        let virt = config.virt_method;
        let disk_spec = match virt {
            VirtMethod::Hvm => "hda1",
            VirtMethod::Pv | VirtMethod::Pvh => "xvda2",
        };

        let mut lines = vec![
            format!("memory = {memory_mb}"),
            format!("# {config}"),
            format!("name = '{}'", self.name),
            format!("type = '{virt}'"),
            format!("vcpus = {}", self.vcpus),
            format!("vif = ['mac={}']", self.mac),
            format!("disk = ['file:{},{disk_spec},w']", self.disk.display()),
        ];

        match virt {
            VirtMethod::Hvm => {
                lines.push("firmware = 'bios'".to_string());
                lines.push("serial = ['pty']".to_string());
            }
            VirtMethod::Pv | VirtMethod::Pvh => {
                lines.push("bootloader = 'pygrub'".to_string());
            }
        }
        if matches!(virt, VirtMethod::Hvm | VirtMethod::Pvh) {
            let hap = u8::from(config.mem_management == MemManagement::Hap);
            lines.push(format!("hap = {hap}"));
        }
        if let Some(cpus) = &self.cpus {
            lines.push(format!("cpus = '{}-{}'", cpus.start(), cpus.end()));
        }

        lines.push(String::new());
        lines.join("\n")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    Graceful,
    /// Graceful shutdown timed out or failed and the domain was destroyed.
    Destroyed,
    /// Even destroy failed; the domain may still be running.
    Failed,
}

pub struct Provisioner {
    host: HostConfig,
    hypervisor: Box<dyn Hypervisor>,
    shutdown_timeout: Duration,
    settle_delay: Duration,
}

impl Provisioner {
    pub fn new(host: HostConfig, hypervisor: Box<dyn Hypervisor>) -> Self {
        let shutdown_timeout = host.shutdown_timeout();
        let settle_delay = host.settle_delay();

        Self {
            host,
            hypervisor,
            shutdown_timeout,
            settle_delay,
        }
    }

    pub fn with_timings(mut self, shutdown_timeout: Duration, settle_delay: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self.settle_delay = settle_delay;
        self
    }

    pub fn host(&self) -> &HostConfig {
        &self.host
    }

    fn cfg_path(&self, name: &str) -> PathBuf {
        self.host.guest_cfg_dir.join(format!("{name}.cfg"))
    }

    /// Computes the guest pool for `config` without touching the filesystem.
    pub fn plan(&self, config: &Configuration) -> Result<Vec<GuestDescriptor>, ProvisionError> {
        let topology = Topology::for_entry(config, self.host.host_cpus, self.host.dom0_cpus)?;
        if topology.pool_size as usize > self.host.guests.len() {
            return Err(ProvisionError::NotEnoughSlots {
                needed: topology.pool_size,
                configured: self.host.guests.len(),
            });
        }
        debug!("Topology for {config}: {topology:?}");

        let image = match config.virt_method {
            VirtMethod::Hvm => "hvm-disk.raw",
            VirtMethod::Pv | VirtMethod::Pvh => "disk.img",
        };

        let guests = self
            .host
            .guests
            .iter()
            .take(topology.pool_size as usize)
            .enumerate()
            .map(|(idx, slot)| {
                let number = idx as u32 + 1;
                let name = format!("{}{}", self.host.guest_name_prefix, number);
                let mac = match (config.virt_method, &slot.hvm_mac) {
                    (VirtMethod::Hvm, Some(hvm_mac)) => hvm_mac.clone(),
                    _ => slot.mac.clone(),
                };
                let cpus = (config.vcpu_pinning == VcpuPinning::PinningOn)
                    .then(|| topology.pin_range(idx as u32));

                GuestDescriptor {
                    slot: number,
                    vcpus: topology.guest_vcpus,
                    cpus,
                    mac,
                    address: SocketAddr::new(slot.address, self.host.guest_port),
                    disk: self.host.image_dir.join(&name).join(image),
                    leader: number == 1,
                    cfg_path: self.cfg_path(&name),
                    name,
                }
            })
            .collect();

        Ok(guests)
    }

    /// Replaces every descriptor of the previous entry with the descriptors for `guests`.
    pub fn write_descriptors(
        &self,
        config: &Configuration,
        guests: &[GuestDescriptor],
    ) -> Result<(), ProvisionError> {
        let dir = &self.host.guest_cfg_dir;
        let io_err = |source| ProvisionError::Descriptor {
            dir: dir.clone(),
            source,
        };

        fs::create_dir_all(dir).map_err(io_err)?;
        remove_stale_descriptors(dir, &self.host.guest_name_prefix).map_err(io_err)?;

        for guest in guests {
            fs::write(
                &guest.cfg_path,
                guest.render(config, self.host.memory_mb),
            )
            .map_err(io_err)?;
        }
        debug!("Wrote {} guest descriptors to {:?}", guests.len(), dir);

        Ok(())
    }

    /// Plans the pool and writes its descriptors.
    pub fn prepare(&self, config: &Configuration) -> Result<Vec<GuestDescriptor>, ProvisionError> {
        let guests = self.plan(config)?;
        self.write_descriptors(config, &guests)?;
        Ok(guests)
    }

    /// Applies the entry's scheduler rate limit and creates every guest of the pool.
    pub async fn create_pool(
        &self,
        config: &Configuration,
        guests: &[GuestDescriptor],
    ) -> Result<(), ProvisionError> {
        if let Some(ratelimit) = config.scheduler.ratelimit_us() {
            info!("Setting credit2 ratelimit to {ratelimit}us");
            self.hypervisor
                .set_ratelimit(ratelimit)
                .await
                .map_err(|e| ProvisionError::Hypervisor {
                    op: "set ratelimit",
                    target: config.scheduler.to_string(),
                    reason: format!("{e:#}"),
                })?;
        }

        for (created, guest) in guests.iter().enumerate() {
            info!("Creating guest {}", guest.name);
            if let Err(e) = self.hypervisor.create(&guest.cfg_path).await {
                // a half-built pool would make the next attempt collide with live domains
                warn!(
                    "Failed to create {}, shutting down the {created} guests already up",
                    guest.name
                );
                self.teardown(&guests[..created]).await;

                return Err(ProvisionError::Hypervisor {
                    op: "create",
                    target: guest.name.clone(),
                    reason: format!("{e:#}"),
                });
            }
        }

        Ok(())
    }

    /// Shuts down `guests` from the highest slot to the leader.
    pub async fn teardown(&self, guests: &[GuestDescriptor]) {
        for guest in guests.iter().rev() {
            self.shutdown_guest(guest).await;
        }
    }

    /// Shuts a guest down, escalating to destroy if it doesn't go away in time. The leader's
    /// shutdown is followed by a settle delay so its network state is gone before the next
    /// entry's guests come up.
    pub async fn shutdown_guest(&self, guest: &GuestDescriptor) -> ShutdownOutcome {
        info!("Shutting down guest {}", guest.name);

        let graceful =
            tokio::time::timeout(self.shutdown_timeout, self.hypervisor.shutdown(&guest.name))
                .await;

        let escalate = match graceful {
            Ok(Ok(())) => false,
            Ok(Err(e)) => {
                warn!("Failed to shut down {}: {e:#}. Destroying...", guest.name);
                true
            }
            Err(_) => {
                warn!(
                    "Failed to shut down {} within {:?}. Destroying...",
                    guest.name, self.shutdown_timeout
                );
                true
            }
        };

        let outcome = if !escalate {
            ShutdownOutcome::Graceful
        } else {
            match self.hypervisor.destroy(&guest.name).await {
                Ok(()) => ShutdownOutcome::Destroyed,
                Err(e) => {
                    warn!("Failed to destroy {}: {e:#}", guest.name);
                    ShutdownOutcome::Failed
                }
            }
        };

        if guest.leader {
            debug!("Waiting {:?} for {} to settle", self.settle_delay, guest.name);
            tokio::time::sleep(self.settle_delay).await;
        }

        outcome
    }
}

fn remove_stale_descriptors(dir: &Path, prefix: &str) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_stale = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.starts_with(prefix) && name.ends_with(".cfg"))
            .unwrap_or(false);

        if is_stale {
            fs::remove_file(&path)?;
        }
    }

    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{Config, GuestSlot};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    /// Hypervisor double that records every operation. Shutdowns of guests listed in `hang`
    /// never complete, and creating a descriptor whose file name is in `refuse` fails.
    #[derive(Default, Clone)]
    pub struct RecordingHypervisor {
        pub ops: Arc<Mutex<Vec<String>>>,
        pub hang: Vec<String>,
        pub refuse: Vec<String>,
    }

    impl RecordingHypervisor {
        pub fn ops(&self) -> Vec<String> {
            self.ops.lock().expect("ops lock").clone()
        }

        fn record(&self, op: String) {
            self.ops.lock().expect("ops lock").push(op);
        }
    }

    #[async_trait]
    impl Hypervisor for RecordingHypervisor {
        async fn create(&self, cfg_path: &Path) -> anyhow::Result<()> {
            self.record(format!("create {}", cfg_path.display()));
            let refused = cfg_path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| self.refuse.iter().any(|r| r == name));
            if refused {
                anyhow::bail!("domain already exists");
            }
            Ok(())
        }

        async fn shutdown(&self, name: &str) -> anyhow::Result<()> {
            self.record(format!("shutdown {name}"));
            if self.hang.iter().any(|hung| hung == name) {
                std::future::pending::<()>().await;
            }
            Ok(())
        }

        async fn destroy(&self, name: &str) -> anyhow::Result<()> {
            self.record(format!("destroy {name}"));
            Ok(())
        }

        async fn set_ratelimit(&self, ratelimit_us: u32) -> anyhow::Result<()> {
            self.record(format!("ratelimit {ratelimit_us}"));
            Ok(())
        }
    }

    pub fn host_config(cfg_dir: PathBuf, slots: usize) -> HostConfig {
        let cfg = Config::try_from_str(
            r#"
            [host]
            host_cpus = 52
            guest_cfg_dir = "unused"
            image_dir = "/srv/images"
            guest = []
            "#,
        )
        .expect("valid host config");

        let mut host = cfg.host.expect("host section");
        host.guest_cfg_dir = cfg_dir;
        host.guests = (1..=slots)
            .map(|i| GuestSlot {
                mac: format!("00:16:3e:00:00:{i:02x}"),
                hvm_mac: Some(format!("00:16:3e:00:01:{i:02x}")),
                address: format!("10.0.0.{}", 10 + i).parse().expect("valid ip"),
            })
            .collect();
        host
    }

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("vmsweep-{}", nanoid::nanoid!(8)))
    }

    fn entry(tags: &str) -> Configuration {
        tags.parse().expect("valid entry")
    }

    #[test]
    fn plan_assigns_leader_addresses_and_pins() -> anyhow::Result<()> {
        let provisioner = Provisioner::new(
            host_config(scratch_dir(), 13),
            Box::new(RecordingHypervisor::default()),
        );
        let guests = provisioner.plan(&entry(
            "[4VM][hvm][pinning-on][taskset-on][credit2-1ms][ht-off][hap][dom0-less-cpus-pinned][default-slop]",
        ))?;

        assert_eq!(guests.len(), 3);
        assert!(guests[0].leader);
        assert!(guests[1..].iter().all(|g| !g.leader));
        assert_eq!(guests[0].name, "xen-benchmark-vm-1");
        assert_eq!(guests[2].cpus, Some(39..=51));
        assert_eq!(guests[1].mac, "00:16:3e:00:01:02");
        assert_eq!(guests[1].address, "10.0.0.12:44544".parse::<SocketAddr>()?);
        assert_eq!(
            guests[0].disk,
            PathBuf::from("/srv/images/xen-benchmark-vm-1/hvm-disk.raw")
        );

        Ok(())
    }

    #[test]
    fn plan_without_pinning_has_no_cpu_ranges() -> anyhow::Result<()> {
        let provisioner = Provisioner::new(
            host_config(scratch_dir(), 13),
            Box::new(RecordingHypervisor::default()),
        );
        let guests = provisioner.plan(&entry(
            "[13VM][pv][pinning-off][taskset-on][credit2-1ms][ht-off][pv-mmu][dom0-all-cpus][default-slop]",
        ))?;

        assert_eq!(guests.len(), 13);
        assert!(guests.iter().all(|g| g.cpus.is_none()));
        assert_eq!(guests[0].mac, "00:16:3e:00:00:01");

        Ok(())
    }

    #[test]
    fn plan_fails_without_enough_slots() {
        let provisioner = Provisioner::new(
            host_config(scratch_dir(), 4),
            Box::new(RecordingHypervisor::default()),
        );
        let result = provisioner.plan(&entry(
            "[13VM][pv][pinning-off][taskset-on][credit2-1ms][ht-off][pv-mmu][dom0-all-cpus][default-slop]",
        ));

        assert!(matches!(
            result,
            Err(ProvisionError::NotEnoughSlots {
                needed: 13,
                configured: 4
            })
        ));
    }

    #[test]
    fn descriptors_render_type_specific_options() -> anyhow::Result<()> {
        let provisioner = Provisioner::new(
            host_config(scratch_dir(), 13),
            Box::new(RecordingHypervisor::default()),
        );

        let hvm = entry("[4VM][hvm][pinning-on][taskset-on][credit2-1ms][ht-off][hap][dom0-all-cpus][default-slop]");
        let text = provisioner.plan(&hvm)?[1].render(&hvm, 8192);
        assert!(text.starts_with("memory = 8192\n# [4VM][hvm]"));
        assert!(text.contains("name = 'xen-benchmark-vm-2'\n"));
        assert!(text.contains("type = 'hvm'\n"));
        assert!(text.contains("vcpus = 13\n"));
        assert!(text.contains("firmware = 'bios'\n"));
        assert!(text.contains("hap = 1\n"));
        assert!(text.contains("cpus = '13-25'\n"));
        assert!(text.contains(",hda1,w']"));
        assert!(!text.contains("bootloader"));

        let pv = entry("[4VM][pv][pinning-off][taskset-on][credit2-1ms][ht-off][pv-mmu][dom0-all-cpus][default-slop]");
        let text = provisioner.plan(&pv)?[0].render(&pv, 4096);
        assert!(text.contains("bootloader = 'pygrub'\n"));
        assert!(!text.contains("hap ="));
        assert!(text.lines().all(|line| !line.starts_with("cpus =")));

        let pvh = entry("[4VM][pvh][pinning-off][taskset-on][credit2-1ms][ht-off][shadow][dom0-all-cpus][default-slop]");
        let text = provisioner.plan(&pvh)?[0].render(&pvh, 4096);
        assert!(text.contains("hap = 0\n"));

        Ok(())
    }

    #[test]
    fn write_descriptors_replaces_stale_ones() -> anyhow::Result<()> {
        let dir = scratch_dir();
        let provisioner = Provisioner::new(
            host_config(dir.clone(), 13),
            Box::new(RecordingHypervisor::default()),
        );

        let many = entry("[13VM][pv][pinning-off][taskset-on][credit2-1ms][ht-off][pv-mmu][dom0-all-cpus][default-slop]");
        provisioner.prepare(&many)?;
        fs::write(dir.join("unrelated.txt"), "keep me")?;
        assert_eq!(fs::read_dir(&dir)?.count(), 14);

        let few = entry("[4VM][pv][pinning-off][taskset-on][credit2-1ms][ht-off][pv-mmu][dom0-all-cpus][default-slop]");
        let guests = provisioner.prepare(&few)?;

        let mut names = fs::read_dir(&dir)?
            .map(|e| e.map(|e| e.file_name().to_string_lossy().to_string()))
            .collect::<Result<Vec<_>, _>>()?;
        names.sort();
        assert_eq!(
            names,
            vec![
                "unrelated.txt",
                "xen-benchmark-vm-1.cfg",
                "xen-benchmark-vm-2.cfg",
                "xen-benchmark-vm-3.cfg",
                "xen-benchmark-vm-4.cfg",
            ]
        );
        for guest in guests {
            assert!(fs::read_to_string(&guest.cfg_path)?.contains("# [4VM]"));
        }

        Ok(())
    }

    #[tokio::test]
    async fn create_pool_sets_ratelimit_then_creates_all() -> anyhow::Result<()> {
        let hypervisor = RecordingHypervisor::default();
        let provisioner = Provisioner::new(
            host_config(PathBuf::from("/cfg"), 13),
            Box::new(hypervisor.clone()),
        );

        let credit = entry("[4VM][pv][pinning-off][taskset-on][credit2-3ms][ht-off][pv-mmu][dom0-all-cpus][default-slop]");
        let guests = provisioner.plan(&credit)?;
        provisioner.create_pool(&credit, &guests).await?;

        assert_eq!(
            hypervisor.ops(),
            vec![
                "ratelimit 3000",
                "create /cfg/xen-benchmark-vm-1.cfg",
                "create /cfg/xen-benchmark-vm-2.cfg",
                "create /cfg/xen-benchmark-vm-3.cfg",
                "create /cfg/xen-benchmark-vm-4.cfg",
            ]
        );

        let null = entry("[4VM][pv][null-pinning][taskset-on][null][ht-off][pv-mmu][dom0-null-pinning][default-slop]");
        let hypervisor = RecordingHypervisor::default();
        let provisioner = Provisioner::new(
            host_config(PathBuf::from("/cfg"), 13),
            Box::new(hypervisor.clone()),
        );
        let guests = provisioner.plan(&null)?;
        provisioner.create_pool(&null, &guests).await?;
        assert!(hypervisor.ops().iter().all(|op| op.starts_with("create")));

        Ok(())
    }

    #[tokio::test]
    async fn failed_create_tears_down_guests_already_up() -> anyhow::Result<()> {
        let hypervisor = RecordingHypervisor {
            refuse: vec!["xen-benchmark-vm-3.cfg".to_string()],
            ..Default::default()
        };
        let provisioner = Provisioner::new(
            host_config(PathBuf::from("/cfg"), 13),
            Box::new(hypervisor.clone()),
        )
        .with_timings(Duration::from_secs(1), Duration::ZERO);

        let null = entry("[4VM][pv][null-pinning][taskset-on][null][ht-off][pv-mmu][dom0-null-pinning][default-slop]");
        let guests = provisioner.plan(&null)?;
        let result = provisioner.create_pool(&null, &guests).await;

        assert!(matches!(
            result,
            Err(ProvisionError::Hypervisor { op: "create", ref target, .. }) if target == "xen-benchmark-vm-3"
        ));
        assert_eq!(
            hypervisor.ops(),
            vec![
                "create /cfg/xen-benchmark-vm-1.cfg",
                "create /cfg/xen-benchmark-vm-2.cfg",
                "create /cfg/xen-benchmark-vm-3.cfg",
                "shutdown xen-benchmark-vm-2",
                "shutdown xen-benchmark-vm-1",
            ]
        );

        Ok(())
    }

    #[tokio::test]
    async fn hung_shutdown_escalates_to_destroy() -> anyhow::Result<()> {
        let hypervisor = RecordingHypervisor {
            hang: vec!["xen-benchmark-vm-2".to_string()],
            ..Default::default()
        };
        let provisioner = Provisioner::new(
            host_config(PathBuf::from("/cfg"), 13),
            Box::new(hypervisor.clone()),
        )
        .with_timings(Duration::from_millis(50), Duration::ZERO);

        let pool = provisioner.plan(&entry(
            "[4VM][pv][pinning-off][taskset-on][credit2-3ms][ht-off][pv-mmu][dom0-all-cpus][default-slop]",
        ))?;

        assert_eq!(
            provisioner.shutdown_guest(&pool[1]).await,
            ShutdownOutcome::Destroyed
        );
        assert_eq!(
            provisioner.shutdown_guest(&pool[2]).await,
            ShutdownOutcome::Graceful
        );
        assert_eq!(
            hypervisor.ops(),
            vec![
                "shutdown xen-benchmark-vm-2",
                "destroy xen-benchmark-vm-2",
                "shutdown xen-benchmark-vm-3",
            ]
        );

        Ok(())
    }

    #[tokio::test]
    async fn leader_shutdown_waits_for_settle_delay() -> anyhow::Result<()> {
        let provisioner = Provisioner::new(
            host_config(PathBuf::from("/cfg"), 13),
            Box::new(RecordingHypervisor::default()),
        )
        .with_timings(Duration::from_secs(1), Duration::from_millis(100));

        let pool = provisioner.plan(&entry(
            "[4VM][pv][pinning-off][taskset-on][credit2-3ms][ht-off][pv-mmu][dom0-all-cpus][default-slop]",
        ))?;

        let start = std::time::Instant::now();
        provisioner.shutdown_guest(&pool[0]).await;
        assert!(start.elapsed() >= Duration::from_millis(100));

        Ok(())
    }
}
