#![allow(dead_code)]

use async_trait::async_trait;
use std::{
    collections::{HashSet, VecDeque},
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use vmsweep::{
    config::{Config, HostConfig},
    protocol::{HostMessage, Transport},
    provisioner::hypervisor::Hypervisor,
};

pub const GUEST_PORT: u16 = 44544;

/// A pool of pretend guests that answer the host the way a well-behaved agent does. Everything
/// the host sends or receives, and every hypervisor operation, lands in one ordered log.
#[derive(Default)]
struct SimState {
    log: Vec<String>,
    alive: HashSet<u32>,
    mute: HashSet<u32>,
    queue: VecDeque<(u32, &'static str)>,
}

#[derive(Clone, Default)]
pub struct SimulatedPool {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedPool {
    /// Guests in `mute` boot but never say anything.
    pub fn with_mute(slots: &[u32]) -> Self {
        let pool = Self::default();
        pool.lock().mute = slots.iter().copied().collect();
        pool
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().expect("sim lock")
    }

    pub fn log(&self) -> Vec<String> {
        self.lock().log.clone()
    }

    pub fn hypervisor(&self) -> Box<dyn Hypervisor> {
        Box::new(self.clone())
    }

    fn reply(state: &mut SimState, slot: u32, payload: &'static str) {
        if state.alive.contains(&slot) && !state.mute.contains(&slot) {
            state.queue.push_back((slot, payload));
        }
    }
}

pub fn guest_address(slot: u32) -> SocketAddr {
    SocketAddr::new(
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 10 + slot as u8)),
        GUEST_PORT,
    )
}

fn slot_of(addr: SocketAddr) -> u32 {
    match addr.ip() {
        IpAddr::V4(ip) => ip.octets()[3] as u32 - 10,
        IpAddr::V6(_) => 0,
    }
}

fn slot_of_name(name: &str) -> u32 {
    name.rsplit('-')
        .next()
        .and_then(|n| n.trim_end_matches(".cfg").parse().ok())
        .unwrap_or(0)
}

#[async_trait]
impl Transport for SimulatedPool {
    async fn send_to(&self, payload: &str, addr: SocketAddr) -> std::io::Result<()> {
        let slot = slot_of(addr);
        let mut state = self.lock();
        state.log.push(format!("-> vm{slot} {payload}"));

        match payload.parse::<HostMessage>() {
            Ok(HostMessage::Start(_)) => Self::reply(&mut state, slot, "FINISHED"),
            Ok(HostMessage::Continue) if slot == 1 => Self::reply(&mut state, slot, "UPLOADED"),
            Ok(HostMessage::Reset) => Self::reply(&mut state, slot, "READY"),
            _ => {}
        }
        Ok(())
    }

    async fn recv_from(&self) -> std::io::Result<(Vec<u8>, SocketAddr)> {
        let next = {
            let mut state = self.lock();
            let next = state.queue.pop_front();
            if let Some((slot, payload)) = next {
                state.log.push(format!("<- vm{slot} {payload}"));
            }
            next
        };

        match next {
            Some((slot, payload)) => Ok((payload.as_bytes().to_vec(), guest_address(slot))),
            None => std::future::pending().await,
        }
    }
}

#[async_trait]
impl Hypervisor for SimulatedPool {
    async fn create(&self, cfg_path: &Path) -> anyhow::Result<()> {
        let slot = slot_of_name(&cfg_path.to_string_lossy());
        let mut state = self.lock();
        state.log.push(format!("create vm{slot}"));
        state.alive.insert(slot);
        Self::reply(&mut state, slot, "READY");
        Ok(())
    }

    async fn shutdown(&self, name: &str) -> anyhow::Result<()> {
        let slot = slot_of_name(name);
        let mut state = self.lock();
        state.log.push(format!("shutdown vm{slot}"));
        state.alive.remove(&slot);
        // a dead guest's datagrams never arrive
        state.queue.retain(|(from, _)| *from != slot);
        Ok(())
    }

    async fn destroy(&self, name: &str) -> anyhow::Result<()> {
        self.lock().log.push(format!("destroy vm{}", slot_of_name(name)));
        Ok(())
    }

    async fn set_ratelimit(&self, ratelimit_us: u32) -> anyhow::Result<()> {
        self.lock().log.push(format!("ratelimit {ratelimit_us}"));
        Ok(())
    }
}

pub fn scratch_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("vmsweep-{}", nanoid::nanoid!(8)));
    std::fs::create_dir_all(&dir).expect("scratch dir");
    dir
}

/// An 8 core host with 4 guest slots, running benchmarks `A` and `B`.
pub fn host_config(scratch: &Path, extra: &str) -> anyhow::Result<HostConfig> {
    let guests = (1..=4)
        .map(|slot| {
            format!(
                "[[host.guest]]\nmac = \"00:16:3e:00:00:{slot:02x}\"\naddress = \"{}\"\n",
                guest_address(slot).ip()
            )
        })
        .collect::<String>();

    let toml = format!(
        r#"
        [host]
        host_cpus = 8
        dom0_cpus = 4
        guest_cfg_dir = "{}"
        image_dir = "/srv/images"
        benchmarks = ["A", "B"]
        settle_delay_secs = 0
        shutdown_timeout_secs = 5
        {extra}

        {guests}
        "#,
        scratch.join("cfg").display()
    );

    Config::try_from_str(&toml)?
        .host
        .ok_or_else(|| anyhow::anyhow!("host section missing"))
}
