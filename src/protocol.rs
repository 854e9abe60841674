/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::campaign::{dimensions::Taskset, Configuration};
use async_trait::async_trait;
use std::{fmt, net::SocketAddr, str::FromStr};
use thiserror::Error;
use tokio::net::UdpSocket;

/// Largest datagram either side sends or accepts.
pub const MAX_DATAGRAM: usize = 1024;

/// Longest benchmark name accepted. Leaves room for the rest of a START in one datagram.
pub const MAX_BENCHMARK_NAME: usize = 256;

#[derive(Error, Debug, PartialEq)]
pub enum ProtocolError {
    #[error("payload is not valid ASCII text")]
    NotText,
    #[error("unrecognised message `{0}`")]
    Unrecognised(String),
    #[error("malformed START payload `{payload}`: {reason}")]
    MalformedStart { payload: String, reason: String },
    #[error("benchmark name `{name}` can't be sent in a START: {reason}")]
    InvalidBenchmark { name: String, reason: String },
}

/// Lifecycle events reported by a guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuestMessage {
    Ready,
    Finished,
    Uploaded,
}

impl fmt::Display for GuestMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GuestMessage::Ready => "READY",
            GuestMessage::Finished => "FINISHED",
            GuestMessage::Uploaded => "UPLOADED",
        })
    }
}

impl FromStr for GuestMessage {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "READY" => Ok(GuestMessage::Ready),
            "FINISHED" => Ok(GuestMessage::Finished),
            "UPLOADED" => Ok(GuestMessage::Uploaded),
            other => Err(ProtocolError::Unrecognised(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRound {
    pub benchmark: String,
    pub open_vms: u32,
    pub taskset: Taskset,
    pub entry: Configuration,
}

/// Commands broadcast by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostMessage {
    Start(StartRound),
    Continue,
    Reset,
}

impl fmt::Display for HostMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostMessage::Start(round) => write!(
                f,
                "START {} {} {} {}",
                round.benchmark, round.open_vms, round.taskset, round.entry
            ),
            HostMessage::Continue => f.write_str("CONTINUE"),
            HostMessage::Reset => f.write_str("RESET"),
        }
    }
}

impl FromStr for HostMessage {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s {
            "CONTINUE" => return Ok(HostMessage::Continue),
            "RESET" => return Ok(HostMessage::Reset),
            _ => {}
        }

        let Some(args) = s.strip_prefix("START ") else {
            return Err(ProtocolError::Unrecognised(s.to_string()));
        };
        let malformed = |reason: String| ProtocolError::MalformedStart {
            payload: s.to_string(),
            reason,
        };

        match &args.split_whitespace().collect::<Vec<_>>()[..] {
            [benchmark, open_vms, taskset, entry] => Ok(HostMessage::Start(StartRound {
                benchmark: benchmark.to_string(),
                open_vms: open_vms
                    .parse()
                    .map_err(|_| malformed(format!("`{open_vms}` is not a VM count")))?,
                taskset: taskset.parse().map_err(malformed)?,
                entry: entry.parse().map_err(malformed)?,
            })),
            parts => Err(malformed(format!(
                "expected 4 arguments, found {}",
                parts.len()
            ))),
        }
    }
}

/// Checks that `name` survives the trip inside a START: one ASCII word that leaves the
/// payload below `MAX_DATAGRAM`.
pub fn check_benchmark_name(name: &str) -> Result<(), ProtocolError> {
    let invalid = |reason: &str| ProtocolError::InvalidBenchmark {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("empty"));
    }
    if !name.is_ascii() || name.chars().any(|c| c.is_ascii_whitespace() || c.is_ascii_control()) {
        return Err(invalid("must be printable ASCII without whitespace"));
    }
    if name.len() > MAX_BENCHMARK_NAME {
        return Err(invalid(&format!("longer than {MAX_BENCHMARK_NAME} bytes")));
    }

    Ok(())
}

/// Decodes a raw datagram into text, rejecting anything that isn't ASCII.
pub fn decode(payload: &[u8]) -> Result<&str, ProtocolError> {
    if !payload.is_ascii() {
        return Err(ProtocolError::NotText);
    }
    std::str::from_utf8(payload).map_err(|_| ProtocolError::NotText)
}

/// The datagram channel both sides talk over. A seam so the barrier can be driven without
/// real sockets.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_to(&self, payload: &str, addr: SocketAddr) -> std::io::Result<()>;

    /// Waits for the next datagram and returns its raw bytes and sender.
    async fn recv_from(&self) -> std::io::Result<(Vec<u8>, SocketAddr)>;
}

#[async_trait]
impl Transport for UdpSocket {
    async fn send_to(&self, payload: &str, addr: SocketAddr) -> std::io::Result<()> {
        UdpSocket::send_to(self, payload.as_bytes(), addr).await?;
        Ok(())
    }

    async fn recv_from(&self) -> std::io::Result<(Vec<u8>, SocketAddr)> {
        let mut buf = [0u8; MAX_DATAGRAM];
        let (len, addr) = UdpSocket::recv_from(self, &mut buf).await?;
        Ok((buf[..len].to_vec(), addr))
    }
}
