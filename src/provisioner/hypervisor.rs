/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;
use tracing::debug;

/// Domain lifecycle operations offered by the hypervisor toolstack.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    async fn create(&self, cfg_path: &Path) -> anyhow::Result<()>;

    /// Asks the domain to shut down and waits until it is gone.
    async fn shutdown(&self, name: &str) -> anyhow::Result<()>;

    async fn destroy(&self, name: &str) -> anyhow::Result<()>;

    async fn set_ratelimit(&self, ratelimit_us: u32) -> anyhow::Result<()>;
}

/// Drives Xen through the `xl` command line tool.
pub struct Xl {
    program: String,
    prefix_args: Vec<String>,
}
impl Xl {
    /// # Arguments
    ///
    /// * `command` - how to invoke xl, e.g. `xl` or `sudo -n xl`
    pub fn new(command: &str) -> anyhow::Result<Self> {
        // break command string into POSIX words
        let words = shlex::split(command).context("xl command string is not POSIX compliant")?;

        match &words[..] {
            [program, args @ ..] => Ok(Self {
                program: program.clone(),
                prefix_args: args.to_vec(),
            }),
            _ => Err(anyhow!("xl command string is empty")),
        }
    }

    async fn run(&self, args: &[&str]) -> anyhow::Result<()> {
        debug!("Running {} {:?} {:?}", self.program, self.prefix_args, args);

        let output = Command::new(&self.program)
            .args(&self.prefix_args)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .context(format!("Failed to run {}", self.program))?;

        if output.status.success() {
            Ok(())
        } else {
            let error_message = String::from_utf8_lossy(&output.stderr).to_string();
            Err(anyhow!(
                "{} {} failed ({}): {}",
                self.program,
                args.join(" "),
                output.status,
                error_message.trim()
            ))
        }
    }
}

#[async_trait]
impl Hypervisor for Xl {
    async fn create(&self, cfg_path: &Path) -> anyhow::Result<()> {
        let cfg_path = cfg_path.to_string_lossy();
        self.run(&["create", &cfg_path]).await
    }

    async fn shutdown(&self, name: &str) -> anyhow::Result<()> {
        self.run(&["shutdown", "--wait", name]).await
    }

    async fn destroy(&self, name: &str) -> anyhow::Result<()> {
        self.run(&["destroy", name]).await
    }

    async fn set_ratelimit(&self, ratelimit_us: u32) -> anyhow::Result<()> {
        let param = format!("--ratelimit_us={ratelimit_us}");
        self.run(&["sched-credit2", "--schedparam", &param]).await
    }
}
