/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use anyhow::Context;
use colored::Colorize;
use std::path::Path;
use term_table::{row, row::Row, rows, table_cell::*, Table, TableStyle};
use tokio::net::UdpSocket;
use tracing::{error, subscriber::set_global_default, Subscriber};
use tracing_subscriber::EnvFilter;
use vmsweep::{
    campaign::{self, Campaign, Domains},
    clap_args::{self, Commands},
    config::Config,
    guest::GuestAgent,
    host::{self, CampaignRunner},
    provisioner::{hypervisor::Xl, Provisioner},
    store,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = clap_args::parse();

    let env_filter = if args.verbose { "debug" } else { "info" };
    init_subscriber(get_subscriber(env_filter.to_string()))?;

    let result = match args.command {
        Commands::Plan { campaign, force } => plan(&campaign, force),
        Commands::Status { campaign } => status(&campaign, &args.config),
        Commands::Host {
            campaign,
            config_only,
        } => run_host(&campaign, &args.config, config_only).await,
        Commands::Guest => run_guest(&args.config).await,
    };

    if let Err(e) = &result {
        error!("{e:#}");
    }
    result
}

fn get_subscriber(env_filter: String) -> impl Subscriber + Sync + Send {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(env_filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .finish()
}

fn init_subscriber(subscriber: impl Subscriber + Sync + Send) -> anyhow::Result<()> {
    set_global_default(subscriber).context("Failed to set subscriber")
}

fn plan(path: &Path, force: bool) -> anyhow::Result<()> {
    let entries = campaign::generate(&Domains::default(), &campaign::default_couplings());
    let campaign = Campaign::create(path, entries, force)?;

    println!(
        "> wrote {} entries to {}",
        campaign.entries().len().to_string().green(),
        path.display()
    );
    Ok(())
}

fn status(path: &Path, config_path: &Path) -> anyhow::Result<()> {
    let campaign = Campaign::load(path)?;
    let total = campaign.entries().len();
    let pending = campaign.remaining();

    // runnable depends on the host profile, which needs a host config
    let runnable = match Config::try_from_path(config_path) {
        Ok(Config {
            host: Some(host), ..
        }) => campaign
            .entries()
            .iter()
            .filter(|entry| !entry.is_done() && entry.config.runnable_on(&host.profile))
            .count()
            .to_string(),
        _ => "--".bright_black().to_string(),
    };

    let next = campaign
        .next_pending()
        .map(|entry| entry.config.to_string())
        .unwrap_or_else(|| "--".to_string());

    let table = Table::builder()
        .rows(rows![
            row![
                TableCell::builder("Entries".bold()).build(),
                TableCell::builder("Done".bold()).build(),
                TableCell::builder("Pending".bold()).build(),
                TableCell::builder("Runnable here".bold()).build()
            ],
            row![
                TableCell::new(total),
                TableCell::new((total - pending).to_string().green()),
                TableCell::new(pending),
                TableCell::new(runnable)
            ]
        ])
        .style(TableStyle::rounded())
        .build();

    println!("{}:", path.display().to_string().green());
    println!("{}", table.render());
    println!("next pending: {next}");

    Ok(())
}

async fn run_host(path: &Path, config_path: &Path, config_only: bool) -> anyhow::Result<()> {
    let config = Config::try_from_path(config_path)?;
    let host = config.host()?.clone();

    let xl = Xl::new(&host.xl)?;
    let bind = host.bind;
    let provisioner = Provisioner::new(host, Box::new(xl));
    let mut campaign = Campaign::load(path)?;

    if config_only {
        return write_descriptors(&provisioner, &campaign);
    }

    let socket = UdpSocket::bind(bind)
        .await
        .context(format!("Error binding control socket to {bind}"))?;
    let runner = CampaignRunner::new(&provisioner, &socket);

    runner.run(&mut campaign).await?;
    Ok(())
}

/// Config-only mode never talks to guests, so it runs without the control socket.
fn write_descriptors(provisioner: &Provisioner, campaign: &Campaign) -> anyhow::Result<()> {
    match host::write_next_descriptors(provisioner, campaign)? {
        Some((entry, guests)) => {
            println!("> wrote {} descriptors for {}", guests.len(), entry);
            for guest in guests {
                println!("  {}", guest.cfg_path.display());
            }
        }
        None => println!("> nothing left to run on this host"),
    }
    Ok(())
}

async fn run_guest(config_path: &Path) -> anyhow::Result<()> {
    let config = Config::try_from_path(config_path)?;
    let guest = config.guest()?.clone();

    let socket = UdpSocket::bind(guest.bind)
        .await
        .context(format!("Error binding control socket to {}", guest.bind))?;
    let store = guest.store.as_ref().map(store::from_config);

    let mut agent = GuestAgent::new(&socket, guest, store)?;
    agent.run().await
}
