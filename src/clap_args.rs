use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Verbose mode (-v, --verbose)
    #[arg(short, long)]
    pub verbose: bool,

    /// Path to the host/guest config file
    #[arg(short, long, default_value = "vmsweep.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Generate a fresh campaign file covering the whole configuration sweep
    Plan {
        /// Where to write the campaign
        campaign: PathBuf,

        /// Overwrite an existing campaign, discarding its progress
        #[arg(long)]
        force: bool,
    },

    /// Show campaign progress
    Status { campaign: PathBuf },

    /// Run campaign entries on this Xen host
    Host {
        campaign: PathBuf,

        /// Only write the guest descriptors for the next entry, don't start anything
        #[arg(long)]
        config_only: bool,
    },

    /// Run the benchmark agent inside a guest
    Guest,
}

pub fn parse() -> Args {
    Args::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_command_takes_campaign_and_flags() -> anyhow::Result<()> {
        let args = Args::try_parse_from([
            "vmsweep",
            "-v",
            "--config",
            "/etc/vmsweep.toml",
            "host",
            "campaign.txt",
            "--config-only",
        ])?;

        assert!(args.verbose);
        assert_eq!(args.config, PathBuf::from("/etc/vmsweep.toml"));
        match args.command {
            Commands::Host {
                campaign,
                config_only,
            } => {
                assert_eq!(campaign, PathBuf::from("campaign.txt"));
                assert!(config_only);
            }
            other => panic!("expected host command, got {other:?}"),
        }

        Ok(())
    }

    #[test]
    fn config_defaults_to_working_directory() -> anyhow::Result<()> {
        let args = Args::try_parse_from(["vmsweep", "guest"])?;
        assert_eq!(args.config, PathBuf::from("vmsweep.toml"));
        assert!(!args.verbose);
        Ok(())
    }
}
