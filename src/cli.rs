//! CLI argument parsing with clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "egressguard")]
#[command(author, version, about = "Default-deny outbound firewall for sandboxed containers")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file path (a missing file means the policy is disabled)
    #[arg(short, long, default_value = "/etc/egressguard/config.yaml", global = true)]
    pub config: PathBuf,

    /// Quiet mode (errors only)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose mode (debug output)
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Resolve the allow-list and enforce it on the packet filter
    Apply {
        /// Compile and print the rule set without changing the firewall
        #[arg(long)]
        dry_run: bool,

        /// Do not probe blocked/allowed targets after enforcement
        #[arg(long)]
        skip_verify: bool,
    },

    /// Probe the configured blocked and allowed targets
    Verify,

    /// Show the live firewall state
    Status,

    /// Remove all egress restrictions
    Disable,

    /// Show version
    Version,
}
