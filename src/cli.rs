use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about = "start, stop and watch a managed daemon")]
pub struct Args {
    /// Path to configuration file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Use system-wide config (/etc/daemonctl/daemonctl.toml)
    #[arg(long, global = true, conflicts_with = "config")]
    pub system: bool,

    #[command(subcommand)]
    pub sub: Option<Cmd>,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Report daemon and auto-start state (Exit 0 = running, 1 = otherwise)
    Status {
        /// Print a JSON object instead of text
        #[arg(long)]
        json: bool,
    },
    /// Start the daemon (Exit 0 = running, 1 = failed)
    Start,
    /// Stop the daemon (Exit 0 = stopped, 1 = failed)
    Stop,
    /// Stop, then start the daemon
    Restart,
    /// Start the daemon at boot
    Enable,
    /// Do not start the daemon at boot
    Disable,
    /// Poll until interrupted, printing every change
    Watch {
        /// One JSON event per line
        #[arg(long)]
        json: bool,

        /// Seconds between polls (defaults to timing.poll_interval_secs)
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Open the admin console in a browser
    Admin,
}
