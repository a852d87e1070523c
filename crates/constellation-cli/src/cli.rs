//! Command-line argument definitions

use clap::{Parser, Subcommand};

/// Constellation device-fleet controller
#[derive(Debug, Parser)]
#[command(name = "constellation", version, about)]
pub struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    pub config: Option<String>,

    /// Enable verbose (debug-level) logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Connect every configured device and keep the control plane running
    Run,

    /// Dispatch one task to one device and print the result as JSON
    Send {
        /// Target device id (must appear in the configuration)
        #[arg(long)]
        device: String,

        /// Task name forwarded to the device agent
        #[arg(long)]
        task: String,

        /// Opaque JSON request payload
        #[arg(long, default_value = "{}")]
        request: String,

        /// Override the response timeout, in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Connect the fleet and print each device's record as JSON
    Devices {
        /// Only list devices that reached a connected state
        #[arg(long)]
        connected: bool,
    },
}
