//! Command-line interface definition for openchamber-sync
//!
//! This module defines the CLI structure using clap's derive API,
//! providing commands for watching the event stream, one-shot resyncs,
//! status inspection and cursor lookup.

use clap::{Parser, Subcommand};

/// openchamber-sync - OpenCode event stream client
///
/// Follows an OpenCode server's event stream, reconciles it into a local
/// session store and reports connection and activity changes.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "openchamber-sync")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/config.yaml")]
    pub config: Option<String>,

    /// Override the server base URL
    #[arg(short, long, env = "OPENCHAMBER_SERVER")]
    pub server: Option<String>,

    /// Only follow sessions in this working directory
    #[arg(short, long)]
    pub directory: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    pub json_logs: bool,

    /// Command to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available commands
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Follow the event stream and print connection and activity changes
    Watch {
        /// Session to treat as the one on screen
        #[arg(long)]
        session: Option<String>,
    },

    /// Pull recent messages for a session and print them
    Resync {
        /// Session identifier
        session: String,
    },

    /// Print the server's session status map
    Status,

    /// Probe server liveness; exits non-zero when unhealthy
    Health,

    /// Print the stored cursor for a session
    Cursor {
        /// Session identifier
        session: String,
    },
}

impl Cli {
    /// Parse CLI arguments from the environment
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
