//! Clap derive structures for the `fanout` CLI.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// fanout -- real-time update distribution from the command line
#[derive(Debug, Parser)]
#[command(
    name = "fanout",
    version,
    about = "Fan an upstream event feed out to subscribed recipients",
    long_about = "Connects to an upstream WebSocket feed, routes its events through\n\
        the subscription registry, and prints each delivered batch and\n\
        notification as a JSON line.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Config file (defaults to the platform config directory)
    #[arg(long, env = "FANOUT_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

// ── Commands ─────────────────────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Connect to the feed and print deliveries as JSON lines
    Run(RunArgs),

    /// Inspect and initialise configuration
    Config(ConfigArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Feed endpoint (overrides feed.url)
    #[arg(long, short = 'e')]
    pub endpoint: Option<String>,

    /// Bearer token for the feed (overrides the config file)
    #[arg(long, env = "FANOUT_FEED_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Channel to subscribe to (repeatable)
    #[arg(long, short = 'c', required = true)]
    pub channel: Vec<String>,

    /// Only events about this entity
    #[arg(long)]
    pub entity: Option<String>,

    /// Recipient id the deliveries are addressed to
    #[arg(long, short = 'r', default_value = "cli")]
    pub recipient: String,

    /// Minimum spacing between batches, in milliseconds
    #[arg(long, default_value = "0")]
    pub throttle_ms: u64,

    /// Stop after this many seconds (runs until Ctrl-C when unset)
    #[arg(long)]
    pub duration: Option<u64>,
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Display the resolved configuration (secrets masked)
    Show,

    /// Print the config file path
    Path,

    /// Write a config file with default values
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}
