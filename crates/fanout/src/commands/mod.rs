//! Subcommand handlers.

pub mod config_cmd;
pub mod run;

use std::path::PathBuf;

use crate::cli::GlobalOpts;

/// `--config` if given, else the platform default.
pub fn resolve_config_path(global: &GlobalOpts) -> PathBuf {
    global
        .config
        .clone()
        .unwrap_or_else(fanout_config::config_path)
}
