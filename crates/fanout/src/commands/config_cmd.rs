//! Config subcommand handlers.

use fanout_config::{self as config, Config};

use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts};
use crate::commands::resolve_config_path;
use crate::error::CliError;

pub fn handle(args: ConfigArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let path = resolve_config_path(global);
    match args.command {
        ConfigCommand::Show => {
            let cfg = config::load_config_from(&path)?;
            // Surface translation errors here rather than at `run` time.
            cfg.to_engine_config()?;
            print!("{}", toml::to_string_pretty(&cfg.redacted())?);
            Ok(())
        }

        ConfigCommand::Path => {
            println!("{}", path.display());
            Ok(())
        }

        ConfigCommand::Init { force } => {
            if path.exists() && !force {
                return Err(CliError::ConfigExists {
                    path: path.display().to_string(),
                });
            }
            config::save_config(&Config::default(), &path)?;
            eprintln!("Wrote default configuration to {}", path.display());
            Ok(())
        }
    }
}
