//! Config command implementation.

use anyhow::{Context, bail};
use clap::Subcommand;
use colored::Colorize;
use conductor_orchestrator::ConductorConfig;
use std::path::PathBuf;

use crate::transcript::load_config;

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the effective configuration as TOML
    Show,

    /// Write a configuration file with default values
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

pub fn execute(command: ConfigCommand, path: Option<PathBuf>) -> anyhow::Result<()> {
    match command {
        ConfigCommand::Show => {
            let config = load_config(path)?;
            print!("{}", config.to_toml_string()?);
        }
        ConfigCommand::Init { force } => {
            let path = match path {
                Some(path) => path,
                None => ConductorConfig::default_config_path()?,
            };
            if path.exists() && !force {
                bail!("{} already exists (use --force to overwrite)", path.display());
            }
            ConductorConfig::default()
                .save_to_file(&path)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("{} {}", "Wrote".green(), path.display());
        }
    }
    Ok(())
}
