//! Command-line interface for the `talon` binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use tal_domain::config::Config;

#[derive(Debug, Parser)]
#[command(name = "talon", about = "Engagement orchestration gateway")]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = "talon.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the gateway server (default).
    Serve,
    /// Configuration helpers.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print the version.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Validate the configuration file and report every issue.
    Validate,
    /// Print the effective configuration.
    Show,
}

/// Load the config named on the command line.
pub fn load_config(path: &std::path::Path) -> anyhow::Result<Config> {
    Config::load(path).map_err(|e| anyhow::anyhow!("loading {}: {e}", path.display()))
}
