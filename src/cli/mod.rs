use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "tollgate")]
#[command(about = "ICAP adaptation gateway - credential blocking, malware scanning, one-time-token approvals")]
#[command(version)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "tollgate.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the ICAP service
    Start,
    /// Validate the configuration and exit
    Check,
    /// List configured detection patterns
    Patterns,
    /// Write a default configuration file
    Init,
}
