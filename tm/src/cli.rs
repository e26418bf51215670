//! Command-line interface
//!
//! Thin by design: the engine is configured through its config record and
//! driven over the queue, not the CLI.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "tm", version, about = "taskmesh - multi-agent task orchestration engine")]
pub struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level override (TRACE/DEBUG/INFO/WARN/ERROR)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the daemon in the foreground (default)
    Run,
    /// Validate the configuration and agent tree, then exit
    Check,
}
