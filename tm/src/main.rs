//! taskmesh daemon entry point

use clap::Parser;
use eyre::{Context, Result};
use tracing::info;

use taskmesh::cli::{Cli, Command};
use taskmesh::config::Config;
use taskmesh::daemon::run_daemon;
use taskmesh::tree::InMemoryAgentTree;

fn setup_logging(cli_level: Option<&str>, config_level: Option<&str>) -> Result<()> {
    let level = match cli_level.or(config_level).map(str::to_uppercase).as_deref() {
        Some("TRACE") => tracing::Level::TRACE,
        Some("DEBUG") => tracing::Level::DEBUG,
        Some("WARN") | Some("WARNING") => tracing::Level::WARN,
        Some("ERROR") => tracing::Level::ERROR,
        Some("INFO") | None => tracing::Level::INFO,
        Some(other) => {
            eprintln!("Warning: unknown log-level '{other}', defaulting to INFO");
            tracing::Level::INFO
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref()).wrap_err("failed to load configuration")?;
    setup_logging(cli.log_level.as_deref(), config.log_level.as_deref())?;

    match cli.command {
        Some(Command::Check) => cmd_check(&config),
        Some(Command::Run) | None => run_daemon(config).await,
    }
}

/// Validate the configuration and agent tree without starting anything
fn cmd_check(config: &Config) -> Result<()> {
    if let Some(path) = &config.tree_file {
        let text = std::fs::read_to_string(path).wrap_err_with(|| format!("failed to read tree file {path}"))?;
        let tree = InMemoryAgentTree::from_yaml(&text).map_err(|e| eyre::eyre!(e.to_string()))?;
        drop(tree);
        println!("tree file ok: {path}");
    } else {
        println!("no tree_file configured (daemon would start with a bare root)");
    }
    if config.llm_endpoint.is_none() {
        println!("warning: no llm_endpoint configured, degraded fallbacks apply");
    }
    println!("configuration ok");
    Ok(())
}
