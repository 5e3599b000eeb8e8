//! Command-line interface.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use ag_domain::config::Config;

#[derive(Parser)]
#[command(name = "agentgate", version, about = "Multi-channel AI agent gateway")]
pub struct Cli {
    /// Path to the config file (defaults to ./agentgate.toml or
    /// $AGENTGATE_CONFIG).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the gateway (default).
    Serve,
    /// Check config, state directory, and workspace health.
    Doctor,
    /// Config helpers.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print the version.
    Version,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Validate the config file and report issues.
    Validate,
    /// Print the effective config.
    Show,
}

/// Resolve and load the config: `--config`, then `$AGENTGATE_CONFIG`,
/// then `./agentgate.toml`, then built-in defaults.
pub fn load_config(cli_path: Option<&PathBuf>) -> anyhow::Result<(Config, Option<PathBuf>)> {
    let path = cli_path
        .cloned()
        .or_else(|| std::env::var("AGENTGATE_CONFIG").ok().map(PathBuf::from))
        .or_else(|| {
            let default = PathBuf::from("agentgate.toml");
            default.exists().then_some(default)
        });

    match path {
        Some(path) => {
            let config = Config::load(&path)?;
            Ok((config, Some(path)))
        }
        None => Ok((Config::default(), None)),
    }
}

/// Run the doctor checks. Returns whether everything passed.
pub fn doctor(config: &Config, config_path: Option<&PathBuf>) -> bool {
    let mut passed = true;

    match config_path {
        Some(path) => println!("config: {}", path.display()),
        None => println!("config: built-in defaults"),
    }

    for issue in config.validate() {
        println!("  {issue}");
        if issue.severity == ag_domain::config::ConfigSeverity::Error {
            passed = false;
        }
    }

    let state_dir = &config.state.state_dir;
    match std::fs::create_dir_all(state_dir) {
        Ok(()) => println!("state dir: {} (writable)", state_dir.display()),
        Err(e) => {
            println!("state dir: {} UNWRITABLE: {e}", state_dir.display());
            passed = false;
        }
    }

    let workspace = &config.agent.workspace_dir;
    if workspace.exists() {
        println!("workspace: {}", workspace.display());
    } else {
        println!("workspace: {} (missing — bootstrap files will be empty)", workspace.display());
    }

    let token_env = &config.server.auth.token_env;
    if std::env::var(token_env).map(|v| !v.is_empty()).unwrap_or(false) {
        println!("auth: token set via {token_env}");
    } else {
        println!("auth: {token_env} unset — only loopback clients can connect");
    }

    passed
}

/// Print validation results. Returns whether the config is usable.
pub fn validate(config: &Config) -> bool {
    let issues = config.validate();
    if issues.is_empty() {
        println!("config OK");
        return true;
    }
    for issue in &issues {
        println!("{issue}");
    }
    !issues
        .iter()
        .any(|i| i.severity == ag_domain::config::ConfigSeverity::Error)
}

pub fn show(config: &Config) {
    match toml::to_string_pretty(config) {
        Ok(rendered) => println!("{rendered}"),
        Err(e) => eprintln!("failed to render config: {e}"),
    }
}
