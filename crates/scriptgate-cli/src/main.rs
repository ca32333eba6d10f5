#![deny(unsafe_code)]

//! scriptgate CLI: runs the gateway over stdio and inspects configuration.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use scriptgate_config::{GatewayConfig, PrivilegeTier};
use scriptgate_core::governor::{self, Limits};
use scriptgate_core::{Dispatcher, Introspection};

/// scriptgate: a persistent, policy-gated Lua execution gateway.
#[derive(Parser)]
#[command(name = "scriptgate", version = scriptgate_core::build_info::VERSION, about, long_about = None)]
struct Cli {
    /// Path to configuration file. Missing means built-in defaults.
    #[arg(short, long, default_value = "scriptgate.toml")]
    config: PathBuf,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve requests on stdin/stdout (default).
    Serve(ServeArgs),

    /// Validate and display configuration.
    Config {
        /// Show the resolved configuration.
        #[arg(long)]
        show: bool,
    },

    /// Check a script against the security policy without running it.
    Check {
        /// Script file to check.
        file: PathBuf,

        /// Tier to validate for.
        #[arg(long, default_value = "RESTRICTED")]
        tier: PrivilegeTier,
    },
}

#[derive(Args, Default)]
struct ServeArgs {
    /// Address-space ceiling in MiB.
    #[arg(long)]
    max_memory_mb: Option<u64>,

    /// Cumulative CPU-time ceiling in seconds.
    #[arg(long)]
    max_cpu_seconds: Option<u64>,

    /// Do not apply resource ceilings.
    #[arg(long)]
    no_limits: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, found) = load_config(&cli.config).await?;
    init_tracing(&config, cli.verbose)?;
    if !found {
        info!(path = %cli.config.display(), "config file not found, using defaults");
    }

    match cli.command.unwrap_or(Commands::Serve(ServeArgs::default())) {
        Commands::Serve(args) => cmd_serve(config, &args).await,
        Commands::Config { show } => cmd_config(&config, &cli.config, show),
        Commands::Check { file, tier } => cmd_check(&config, &file, tier).await,
    }
}

async fn cmd_serve(config: GatewayConfig, args: &ServeArgs) -> Result<()> {
    let config = apply_overrides(config, args)?;
    info!(
        version = %scriptgate_core::build_info::version_string(),
        "scriptgate starting"
    );

    governor::apply(&Limits::from_config(&config.limits));

    let dispatcher = Dispatcher::new(&config).context("gateway startup failed")?;
    let summary = scriptgate_core::serve_stdio(dispatcher).await?;
    info!(handled = summary.handled, reason = ?summary.reason, "scriptgate exiting");
    Ok(())
}

fn cmd_config(config: &GatewayConfig, path: &Path, show: bool) -> Result<()> {
    if show {
        let toml_str = toml::to_string_pretty(config).context("TOML encoding failed")?;
        println!("{toml_str}");
    } else {
        println!("Configuration at '{}' is valid.", path.display());
    }
    Ok(())
}

async fn cmd_check(config: &GatewayConfig, file: &Path, tier: PrivilegeTier) -> Result<()> {
    let code = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;

    if let Some(error) = Introspection::new().parse(&code) {
        anyhow::bail!("{}:{}:{}: {}", file.display(), error.line, error.column, error.message);
    }
    config.build_policy()?.validate(&code, tier)?;
    println!("{}: permitted at {tier}", file.display());
    Ok(())
}

/// Fold CLI ceiling overrides into the configuration and re-validate.
fn apply_overrides(mut config: GatewayConfig, args: &ServeArgs) -> Result<GatewayConfig> {
    if let Some(mb) = args.max_memory_mb {
        config.limits.memory_mb = mb;
    }
    if let Some(secs) = args.max_cpu_seconds {
        config.limits.cpu_seconds = secs;
    }
    if args.no_limits {
        config.limits.enabled = false;
    }
    config.validate()?;
    Ok(config)
}

async fn load_config(path: &Path) -> Result<(GatewayConfig, bool)> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        let config = GatewayConfig::load(path)
            .await
            .with_context(|| format!("invalid configuration in {}", path.display()))?;
        Ok((config, true))
    } else {
        Ok((GatewayConfig::default(), false))
    }
}

/// Log to stderr, or to `logging.file` when configured. Stdout carries only
/// protocol records.
fn init_tracing(config: &GatewayConfig, verbose: u8) -> Result<()> {
    let level = match verbose {
        0 => config.logging.level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match &config.logging.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {path}"))?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_serve_is_default() {
        let cli = Cli::try_parse_from(["scriptgate"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.config, PathBuf::from("scriptgate.toml"));
    }

    #[test]
    fn test_check_tier_parses_case_insensitively() {
        let cli = Cli::try_parse_from(["scriptgate", "check", "job.lua", "--tier", "admin"]).unwrap();
        match cli.command {
            Some(Commands::Check { tier, .. }) => assert_eq!(tier, PrivilegeTier::Admin),
            _ => panic!("expected check"),
        }
    }

    #[test]
    fn test_overrides_apply() {
        let args = ServeArgs {
            max_memory_mb: Some(256),
            max_cpu_seconds: Some(5),
            no_limits: false,
        };
        let config = apply_overrides(GatewayConfig::default(), &args).unwrap();
        assert_eq!(config.limits.memory_mb, 256);
        assert_eq!(config.limits.cpu_seconds, 5);
        assert!(config.limits.enabled);
    }

    #[test]
    fn test_zero_override_rejected() {
        let args = ServeArgs {
            max_memory_mb: Some(0),
            ..ServeArgs::default()
        };
        assert!(apply_overrides(GatewayConfig::default(), &args).is_err());
    }

    #[test]
    fn test_no_limits_allows_zero() {
        let args = ServeArgs {
            max_cpu_seconds: Some(0),
            no_limits: true,
            ..ServeArgs::default()
        };
        let config = apply_overrides(GatewayConfig::default(), &args).unwrap();
        assert!(!config.limits.enabled);
    }

    #[tokio::test]
    async fn test_check_reports_violation() {
        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("job.lua");
        std::fs::write(&script, "local io = require('io')").unwrap();
        let config = GatewayConfig::default();

        assert!(cmd_check(&config, &script, PrivilegeTier::Restricted).await.is_err());
        assert!(cmd_check(&config, &script, PrivilegeTier::Admin).await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_config_uses_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let (config, found) = load_config(&dir.path().join("absent.toml")).await.unwrap();
        assert!(!found);
        assert!(config.limits.enabled);
    }
}
