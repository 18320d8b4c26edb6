//! wgsift CLI
//!
//! Runs the split-tunneling engine against a TOML state file and
//! provides offline rule editing, config generation, and tunnel
//! detection.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use wgsift_engine::{Config, Engine};

/// Domain-based split tunneling over WireGuard
#[derive(Parser)]
#[command(name = "wgsift")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the state file
    #[arg(short, long, default_value = "wgsift.toml")]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the routing engine until interrupted
    Run,

    /// Generate a sample configuration file
    GenConfig {
        /// Output path
        #[arg(short, long, default_value = "wgsift.toml")]
        output: PathBuf,
    },

    /// Probe for usable tunnels (advisory)
    Detect,

    /// Edit the rule set without starting the engine
    Rules {
        #[command(subcommand)]
        action: RuleAction,
    },
}

#[derive(Subcommand)]
enum RuleAction {
    /// List stored rules
    List,

    /// Add a rule (tunnel by default)
    Add {
        /// Literal name or `*.suffix` wildcard
        pattern: String,
        /// Classify matching names as direct instead of tunnel
        #[arg(long)]
        direct: bool,
    },

    /// Remove a rule by pattern
    Remove { pattern: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    match cli.command {
        Commands::Run => run(cli.config).await,
        Commands::GenConfig { output } => gen_config(output),
        Commands::Detect => detect(cli.config).await,
        Commands::Rules { action } => rules(cli.config, action).await,
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run(config_path: PathBuf) -> Result<()> {
    let mut engine = Engine::new(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;

    info!("starting wgsift with state from {}", config_path.display());
    engine.start().await.context("engine start failed")?;
    info!("running; press Ctrl-C to stop");

    signal::ctrl_c().await.context("failed to wait for Ctrl-C")?;
    info!("shutting down...");

    if let Err(e) = engine.stop().await {
        error!("shutdown incomplete: {}", e);
        return Err(e.into());
    }
    info!("stopped; resolver restored");
    Ok(())
}

fn gen_config(output: PathBuf) -> Result<()> {
    if output.exists() {
        bail!("{} already exists, refusing to overwrite", output.display());
    }
    std::fs::write(&output, Config::sample())
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!("wrote sample configuration to {}", output.display());
    println!("edit the [vpn] section, then start with: wgsift run");
    Ok(())
}

async fn detect(config_path: PathBuf) -> Result<()> {
    let engine = Engine::new(&config_path)?;
    println!("{}", engine.detect_tunnels().await);
    Ok(())
}

async fn rules(config_path: PathBuf, action: RuleAction) -> Result<()> {
    let mut engine = Engine::new(&config_path)?;

    match action {
        RuleAction::List => {
            let rules = engine.rules().await;
            if rules.is_empty() {
                println!("no rules configured");
            }
            for rule in rules {
                println!(
                    "{:7} {}",
                    if rule.tunnel { "tunnel" } else { "direct" },
                    rule.pattern
                );
            }
        }
        RuleAction::Add { pattern, direct } => {
            engine.add_rule(&pattern, !direct).await?;
            println!(
                "added {} rule for {}",
                if direct { "direct" } else { "tunnel" },
                pattern
            );
        }
        RuleAction::Remove { pattern } => {
            if engine.remove_rule(&pattern).await? {
                println!("removed {}", pattern);
            } else {
                bail!("no rule with pattern {}", pattern);
            }
        }
    }
    Ok(())
}
