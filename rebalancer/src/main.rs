//! CLI entry point for the ledgerless rebalancer.

use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};

use ledgerless::Symbol;
use ledgerless_rebalancer::config::Config;
use ledgerless_rebalancer::error::Error;
use ledgerless_rebalancer::execution::{self, OrderTarget, RunOptions};
use ledgerless_rebalancer::target::TargetSpec;

#[derive(Parser)]
#[command(name = "rebalancer")]
#[command(about = "Stateless portfolio rebalancer: target weights → broker orders")]
#[command(version)]
struct Cli {
    /// Path to config.toml
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Plan, confirm, and execute a rebalance to target.json
    Run {
        /// Path to target.json
        target: PathBuf,

        /// Show plan without executing
        #[arg(long)]
        dry_run: bool,

        /// Skip confirmation prompt (for automation/cron)
        #[arg(long)]
        force: bool,
    },

    /// Move a single symbol to a target percent or value of NAV
    Order {
        symbol: String,

        /// Target weight in [0, 1]
        #[arg(long, conflicts_with = "value", required_unless_present = "value")]
        percent: Option<f64>,

        /// Target market value in dollars
        #[arg(long)]
        value: Option<f64>,
    },

    /// Rebalance to target.json on a fixed interval
    Watch {
        /// Path to target.json
        target: PathBuf,

        /// Seconds between passes
        #[arg(long, default_value_t = 300)]
        interval: u64,

        /// Stop after this many passes
        #[arg(long)]
        max_passes: Option<u64>,
    },

    /// Show current positions
    Positions,

    /// Check the broker session and working orders
    Status,

    /// Compare actual positions vs target
    Reconcile {
        /// Path to target.json
        target: PathBuf,
    },
}

fn load_target(path: &Path) -> anyhow::Result<TargetSpec> {
    TargetSpec::load(path).with_context(|| format!("loading target {}", path.display()))
}

fn parse_symbol(s: &str) -> anyhow::Result<Symbol> {
    Symbol::try_new(s).with_context(|| format!("invalid symbol '{s}'"))
}

fn dispatch(config: &Config, command: Command) -> anyhow::Result<Result<(), Error>> {
    Ok(match command {
        Command::Run {
            target,
            dry_run,
            force,
        } => {
            let spec = load_target(&target)?;
            let opts = RunOptions {
                dry_run,
                force,
                target_file: target.display().to_string(),
            };
            execution::run(config, &spec, &opts)
        }
        Command::Order {
            symbol,
            percent,
            value,
        } => {
            let symbol = parse_symbol(&symbol)?;
            let target = match (percent, value) {
                (Some(pct), _) => OrderTarget::Percent(pct),
                (None, Some(usd)) => OrderTarget::ValueCents((usd * 100.0).round() as i64),
                (None, None) => anyhow::bail!("one of --percent or --value is required"),
            };
            execution::order_target(config, symbol, target)
        }
        Command::Watch {
            target,
            interval,
            max_passes,
        } => {
            let spec = load_target(&target)?;
            execution::watch(config, &spec, Duration::from_secs(interval), max_passes).map(|_| ())
        }
        Command::Positions => execution::show_positions(config),
        Command::Status => execution::check_status(config),
        Command::Reconcile { target } => {
            let spec = load_target(&target)?;
            execution::run_reconcile(config, &spec)
        }
    })
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading config: {e}");
            process::exit(1);
        }
    };

    let result = match dispatch(&config, cli.command) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Error: {e:#}");
            process::exit(1);
        }
    };

    if let Err(e) = result {
        match &e {
            Error::RiskFailed(msg) => {
                eprintln!("\nAborted: {msg}");
                process::exit(2);
            }
            Error::Aborted(msg) => {
                eprintln!("{msg}");
                process::exit(0);
            }
            Error::BrokerFatal(_) => {
                eprintln!("Fatal: {e}");
                process::exit(3);
            }
            _ => {
                eprintln!("Error: {e}");
                process::exit(1);
            }
        }
    }
}
