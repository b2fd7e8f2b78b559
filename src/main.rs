// Spot CLI - run a playbook task on a target

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use colored::*;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use spot::executor::{Scheduler, SchedulerConfig, SshConfig, SshConnector};
use spot::output::HostPrinter;
use spot::parser::{load_playbook, Overrides};

#[derive(Parser)]
#[command(
    name = "spot",
    about = "Run playbook tasks on groups of remote hosts",
    version,
    disable_colored_help = true
)]
struct Cli {
    /// Path to the playbook file
    #[arg(short, long, default_value = "spot.yml")]
    playbook: PathBuf,

    /// Task to run
    #[arg(short = 'n', long)]
    task: String,

    /// Target name, inventory host or `host:port` (can repeat)
    #[arg(short = 't', long = "target", default_value = "default")]
    targets: Vec<String>,

    /// Hosts processed concurrently
    #[arg(short, long, default_value_t = 1)]
    concurrent: usize,

    /// SSH connection timeout in seconds
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    /// Inventory file used instead of the playbook targets
    #[arg(long)]
    inventory_file: Option<String>,

    /// Inventory URL used instead of the playbook targets
    #[arg(long)]
    inventory_url: Option<String>,

    /// Explicit `host[:port]` used instead of the playbook targets (can repeat)
    #[arg(long = "target-host")]
    target_hosts: Vec<String>,

    /// Remote user (overrides playbook and task)
    #[arg(short, long)]
    user: Option<String>,

    /// SSH private key (overrides playbook and task)
    #[arg(short, long)]
    key: Option<PathBuf>,

    /// Skip these commands (can repeat)
    #[arg(long)]
    skip: Vec<String>,

    /// Run only these commands (can repeat)
    #[arg(long)]
    only: Vec<String>,

    /// Extra environment for script commands, `KEY:VALUE` (can repeat)
    #[arg(short, long = "env", value_parser = parse_env)]
    env: Vec<(String, String)>,

    /// Debug logging
    #[arg(long)]
    dbg: bool,
}

fn parse_env(s: &str) -> Result<(String, String), String> {
    match s.split_once(':') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY:VALUE, got {:?}", s)),
    }
}

fn init_logging(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(debug).with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

fn non_empty(s: &str) -> Option<PathBuf> {
    (!s.is_empty()).then(|| PathBuf::from(s))
}

async fn run(cli: Cli) -> Result<()> {
    let overrides = Overrides {
        user: cli.user.unwrap_or_default(),
        target_hosts: cli.target_hosts,
        inventory_file: cli.inventory_file.unwrap_or_default(),
        inventory_url: cli.inventory_url.unwrap_or_default(),
        environment: cli.env.into_iter().collect(),
    };
    let playbook = load_playbook(&cli.playbook, Some(overrides))?;

    // identity and key are per task: CLI, then task, then playbook
    let task = playbook.task(&cli.task)?;
    let private_key = cli
        .key
        .or_else(|| non_empty(&task.ssh_key))
        .or_else(|| non_empty(&playbook.ssh_key));
    let connector = SshConnector::new(SshConfig {
        user: task.user.clone(),
        private_key,
        connect_timeout: Duration::from_secs(cli.timeout),
    });

    let config = SchedulerConfig {
        concurrency: cli.concurrent,
        only: cli.only,
        skip: cli.skip,
    };
    let scheduler = Scheduler::new(config, Arc::new(playbook), Arc::new(connector))
        .with_printer(HostPrinter::new(false));

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, stopping");
            interrupt.cancel();
        }
    });

    for target in &cli.targets {
        let start = Instant::now();
        let stats = scheduler
            .run(&cancel, &cli.task, target)
            .await
            .with_context(|| format!("task {:?} failed on target {:?}", cli.task, target))?;
        info!(
            "completed {} commands on {} hosts in {:?}",
            stats.commands,
            stats.hosts,
            Duration::from_millis(start.elapsed().as_millis() as u64)
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.dbg);

    if let Err(e) = run(cli).await {
        eprintln!("{} {:#}", "error:".red().bold(), e);
        std::process::exit(1);
    }
}
