use clap::Parser;
use memwatch::config::Settings;
use memwatch::configurator::{configure, Role, WorkerContext};
use memwatch::lifecycle::{install, LifecycleEvents};
use memwatch::memory::ProcMemory;
use memwatch::signals::SignalHandler;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Supervise this worker process's memory: run health monitors on a fixed
/// interval and shut the worker down once a monitor keeps failing.
#[derive(Parser, Debug)]
#[command(name = "memwatch", version, about)]
pub struct Cli {
    /// Kind of worker being supervised
    #[arg(short, long, value_enum, default_value_t = Role::Web)]
    role: Role,

    /// Config file path (environment variables override it)
    #[arg(short, long, default_value = "memwatch.toml")]
    config: PathBuf,

    /// Print the resolved watchdog configuration and exit
    #[arg(long)]
    dry_run: bool,

    /// Log every monitor check, not just strikes and escalations
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli);
    tracing::debug!(?cli, "parsed CLI arguments");

    let settings = match Settings::load(&cli.config) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::error!(error = %e, "failed to load settings");
            return ExitCode::FAILURE;
        }
    };

    let (context, mut shutdown_request) = WorkerContext::new(Arc::new(ProcMemory::new()));

    if cli.dry_run {
        return match configure(cli.role, &settings, &context) {
            Ok(config) => {
                println!("role: {}", cli.role);
                print!("{}", config.describe());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("invalid configuration: {e}");
                ExitCode::FAILURE
            }
        };
    }

    let mut signals = match SignalHandler::install() {
        Ok(signals) => signals,
        Err(e) => {
            tracing::error!(error = %e, "failed to install signal handlers");
            return ExitCode::FAILURE;
        }
    };

    let mut events = LifecycleEvents::new();
    let slot = install(&mut events, cli.role, settings, context);

    tracing::info!(role = %cli.role, pid = std::process::id(), "memwatch worker starting");
    events.do_worker_start();

    tokio::select! {
        received = signals.recv() => {
            tracing::info!(signal = received.name(), "shutdown signal received");
        }
        _ = shutdown_request.requested() => {
            tracing::info!("graceful shutdown requested by memory watchdog");
        }
    }

    events.do_worker_stop();
    match slot.join().await {
        Some(outcome) => tracing::info!(?outcome, "memory watchdog finished"),
        None => tracing::debug!("no memory watchdog was running"),
    }
    ExitCode::SUCCESS
}

fn init_tracing(cli: &Cli) {
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false);
    if cli.json {
        builder.json().init();
    } else {
        builder.init();
    }
}
