//! CLI entry point for the stereo companion daemon.
//!
//! Parses command line arguments, loads configuration, and drives the
//! manager: one-shot discovery, the monitoring loop, status and health
//! queries, maintenance, and a guarded state reset.

use clap::{Parser, Subcommand};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use stereod_daemon::{Config, DiscoverOptions, Manager, ManagerError, StoreError};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Stereo Companion Daemon - tracks downloaded media and produces stereo audio companions
#[derive(Parser, Debug)]
#[command(name = "stereod")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to the state database (overrides config)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Planner batch size (overrides config)
    #[arg(long)]
    batch_size: Option<u32>,

    /// Enable debug logging
    #[arg(long, default_value = "false")]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// One-shot discovery pass over a directory
    Scan {
        /// Directory to scan
        dir: PathBuf,

        /// Walk depth (1 scans only the directory itself)
        #[arg(long, default_value = "3")]
        max_depth: usize,
    },
    /// Run the monitoring loop until SIGINT/SIGTERM
    Monitor,
    /// Print the current system status as JSON
    Status,
    /// Run GC and compaction
    Maintenance,
    /// Drop all persisted state after confirmation
    Reset {
        /// Skip the interactive confirmation
        #[arg(long, default_value = "false")]
        yes: bool,
    },
}

fn init_logging(debug: bool) {
    // STATE_LOG_LEVEL wins; --debug is the shorthand; default info
    let filter = if let Ok(level) = std::env::var("STATE_LOG_LEVEL") {
        EnvFilter::new(level)
    } else if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_config(cli: &Cli) -> Result<Config, ExitCode> {
    let mut config = match &cli.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                error!("failed to load config {}: {}", path.display(), e);
                return Err(ExitCode::from(2));
            }
        },
        None => {
            let mut config = Config::default();
            config.apply_env_overrides();
            config
        }
    };

    if let Some(db) = &cli.db {
        config.storage.db_path = db.clone();
    }
    if let Some(batch_size) = cli.batch_size {
        config.planner.batch_size = batch_size;
    }

    if let Err(e) = config.validate() {
        error!("invalid configuration: {}", e);
        return Err(ExitCode::from(2));
    }

    Ok(config)
}

/// A store that cannot be opened or migrated is a refusal to start.
fn exit_code_for(e: &ManagerError) -> ExitCode {
    match e {
        ManagerError::Store(StoreError::SchemaTooNew { .. }) => ExitCode::from(2),
        ManagerError::Store(_) => ExitCode::from(2),
        _ => ExitCode::FAILURE,
    }
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => error!("failed to render JSON: {}", e),
    }
}

async fn run(cli: Cli) -> ExitCode {
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(code) => return code,
    };

    let manager = match Manager::open(config) {
        Ok(manager) => manager,
        Err(e) => {
            error!("failed to open state core: {}", e);
            return exit_code_for(&e);
        }
    };

    let result: Result<(), ManagerError> = match cli.command {
        Command::Scan { dir, max_depth } => {
            let options = DiscoverOptions { max_depth };
            match manager.discover_directory(&dir, &options) {
                Ok(report) => {
                    print_json(&report);
                    Ok(())
                }
                Err(e) => Err(e),
            }
        }

        Command::Monitor => {
            info!("monitoring started (Ctrl+C to stop)");
            let monitor = manager.start_monitoring();
            tokio::pin!(monitor);

            let outcome = tokio::select! {
                result = &mut monitor => result,
                _ = shutdown_signal() => {
                    info!("shutdown signal received");
                    if let Err(e) = manager.close().await {
                        error!("error during shutdown: {}", e);
                    }
                    monitor.await
                }
            };
            outcome
        }

        Command::Status => match manager.get_status() {
            Ok(status) => {
                print_json(&status);
                match manager.get_health() {
                    Ok(health) => {
                        print_json(&health);
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        },

        Command::Maintenance => match manager.run_maintenance().await {
            Ok(report) => {
                print_json(&report);
                Ok(())
            }
            Err(e) => Err(e),
        },

        Command::Reset { yes } => {
            if !yes && !confirm_reset() {
                info!("reset aborted");
                return ExitCode::SUCCESS;
            }
            manager.reset_store()
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            exit_code_for(&e)
        }
    }
}

fn confirm_reset() -> bool {
    print!("This drops ALL tracked state. Type 'yes' to continue: ");
    let _ = std::io::stdout().flush();

    let mut line = String::new();
    if std::io::stdin().lock().read_line(&mut line).is_err() {
        return false;
    }
    line.trim().eq_ignore_ascii_case("yes")
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(_) => {
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.debug);
    run(cli).await
}
