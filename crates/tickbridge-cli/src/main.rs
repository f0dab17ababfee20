//! # tickbridge CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Run a script until it has nothing left in flight
//! tickbridge run -s script.js
//!
//! # Tighter admission, two workers, stop after 1000 ticks
//! tickbridge run -s server.js --workers 2 --queue-capacity 16 --max-ticks 1000
//!
//! # Load tunables from a file; flags still win
//! tickbridge run -s script.js --config bridge.json --tick-ms 5
//! ```
//!
//! `TICKBRIDGE_MAX_WORKERS`, `TICKBRIDGE_QUEUE_CAPACITY` and
//! `TICKBRIDGE_ADMISSION_TIMEOUT_MS` sit between the config file and the flags.
//! `RUST_LOG` overrides the default `info` log level.

use anyhow::Result;
use argh::FromArgs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tickbridge_cli::run::{self, ConfigOverrides, RunOptions};

#[derive(FromArgs)]
/// tickbridge - run scripts against a threaded I/O bridge
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Run(RunArgs),
}

/// Arguments for `tickbridge run`.
///
/// # Example
///
/// ```bash
/// tickbridge run -s scripts/fetch.js --workers 8
/// ```
#[derive(FromArgs)]
#[argh(subcommand, name = "run")]
/// run a JavaScript file until it is idle
struct RunArgs {
    /// path to the JavaScript file to load and execute
    #[argh(option, short = 's')]
    script: String,

    /// optional JSON file with bridge tunables
    #[argh(option, long = "config")]
    config: Option<String>,

    /// maximum number of concurrent transport workers
    #[argh(option, long = "workers")]
    workers: Option<usize>,

    /// maximum number of queued requests (0 for unbounded)
    #[argh(option, long = "queue-capacity")]
    queue_capacity: Option<usize>,

    /// how long inbound requests may wait for the script, in milliseconds (0 waits forever)
    #[argh(option, long = "admission-timeout-ms")]
    admission_timeout_ms: Option<u64>,

    /// delay between owner ticks in milliseconds
    #[argh(option, long = "tick-ms", default = "10")]
    tick_ms: u64,

    /// stop after this many ticks even if requests are still in flight
    #[argh(option, long = "max-ticks")]
    max_ticks: Option<u64>,
}

impl RunArgs {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            config_file: self.config.as_ref().map(PathBuf::from),
            workers: self.workers,
            queue_capacity: self.queue_capacity,
            admission_timeout_ms: self.admission_timeout_ms,
        }
    }
}

/// Sets `flag` on the first ctrl-c.
///
/// The signal listener gets its own thread and runtime so the main thread
/// stays free of any async context while it drives the script.
fn install_interrupt_handler(flag: Arc<AtomicBool>) -> Result<()> {
    std::thread::Builder::new()
        .name("tickbridge-signal".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    tracing::warn!("Ctrl-c handling disabled: {}", e);
                    return;
                }
            };
            if runtime.block_on(tokio::signal::ctrl_c()).is_ok() {
                tracing::info!("Interrupted, shutting down");
                flag.store(true, Ordering::SeqCst);
            }
        })?;
    Ok(())
}

fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // RUST_LOG overrides the default level
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    match cli.command {
        Commands::Run(args) => {
            let config = args.overrides().resolve()?;
            tracing::info!(
                max_workers = config.max_workers,
                queue_capacity = ?config.queue_capacity,
                admission_timeout_ms = ?config.admission_timeout_ms,
                "Starting tickbridge with script: {}",
                args.script
            );

            let stop = Arc::new(AtomicBool::new(false));
            install_interrupt_handler(stop.clone())?;

            let summary = run::run(
                RunOptions {
                    script: PathBuf::from(&args.script),
                    config,
                    tick: Duration::from_millis(args.tick_ms),
                    max_ticks: args.max_ticks,
                },
                &stop,
            )?;

            println!("{}", serde_json::to_string(&summary.stats)?);
        }
    }

    Ok(())
}
