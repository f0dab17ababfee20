//! The owner tick loop behind `tickbridge run`.

use anyhow::{Context as _, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tickbridge_common::BridgeConfig;
use tickbridge_core::{Bridge, StatsSnapshot};
use tickbridge_net::HttpTransport;
use tickbridge_script::ScriptHost;

/// Configuration layers above the built-in defaults: a JSON file, then the
/// environment, then these explicit values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub config_file: Option<PathBuf>,
    pub workers: Option<usize>,
    /// `Some(0)` means unbounded
    pub queue_capacity: Option<usize>,
    /// `Some(0)` means wait forever
    pub admission_timeout_ms: Option<u64>,
}

impl ConfigOverrides {
    pub fn resolve(&self) -> Result<BridgeConfig> {
        let config = match &self.config_file {
            Some(path) => BridgeConfig::from_json_file(path)?,
            None => BridgeConfig::default(),
        };
        let mut config = config.apply_env()?;

        if let Some(workers) = self.workers {
            config.max_workers = workers;
        }
        if let Some(capacity) = self.queue_capacity {
            config.queue_capacity = (capacity > 0).then_some(capacity);
        }
        if let Some(ms) = self.admission_timeout_ms {
            config.admission_timeout_ms = (ms > 0).then_some(ms);
        }

        config
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;
        Ok(config)
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub script: PathBuf,
    pub config: BridgeConfig,
    pub tick: Duration,
    pub max_ticks: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// No request in flight and no server running
    Idle,
    MaxTicks,
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub ticks: u64,
    pub reason: StopReason,
    /// Refs still owned by the bridge when the host shut down
    pub released: usize,
    pub stats: StatsSnapshot,
}

/// Loads the script and ticks it until it stops; see [`StopReason`].
pub fn run(options: RunOptions, stop: &AtomicBool) -> Result<RunSummary> {
    let transport = HttpTransport::new()?;
    let bridge = Bridge::builder(transport)
        .config(options.config)
        .build()
        .context("Failed to start bridge")?;

    let mut host = ScriptHost::from_file(&options.script, bridge.clone())
        .with_context(|| format!("Failed to load script {}", options.script.display()))?;
    tracing::info!(context = %host.context_id(), "Script loaded from {}", options.script.display());

    let mut ticks = 0u64;
    let reason = loop {
        if stop.load(Ordering::SeqCst) {
            break StopReason::Interrupted;
        }

        host.tick()?;
        ticks += 1;

        if host.is_idle() {
            break StopReason::Idle;
        }
        if options.max_ticks.is_some_and(|max| ticks >= max) {
            break StopReason::MaxTicks;
        }
        std::thread::sleep(options.tick);
    };

    let released = host.shutdown();
    bridge.shutdown();
    let stats = bridge.stats();
    tracing::info!(ticks, ?reason, released, "Script finished");

    Ok(RunSummary {
        ticks,
        reason,
        released,
        stats,
    })
}
