//! sedaq – runs a command dispatcher on a thread-per-processor pool, or
//! checks a configuration file.
//
//  $ sedaq run --config sedaq.toml --duration-secs 10
//  $ sedaq check --config sedaq.toml
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use sedaq::core::queue::Sink;
use sedaq::logging::init_logging;
use sedaq::{
    metrics, Command, CommandManager, Config, Event, EventPipeline, Signal, SignalHandler,
    ThreadManager, TpcThreadManager,
};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "sedaq", version, about = "sedaq command dispatcher")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Start a dispatcher that emits a heartbeat signal until interrupted.
    Run {
        /// Path to config TOML (env SEDAQ_CONFIG overrides)
        #[arg(short, long, default_value = "sedaq.toml")]
        config: String,
        /// Stop after this many seconds instead of waiting for Ctrl-C.
        #[arg(long)]
        duration_secs: Option<u64>,
        /// Heartbeat period.
        #[arg(long, default_value_t = 1000)]
        heartbeat_ms: u64,
    },
    /// Load and validate a config file, then print the effective values.
    Check {
        #[arg(short, long, default_value = "sedaq.toml")]
        config: String,
    },
}

/// Broadcast on every heartbeat.
#[derive(Debug)]
struct Tick(u64);

impl Signal for Tick {}

/// Re-submits a [`Tick`] through the dispatcher's own inbox.
struct Heartbeat {
    sink: Arc<dyn Sink<Event>>,
    beats: AtomicU64,
}

impl Command for Heartbeat {
    fn execute(&self) -> anyhow::Result<()> {
        let n = self.beats.fetch_add(1, Ordering::Relaxed) + 1;
        self.sink.enqueue(Event::signal(Tick(n)))?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "heartbeat"
    }
}

struct TickLogger;

impl SignalHandler for TickLogger {
    fn handle_signal(&self, signal: &dyn Signal) {
        if let Some(Tick(n)) = signal.downcast_ref::<Tick>() {
            info!(beat = n, "tick");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.cmd {
        Cmd::Run {
            config,
            duration_secs,
            heartbeat_ms,
        } => run(&config, duration_secs, Duration::from_millis(heartbeat_ms)).await?,
        Cmd::Check { config } => {
            let cfg = Config::load(Some(config.as_str()))?;
            println!("{cfg:#?}");
            println!(
                "fixed pool: up to {} workers",
                cfg.fixed_pool.to_tpc_config().max_workers()
            );
        }
    }
    Ok(())
}

async fn run(config: &str, duration_secs: Option<u64>, heartbeat: Duration) -> anyhow::Result<()> {
    let cfg = Config::load(Some(config))?;

    let manager = Arc::new(match cfg.queue.predicate()? {
        Some(predicate) => CommandManager::with_predicate(predicate),
        None => CommandManager::new(),
    });
    manager.set_dequeue_timeout(cfg.queue.timeout());

    let threads = TpcThreadManager::new(cfg.fixed_pool.to_tpc_config());
    threads.initialize()?;
    threads.register(Arc::clone(&manager) as Arc<dyn EventPipeline<Event>>)?;

    manager.register_signal_handler::<Tick>(Arc::new(TickLogger));
    manager.submit(Event::every(
        heartbeat,
        heartbeat,
        0,
        Heartbeat {
            sink: manager.command_sink(),
            beats: AtomicU64::new(0),
        },
    ))?;
    info!(?heartbeat, "dispatcher running");

    match duration_secs {
        Some(secs) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("interrupted"),
                _ = tokio::time::sleep(Duration::from_secs(secs)) => info!("run time elapsed"),
            }
        }
        None => {
            tokio::signal::ctrl_c().await?;
            info!("interrupted");
        }
    }

    if let Err(e) = threads.dispose() {
        warn!(error = %e, "thread manager already disposed");
    }
    manager.dispose()?;
    println!("{}", metrics::snapshot());
    Ok(())
}
