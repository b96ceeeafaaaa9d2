use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::future::join_all;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use kvguard::config::KvGuardConfig;
use kvguard::ratelimit::{AdmissionControl, HookEvent};
use kvguard::store::MemoryStore;

#[derive(Debug, Parser)]
#[command(name = "kvguard", version, about = "Inspect and exercise kvguard configurations")]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Build every configured lock and limiter and report the first error
    Validate {
        #[arg(long)]
        config: PathBuf,
    },
    /// Drive a configured limiter against an in-memory store
    Simulate {
        #[arg(long)]
        config: PathBuf,
        /// Name of the limiter to drive
        #[arg(long)]
        limiter: String,
        /// Amount requested per call
        #[arg(long, default_value_t = 1, allow_hyphen_values = true)]
        amount: i64,
        /// Number of calls
        #[arg(long, default_value_t = 1)]
        times: usize,
        /// Calls issued together per batch
        #[arg(long, default_value_t = 1)]
        concurrency: usize,
        /// Print one JSON object per decision
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Validate { config } => validate(config),
        Command::Simulate {
            config,
            limiter,
            amount,
            times,
            concurrency,
            json,
        } => simulate(config, &limiter, amount, times, concurrency, json).await,
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn validate(path: PathBuf) -> anyhow::Result<()> {
    let config = KvGuardConfig::from_file(&path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    config.validate()?;

    let store = Arc::new(MemoryStore::new());

    let mut locks: Vec<&String> = config.locks.keys().collect();
    locks.sort();
    for name in locks {
        let lock = config.lock(store.clone(), name)?;
        println!(
            "lock     {:<24} key={} ttl={:?} poll={:?}",
            name,
            lock.key(),
            lock.lease_ttl(),
            lock.poll_interval()
        );
    }

    let mut limiters: Vec<&String> = config.limiters.keys().collect();
    limiters.sort();
    for name in limiters {
        let limiter = config.limiter_builder(name)?.build(store.clone())?;
        let marks = limiter.watermarks();
        println!(
            "limiter  {:<24} key={} max={} warning={}",
            name,
            AdmissionControl::key(&limiter),
            marks.max,
            marks.warning
        );
    }

    info!(path = %path.display(), "Configuration is valid");
    Ok(())
}

async fn simulate(
    path: PathBuf,
    name: &str,
    amount: i64,
    times: usize,
    concurrency: usize,
    json: bool,
) -> anyhow::Result<()> {
    anyhow::ensure!(concurrency > 0, "--concurrency must be positive");

    let config = KvGuardConfig::from_file(&path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    let store = Arc::new(MemoryStore::new());

    let limiter = config
        .limiter_builder(name)?
        .on_warning(|event: &HookEvent| {
            info!(key = %event.key, value = event.value, watermark = event.watermark, "Warning watermark reached");
        })
        .on_full(|event: &HookEvent| {
            warn!(key = %event.key, value = event.value, watermark = event.watermark, "Max watermark reached");
        })
        .on_compensation_error(|failure| {
            warn!(key = %failure.key, delta = failure.delta, error = %failure.error, "Compensation failed");
        })
        .build(store)?;

    let mut admitted = 0usize;
    let mut call = 0usize;
    while call < times {
        let batch = concurrency.min(times - call);
        let results = join_all((0..batch).map(|_| limiter.admit(amount))).await;

        for result in results {
            call += 1;
            let admission = result?;
            if admission.admitted {
                admitted += 1;
            }

            if json {
                let line = serde_json::json!({
                    "call": call,
                    "admitted": admission.admitted,
                    "level": admission.level,
                    "remaining": admission.remaining,
                    "retry_after_ms": admission.retry_after.map(|d| d.as_millis() as u64),
                });
                println!("{line}");
            } else {
                println!(
                    "#{:<4} {:<8} level={:<6} remaining={:<6} retry_after={:?}",
                    call,
                    if admission.admitted { "admitted" } else { "refused" },
                    admission.level,
                    admission.remaining,
                    admission.retry_after
                );
            }
        }
    }

    info!(limiter = name, calls = times, admitted = admitted, "Simulation finished");
    Ok(())
}
