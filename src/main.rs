use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use rand::Rng;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tollgate::config::TollgateConfig;
use tollgate::{MemoryStore, PolicyError, Registry};

#[derive(Parser)]
#[command(name = "tollgate", version, about = "Distributed rate limiting and circuit breaking")]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load and validate a configuration file
    Check {
        #[arg(short, long)]
        config: String,
    },
    /// Run independent replicas against one in-memory store
    Simulate {
        #[arg(short, long)]
        config: String,
        /// Limiter hash to guard calls with
        #[arg(long)]
        limiter: Option<String>,
        /// Circuit breaker to guard calls with
        #[arg(long)]
        breaker: Option<String>,
        #[arg(long, default_value_t = 8)]
        replicas: usize,
        /// Calls per replica
        #[arg(long, default_value_t = 100)]
        calls: usize,
        /// Fraction of simulated calls that fail
        #[arg(long, default_value_t = 0.0)]
        failure_rate: f64,
    },
}

#[derive(Debug, Default)]
struct Tally {
    succeeded: usize,
    failed: usize,
    rate_limited: usize,
    circuit_open: usize,
    store_faults: usize,
}

impl Tally {
    fn merge(&mut self, other: &Tally) {
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.rate_limited += other.rate_limited;
        self.circuit_open += other.circuit_open;
        self.store_faults += other.store_faults;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    match cli.command {
        Command::Check { config } => check(&config),
        Command::Simulate {
            config,
            limiter,
            breaker,
            replicas,
            calls,
            failure_rate,
        } => {
            tokio::select! {
                result = simulate(&config, limiter, breaker, replicas, calls, failure_rate) => {
                    result
                }
                _ = shutdown_signal() => {
                    info!("Simulation interrupted");
                    Ok(())
                }
            }
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

fn check(path: &str) -> anyhow::Result<()> {
    let config = TollgateConfig::load(path)?;
    config.validate()?;

    info!(instance_id = %config.instance_id, "Configuration is valid");
    for (hash, limiter) in &config.limiters {
        info!(hash = %hash, config = ?limiter, "Limiter");
    }
    for (name, breaker) in &config.breakers {
        info!(breaker = %name, config = ?breaker, "Circuit breaker");
    }
    Ok(())
}

async fn simulate(
    path: &str,
    limiter: Option<String>,
    breaker: Option<String>,
    replicas: usize,
    calls: usize,
    failure_rate: f64,
) -> anyhow::Result<()> {
    if !(0.0..=1.0).contains(&failure_rate) {
        anyhow::bail!("failure rate must be within [0, 1], got {}", failure_rate);
    }

    let config = TollgateConfig::load(path)?;
    let store = Arc::new(MemoryStore::new());
    info!(
        instance_id = %config.instance_id,
        replicas,
        calls,
        "Starting simulation"
    );

    let started = Instant::now();
    let mut tasks = Vec::with_capacity(replicas);
    for replica in 0..replicas {
        // Each replica builds its own drivers; only the store is shared
        let registry = Registry::from_config(&config, store.clone())?;
        let policy = registry.policy(limiter.as_deref(), breaker.as_deref())?;

        tasks.push(tokio::spawn(async move {
            let mut tally = Tally::default();
            for _ in 0..calls {
                let fail = rand::thread_rng().gen_bool(failure_rate);
                let result = policy
                    .execute(|| async move {
                        if fail {
                            Err("simulated failure")
                        } else {
                            Ok(())
                        }
                    })
                    .await;

                match result {
                    Ok(()) => tally.succeeded += 1,
                    Err(PolicyError::Action(_)) => tally.failed += 1,
                    Err(e) if e.is_rate_limited() => tally.rate_limited += 1,
                    Err(e) if e.is_circuit_open() => tally.circuit_open += 1,
                    Err(e) => {
                        warn!(replica, error = %e, "Call failed");
                        tally.store_faults += 1;
                    }
                }
            }
            tally
        }));
    }

    let mut total = Tally::default();
    for tally in futures::future::join_all(tasks).await {
        total.merge(&tally?);
    }

    info!(
        elapsed = ?started.elapsed(),
        succeeded = total.succeeded,
        failed = total.failed,
        rate_limited = total.rate_limited,
        circuit_open = total.circuit_open,
        store_faults = total.store_faults,
        "Simulation finished"
    );

    if let Some(hash) = limiter.as_deref() {
        let registry = Registry::from_config(&config, store.clone())?;
        if let Some(driver) = registry.limiter(hash) {
            let snapshot = driver.snapshot().await?;
            info!(hash = %hash, state = %snapshot, "Final limiter state");
        }
    }
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping");
        }
    }
}
