use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use slidelimit::config::{LoggingConfig, SlidelimitConfig};
use slidelimit::error::LimiterError;
use slidelimit::ratelimit::{
    spawn_reaper, Clock, LimitKey, ManualClock, Policy, RateLimiter, SystemClock, WindowStats,
};

/// Sliding-window rate limiter driver.
#[derive(Debug, Parser)]
#[command(name = "slidelimit", version, about)]
struct Cli {
    /// YAML configuration file; `SLIDELIMIT__*` environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run admission checks against one key and print each decision
    Check {
        /// Caller identity to account against
        #[arg(long)]
        key: String,

        #[command(flatten)]
        policy: PolicyArgs,

        /// Number of checks to run
        #[arg(long, default_value_t = 1)]
        count: u32,

        /// Step a virtual clock by this many seconds between checks
        /// instead of reading the system clock
        #[arg(long)]
        spacing: Option<f64>,
    },
    /// Drive the limiter from many concurrent clients and report the outcome
    Simulate {
        #[command(flatten)]
        policy: PolicyArgs,

        /// Number of concurrent clients
        #[arg(long, default_value_t = 8)]
        clients: usize,

        /// Requests issued by each client
        #[arg(long, default_value_t = 20)]
        requests: u32,

        /// Pause between a client's requests, in milliseconds
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,

        /// Random extra pause added to each interval, in milliseconds
        #[arg(long, default_value_t = 0)]
        jitter_ms: u64,

        /// Make every client share one key instead of one key each
        #[arg(long)]
        shared_key: bool,
    },
    /// Print the configured policy table
    Policies,
}

/// Policy selection shared by subcommands.
#[derive(Debug, Args)]
struct PolicyArgs {
    /// Named policy scope from the configuration
    #[arg(long)]
    scope: Option<String>,

    /// Maximum requests inside the window (overrides the scope)
    #[arg(long)]
    max_requests: Option<u64>,

    /// Window length in seconds (overrides the scope)
    #[arg(long)]
    window: Option<u64>,
}

impl PolicyArgs {
    /// Resolve the effective policy from the scope table and explicit overrides.
    fn resolve(&self, config: &SlidelimitConfig) -> anyhow::Result<Policy> {
        let base = match &self.scope {
            Some(scope) => match config.policies.get(scope) {
                Some(policy) => Some(policy),
                None => bail!(
                    "unknown policy scope '{}' (configured: {:?})",
                    scope,
                    config.policies.scopes()
                ),
            },
            None => None,
        };

        match (base, self.max_requests, self.window) {
            (_, Some(max), Some(window)) => Ok(Policy::new(max, window)),
            (Some(base), max, window) => Ok(Policy::new(
                max.unwrap_or(base.max_requests),
                window.unwrap_or(base.window_seconds),
            )),
            (None, _, _) => bail!("either --scope or both --max-requests and --window are required"),
        }
    }

    /// Key under which an identity is accounted.
    fn key_for(&self, identity: &str) -> Result<String, LimiterError> {
        match &self.scope {
            Some(scope) => Ok(LimitKey::new(scope, identity)?.to_string_key()),
            None => Ok(identity.to_string()),
        }
    }
}

/// Per-client outcome of a simulation.
#[derive(Debug, Serialize)]
struct ClientReport {
    key: String,
    admitted: u64,
    rejected: u64,
    stats: WindowStats,
}

/// Outcome of a whole simulation run.
#[derive(Debug, Serialize)]
struct SimulationSummary {
    run_id: Uuid,
    policy: Policy,
    interrupted: bool,
    admitted_total: u64,
    rejected_total: u64,
    keys: usize,
    clients: Vec<ClientReport>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = SlidelimitConfig::load(cli.config.as_deref())
        .context("failed to load configuration")?;

    init_tracing(&config.logging);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        policy_mode = ?config.limiter.policy_mode,
        policies = config.policies.len(),
        "Configuration loaded"
    );

    match cli.command {
        Command::Check {
            key,
            policy,
            count,
            spacing,
        } => run_check(&config, &key, &policy, count, spacing),
        Command::Simulate {
            policy,
            clients,
            requests,
            interval_ms,
            jitter_ms,
            shared_key,
        } => {
            let pace = Pace {
                interval: Duration::from_millis(interval_ms),
                jitter_ms,
            };
            run_simulation(&config, &policy, clients, requests, pace, shared_key).await
        }
        Command::Policies => {
            let table: BTreeMap<&str, Policy> = config
                .policies
                .scopes()
                .into_iter()
                .filter_map(|scope| config.policies.get(scope).map(|policy| (scope, policy)))
                .collect();
            println!("{}", serde_json::to_string_pretty(&table)?);
            Ok(())
        }
    }
}

/// Install the tracing subscriber. `RUST_LOG` takes precedence over the
/// configured level. Logs go to stderr so stdout stays machine-readable.
fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn run_check(
    config: &SlidelimitConfig,
    identity: &str,
    args: &PolicyArgs,
    count: u32,
    spacing: Option<f64>,
) -> anyhow::Result<()> {
    let policy = args.resolve(config)?;
    let key = args.key_for(identity)?;

    let virtual_clock = spacing.map(|_| Arc::new(ManualClock::new(SystemClock.now())));
    let clock: Arc<dyn Clock> = match &virtual_clock {
        Some(clock) => clock.clone() as Arc<dyn Clock>,
        None => Arc::new(SystemClock),
    };
    let limiter = RateLimiter::with_config_and_clock(&config.limiter, clock);

    info!(key = %key, policy = %policy, count = count, "Running admission checks");

    for _ in 0..count {
        let decision = limiter.check(&key, policy)?;
        println!("{}", serde_json::to_string(&decision)?);

        if let (Some(clock), Some(step)) = (&virtual_clock, spacing) {
            clock.advance(step);
        }
    }

    let stats = limiter.stats_for(&key, policy.window_seconds);
    println!("{}", serde_json::to_string(&stats)?);
    Ok(())
}

/// Pacing between one client's requests.
#[derive(Debug, Clone, Copy)]
struct Pace {
    interval: Duration,
    jitter_ms: u64,
}

async fn run_simulation(
    config: &SlidelimitConfig,
    args: &PolicyArgs,
    clients: usize,
    requests: u32,
    pace: Pace,
    shared_key: bool,
) -> anyhow::Result<()> {
    let policy = args.resolve(config)?;
    let run_id = Uuid::new_v4();
    let limiter = Arc::new(RateLimiter::with_config(&config.limiter));

    info!(
        run_id = %run_id,
        clients = clients,
        requests = requests,
        policy = %policy,
        shared_key = shared_key,
        "Starting simulation"
    );

    let reaper = config.reaper.enabled.then(|| {
        spawn_reaper(
            limiter.clone(),
            Duration::from_secs(config.reaper.interval_secs),
            Duration::from_secs(config.reaper.idle_horizon_secs),
        )
    });

    let mut tasks = Vec::with_capacity(clients);
    for i in 0..clients {
        let key = if shared_key {
            args.key_for("shared")?
        } else {
            args.key_for(&format!("client-{}", i))?
        };
        tasks.push(tokio::spawn(run_client(limiter.clone(), key, policy, requests, pace)));
    }
    let all_clients = futures::future::join_all(tasks);

    let (reports, interrupted) = tokio::select! {
        results = all_clients => {
            let mut reports = Vec::with_capacity(clients);
            for result in results {
                reports.push(result.context("client task failed")??);
            }
            (reports, false)
        }
        _ = shutdown_signal() => {
            warn!(run_id = %run_id, "Simulation interrupted, reporting partial totals");
            (Vec::new(), true)
        }
    };

    if let Some(reaper) = reaper {
        reaper.abort();
    }

    let summary = SimulationSummary {
        run_id,
        policy,
        interrupted,
        admitted_total: limiter.admitted_total(),
        rejected_total: limiter.rejected_total(),
        keys: limiter.key_count(),
        clients: reports,
    };

    info!(
        run_id = %run_id,
        admitted = summary.admitted_total,
        rejected = summary.rejected_total,
        "Simulation finished"
    );
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn run_client(
    limiter: Arc<RateLimiter>,
    key: String,
    policy: Policy,
    requests: u32,
    pace: Pace,
) -> Result<ClientReport, LimiterError> {
    let mut rng = StdRng::from_entropy();
    let mut admitted = 0;
    let mut rejected = 0;

    for _ in 0..requests {
        if limiter.check(&key, policy)?.is_allowed() {
            admitted += 1;
        } else {
            rejected += 1;
        }

        let jitter = if pace.jitter_ms > 0 {
            Duration::from_millis(rng.gen_range(0..=pace.jitter_ms))
        } else {
            Duration::ZERO
        };
        let pause = pace.interval + jitter;
        if pause.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(pause).await;
        }
    }

    Ok(ClientReport {
        stats: limiter.stats_for(&key, policy.window_seconds),
        key,
        admitted,
        rejected,
    })
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
