#![forbid(unsafe_code)]

mod actuator;
mod bin_detect;
mod command;
mod config;
mod engine;
mod lock;
mod scheduler;
mod status;

use actuator::SshActuator;
use clap::{Parser, Subcommand};
use config::{Config, ConfigError, env_var};
use engine::{CycleError, CycleReport, EngineSettings, ReconciliationEngine};
use lock::{LockError, RunLock};
use nw_core::{Anonymizer, NodeRangeExpander, SnapshotBuilder};
use nw_storage::{JobsListRequest, SqliteStore, StoreError};
use scheduler::Squeue;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;
use std::thread::sleep;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{error, info, info_span, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Parser)]
#[command(
    name = "nw_runner",
    version,
    about = "Track exclusive Slurm jobs and drive per-node monitor agents through their lifecycle"
)]
struct Cli {
    /// Config file [default: ./nodewatch.toml when present]
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Ledger directory; overrides store.storage_dir and NW_STORAGE_DIR
    #[arg(long, global = true)]
    storage_dir: Option<PathBuf>,
    /// Log filter such as `debug` or `nw_runner=trace` [default: RUST_LOG, then info]
    #[arg(long, global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Run one poll cycle and exit.
    Reconcile,
    /// Run poll cycles back to back in this process.
    Watch {
        #[arg(long, default_value_t = 300)]
        interval_s: u64,
        #[arg(long)]
        max_cycles: Option<u64>,
    },
    /// Print the ledger, newest first.
    Status {
        #[arg(long, default_value_t = 50)]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
    /// Print the canonical node names a node-range token covers.
    Expand {
        token: String,
        #[arg(long, default_value_t = nw_core::DEFAULT_INDEX_WIDTH)]
        width: usize,
    },
}

#[derive(Debug, thiserror::Error)]
enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Cycle(#[from] CycleError),
    #[error("render status: {0}")]
    Json(#[from] serde_json::Error),
}

impl RunError {
    fn exit_code(&self) -> ExitCode {
        match self {
            RunError::Config(_) | RunError::Usage(_) => ExitCode::from(2),
            _ => ExitCode::from(1),
        }
    }
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis()
        .min(i64::MAX as u128) as i64
}

fn init_tracing(level: Option<&str>, log_file: Option<&std::path::Path>) -> Result<(), RunError> {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level)
            .map_err(|e| RunError::Usage(format!("invalid --log-level {level:?}: {e}")))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(())
}

fn load_config(cli: &Cli, require_scheduler: bool) -> Result<Config, ConfigError> {
    let mut cfg = Config::load(cli.config.as_deref())?;
    cfg.apply_env(env_var);
    if let Some(dir) = &cli.storage_dir {
        cfg.store.storage_dir = dir.clone();
    }
    if require_scheduler {
        cfg.validate()?;
    }
    Ok(cfg)
}

fn build_engine(cfg: &Config) -> ReconciliationEngine<Squeue, SshActuator> {
    let builder = SnapshotBuilder::new(
        NodeRangeExpander::new(cfg.reconcile.node_index_width),
        Anonymizer::new(cfg.reconcile.anon_salt.clone()),
    );
    ReconciliationEngine::new(
        Squeue::from_config(&cfg.scheduler),
        SshActuator::new(
            &cfg.monitor,
            &cfg.collection,
            Duration::from_secs(cfg.reconcile.command_timeout_s),
        ),
        builder,
        EngineSettings {
            fanout: cfg.reconcile.fanout,
            strict_actuation: cfg.reconcile.strict_actuation,
        },
    )
}

fn log_report(report: &CycleReport) {
    info!(
        observed = report.observed,
        inserted = report.inserted.len(),
        excluded = report.excluded.len(),
        malformed = report.malformed.len(),
        finished = report.finished.len(),
        started = report.started.len(),
        stopped = report.stopped.len(),
        fetched = report.fetched.len(),
        deferred = report.deferred.len(),
        transitions = report.transitions(),
        "cycle complete"
    );
}

/// `None` runs a single cycle; `Some((interval, max_cycles))` keeps going.
fn run_cycles(cfg: &Config, watch: Option<(Duration, Option<u64>)>) -> Result<(), RunError> {
    let lock = match RunLock::acquire(
        &cfg.store.storage_dir,
        Duration::from_secs(cfg.reconcile.lock_stale_after_s),
    ) {
        Ok(lock) => lock,
        Err(err @ LockError::Held { .. }) => {
            warn!(error = %err, "previous run still active; skipping");
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };

    for cmd in bin_detect::missing_commands(&bin_detect::required_commands(cfg)) {
        warn!(command = cmd, "command not found; dependent actions will fail");
    }

    let mut store = SqliteStore::open(&cfg.store.storage_dir)?;
    let engine = build_engine(cfg);

    let mut cycle = 0u64;
    loop {
        cycle = cycle.saturating_add(1);
        if let Err(err) = lock.refresh() {
            warn!(error = %err, path = %lock.path().display(), "could not refresh run-lock");
        }
        let outcome = {
            let _span = info_span!("cycle", n = cycle).entered();
            engine.run_cycle(&mut store, now_ms())
        };
        match outcome {
            Ok(report) => log_report(&report),
            Err(err) if watch.is_some() => error!(error = %err, cycle, "cycle aborted"),
            Err(err) => return Err(err.into()),
        }

        let Some((interval, max_cycles)) = watch else {
            return Ok(());
        };
        if max_cycles.is_some_and(|max| cycle >= max) {
            return Ok(());
        }
        sleep(interval);
    }
}

fn print_status(cfg: &Config, limit: usize, as_json: bool) -> Result<(), RunError> {
    let store = SqliteStore::open(&cfg.store.storage_dir)?;
    let jobs = store.jobs_list(JobsListRequest { limit })?;
    if as_json {
        let rows = jobs.iter().map(status::job_json).collect::<Vec<_>>();
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        print!("{}", status::render_table(&jobs));
    }
    Ok(())
}

fn run(cli: Cli) -> Result<(), RunError> {
    match &cli.command {
        Cmd::Expand { token, width } => {
            if *width == 0 {
                return Err(RunError::Usage("--width must be > 0".to_string()));
            }
            let nodes = NodeRangeExpander::new(*width)
                .expand(token)
                .map_err(|e| RunError::Usage(e.to_string()))?;
            for node in nodes {
                println!("{node}");
            }
            Ok(())
        }
        Cmd::Status { limit, json } => {
            let cfg = load_config(&cli, false)?;
            init_tracing(cli.log_level.as_deref(), None)?;
            print_status(&cfg, *limit, *json)
        }
        Cmd::Reconcile => {
            let cfg = load_config(&cli, true)?;
            init_tracing(cli.log_level.as_deref(), cfg.log_file.as_deref())?;
            run_cycles(&cfg, None)
        }
        Cmd::Watch {
            interval_s,
            max_cycles,
        } => {
            let cfg = load_config(&cli, true)?;
            init_tracing(cli.log_level.as_deref(), cfg.log_file.as_deref())?;
            run_cycles(&cfg, Some((Duration::from_secs(*interval_s), *max_cycles)))
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            // The subscriber may not be installed yet (config errors).
            if tracing::dispatcher::has_been_set() {
                error!(error = %err, "nw_runner failed");
            } else {
                eprintln!("nw_runner: {err}");
            }
            err.exit_code()
        }
    }
}
