//! session-runtime - exercise the session runtime from the command line.
//!
//! `config` prints the effective configuration. `simulate` runs request
//! threads, background access submissions and idle expiry against an
//! in-process service and prints a JSON report.

use clap::{Parser as ClapParser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use session_runtime::{
    config::{ConfigError, RuntimeConfig},
    reaper::spawn_reaper,
    request::CLOSE_APPLICATION_PARAMETER,
    service::ServiceSnapshot,
    PushMode, Request, RequestKind, Response, ResponseStatus, Session, SessionService, UiId,
};

/// session-runtime
///
/// Exclusive per-session locking, deferred access and liveness tracking for
/// stateful UI servers.
#[derive(ClapParser, Debug)]
#[command(name = "session-runtime", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a TOML config file (defaults to the user config dir)
    #[arg(long, global = true, env = "SESSION_RUNTIME_CONFIG")]
    config: Option<PathBuf>,

    /// Relax lock checks to debug assertions
    #[arg(long, global = true, env = "SESSION_RUNTIME_PRODUCTION_MODE")]
    production_mode: bool,

    /// Seconds between client heartbeats (0 disables UI expiry)
    #[arg(long, global = true, env = "SESSION_RUNTIME_HEARTBEAT_INTERVAL")]
    heartbeat_interval: Option<i64>,

    /// Close sessions that only send heartbeats
    #[arg(long, global = true, env = "SESSION_RUNTIME_CLOSE_IDLE_SESSIONS")]
    close_idle_sessions: bool,

    /// Inactivity limit for transport sessions, in seconds
    #[arg(long, global = true, env = "SESSION_RUNTIME_MAX_INACTIVE")]
    max_inactive: Option<i64>,

    /// Push mode for new UIs: disabled, manual or automatic
    #[arg(long, global = true, env = "SESSION_RUNTIME_PUSH_MODE")]
    push_mode: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the effective configuration as TOML
    Config,

    /// Run a load simulation against an in-process service
    Simulate {
        /// Number of concurrent clients
        #[arg(long, default_value_t = 8)]
        clients: usize,

        /// Requests sent by each client after bootstrap
        #[arg(long, default_value_t = 50)]
        requests: usize,

        /// Background access tasks submitted per client
        #[arg(long, default_value_t = 20)]
        background: usize,

        /// Reaper period in milliseconds
        #[arg(long, default_value_t = 50)]
        reaper_ms: u64,
    },
}

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid push mode: {0}")]
    PushMode(String),

    #[error("task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "session_runtime=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn parse_push_mode(value: &str) -> Result<PushMode, RuntimeError> {
    match value.to_ascii_lowercase().as_str() {
        "disabled" => Ok(PushMode::Disabled),
        "manual" => Ok(PushMode::Manual),
        "automatic" => Ok(PushMode::Automatic),
        other => Err(RuntimeError::PushMode(other.to_string())),
    }
}

/// Load the config file and apply command-line overrides.
fn effective_config(cli: &Cli) -> Result<RuntimeConfig, RuntimeError> {
    let mut config = RuntimeConfig::load_or_default(cli.config.as_deref())?;
    if cli.production_mode {
        config.production_mode = true;
    }
    if let Some(interval) = cli.heartbeat_interval {
        config.heartbeat_interval_secs = interval;
    }
    if cli.close_idle_sessions {
        config.close_idle_sessions = true;
    }
    if let Some(max_inactive) = cli.max_inactive {
        config.max_inactive_interval_secs = max_inactive;
    }
    if let Some(mode) = &cli.push_mode {
        config.default_push_mode = parse_push_mode(mode)?;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), RuntimeError> {
    let cli = Cli::parse();
    init_tracing();

    let config = effective_config(&cli)?;
    match cli.command {
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::Simulate { clients, requests, background, reaper_ms } => {
            let report = run_simulation(config, clients, requests, background, reaper_ms).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

// ── Simulation ─────────────────────────────────────────────────────

#[derive(Debug, Default, Serialize)]
struct SimulationReport {
    clients: usize,
    elapsed_ms: u64,
    requests: u64,
    ok: u64,
    not_found: u64,
    gone: u64,
    expired: u64,
    internal_error: u64,
    access_submitted: u64,
    access_completed: u64,
    access_failed: u64,
    sessions_created: usize,
    sessions_destroyed: usize,
    transports_expired: usize,
    final_state: Option<ServiceSnapshot>,
}

#[derive(Default)]
struct Counters {
    requests: AtomicU64,
    ok: AtomicU64,
    not_found: AtomicU64,
    gone: AtomicU64,
    expired: AtomicU64,
    internal_error: AtomicU64,
    access_submitted: AtomicU64,
    access_completed: AtomicU64,
    access_failed: AtomicU64,
}

impl Counters {
    fn record(&self, response: &Response) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let counter = match response.status {
            ResponseStatus::Ok => &self.ok,
            ResponseStatus::NotFound => &self.not_found,
            ResponseStatus::Gone => &self.gone,
            ResponseStatus::SessionExpired => &self.expired,
            ResponseStatus::InternalError => &self.internal_error,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Answers UIDL requests with the number of changes waiting for the UI.
fn uidl_handler(session: &Session, request: &Request, response: &mut Response) -> anyhow::Result<bool> {
    let RequestKind::Uidl { ui } = request.kind else {
        return Ok(false);
    };
    match session.ui(ui)? {
        Some(target) => {
            let pending = target.pending_changes()?.len();
            response.set(ResponseStatus::Ok, pending.to_string());
        }
        None => response.set(ResponseStatus::Gone, format!("UI {ui} not found")),
    }
    Ok(true)
}

fn run_client(
    service: &SessionService,
    counters: &Counters,
    requests: usize,
    background: usize,
    close_at_end: bool,
) {
    use rand::Rng;

    let response = service.handle_request(&Request::init().with_locales(["en-US"]));
    counters.record(&response);
    let (Some(transport), Ok(ui_id)) = (response.transport, response.body.parse::<UiId>()) else {
        return;
    };
    let Some(session) = service.session_for(transport) else {
        return;
    };

    // Background producer: touches the UI through the access queue.
    let producer = {
        let session = session.clone();
        let submitted = Arc::new(AtomicU64::new(0));
        let completed = Arc::new(AtomicU64::new(0));
        let failed = Arc::new(AtomicU64::new(0));
        let (s, c, f) = (submitted.clone(), completed.clone(), failed.clone());
        let thread = std::thread::spawn(move || {
            for n in 0..background {
                let target = session.clone();
                let handle = session.access(move || {
                    if let Some(ui) = target.ui(ui_id)? {
                        ui.mark_changed(format!("tick-{n}"))?;
                    }
                    Ok(())
                });
                s.fetch_add(1, Ordering::Relaxed);
                match handle.get_timeout(Duration::from_secs(10)) {
                    Ok(()) => c.fetch_add(1, Ordering::Relaxed),
                    Err(_) => f.fetch_add(1, Ordering::Relaxed),
                };
            }
        });
        (thread, submitted, completed, failed)
    };

    let mut rng = rand::thread_rng();
    for _ in 0..requests {
        let request = if rng.gen_bool(0.3) {
            Request::heartbeat(transport, ui_id)
        } else {
            Request::uidl(transport, ui_id)
        };
        counters.record(&service.handle_request(&request));
        if rng.gen_bool(0.1) {
            std::thread::sleep(Duration::from_millis(rng.gen_range(1..5)));
        }
    }

    let (thread, submitted, completed, failed) = producer;
    if thread.join().is_err() {
        tracing::error!("background producer panicked");
    }
    counters.access_submitted.fetch_add(submitted.load(Ordering::Relaxed), Ordering::Relaxed);
    counters.access_completed.fetch_add(completed.load(Ordering::Relaxed), Ordering::Relaxed);
    counters.access_failed.fetch_add(failed.load(Ordering::Relaxed), Ordering::Relaxed);

    if close_at_end {
        let close = Request::new(RequestKind::Other("/".into()))
            .with_transport(transport)
            .with_parameter(CLOSE_APPLICATION_PARAMETER, "");
        counters.record(&service.handle_request(&close));
    }
}

async fn run_simulation(
    config: RuntimeConfig,
    clients: usize,
    requests: usize,
    background: usize,
    reaper_ms: u64,
) -> Result<SimulationReport, RuntimeError> {
    let max_inactive = config.max_inactive_interval_secs;
    let service = SessionService::new(config);
    let counters = Arc::new(Counters::default());
    let created = Arc::new(AtomicUsize::new(0));
    let destroyed = Arc::new(AtomicUsize::new(0));
    {
        let created = created.clone();
        service.add_session_init_listener(move |_, _| {
            created.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });
        let destroyed = destroyed.clone();
        service.add_session_destroy_listener(move |_| {
            destroyed.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });
    }
    service.add_request_handler(uidl_handler);

    let cancel = CancellationToken::new();
    let reaper = spawn_reaper(service.clone(), Duration::from_millis(reaper_ms.max(1)), cancel.clone());

    tracing::info!(clients, requests, background, "simulation starting");
    let started = Instant::now();
    let mut tasks = Vec::with_capacity(clients);
    for n in 0..clients {
        let service = service.clone();
        let counters = counters.clone();
        tasks.push(tokio::task::spawn_blocking(move || {
            run_client(&service, &counters, requests, background, n % 2 == 0)
        }));
    }
    for task in tasks {
        task.await?;
    }

    // Everything still alive has gone idle: expire it as the container would.
    let svc = service.clone();
    let expired = tokio::task::spawn_blocking(move || {
        let horizon = Instant::now() + Duration::from_secs(max_inactive.max(0) as u64 + 1);
        svc.expire_transport_sessions(horizon)
    })
    .await?;

    cancel.cancel();
    reaper.await?;

    Ok(SimulationReport {
        clients,
        elapsed_ms: started.elapsed().as_millis() as u64,
        requests: counters.requests.load(Ordering::Relaxed),
        ok: counters.ok.load(Ordering::Relaxed),
        not_found: counters.not_found.load(Ordering::Relaxed),
        gone: counters.gone.load(Ordering::Relaxed),
        expired: counters.expired.load(Ordering::Relaxed),
        internal_error: counters.internal_error.load(Ordering::Relaxed),
        access_submitted: counters.access_submitted.load(Ordering::Relaxed),
        access_completed: counters.access_completed.load(Ordering::Relaxed),
        access_failed: counters.access_failed.load(Ordering::Relaxed),
        sessions_created: created.load(Ordering::Relaxed),
        sessions_destroyed: destroyed.load(Ordering::Relaxed),
        transports_expired: expired,
        final_state: Some(service.snapshot()),
    })
}
