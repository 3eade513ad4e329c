//! `ckbd` — the CKB daemon binary. Loads config, brings up C5/C6/C7/C8/C9
//! together (spec §4.9), serves the admin HTTP surface, and tears
//! everything down within a bounded shutdown window on SIGINT/SIGTERM.

use anyhow::{Context, Result};
use ckb_daemon::config::DaemonConfig;
use ckb_daemon::control::DaemonControlImpl;
use ckb_daemon::daemon::{self, PidFile};
use ckb_daemon::refresh::{
    CancelContext, IncrementalEngine, IncrementalOutcome, IndexerResolver, ManifestIndexerResolver,
    RefreshManager,
};
use ckb_daemon::scheduler::Scheduler;
use ckb_daemon::watcher::{self, Watcher};
use ckb_protocol::model::{EventKind, TaskType, Trigger};
use ckb_protocol::CoreResult;
use ckb_server::admin::{self, AdminState};
use ckb_server::webhooks::{WebhookManager, WebhookManagerConfig};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ckbd", version, about = "CKB daemon: repo watcher, scheduler, and refresh orchestration core")]
struct Args {
    /// Directory the daemon keeps its own state in (pid file, scheduler.db,
    /// webhooks.db, config.toml). Defaults to `~/.ckb/daemon`.
    #[arg(long)]
    daemon_dir: Option<PathBuf>,

    /// Path to the TOML config file. Defaults to `<daemon-dir>/config.toml`.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Repository paths to watch and maintain. Repeatable.
    #[arg(long = "repo")]
    repos: Vec<PathBuf>,
}

/// An incremental engine is an external collaborator the core has no
/// opinion on (spec §4.7.2); absent a real one wired in, every incremental
/// request defers straight to the documented full-reindex fallback.
struct AlwaysFullIncrementalEngine;

impl IncrementalEngine for AlwaysFullIncrementalEngine {
    fn run(&self, _repo_path: &Path) -> CoreResult<IncrementalOutcome> {
        Ok(IncrementalOutcome::RequiresFullReindex)
    }
}

/// Turns a refresh-manager event into a webhook emission. `emit` is
/// deliberately synchronous at this boundary: the refresh pipeline must
/// never block on network I/O (spec §9 "enqueue asynchronously"), so the
/// actual delivery attempt is spawned onto its own task.
struct WebhookEventEmitter {
    webhooks: Arc<WebhookManager>,
}

impl ckb_daemon::refresh::EventEmitter for WebhookEventEmitter {
    fn emit(&self, kind: EventKind, source: &str, data: serde_json::Value) {
        let webhooks = self.webhooks.clone();
        let source = source.to_string();
        tokio::spawn(async move {
            let event = ckb_protocol::model::Event {
                id: uuid::Uuid::new_v4().to_string(),
                kind,
                timestamp: chrono::Utc::now(),
                source,
                data,
            };
            if let Err(e) = webhooks.emit(event).await {
                warn!(error = %e, "failed to queue webhook deliveries for event");
            }
        });
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let daemon_dir = match args.daemon_dir {
        Some(dir) => dir,
        None => daemon::daemon_root_dir().context("resolving daemon directory")?,
    };
    std::fs::create_dir_all(&daemon_dir)
        .with_context(|| format!("creating daemon directory {}", daemon_dir.display()))?;

    init_logging(&daemon_dir)?;

    let config_path = args.config.unwrap_or_else(|| daemon_dir.join("config.toml"));
    let config = DaemonConfig::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    info!(daemon_dir = %daemon_dir.display(), "starting ckbd");

    let mut pid_file = match PidFile::acquire(&daemon_dir) {
        Ok(pid_file) => pid_file,
        Err(e) => {
            error!(error = %e, "daemon already running");
            anyhow::bail!("already running: {e}");
        }
    };

    let shutdown_timeout = daemon::shutdown_timeout(&config);

    let scheduler = Arc::new(
        Scheduler::open(
            &daemon_dir.join("scheduler.db"),
            Duration::from_secs(config.scheduler.check_interval_secs),
        )
        .context("opening scheduler store")?,
    );

    let webhooks = Arc::new(
        WebhookManager::open(
            &daemon_dir.join("webhooks.db"),
            WebhookManagerConfig {
                timeout: Duration::from_secs(config.webhooks.timeout_secs),
                retry_interval: Duration::from_secs(config.webhooks.retry_interval_secs),
                default_max_retries: config.webhooks.max_retries,
                default_retry_delay_seconds: config.webhooks.retry_delay_seconds,
            },
        )
        .context("opening webhook store")?,
    );

    let indexer_resolver: Arc<dyn IndexerResolver> = Arc::new(ManifestIndexerResolver::new());
    let incremental_engine: Arc<dyn IncrementalEngine> = Arc::new(AlwaysFullIncrementalEngine);
    let event_emitter = Arc::new(WebhookEventEmitter { webhooks: webhooks.clone() });

    let refresh_manager = Arc::new(RefreshManager::new(
        incremental_engine,
        indexer_resolver,
        Some(event_emitter),
    ));

    register_refresh_schedule_handler(&scheduler, refresh_manager.clone());

    let watcher = Arc::new(build_watcher(&config, refresh_manager.clone()));
    if config.watch.enabled {
        for repo in &args.repos {
            watcher.watch_repo(repo);
        }
    }

    scheduler.start();
    webhooks.start();

    let control = Arc::new(DaemonControlImpl {
        scheduler: scheduler.clone(),
        refresh: refresh_manager.clone(),
    });
    let daemon_state = daemon::DaemonState::new();
    let admin_state = AdminState {
        control: control.clone(),
        webhooks: webhooks.clone(),
        pid: daemon_state.pid,
        started_at: std::time::Instant::now(),
        health: None,
    };
    let router = admin::router(admin_state);

    let bind_addr = format!("{}:{}", config.bind, config.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding http listener on {bind_addr}"))?;
    info!(addr = %bind_addr, "admin http surface listening");

    let server = axum::serve(listener, router).with_graceful_shutdown(shutdown_signal());
    if let Err(e) = server.await {
        error!(error = %e, "http server exited with error");
    }

    info!("shutdown signal received, stopping subsystems");

    if let Err(e) = daemon::bounded_shutdown("webhooks", shutdown_timeout, async {
        if let Err(e) = webhooks.stop(shutdown_timeout).await {
            warn!(error = %e, "webhook manager did not stop cleanly");
        }
    })
    .await
    {
        warn!(error = %e, "webhook shutdown stage exceeded its bound");
    }

    if let Err(e) = daemon::bounded_shutdown("watcher", shutdown_timeout, async {
        watcher.stop().await;
    })
    .await
    {
        warn!(error = %e, "watcher shutdown stage exceeded its bound");
    }

    if let Err(e) = daemon::bounded_shutdown("scheduler", shutdown_timeout, async {
        if let Err(e) = scheduler.stop(shutdown_timeout).await {
            warn!(error = %e, "scheduler did not stop cleanly");
        }
    })
    .await
    {
        warn!(error = %e, "scheduler shutdown stage exceeded its bound");
    }

    // Watcher and scheduler are stopped first so no new refresh gets
    // spawned; this stage trips every in-flight call's cancellation context
    // and waits for the tracked tasks it spawned (spec §4.9 step 6).
    if let Err(e) = daemon::bounded_shutdown("refresh", shutdown_timeout, async {
        if let Err(e) = refresh_manager.drain(shutdown_timeout).await {
            warn!(error = %e, "refresh manager did not drain cleanly");
        }
    })
    .await
    {
        warn!(error = %e, "refresh shutdown stage exceeded its bound");
    }

    pid_file.release();
    info!("ckbd stopped");
    Ok(())
}

/// Wires the watcher's debounced batch callback into the refresh manager:
/// skip rather than queue when a refresh is already in flight (spec §4.7.1),
/// and tag the trigger from the first event's path (spec §4.7.4).
fn build_watcher(config: &DaemonConfig, refresh_manager: Arc<RefreshManager>) -> Watcher {
    let handler_refresh = refresh_manager;
    Watcher::new(
        Duration::from_millis(config.watch.debounce_ms),
        config.watch.ignore_patterns.clone(),
        Arc::new(move |repo_path: String, events| {
            let refresh_manager = handler_refresh.clone();
            let path = PathBuf::from(&repo_path);
            let (trigger, trigger_info) = events
                .first()
                .map(|e| watcher::trigger_for_path(&e.path))
                .unwrap_or((Trigger::Stale, "unspecified change"));

            if refresh_manager.has_pending_refresh(&path) {
                return;
            }
            let spawn_target = refresh_manager.clone();
            spawn_target.spawn_tracked(async move {
                let ctx = CancelContext::new();
                let result = refresh_manager
                    .run_incremental(&ctx, &path, trigger, trigger_info)
                    .await;
                if !result.success {
                    warn!(repo = %repo_path, error = ?result.error, "watcher-triggered refresh failed");
                }
            });
        }),
    )
}

/// Registers the one task type this core ships a handler for out of the
/// box: `refresh`, whose `target` names the repo path to re-run. The other
/// task types (`federation_sync`, `cleanup`, `health_check`) are external
/// collaborators (spec §4.6) — an operator wires their own handlers in via
/// `Scheduler::register_handler` before calling `start()`.
fn register_refresh_schedule_handler(scheduler: &Arc<Scheduler>, refresh_manager: Arc<RefreshManager>) {
    scheduler.register_handler(
        TaskType::Refresh,
        Arc::new(move |schedule| {
            let refresh_manager = refresh_manager.clone();
            Box::pin(async move {
                let ctx = CancelContext::new();
                let path = PathBuf::from(&schedule.target);
                let result = refresh_manager
                    .run_incremental(&ctx, &path, Trigger::Scheduled, "scheduled refresh")
                    .await;
                if result.success {
                    Ok(())
                } else {
                    Err(ckb_protocol::CoreError::external(
                        result.error.unwrap_or_else(|| "refresh failed".to_string()),
                    ))
                }
            })
        }),
    );
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn init_logging(daemon_dir: &Path) -> Result<()> {
    let log_path = daemon_dir.join("ckbd.log");
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("opening log file {}", log_path.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(move || file.try_clone().expect("log file handle clone"))
        .with_ansi(false)
        .init();
    Ok(())
}
