//! C7 — RefreshManager. Runs the incremental-then-fallback-to-full pipeline
//! that every trigger (watcher, scheduler, webhook, manual HTTP call) feeds
//! into.
//!
//! The pending-set guard is a plain `RwLock<HashSet<PathBuf>>`, not a
//! lock-free structure — a second request arriving mid-flight for the same
//! repo is simply dropped rather than queued, so there is nothing here that
//! needs to survive contention beyond a short critical section.

use crate::lock::IndexLockFile;
use crate::metadata;
use crate::probe;
use ckb_protocol::model::{
    EventKind, IndexMeta, LastRefresh, RefreshResult, RefreshType, Trigger, INDEX_META_VERSION,
};
use ckb_protocol::{CoreError, CoreResult};
use chrono::Utc;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{info, warn};

/// What happened when the incremental engine tried to apply a partial
/// update.
#[derive(Debug)]
pub enum IncrementalOutcome {
    Applied { files_changed: u64 },
    RequiresFullReindex,
}

/// The storage-aware partial-update path. A repo's own index backend
/// implements this; the manager itself has no opinion on index formats.
pub trait IncrementalEngine: Send + Sync {
    fn run(&self, repo_path: &Path) -> CoreResult<IncrementalOutcome>;
}

#[derive(Debug, Clone)]
pub struct IndexerCommand {
    pub program: String,
    pub args: Vec<String>,
}

/// Maps a repo to the external indexer invocation that reindexes it fully.
pub trait IndexerResolver: Send + Sync {
    fn resolve(&self, repo_path: &Path) -> Option<IndexerCommand>;
}

/// Sink for the events a refresh produces. `ckb-server`'s webhook manager
/// implements this to turn `index.updated` / `index.failed` into deliveries.
pub trait EventEmitter: Send + Sync {
    fn emit(&self, kind: EventKind, source: &str, data: serde_json::Value);
}

const STDERR_CAPTURE_LIMIT: usize = 8192;

/// The per-call cancellation context spec §4.7 passes into
/// `runIncremental`/`runFull` (`ctx`). Cloning shares the same underlying
/// flag, so a caller can hold one clone while `RefreshManager` holds another
/// for its own shutdown-wide signal, and either tripping it cancels the
/// call.
#[derive(Clone)]
pub struct CancelContext {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelContext {
    pub fn new() -> Self {
        CancelContext {
            flag: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel()` has been called on this context or any of
    /// its clones; resolves immediately if it already has.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

impl Default for CancelContext {
    fn default() -> Self {
        Self::new()
    }
}

async fn any_cancelled(ctx: &CancelContext, shutdown: &CancelContext) {
    tokio::select! {
        _ = ctx.cancelled() => {}
        _ = shutdown.cancelled() => {}
    }
}

pub struct RefreshManager {
    pending: RwLock<HashSet<PathBuf>>,
    incremental_engine: Arc<dyn IncrementalEngine>,
    indexer_resolver: Arc<dyn IndexerResolver>,
    event_emitter: Option<Arc<dyn EventEmitter>>,
    shutdown: CancelContext,
    tasks: Mutex<JoinSet<()>>,
}

impl RefreshManager {
    pub fn new(
        incremental_engine: Arc<dyn IncrementalEngine>,
        indexer_resolver: Arc<dyn IndexerResolver>,
        event_emitter: Option<Arc<dyn EventEmitter>>,
    ) -> Self {
        RefreshManager {
            pending: RwLock::new(HashSet::new()),
            incremental_engine,
            indexer_resolver,
            event_emitter,
            shutdown: CancelContext::new(),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    pub fn has_pending_refresh(&self, repo_path: &Path) -> bool {
        self.pending.read().unwrap().contains(repo_path)
    }

    /// Trip the manager-wide cancellation signal: every in-flight and future
    /// call observes `is_cancelled()` regardless of its own per-call `ctx`.
    pub fn cancel_all(&self) {
        self.shutdown.cancel();
    }

    /// Spawns `fut` onto this manager's tracked task set so `drain` can wait
    /// for it instead of it being abandoned at shutdown (spec §4.9 step 6).
    pub fn spawn_tracked<F>(&self, fut: F) -> JoinHandle<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks.lock().unwrap().spawn(fut)
    }

    /// Trips the manager-wide cancellation context and waits for every
    /// tracked task to finish, bounded by `timeout`.
    pub async fn drain(&self, timeout: Duration) -> CoreResult<()> {
        self.shutdown.cancel();
        let mut tasks = {
            let mut guard = self.tasks.lock().unwrap();
            std::mem::replace(&mut *guard, JoinSet::new())
        };
        tokio::time::timeout(timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await
        .map_err(|_| CoreError::external("refresh task drain timed out"))
    }

    fn is_cancelled(&self, ctx: &CancelContext) -> bool {
        ctx.is_cancelled() || self.shutdown.is_cancelled()
    }

    fn try_mark_pending(&self, repo_path: &Path) -> bool {
        let mut pending = self.pending.write().unwrap();
        if pending.contains(repo_path) {
            return false;
        }
        pending.insert(repo_path.to_path_buf());
        true
    }

    fn clear_pending(&self, repo_path: &Path) {
        self.pending.write().unwrap().remove(repo_path);
    }

    pub async fn run_incremental(
        &self,
        ctx: &CancelContext,
        repo_path: &Path,
        trigger: Trigger,
        trigger_info: &str,
    ) -> RefreshResult {
        self.run_incremental_tagged(ctx, repo_path, Some(trigger), Some(trigger_info.to_string()))
            .await
    }

    pub async fn run_incremental_tagged(
        &self,
        ctx: &CancelContext,
        repo_path: &Path,
        trigger: Option<Trigger>,
        trigger_info: Option<String>,
    ) -> RefreshResult {
        if !self.try_mark_pending(repo_path) {
            return dropped_result(repo_path, RefreshType::Incremental, trigger, trigger_info);
        }

        let result = self
            .run_incremental_inner(ctx, repo_path, trigger, trigger_info.clone())
            .await;
        self.clear_pending(repo_path);
        result
    }

    async fn run_incremental_inner(
        &self,
        ctx: &CancelContext,
        repo_path: &Path,
        trigger: Option<Trigger>,
        trigger_info: Option<String>,
    ) -> RefreshResult {
        let start = Instant::now();

        if self.is_cancelled(ctx) {
            return failed_result(
                repo_path,
                RefreshType::Incremental,
                start,
                &CoreError::cancelled().to_string(),
                trigger,
                trigger_info,
            );
        }

        let outcome = self.incremental_engine.run(repo_path);

        match outcome {
            Ok(IncrementalOutcome::Applied { files_changed }) => {
                let result = RefreshResult {
                    repo_path: repo_path.to_string_lossy().to_string(),
                    refresh_type: RefreshType::Incremental,
                    success: true,
                    duration_ms: start.elapsed().as_millis() as u64,
                    files_changed: Some(files_changed),
                    error: None,
                    trigger,
                    trigger_info,
                };
                self.emit_refresh_event(&result);
                result
            }
            // Falling back to a full reindex is the deliberate recovery
            // policy for both an explicit "I can't do this incrementally"
            // signal and an outright incremental-engine error — a partial
            // update we can't trust is worth no more than one we can't run.
            Ok(IncrementalOutcome::RequiresFullReindex) => {
                info!(repo = %repo_path.display(), "incremental engine requested full reindex");
                self.run_full_inner(ctx, repo_path, trigger, trigger_info).await
            }
            Err(e) => {
                warn!(repo = %repo_path.display(), error = %e, "incremental refresh failed, falling back to full reindex");
                self.run_full_inner(ctx, repo_path, trigger, trigger_info).await
            }
        }
    }

    pub async fn run_full(
        &self,
        ctx: &CancelContext,
        repo_path: &Path,
        trigger: Trigger,
        trigger_info: &str,
    ) -> RefreshResult {
        self.run_full_tagged(ctx, repo_path, Some(trigger), Some(trigger_info.to_string()))
            .await
    }

    pub async fn run_full_tagged(
        &self,
        ctx: &CancelContext,
        repo_path: &Path,
        trigger: Option<Trigger>,
        trigger_info: Option<String>,
    ) -> RefreshResult {
        if !self.try_mark_pending(repo_path) {
            return dropped_result(repo_path, RefreshType::Full, trigger, trigger_info);
        }

        let result = self.run_full_inner(ctx, repo_path, trigger, trigger_info).await;
        self.clear_pending(repo_path);
        result
    }

    async fn run_full_inner(
        &self,
        ctx: &CancelContext,
        repo_path: &Path,
        trigger: Option<Trigger>,
        trigger_info: Option<String>,
    ) -> RefreshResult {
        let start = Instant::now();

        if self.is_cancelled(ctx) {
            return failed_result(
                repo_path,
                RefreshType::Full,
                start,
                &CoreError::cancelled().to_string(),
                trigger,
                trigger_info,
            );
        }

        let ckb_dir = repo_path.join(".ckb");
        let mut lock = match IndexLockFile::acquire(&ckb_dir) {
            Ok(lock) => lock,
            Err(e) => {
                return failed_result(repo_path, RefreshType::Full, start, &e.to_string(), trigger, trigger_info);
            }
        };

        let command = match self.indexer_resolver.resolve(repo_path) {
            Some(cmd) => cmd,
            None => {
                lock.release();
                return failed_result(
                    repo_path,
                    RefreshType::Full,
                    start,
                    "no indexer configured for this repository",
                    trigger,
                    trigger_info,
                );
            }
        };

        if self.is_cancelled(ctx) {
            lock.release();
            return failed_result(
                repo_path,
                RefreshType::Full,
                start,
                &CoreError::cancelled().to_string(),
                trigger,
                trigger_info,
            );
        }

        let run_outcome = run_indexer(repo_path, &command, ctx, &self.shutdown).await;
        let file_count = match run_outcome {
            Ok(n) => n,
            Err(e) => {
                lock.release();
                return failed_result(repo_path, RefreshType::Full, start, &e.to_string(), trigger, trigger_info);
            }
        };

        let state = probe::probe(repo_path);
        let meta = IndexMeta {
            version: INDEX_META_VERSION,
            created_at: Utc::now(),
            commit_hash: state.as_ref().map(|s| s.head_commit.clone()).unwrap_or_default(),
            repo_state_id: state.as_ref().map(|s| s.repo_state_id.clone()).unwrap_or_default(),
            file_count,
            duration_secs: (start.elapsed().as_secs_f64() * 10.0).round() / 10.0,
            indexer: command.program.clone(),
            indexer_args: command.args.clone(),
            last_refresh: LastRefresh {
                at: Utc::now(),
                trigger: trigger.unwrap_or(Trigger::Manual),
                trigger_info: trigger_info.clone().unwrap_or_default(),
                duration_ms: start.elapsed().as_millis() as u64,
            },
        };

        // A failure to persist metadata is logged, not fatal: the reindex
        // itself succeeded, and the next freshness check will simply see no
        // metadata and schedule another one.
        if let Err(e) = metadata::save(&ckb_dir, &meta) {
            warn!(repo = %repo_path.display(), error = %e, "failed to persist index metadata after full reindex");
        }

        lock.release();

        let result = RefreshResult {
            repo_path: repo_path.to_string_lossy().to_string(),
            refresh_type: RefreshType::Full,
            success: true,
            duration_ms: start.elapsed().as_millis() as u64,
            files_changed: Some(file_count),
            error: None,
            trigger,
            trigger_info,
        };
        self.emit_refresh_event(&result);
        result
    }

    fn emit_refresh_event(&self, result: &RefreshResult) {
        let Some(emitter) = &self.event_emitter else {
            return;
        };
        let kind = if result.success {
            EventKind::RefreshCompleted
        } else {
            EventKind::RefreshFailed
        };
        let data = serde_json::json!({
            "repo_path": result.repo_path,
            "type": result.refresh_type.as_str(),
            "duration_ms": result.duration_ms,
            "files_changed": result.files_changed,
            "error": result.error,
        });
        emitter.emit(kind, "refresh-manager", data);
    }
}

fn dropped_result(
    repo_path: &Path,
    refresh_type: RefreshType,
    trigger: Option<Trigger>,
    trigger_info: Option<String>,
) -> RefreshResult {
    RefreshResult {
        repo_path: repo_path.to_string_lossy().to_string(),
        refresh_type,
        success: false,
        duration_ms: 0,
        files_changed: None,
        error: Some("a refresh is already in progress for this repository".to_string()),
        trigger,
        trigger_info,
    }
}

fn failed_result(
    repo_path: &Path,
    refresh_type: RefreshType,
    start: Instant,
    error: &str,
    trigger: Option<Trigger>,
    trigger_info: Option<String>,
) -> RefreshResult {
    RefreshResult {
        repo_path: repo_path.to_string_lossy().to_string(),
        refresh_type,
        success: false,
        duration_ms: start.elapsed().as_millis() as u64,
        files_changed: None,
        error: Some(error.to_string()),
        trigger,
        trigger_info,
    }
}

/// Runs the resolved indexer command to completion, capturing a bounded tail
/// of stderr for the error message if it exits non-zero. Returns the file
/// count the indexer reported on its final stdout line, or 0 if it printed
/// nothing parseable.
///
/// Races the child against `ctx`/`shutdown`: whichever trips first wins, and
/// a cancellation kills the child's process before returning
/// `CoreError::cancelled()` (spec §9 "child-process cancellation").
async fn run_indexer(
    repo_path: &Path,
    command: &IndexerCommand,
    ctx: &CancelContext,
    shutdown: &CancelContext,
) -> CoreResult<u64> {
    let mut child = tokio::process::Command::new(&command.program)
        .args(&command.args)
        .current_dir(repo_path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| CoreError::external(format!("failed to launch indexer {}: {e}", command.program)))?;

    let mut stdout_pipe = child.stdout.take().expect("spawned with Stdio::piped");
    let mut stderr_pipe = child.stderr.take().expect("spawned with Stdio::piped");
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stdout_pipe.read_to_end(&mut buf).await;
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr_pipe.read_to_end(&mut buf).await;
        buf
    });

    let status = tokio::select! {
        status = child.wait() => {
            status.map_err(|e| CoreError::external(format!("failed to run indexer {}: {e}", command.program)))?
        }
        _ = any_cancelled(ctx, shutdown) => {
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to kill cancelled indexer process");
            }
            stdout_task.abort();
            stderr_task.abort();
            return Err(CoreError::cancelled());
        }
    };

    let stdout_buf = stdout_task.await.unwrap_or_default();
    let stderr_buf = stderr_task.await.unwrap_or_default();

    if !status.success() {
        let stderr = String::from_utf8_lossy(&stderr_buf);
        let tail = tail_bytes(&stderr, STDERR_CAPTURE_LIMIT);
        return Err(CoreError::external(format!("indexer exited with {status}: {tail}")));
    }

    let stdout = String::from_utf8_lossy(&stdout_buf);
    Ok(stdout
        .lines()
        .rev()
        .find_map(|line| line.trim().parse::<u64>().ok())
        .unwrap_or(0))
}

fn tail_bytes(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        s.to_string()
    } else {
        s[s.len() - limit..].to_string()
    }
}

/// Detects the indexer command for a repo by the presence of well-known
/// project manifests. Kept deliberately small — new languages are added by
/// extending the match arms, not by restructuring the resolver.
pub struct ManifestIndexerResolver {
    overrides: std::collections::HashMap<String, IndexerCommand>,
}

impl ManifestIndexerResolver {
    pub fn new() -> Self {
        ManifestIndexerResolver {
            overrides: std::collections::HashMap::new(),
        }
    }

    pub fn with_override(mut self, language: &str, command: IndexerCommand) -> Self {
        self.overrides.insert(language.to_string(), command);
        self
    }

    fn detect_language(&self, repo_path: &Path) -> Option<&'static str> {
        if repo_path.join("Cargo.toml").exists() {
            Some("rust")
        } else if repo_path.join("go.mod").exists() {
            Some("go")
        } else if repo_path.join("package.json").exists() {
            Some("typescript")
        } else if repo_path.join("pyproject.toml").exists() || repo_path.join("setup.py").exists() {
            Some("python")
        } else {
            None
        }
    }
}

impl Default for ManifestIndexerResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexerResolver for ManifestIndexerResolver {
    fn resolve(&self, repo_path: &Path) -> Option<IndexerCommand> {
        let language = self.detect_language(repo_path)?;
        if let Some(cmd) = self.overrides.get(language) {
            return Some(cmd.clone());
        }
        let (program, args): (&str, &[&str]) = match language {
            "rust" => ("scip-rust", &["index", "."]),
            "go" => ("scip-go", &[]),
            "typescript" => ("scip-typescript", &["index"]),
            "python" => ("scip-python", &["index", "."]),
            _ => return None,
        };
        Some(IndexerCommand {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        })
    }
}
