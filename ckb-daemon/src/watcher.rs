//! C5 — Watcher. Polls each tracked repo's `.git/HEAD` and `.git/index`,
//! emitting debounced batched events per repo (spec §4.5).
//!
//! The teacher's `fsmonitor.rs` watches a whole tree with `notify` and
//! drains it through a batching channel read on a fixed window; this
//! follows the same "own per-repo state, batch on a timer" shape but polls
//! the two files the spec names directly, which keeps the daemon's
//! observable behavior platform-neutral per §4.5's note that polling is
//! the specified baseline mechanism.

use crate::debounce::BatchDebouncer;
use dashmap::DashMap;
use globset::{Glob, GlobSetBuilder};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEventKind {
    Modify,
}

#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub path: String,
    pub kind: WatchEventKind,
}

pub type ChangeHandler = Arc<dyn Fn(String, Vec<WatchEvent>) + Send + Sync>;

struct RepoWatcherHandle {
    task: JoinHandle<()>,
}

/// Owns one `repoWatcher` per tracked repo.
pub struct Watcher {
    watchers: DashMap<PathBuf, RepoWatcherHandle>,
    debounce_delay: Duration,
    poll_interval: Duration,
    ignore_patterns: Vec<String>,
    handler: ChangeHandler,
}

impl Watcher {
    pub fn new(debounce_delay: Duration, ignore_patterns: Vec<String>, handler: ChangeHandler) -> Self {
        Watcher {
            watchers: DashMap::new(),
            debounce_delay,
            poll_interval: DEFAULT_POLL_INTERVAL,
            ignore_patterns,
            handler,
        }
    }

    /// Override the poll tick (default 2s). Exposed for tests that can't
    /// afford to wait out the production interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Start watching `path`. Silently skipped if it isn't a git repo
    /// (`<path>/.git` missing) — spec §4.5, §7 `NotApplicable`.
    pub fn watch_repo(&self, path: &Path) {
        if !path.join(".git").exists() {
            debug!(repo = %path.display(), "not a git repository, skipping watch");
            return;
        }

        let canonical = match path.canonicalize() {
            Ok(p) => p,
            Err(e) => {
                warn!(repo = %path.display(), error = %e, "failed to canonicalize repo path");
                return;
            }
        };

        if self.watchers.contains_key(&canonical) {
            return;
        }

        let ignore_set = build_ignore_set(&self.ignore_patterns);
        let repo_path_str = canonical.to_string_lossy().to_string();
        let handler = self.handler.clone();
        let debouncer = Arc::new(BatchDebouncer::new(self.debounce_delay, {
            let handler = handler.clone();
            let repo_path_str = repo_path_str.clone();
            move |events: Vec<WatchEvent>| {
                handler(repo_path_str.clone(), events);
            }
        }));

        let poll_interval = self.poll_interval;
        let repo_root = canonical.clone();
        let task = tokio::spawn(async move {
            poll_loop(repo_root, poll_interval, ignore_set, debouncer).await;
        });

        self.watchers
            .insert(canonical, RepoWatcherHandle { task });
    }

    /// Stop watching `path`. Idempotent.
    pub fn unwatch_repo(&self, path: &Path) {
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        if let Some((_, handle)) = self.watchers.remove(&canonical) {
            handle.task.abort();
        }
    }

    /// Cancel every task and wait for completion. Safe to call without a
    /// prior watch having been set up.
    pub async fn stop(&self) {
        let paths: Vec<PathBuf> = self.watchers.iter().map(|e| e.key().clone()).collect();
        for path in paths {
            if let Some((_, handle)) = self.watchers.remove(&path) {
                handle.task.abort();
                let _ = handle.task.await;
            }
        }
    }

    pub fn watched_count(&self) -> usize {
        self.watchers.len()
    }
}

fn build_ignore_set(patterns: &[String]) -> globset::GlobSet {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        if let Ok(glob) = Glob::new(pattern) {
            builder.add(glob);
        } else {
            warn!(pattern = %pattern, "ignoring invalid watch ignore pattern");
        }
    }
    builder.build().unwrap_or_else(|_| GlobSetBuilder::new().build().unwrap())
}

async fn poll_loop(
    repo_root: PathBuf,
    poll_interval: Duration,
    ignore: globset::GlobSet,
    debouncer: Arc<BatchDebouncer<WatchEvent>>,
) {
    let head_path = repo_root.join(".git").join("HEAD");
    let index_path = repo_root.join(".git").join("index");

    let mut last_head = std::fs::read_to_string(&head_path).unwrap_or_default();
    let mut last_index_mtime = mtime(&index_path);

    let mut ticker = tokio::time::interval(poll_interval);
    // the interval's first tick fires immediately; skip it so we don't
    // compare state against itself
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let current_head = std::fs::read_to_string(&head_path).unwrap_or_default();
        if current_head != last_head {
            last_head = current_head;
            if !ignore.is_match(".git/HEAD") {
                debouncer.add(WatchEvent {
                    path: ".git/HEAD".to_string(),
                    kind: WatchEventKind::Modify,
                });
            }
        }

        let current_index_mtime = mtime(&index_path);
        if current_index_mtime != last_index_mtime {
            last_index_mtime = current_index_mtime;
            if !ignore.is_match(".git/index") {
                debouncer.add(WatchEvent {
                    path: ".git/index".to_string(),
                    kind: WatchEventKind::Modify,
                });
            }
        }
    }
}

fn mtime(path: &Path) -> Option<std::time::SystemTime> {
    std::fs::metadata(path).ok().and_then(|m| m.modified().ok())
}

/// Maps a watch event's path to a refresh trigger tag (spec §4.7.4).
pub fn trigger_for_path(path: &str) -> (ckb_protocol::model::Trigger, &'static str) {
    if path.ends_with("HEAD") {
        (ckb_protocol::model::Trigger::HeadChanged, "branch or commit changed")
    } else if path.ends_with("index") {
        (ckb_protocol::model::Trigger::IndexChanged, "staged files changed")
    } else {
        (ckb_protocol::model::Trigger::Stale, "unspecified change")
    }
}

/// For use by the daemon lifecycle when a lock is held across an
/// `Arc<Watcher>` — a thin wrapper kept here so callers don't need to
/// reach into `tokio::sync` themselves.
pub type SharedWatcher = Arc<AsyncMutex<Watcher>>;
