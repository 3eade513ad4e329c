//! End-to-end: a real git repo, watched and mutated, drives exactly one
//! debounced refresh through the incremental-then-full pipeline.

use ckb_daemon::refresh::{
    CancelContext, IncrementalEngine, IncrementalOutcome, IndexerCommand, IndexerResolver, RefreshManager,
};
use ckb_daemon::watcher::Watcher;
use ckb_protocol::CoreResult;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct AlwaysFull;

impl IncrementalEngine for AlwaysFull {
    fn run(&self, _repo_path: &Path) -> CoreResult<IncrementalOutcome> {
        Ok(IncrementalOutcome::RequiresFullReindex)
    }
}

struct TrueIndexer;

impl IndexerResolver for TrueIndexer {
    fn resolve(&self, _repo_path: &Path) -> Option<IndexerCommand> {
        Some(IndexerCommand {
            program: "true".to_string(),
            args: vec![],
        })
    }
}

fn init_repo() -> TempDir {
    let dir = TempDir::new().unwrap();
    for args in [
        vec!["init"],
        vec!["config", "user.email", "t@example.com"],
        vec!["config", "user.name", "T"],
    ] {
        Command::new("git").args(&args).current_dir(dir.path()).output().unwrap();
    }
    std::fs::write(dir.path().join("a.txt"), "a").unwrap();
    Command::new("git").args(["add", "-A"]).current_dir(dir.path()).output().unwrap();
    Command::new("git")
        .args(["commit", "-m", "initial"])
        .current_dir(dir.path())
        .output()
        .unwrap();
    dir
}

#[tokio::test]
async fn head_move_triggers_one_full_refresh() {
    let repo = init_repo();

    let refresh_manager = Arc::new(RefreshManager::new(
        Arc::new(AlwaysFull),
        Arc::new(TrueIndexer),
        None,
    ));
    let refresh_calls = Arc::new(AtomicUsize::new(0));

    let handler_refresh = refresh_manager.clone();
    let handler_calls = refresh_calls.clone();
    let watcher = Watcher::new(
        Duration::from_millis(80),
        vec![],
        Arc::new(move |repo_path: String, _events| {
            let refresh_manager = handler_refresh.clone();
            let calls = handler_calls.clone();
            let path = PathBuf::from(repo_path);
            if refresh_manager.has_pending_refresh(&path) {
                return;
            }
            tokio::spawn(async move {
                let ctx = CancelContext::new();
                let result = refresh_manager
                    .run_incremental(&ctx, &path, ckb_protocol::model::Trigger::HeadChanged, "head moved")
                    .await;
                assert!(result.success, "refresh should succeed: {:?}", result.error);
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }),
    )
    .with_poll_interval(Duration::from_millis(20));

    watcher.watch_repo(repo.path());
    assert_eq!(watcher.watched_count(), 1);

    // Burst of HEAD moves within the debounce window should collapse to one refresh.
    for i in 0..4 {
        std::fs::write(
            repo.path().join(".git").join("HEAD"),
            format!("ref: refs/heads/branch-{i}\n"),
        )
        .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    tokio::time::sleep(Duration::from_millis(400)).await;
    watcher.stop().await;

    assert_eq!(refresh_calls.load(Ordering::SeqCst), 1, "burst should collapse into one refresh");

    // Only the full pipeline ever persists metadata (spec §4.7.2/§4.7.3), so
    // its mere presence here confirms the incremental-requires-full fallback
    // ran to completion, not just the watcher's debounced callback.
    let meta = ckb_daemon::metadata::load(&repo.path().join(".ckb"))
        .unwrap()
        .expect("full refresh should have written index-meta.json");
    assert_eq!(meta.last_refresh.trigger, ckb_protocol::model::Trigger::HeadChanged);
}
