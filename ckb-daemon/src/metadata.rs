//! C3 — IndexMetadataStore. Reads/writes `<repo>/.ckb/index-meta.json` and
//! computes freshness per spec §4.3. The atomic-write discipline (temp file
//! in the same directory, then rename) is lifted from the teacher's
//! `helix-server/src/storage/storage.rs::write_object`.

use crate::probe;
use ckb_protocol::model::{FreshnessResult, IndexMeta, StalenessView};
use ckb_protocol::{CoreError, CoreResult};
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

const META_FILE: &str = "index-meta.json";

fn meta_path(ckb_dir: &Path) -> PathBuf {
    ckb_dir.join(META_FILE)
}

/// Returns `None` for a missing file and for a version mismatch (both
/// treated as "no metadata present" per spec §3/§7), propagates a real parse
/// failure.
pub fn load(ckb_dir: &Path) -> CoreResult<Option<IndexMeta>> {
    let path = meta_path(ckb_dir);
    if !path.exists() {
        return Ok(None);
    }

    let contents = fs::read_to_string(&path)?;
    let meta: IndexMeta = serde_json::from_str(&contents)
        .map_err(|e| CoreError::parse(format!("invalid index-meta.json: {e}")))?;

    if !meta.is_current_version() {
        return Ok(None);
    }

    Ok(Some(meta))
}

/// Write `meta` atomically: serialize to a temp file in `ckb_dir`, then
/// rename over the final path so concurrent readers never observe a
/// partially-written file.
pub fn save(ckb_dir: &Path, meta: &IndexMeta) -> CoreResult<()> {
    fs::create_dir_all(ckb_dir)?;
    let path = meta_path(ckb_dir);
    let tmp_path = tmp_path_for(&path);

    let json = serde_json::to_string_pretty(meta)
        .map_err(|e| CoreError::internal(format!("failed to serialize index meta: {e}")))?;
    fs::write(&tmp_path, json)?;
    fs::rename(&tmp_path, &path)?;
    Ok(())
}

fn tmp_path_for(final_path: &Path) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let file_name = final_path
        .file_name()
        .unwrap_or_default()
        .to_string_lossy();
    final_path.with_file_name(format!(".{}.tmp.{}", file_name, nanos))
}

/// The decision tree from spec §4.3.
pub fn check_freshness(repo_root: &Path) -> CoreResult<FreshnessResult> {
    let ckb_dir = repo_root.join(".ckb");
    let meta = match load(&ckb_dir)? {
        Some(meta) => meta,
        None => return Ok(FreshnessResult::stale("no index metadata found")),
    };

    let current = match probe::probe(repo_root) {
        Some(state) => state,
        None => {
            let age = Utc::now() - meta.created_at;
            return Ok(if age <= chrono::Duration::hours(24) {
                FreshnessResult::fresh()
            } else {
                FreshnessResult::stale("git probe unavailable and index older than 24h")
            });
        }
    };

    if meta.repo_state_id == current.repo_state_id {
        return Ok(FreshnessResult::fresh());
    }

    if meta.commit_hash == current.head_commit {
        return Ok(FreshnessResult {
            fresh: false,
            reason: "uncommitted changes detected".to_string(),
            has_uncommitted: true,
            commits_behind: None,
        });
    }

    let commits_behind = probe::commits_behind(repo_root, &meta.commit_hash, &current.head_commit);
    let reason = match commits_behind {
        Some(n) if n > 0 => {
            if current.dirty {
                format!("{n} commits behind, with uncommitted changes")
            } else {
                format!("{n} commits behind")
            }
        }
        _ => "repository state changed".to_string(),
    };

    Ok(FreshnessResult {
        fresh: false,
        reason,
        has_uncommitted: current.dirty,
        commits_behind: commits_behind.or(Some(0)),
    })
}

/// Display-friendly projection with a bucketed index age (spec §4.3).
pub fn get_staleness(repo_root: &Path) -> CoreResult<StalenessView> {
    let ckb_dir = repo_root.join(".ckb");
    let freshness = check_freshness(repo_root)?;

    let index_age = match load(&ckb_dir)? {
        Some(meta) => ckb_protocol::model::bucket_age(Utc::now() - meta.created_at),
        None => "unknown".to_string(),
    };

    Ok(StalenessView {
        freshness,
        index_age,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ckb_protocol::model::{LastRefresh, Trigger, INDEX_META_VERSION};
    use std::process::Command;
    use tempfile::TempDir;

    fn sample_meta(commit_hash: &str, repo_state_id: &str) -> IndexMeta {
        IndexMeta {
            version: INDEX_META_VERSION,
            created_at: Utc::now(),
            commit_hash: commit_hash.to_string(),
            repo_state_id: repo_state_id.to_string(),
            file_count: 10,
            duration_secs: 1.2,
            indexer: "scip-go".to_string(),
            indexer_args: vec!["index".to_string()],
            last_refresh: LastRefresh {
                at: Utc::now(),
                trigger: Trigger::Manual,
                trigger_info: String::new(),
                duration_ms: 1200,
            },
        }
    }

    #[test]
    fn load_missing_file_returns_none() {
        let dir = TempDir::new().unwrap();
        assert!(load(dir.path()).unwrap().is_none());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let meta = sample_meta("abc123", "fp1");
        save(dir.path(), &meta).unwrap();

        let loaded = load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded.commit_hash, "abc123");
        assert_eq!(loaded.repo_state_id, "fp1");
    }

    #[test]
    fn version_mismatch_is_treated_as_absent() {
        let dir = TempDir::new().unwrap();
        let mut meta = sample_meta("abc123", "fp1");
        meta.version = INDEX_META_VERSION + 1;
        save(dir.path(), &meta).unwrap();

        assert!(load(dir.path()).unwrap().is_none());
    }

    #[test]
    fn corrupt_file_is_a_parse_error() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path()).unwrap();
        fs::write(dir.path().join(META_FILE), "not json").unwrap();

        let err = load(dir.path()).unwrap_err();
        assert_eq!(err.kind(), ckb_protocol::ErrorKind::Parse);
    }

    fn init_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        Command::new("git")
            .args(["init"])
            .current_dir(dir.path())
            .output()
            .unwrap();
        Command::new("git")
            .args(["config", "user.email", "t@example.com"])
            .current_dir(dir.path())
            .output()
            .unwrap();
        Command::new("git")
            .args(["config", "user.name", "T"])
            .current_dir(dir.path())
            .output()
            .unwrap();
        dir
    }

    fn commit_all(dir: &Path) {
        Command::new("git")
            .args(["add", "-A"])
            .current_dir(dir)
            .output()
            .unwrap();
        Command::new("git")
            .args(["commit", "-m", "c"])
            .current_dir(dir)
            .output()
            .unwrap();
    }

    #[test]
    fn no_metadata_is_never_fresh() {
        let dir = init_repo();
        std::fs::write(dir.path().join("a"), "a").unwrap();
        commit_all(dir.path());

        let result = check_freshness(dir.path()).unwrap();
        assert!(!result.fresh);
        assert_eq!(result.reason, "no index metadata found");
    }

    #[test]
    fn matching_repo_state_id_is_fresh() {
        let dir = init_repo();
        std::fs::write(dir.path().join("a"), "a").unwrap();
        commit_all(dir.path());

        let state = probe::probe(dir.path()).unwrap();
        let mut meta = sample_meta(&state.head_commit, &state.repo_state_id);
        meta.created_at = Utc::now();
        save(&dir.path().join(".ckb"), &meta).unwrap();

        let result = check_freshness(dir.path()).unwrap();
        assert!(result.fresh);
    }

    #[test]
    fn dirty_tree_same_commit_is_stale_with_flag() {
        let dir = init_repo();
        std::fs::write(dir.path().join("a"), "a").unwrap();
        commit_all(dir.path());

        let state = probe::probe(dir.path()).unwrap();
        let meta = sample_meta(&state.head_commit, &state.repo_state_id);
        save(&dir.path().join(".ckb"), &meta).unwrap();

        std::fs::write(dir.path().join("a"), "changed").unwrap();

        let result = check_freshness(dir.path()).unwrap();
        assert!(!result.fresh);
        assert!(result.has_uncommitted);
        assert_eq!(result.reason, "uncommitted changes detected");
    }

    #[test]
    fn new_commit_reports_commits_behind() {
        let dir = init_repo();
        std::fs::write(dir.path().join("a"), "a").unwrap();
        commit_all(dir.path());

        let state = probe::probe(dir.path()).unwrap();
        let meta = sample_meta(&state.head_commit, &state.repo_state_id);
        save(&dir.path().join(".ckb"), &meta).unwrap();

        std::fs::write(dir.path().join("b"), "b").unwrap();
        commit_all(dir.path());

        let result = check_freshness(dir.path()).unwrap();
        assert!(!result.fresh);
        assert_eq!(result.commits_behind, Some(1));
    }
}
