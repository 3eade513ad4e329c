//! C1 — RepoStateProbe. Derives a content-addressed `repoStateId` from HEAD
//! commit + working-tree dirty signature. Grounded in the teacher's
//! `helix_index/fingerprint.rs` (md5 of canonical path + HEAD oid), adapted
//! to hash `(head_commit, dirty-signature)` per spec §4.1, via git2 instead
//! of shelling out to `git`.

use ckb_protocol::model::RepoState;
use git2::{Repository, StatusOptions};
use std::path::Path;

/// `probe()` never errors to callers — a repo that isn't git, or any git
/// failure, is reported as `NotGit` (spec §4.1, §7 `NotApplicable`).
pub fn probe(repo_path: &Path) -> Option<RepoState> {
    let repo = Repository::open(repo_path).ok()?;

    let head_commit = match repo.head() {
        Ok(head) => head
            .target()
            .map(|oid| oid.to_string())
            .unwrap_or_default(),
        Err(_) => String::new(),
    };

    let dirty_signature = dirty_signature(&repo);
    let dirty = !dirty_signature.is_empty();

    let repo_state_id = fingerprint(&head_commit, &dirty_signature);

    Some(RepoState {
        head_commit,
        dirty,
        repo_state_id,
    })
}

/// A stable fingerprint of the porcelain status: every dirty path plus its
/// status flags, sorted so unrelated orderings of the same change-set still
/// agree.
fn dirty_signature(repo: &Repository) -> String {
    let mut opts = StatusOptions::new();
    opts.include_untracked(true)
        .recurse_untracked_dirs(true)
        .include_ignored(false);

    let statuses = match repo.statuses(Some(&mut opts)) {
        Ok(s) => s,
        Err(_) => return String::new(),
    };

    let mut entries: Vec<String> = statuses
        .iter()
        .filter(|entry| !entry.status().is_empty())
        .filter_map(|entry| {
            entry
                .path()
                .map(|path| format!("{:?}:{}", entry.status(), path))
        })
        .collect();

    entries.sort();
    entries.join("\n")
}

fn fingerprint(head_commit: &str, dirty_signature: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(head_commit.as_bytes());
    hasher.update(b"\0");
    hasher.update(dirty_signature.as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Count of `meta_commit..current_commit` — how many commits the current
/// HEAD has advanced past the commit the index was built from. Returns
/// `None` when `meta_commit` can't be resolved locally at all (force-pushed
/// away, gc'd, or simply on a divergent branch unreachable from HEAD): spec
/// §9 accepts under-reporting `commitsBehind=0` in that case.
pub fn commits_behind(repo_path: &Path, meta_commit: &str, current_commit: &str) -> Option<u32> {
    let repo = Repository::open(repo_path).ok()?;
    let meta_oid = git2::Oid::from_str(meta_commit).ok()?;
    let current_oid = git2::Oid::from_str(current_commit).ok()?;

    repo.find_commit(meta_oid).ok()?;
    repo.find_commit(current_oid).ok()?;

    let (ahead, _behind) = repo.graph_ahead_behind(current_oid, meta_oid).ok()?;
    Some(ahead as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;

    fn init_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        Command::new("git")
            .args(["init"])
            .current_dir(dir.path())
            .output()
            .unwrap();
        Command::new("git")
            .args(["config", "user.email", "test@example.com"])
            .current_dir(dir.path())
            .output()
            .unwrap();
        Command::new("git")
            .args(["config", "user.name", "Test"])
            .current_dir(dir.path())
            .output()
            .unwrap();
        dir
    }

    fn commit_all(dir: &Path, message: &str) {
        Command::new("git")
            .args(["add", "-A"])
            .current_dir(dir)
            .output()
            .unwrap();
        Command::new("git")
            .args(["commit", "-m", message])
            .current_dir(dir)
            .output()
            .unwrap();
    }

    #[test]
    fn non_git_directory_yields_none() {
        let dir = TempDir::new().unwrap();
        assert!(probe(dir.path()).is_none());
    }

    #[test]
    fn clean_repo_is_not_dirty() {
        let dir = init_repo();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        commit_all(dir.path(), "init");

        let state = probe(dir.path()).unwrap();
        assert!(!state.dirty);
        assert!(!state.head_commit.is_empty());
    }

    #[test]
    fn uncommitted_change_marks_dirty_and_changes_id() {
        let dir = init_repo();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        commit_all(dir.path(), "init");
        let clean = probe(dir.path()).unwrap();

        std::fs::write(dir.path().join("a.txt"), "modified").unwrap();
        let dirty = probe(dir.path()).unwrap();

        assert!(dirty.dirty);
        assert_eq!(clean.head_commit, dirty.head_commit);
        assert_ne!(clean.repo_state_id, dirty.repo_state_id);
    }

    #[test]
    fn repo_state_id_is_deterministic() {
        let dir = init_repo();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        commit_all(dir.path(), "init");

        let s1 = probe(dir.path()).unwrap();
        let s2 = probe(dir.path()).unwrap();
        assert_eq!(s1.repo_state_id, s2.repo_state_id);
    }

    #[test]
    fn new_commit_changes_repo_state_id() {
        let dir = init_repo();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        commit_all(dir.path(), "init");
        let first = probe(dir.path()).unwrap();

        std::fs::write(dir.path().join("b.txt"), "b").unwrap();
        commit_all(dir.path(), "second");
        let second = probe(dir.path()).unwrap();

        assert_ne!(first.head_commit, second.head_commit);
        assert_ne!(first.repo_state_id, second.repo_state_id);
    }

    #[test]
    fn commits_behind_counts_new_commits() {
        let dir = init_repo();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        commit_all(dir.path(), "init");
        let first = probe(dir.path()).unwrap();

        std::fs::write(dir.path().join("b.txt"), "b").unwrap();
        commit_all(dir.path(), "second");
        std::fs::write(dir.path().join("c.txt"), "c").unwrap();
        commit_all(dir.path(), "third");
        let current = probe(dir.path()).unwrap();

        let behind = commits_behind(dir.path(), &first.head_commit, &current.head_commit);
        assert_eq!(behind, Some(2));
    }

    #[test]
    fn commits_behind_unresolvable_commit_yields_none() {
        let dir = init_repo();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        commit_all(dir.path(), "init");
        let current = probe(dir.path()).unwrap();

        let bogus = "0".repeat(40);
        assert_eq!(
            commits_behind(dir.path(), &bogus, &current.head_commit),
            None
        );
    }
}
