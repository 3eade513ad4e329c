//! Binds the daemon's own `Scheduler` and `RefreshManager` to the admin
//! HTTP surface's narrow `DaemonControl` trait, so `ckb-server` never needs
//! to know these concrete types exist.

use crate::refresh::{CancelContext, RefreshManager};
use crate::scheduler::Scheduler;
use ckb_protocol::model::{Schedule, ScheduleFilter, TaskType, Trigger};
use ckb_protocol::CoreResult;
use ckb_server::admin::DaemonControl;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

pub struct DaemonControlImpl {
    pub scheduler: Arc<Scheduler>,
    pub refresh: Arc<RefreshManager>,
}

impl DaemonControl for DaemonControlImpl {
    fn has_pending_refresh(&self, repo_path: &str) -> bool {
        self.refresh.has_pending_refresh(PathBuf::from(repo_path).as_path())
    }

    /// Fires the refresh on its own tracked task so the HTTP handler can
    /// return 202 immediately (spec §6.3) — the pending-set guard inside
    /// `RefreshManager` still protects against a race between this check
    /// and the spawn, and shutdown can still wait for it via `drain`.
    fn spawn_refresh(&self, repo_path: String, full: bool) {
        let refresh = self.refresh.clone();
        self.refresh.spawn_tracked(async move {
            let ctx = CancelContext::new();
            let path = PathBuf::from(&repo_path);
            let result = if full {
                refresh.run_full(&ctx, &path, Trigger::Manual, "requested via admin API").await
            } else {
                refresh
                    .run_incremental(&ctx, &path, Trigger::Manual, "requested via admin API")
                    .await
            };
            if !result.success {
                warn!(repo = %repo_path, error = ?result.error, "admin-triggered refresh failed");
            }
        });
    }

    fn add_schedule(&self, task_type: TaskType, target: String, expression: String) -> CoreResult<Schedule> {
        self.scheduler.add_schedule(task_type, &target, &expression)
    }

    fn list_schedules(&self, filter: ScheduleFilter) -> CoreResult<Vec<Schedule>> {
        self.scheduler.list_schedules(&filter)
    }

    fn delete_schedule(&self, id: String) -> CoreResult<()> {
        self.scheduler.delete_schedule(&id)
    }
}
