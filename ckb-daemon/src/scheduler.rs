//! C6 — Scheduler. Persists cron-like schedules in `scheduler.db` and fires
//! due handlers on a tick loop (spec §4.6). The schema-init and
//! `Arc<Mutex<Connection>>` handle shape follow the teacher pack's
//! `codegraph-ir::features::storage::infrastructure::sqlite_store`.

use crate::schedule_expr::ScheduleExpr;
use chrono::Utc;
use ckb_protocol::model::{RunStatus, Schedule, ScheduleFilter, TaskType};
use ckb_protocol::{CoreError, CoreResult};
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

pub type HandlerFuture = Pin<Box<dyn Future<Output = CoreResult<()>> + Send>>;
pub type Handler = Arc<dyn Fn(Schedule) -> HandlerFuture + Send + Sync>;

pub struct Scheduler {
    conn: Arc<Mutex<Connection>>,
    handlers: Mutex<HashMap<TaskType, Handler>>,
    check_interval: Duration,
    stop_notify: Arc<Notify>,
    tick_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn open(db_path: &Path, check_interval: Duration) -> CoreResult<Self> {
        let conn = Connection::open(db_path)
            .map_err(|e| CoreError::external(format!("failed to open scheduler.db: {e}")))?;
        let scheduler = Scheduler {
            conn: Arc::new(Mutex::new(conn)),
            handlers: Mutex::new(HashMap::new()),
            check_interval,
            stop_notify: Arc::new(Notify::new()),
            tick_handle: Mutex::new(None),
        };
        scheduler.init_schema()?;
        Ok(scheduler)
    }

    fn init_schema(&self) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(sql_err)?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(sql_err)?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(sql_err)?;
        conn.busy_timeout(Duration::from_secs(5)).map_err(sql_err)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schedules (
                id TEXT PRIMARY KEY,
                task_type TEXT NOT NULL,
                target TEXT NOT NULL,
                expression TEXT NOT NULL,
                enabled INTEGER NOT NULL,
                next_run TEXT NOT NULL,
                last_run TEXT,
                last_status TEXT NOT NULL DEFAULT '',
                last_duration_ms INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )
        .map_err(sql_err)?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_schedules_next_run ON schedules(next_run)",
            [],
        )
        .map_err(sql_err)?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_schedules_enabled ON schedules(enabled)",
            [],
        )
        .map_err(sql_err)?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_schedules_task_type ON schedules(task_type)",
            [],
        )
        .map_err(sql_err)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schedule_runs (
                id TEXT PRIMARY KEY,
                schedule_id TEXT NOT NULL,
                started_at TEXT NOT NULL,
                duration_ms INTEGER NOT NULL,
                status TEXT NOT NULL,
                error TEXT,
                FOREIGN KEY (schedule_id) REFERENCES schedules(id)
            )",
            [],
        )
        .map_err(sql_err)?;

        Ok(())
    }

    pub fn register_handler(&self, task_type: TaskType, handler: Handler) {
        self.handlers.lock().unwrap().insert(task_type, handler);
    }

    pub fn add_schedule(
        &self,
        task_type: TaskType,
        target: &str,
        expression: &str,
    ) -> CoreResult<Schedule> {
        ScheduleExpr::validate(expression)?;
        let now = Utc::now();
        let expr = ScheduleExpr::parse(expression)?;
        let schedule = Schedule {
            id: Uuid::new_v4().to_string(),
            task_type,
            target: target.to_string(),
            expression: expression.to_string(),
            enabled: true,
            next_run: expr.next_after(now),
            last_run: None,
            last_status: RunStatus::None,
            last_duration_ms: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        };

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO schedules (id, task_type, target, expression, enabled, next_run,
                last_run, last_status, last_duration_ms, last_error, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                schedule.id,
                schedule.task_type.as_str(),
                schedule.target,
                schedule.expression,
                schedule.enabled as i64,
                schedule.next_run.to_rfc3339(),
                schedule.last_run.map(|t| t.to_rfc3339()),
                schedule.last_status.as_str(),
                schedule.last_duration_ms as i64,
                schedule.last_error,
                schedule.created_at.to_rfc3339(),
                schedule.updated_at.to_rfc3339(),
            ],
        )
        .map_err(sql_err)?;

        Ok(schedule)
    }

    pub fn update_schedule(&self, schedule: &Schedule) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE schedules SET task_type=?2, target=?3, expression=?4, enabled=?5,
                next_run=?6, last_run=?7, last_status=?8, last_duration_ms=?9,
                last_error=?10, updated_at=?11 WHERE id=?1",
            params![
                schedule.id,
                schedule.task_type.as_str(),
                schedule.target,
                schedule.expression,
                schedule.enabled as i64,
                schedule.next_run.to_rfc3339(),
                schedule.last_run.map(|t| t.to_rfc3339()),
                schedule.last_status.as_str(),
                schedule.last_duration_ms as i64,
                schedule.last_error,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    pub fn delete_schedule(&self, id: &str) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM schedules WHERE id=?1", params![id])
            .map_err(sql_err)?;
        Ok(())
    }

    pub fn list_schedules(&self, filter: &ScheduleFilter) -> CoreResult<Vec<Schedule>> {
        let conn = self.conn.lock().unwrap();
        let mut sql = "SELECT id, task_type, target, expression, enabled, next_run, last_run,
                last_status, last_duration_ms, last_error, created_at, updated_at
             FROM schedules WHERE 1=1"
            .to_string();

        if let Some(enabled) = filter.enabled {
            sql.push_str(&format!(" AND enabled = {}", enabled as i64));
        }
        if let Some(task_types) = &filter.task_types {
            let list = task_types
                .iter()
                .map(|t| format!("'{}'", t.as_str()))
                .collect::<Vec<_>>()
                .join(",");
            if !list.is_empty() {
                sql.push_str(&format!(" AND task_type IN ({list})"));
            }
        }
        sql.push_str(" ORDER BY next_run ASC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
            if let Some(offset) = filter.offset {
                sql.push_str(&format!(" OFFSET {offset}"));
            }
        }

        let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
        let rows = stmt
            .query_map([], row_to_schedule)
            .map_err(sql_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sql_err)?;
        Ok(rows)
    }

    fn due_schedules(&self) -> CoreResult<Vec<Schedule>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT id, task_type, target, expression, enabled, next_run, last_run,
                    last_status, last_duration_ms, last_error, created_at, updated_at
                 FROM schedules WHERE enabled = 1 AND next_run <= ?1 ORDER BY next_run ASC",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![Utc::now().to_rfc3339()], row_to_schedule)
            .map_err(sql_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(sql_err)?;
        Ok(rows)
    }

    /// One execution pass: run every currently-due, enabled schedule in
    /// sequence (spec §5 "Scheduler execution is sequential within one
    /// tick"). Returns the number of schedules executed.
    pub async fn run_due(&self) -> CoreResult<usize> {
        let due = self.due_schedules()?;
        let mut ran = 0;
        for mut schedule in due {
            self.execute_one(&mut schedule).await;
            ran += 1;
        }
        Ok(ran)
    }

    async fn execute_one(&self, schedule: &mut Schedule) {
        let handler = self.handlers.lock().unwrap().get(&schedule.task_type).cloned();

        let Some(handler) = handler else {
            warn!(task_type = schedule.task_type.as_str(), "no handler registered, skipping");
            self.advance_next_run(schedule);
            let _ = self.update_schedule(schedule);
            return;
        };

        let start = std::time::Instant::now();
        let result = handler(schedule.clone()).await;
        let duration = start.elapsed();

        schedule.last_run = Some(Utc::now());
        schedule.last_duration_ms = duration.as_millis() as u64;
        match &result {
            Ok(()) => {
                schedule.last_status = RunStatus::Success;
                schedule.last_error = None;
            }
            Err(e) => {
                schedule.last_status = RunStatus::Failed;
                schedule.last_error = Some(e.to_string());
            }
        }

        self.advance_next_run(schedule);

        if let Err(e) = self.update_schedule(schedule) {
            warn!(schedule_id = %schedule.id, error = %e, "failed to persist schedule after run");
        }
        self.record_run(schedule, duration, &result);
    }

    /// Recompute `next_run`. If the expression fails to parse at this point
    /// (it validated fine at creation time, but defends against hand-edited
    /// rows), `next_run` still advances by at least one `check_interval` so
    /// the tick loop can't spin on this schedule forever (spec §4.6 step 4).
    fn advance_next_run(&self, schedule: &mut Schedule) {
        let now = Utc::now();
        match ScheduleExpr::parse(&schedule.expression) {
            Ok(expr) => schedule.next_run = expr.next_after(now),
            Err(e) => {
                warn!(schedule_id = %schedule.id, error = %e, "failed to parse schedule expression");
                schedule.next_run = now
                    + chrono::Duration::from_std(self.check_interval).unwrap_or(chrono::Duration::seconds(60));
            }
        }
    }

    fn record_run(
        &self,
        schedule: &Schedule,
        duration: Duration,
        result: &CoreResult<()>,
    ) {
        let conn = self.conn.lock().unwrap();
        let _ = conn.execute(
            "INSERT INTO schedule_runs (id, schedule_id, started_at, duration_ms, status, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                Uuid::new_v4().to_string(),
                schedule.id,
                Utc::now().to_rfc3339(),
                duration.as_millis() as i64,
                if result.is_ok() { "success" } else { "failed" },
                result.as_ref().err().map(|e| e.to_string()),
            ],
        );
    }

    /// Start the tick loop: fires once immediately, then every
    /// `check_interval` until `stop()` is called.
    pub fn start(self: &Arc<Self>) {
        let scheduler = self.clone();
        let stop_notify = self.stop_notify.clone();
        let interval = self.check_interval;

        let handle = tokio::spawn(async move {
            loop {
                if let Err(e) = scheduler.run_due().await {
                    warn!(error = %e, "scheduler tick failed");
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = stop_notify.notified() => break,
                }
            }
            info!("scheduler tick loop stopped");
        });

        *self.tick_handle.lock().unwrap() = Some(handle);
    }

    /// Signal the tick loop to stop and wait for in-flight handlers,
    /// bounded by `timeout`. Returns an error if the bound elapses first.
    pub async fn stop(&self, timeout: Duration) -> CoreResult<()> {
        self.stop_notify.notify_waiters();
        let handle = self.tick_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            match tokio::time::timeout(timeout, handle).await {
                Ok(_) => Ok(()),
                Err(_) => Err(CoreError::external("scheduler stop timed out")),
            }
        } else {
            Ok(())
        }
    }
}

fn row_to_schedule(row: &rusqlite::Row) -> rusqlite::Result<Schedule> {
    let task_type_str: String = row.get(1)?;
    let next_run_str: String = row.get(5)?;
    let last_run_str: Option<String> = row.get(6)?;
    let created_at_str: String = row.get(10)?;
    let updated_at_str: String = row.get(11)?;

    Ok(Schedule {
        id: row.get(0)?,
        task_type: TaskType::from_str(&task_type_str).unwrap_or(TaskType::Refresh),
        target: row.get(2)?,
        expression: row.get(3)?,
        enabled: row.get::<_, i64>(4)? != 0,
        next_run: parse_rfc3339(&next_run_str),
        last_run: last_run_str.map(|s| parse_rfc3339(&s)),
        last_status: RunStatus::from_str(&row.get::<_, String>(7)?),
        last_duration_ms: row.get::<_, i64>(8)? as u64,
        last_error: row.get(9)?,
        created_at: parse_rfc3339(&created_at_str),
        updated_at: parse_rfc3339(&updated_at_str),
    })
}

fn parse_rfc3339(s: &str) -> chrono::DateTime<Utc> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn sql_err(e: rusqlite::Error) -> CoreError {
    CoreError::external(format!("scheduler store error: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn open_test_scheduler() -> (TempDir, Arc<Scheduler>) {
        let dir = TempDir::new().unwrap();
        let scheduler =
            Arc::new(Scheduler::open(&dir.path().join("scheduler.db"), Duration::from_millis(50)).unwrap());
        (dir, scheduler)
    }

    #[tokio::test]
    async fn add_and_list_schedule() {
        let (_dir, scheduler) = open_test_scheduler();
        scheduler
            .add_schedule(TaskType::Cleanup, "repo-a", "every 1h")
            .unwrap();

        let filter = ScheduleFilter::default();
        let schedules = scheduler.list_schedules(&filter).unwrap();
        assert_eq!(schedules.len(), 1);
        assert_eq!(schedules[0].task_type, TaskType::Cleanup);
    }

    #[tokio::test]
    async fn invalid_expression_is_rejected_at_creation() {
        let (_dir, scheduler) = open_test_scheduler();
        let result = scheduler.add_schedule(TaskType::Cleanup, "repo-a", "not a cron");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn due_schedule_executes_and_advances_next_run() {
        let (_dir, scheduler) = open_test_scheduler();
        let mut schedule = scheduler
            .add_schedule(TaskType::Cleanup, "repo-a", "every 1m")
            .unwrap();
        schedule.next_run = Utc::now() - chrono::Duration::seconds(5);
        scheduler.update_schedule(&schedule).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        scheduler.register_handler(
            TaskType::Cleanup,
            Arc::new(move |_s| {
                let calls = calls_clone.clone();
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        );

        let ran = scheduler.run_due().await.unwrap();
        assert_eq!(ran, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let reloaded = scheduler.list_schedules(&ScheduleFilter::default()).unwrap();
        assert!(reloaded[0].next_run > Utc::now());
        assert_eq!(reloaded[0].last_status, RunStatus::Success);
    }

    #[tokio::test]
    async fn failing_handler_is_recorded_and_schedule_still_advances() {
        let (_dir, scheduler) = open_test_scheduler();
        let mut schedule = scheduler
            .add_schedule(TaskType::HealthCheck, "repo-a", "every 1m")
            .unwrap();
        schedule.next_run = Utc::now() - chrono::Duration::seconds(5);
        scheduler.update_schedule(&schedule).unwrap();

        scheduler.register_handler(
            TaskType::HealthCheck,
            Arc::new(|_s| Box::pin(async move { Err(CoreError::external("boom")) })),
        );

        scheduler.run_due().await.unwrap();

        let reloaded = scheduler.list_schedules(&ScheduleFilter::default()).unwrap();
        assert_eq!(reloaded[0].last_status, RunStatus::Failed);
        assert!(reloaded[0].last_error.as_deref().unwrap().contains("boom"));
        assert!(reloaded[0].next_run > Utc::now());
    }

    #[tokio::test]
    async fn unknown_task_type_is_skipped_not_fatal() {
        let (_dir, scheduler) = open_test_scheduler();
        let mut schedule = scheduler
            .add_schedule(TaskType::FederationSync, "repo-a", "every 1m")
            .unwrap();
        schedule.next_run = Utc::now() - chrono::Duration::seconds(5);
        scheduler.update_schedule(&schedule).unwrap();

        // no handler registered for FederationSync
        let ran = scheduler.run_due().await.unwrap();
        assert_eq!(ran, 1);
    }

    #[tokio::test]
    async fn stop_without_start_returns_ok() {
        let (_dir, scheduler) = open_test_scheduler();
        scheduler.stop(Duration::from_millis(100)).await.unwrap();
    }

    #[tokio::test]
    async fn start_runs_immediately_then_on_interval() {
        let (_dir, scheduler) = open_test_scheduler();
        let mut schedule = scheduler
            .add_schedule(TaskType::Cleanup, "repo-a", "every 1s")
            .unwrap();
        // force due immediately
        schedule.next_run = Utc::now() - chrono::Duration::seconds(1);
        scheduler.update_schedule(&schedule).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        scheduler.register_handler(
            TaskType::Cleanup,
            Arc::new(move |_s| {
                let calls = calls_clone.clone();
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        );

        scheduler.start();
        tokio::time::sleep(Duration::from_millis(120)).await;
        scheduler.stop(Duration::from_millis(200)).await.unwrap();

        assert!(calls.load(Ordering::SeqCst) >= 1);
    }
}
