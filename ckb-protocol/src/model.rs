//! Data model shared between the orchestration core (`ckb-daemon`) and the
//! HTTP/webhook crate (`ckb-server`). See spec §3 for the authoritative
//! field-by-field description; this module just gives the shapes names.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Ephemeral snapshot of a repository's git state, derived on demand by the
/// probe — never persisted on its own (it rides along inside `IndexMeta`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoState {
    /// 40-char commit hash, empty when HEAD is unborn.
    pub head_commit: String,
    pub dirty: bool,
    /// Content fingerprint of `(head_commit, dirty-signature)`; equal iff
    /// both inputs are equal.
    pub repo_state_id: String,
}

/// Who/what asked for a refresh. Purely informational — never changes the
/// pipeline's decision tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Trigger {
    Manual,
    HeadChanged,
    IndexChanged,
    Scheduled,
    Webhook,
    Stale,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Manual => "manual",
            Trigger::HeadChanged => "head-changed",
            Trigger::IndexChanged => "index-changed",
            Trigger::Scheduled => "scheduled",
            Trigger::Webhook => "webhook",
            Trigger::Stale => "stale",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastRefresh {
    pub at: DateTime<Utc>,
    pub trigger: Trigger,
    pub trigger_info: String,
    pub duration_ms: u64,
}

/// The on-disk schema version this binary writes. Readers must treat any
/// mismatch as "no metadata present" (spec §3 invariant).
pub const INDEX_META_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexMeta {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub commit_hash: String,
    pub repo_state_id: String,
    pub file_count: u64,
    pub duration_secs: f64,
    pub indexer: String,
    pub indexer_args: Vec<String>,
    pub last_refresh: LastRefresh,
}

impl IndexMeta {
    pub fn is_current_version(&self) -> bool {
        self.version == INDEX_META_VERSION
    }
}

/// Result of `IndexMetadataStore::checkFreshness`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreshnessResult {
    pub fresh: bool,
    pub reason: String,
    pub has_uncommitted: bool,
    pub commits_behind: Option<u32>,
}

impl FreshnessResult {
    pub fn fresh() -> Self {
        FreshnessResult {
            fresh: true,
            reason: "index state matches repository".to_string(),
            has_uncommitted: false,
            commits_behind: None,
        }
    }

    pub fn stale(reason: impl Into<String>) -> Self {
        FreshnessResult {
            fresh: false,
            reason: reason.into(),
            has_uncommitted: false,
            commits_behind: None,
        }
    }
}

/// Display-friendly projection of `FreshnessResult` with a bucketed age.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StalenessView {
    #[serde(flatten)]
    pub freshness: FreshnessResult,
    pub index_age: String,
}

pub fn bucket_age(age: chrono::Duration) -> String {
    let secs = age.num_seconds();
    if secs < 60 {
        "just now".to_string()
    } else if secs < 3600 {
        format!("{} minutes ago", secs / 60)
    } else if secs < 86_400 {
        format!("{} hours ago", secs / 3600)
    } else {
        format!("{} days ago", secs / 86_400)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Refresh,
    FederationSync,
    Cleanup,
    HealthCheck,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Refresh => "refresh",
            TaskType::FederationSync => "federation_sync",
            TaskType::Cleanup => "cleanup",
            TaskType::HealthCheck => "health_check",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "refresh" => Some(TaskType::Refresh),
            "federation_sync" => Some(TaskType::FederationSync),
            "cleanup" => Some(TaskType::Cleanup),
            "health_check" => Some(TaskType::HealthCheck),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
    #[serde(rename = "")]
    None,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::None => "",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "success" => RunStatus::Success,
            "failed" => RunStatus::Failed,
            _ => RunStatus::None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub task_type: TaskType,
    pub target: String,
    pub expression: String,
    pub enabled: bool,
    pub next_run: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_status: RunStatus,
    pub last_duration_ms: u64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct ScheduleFilter {
    pub task_types: Option<Vec<TaskType>>,
    pub enabled: Option<bool>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookFormat {
    Json,
    Slack,
    Pagerduty,
    Discord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Webhook {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(skip_serializing)]
    pub secret: Option<String>,
    pub events: HashSet<EventKind>,
    pub format: WebhookFormat,
    pub enabled: bool,
    pub headers: Vec<(String, String)>,
    pub max_retries: u32,
    pub retry_delay_seconds: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RefreshCompleted,
    RefreshFailed,
    HotspotAlert,
    FederationSync,
    JobCompleted,
    JobFailed,
    HealthDegraded,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::RefreshCompleted => "refresh_completed",
            EventKind::RefreshFailed => "refresh_failed",
            EventKind::HotspotAlert => "hotspot_alert",
            EventKind::FederationSync => "federation_sync",
            EventKind::JobCompleted => "job_completed",
            EventKind::JobFailed => "job_failed",
            EventKind::HealthDegraded => "health_degraded",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "refresh_completed" => Some(EventKind::RefreshCompleted),
            "refresh_failed" => Some(EventKind::RefreshFailed),
            "hotspot_alert" => Some(EventKind::HotspotAlert),
            "federation_sync" => Some(EventKind::FederationSync),
            "job_completed" => Some(EventKind::JobCompleted),
            "job_failed" => Some(EventKind::JobFailed),
            "health_degraded" => Some(EventKind::HealthDegraded),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Queued,
    Pending,
    Delivered,
    Failed,
    Dead,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Queued => "queued",
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::Dead => "dead",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(DeliveryStatus::Queued),
            "pending" => Some(DeliveryStatus::Pending),
            "delivered" => Some(DeliveryStatus::Delivered),
            "failed" => Some(DeliveryStatus::Failed),
            "dead" => Some(DeliveryStatus::Dead),
            _ => None,
        }
    }

    /// Whether `self -> next` is a legal transition per spec §8 property 8.
    pub fn can_transition_to(&self, next: DeliveryStatus) -> bool {
        use DeliveryStatus::*;
        matches!(
            (self, next),
            (Queued, Pending) | (Queued, Delivered) | (Queued, Dead) |
            (Pending, Pending) | (Pending, Delivered) | (Pending, Dead)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    pub id: String,
    pub webhook_id: String,
    pub event_id: String,
    pub event_kind: EventKind,
    pub payload: String,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub response_code: Option<u16>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: String,
    pub webhook_id: String,
    pub event_id: String,
    pub event_kind: EventKind,
    pub payload: String,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub archived_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshType {
    Incremental,
    Full,
}

impl RefreshType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshType::Incremental => "incremental",
            RefreshType::Full => "full",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshResult {
    pub repo_path: String,
    #[serde(rename = "type")]
    pub refresh_type: RefreshType,
    pub success: bool,
    pub duration_ms: u64,
    pub files_changed: Option<u64>,
    pub error: Option<String>,
    pub trigger: Option<Trigger>,
    pub trigger_info: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_status_transitions() {
        assert!(DeliveryStatus::Queued.can_transition_to(DeliveryStatus::Pending));
        assert!(DeliveryStatus::Pending.can_transition_to(DeliveryStatus::Dead));
        assert!(!DeliveryStatus::Delivered.can_transition_to(DeliveryStatus::Pending));
        assert!(!DeliveryStatus::Dead.can_transition_to(DeliveryStatus::Queued));
    }

    #[test]
    fn event_kind_round_trips_through_strings() {
        for kind in [
            EventKind::RefreshCompleted,
            EventKind::RefreshFailed,
            EventKind::HotspotAlert,
            EventKind::FederationSync,
            EventKind::JobCompleted,
            EventKind::JobFailed,
            EventKind::HealthDegraded,
        ] {
            assert_eq!(EventKind::from_str(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn bucket_age_thresholds() {
        assert_eq!(bucket_age(chrono::Duration::seconds(10)), "just now");
        assert_eq!(bucket_age(chrono::Duration::minutes(5)), "5 minutes ago");
        assert_eq!(bucket_age(chrono::Duration::hours(3)), "3 hours ago");
        assert_eq!(bucket_age(chrono::Duration::days(2)), "2 days ago");
    }

    #[test]
    fn webhook_secret_never_serializes() {
        let webhook = Webhook {
            id: "wh1".into(),
            name: "test".into(),
            url: "https://example.com".into(),
            secret: Some("super-secret".into()),
            events: HashSet::from([EventKind::RefreshCompleted]),
            format: WebhookFormat::Json,
            enabled: true,
            headers: vec![],
            max_retries: 3,
            retry_delay_seconds: 60,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let json = serde_json::to_string(&webhook).unwrap();
        assert!(!json.contains("super-secret"));
    }
}
