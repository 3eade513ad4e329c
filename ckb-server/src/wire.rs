//! Webhook payload formats. One small builder per target (`json`, `slack`,
//! `pagerduty`, `discord`) — each maps the same `Event` onto whatever shape
//! that destination expects.

use ckb_protocol::model::{Event, EventKind, WebhookFormat};

pub fn content_type(format: WebhookFormat) -> &'static str {
    match format {
        WebhookFormat::Json => "application/json",
        WebhookFormat::Slack => "application/json",
        WebhookFormat::Pagerduty => "application/json",
        WebhookFormat::Discord => "application/json",
    }
}

pub fn build_payload(format: WebhookFormat, event: &Event) -> String {
    let value = match format {
        WebhookFormat::Json => build_json(event),
        WebhookFormat::Slack => build_slack(event),
        WebhookFormat::Pagerduty => build_pagerduty(event),
        WebhookFormat::Discord => build_discord(event),
    };
    value.to_string()
}

fn build_json(event: &Event) -> serde_json::Value {
    serde_json::json!({
        "event_id": event.id,
        "event_type": event.kind.as_str(),
        "timestamp": event.timestamp.to_rfc3339(),
        "source": event.source,
        "data": event.data,
    })
}

fn summary_line(event: &Event) -> String {
    format!("CKB {}: {}", event.kind.as_str(), event.source)
}

/// error/warning/info per spec §6.2 pagerduty mapping; also doubles as the
/// severity axis for slack's `good`/`warning`/`danger` and discord's
/// Success/Error/Warning/Info title.
enum Severity {
    Error,
    Warning,
    Info,
    Ok,
}

fn severity(kind: EventKind) -> Severity {
    match kind {
        EventKind::RefreshFailed | EventKind::JobFailed => Severity::Error,
        EventKind::HotspotAlert | EventKind::HealthDegraded => Severity::Warning,
        EventKind::RefreshCompleted | EventKind::JobCompleted => Severity::Ok,
        EventKind::FederationSync => Severity::Info,
    }
}

fn build_slack(event: &Event) -> serde_json::Value {
    let color = match severity(event.kind) {
        Severity::Error => "danger",
        Severity::Warning => "warning",
        Severity::Ok => "good",
        Severity::Info => "#36a64f",
    };
    serde_json::json!({
        "attachments": [{
            "color": color,
            "text": summary_line(event),
            "ts": event.timestamp.timestamp(),
            "footer": "CKB",
        }],
    })
}

fn build_pagerduty(event: &Event) -> serde_json::Value {
    let severity = match severity(event.kind) {
        Severity::Error => "error",
        Severity::Warning => "warning",
        Severity::Ok | Severity::Info => "info",
    };
    serde_json::json!({
        "event_action": "trigger",
        "payload": {
            "summary": summary_line(event),
            "source": "ckb",
            "severity": severity,
            "custom_details": {
                "event_id": event.id,
                "source": event.source,
                "data": event.data,
            },
        },
    })
}

fn build_discord(event: &Event) -> serde_json::Value {
    let (title, color) = match severity(event.kind) {
        Severity::Error => ("CKB Error", 0xE74C3C),
        Severity::Warning => ("CKB Warning", 0xE67E22),
        Severity::Ok => ("CKB Success", 0x2ECC71),
        Severity::Info => ("CKB Info", 0x3498DB),
    };
    serde_json::json!({
        "embeds": [{
            "title": title,
            "description": format!("{}: {}", event.kind.as_str(), event.source),
            "color": color,
            "timestamp": event.timestamp.to_rfc3339(),
            "footer": {"text": "CKB Daemon"},
        }],
    })
}
