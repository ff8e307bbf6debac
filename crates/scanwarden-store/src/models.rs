//! Entity types for the ScanWarden row store.
//!
//! These mirror the semantic entities of the data model one-to-one: `Target`,
//! `ScanRun`, `ProbeResult`, `Lease`, `Escalation`, `Notification`, `Job`, and
//! `ResourceSample`. Column storage is implementation-defined; these are the
//! shapes every `Store` implementation (Postgres or in-memory) produces and
//! consumes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// How often a target is due for a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanFrequency {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Manual,
}

impl ScanFrequency {
    /// Compute the next scan instant from a successful-scan completion time.
    ///
    /// `Manual` targets are never auto-scheduled — returns `None`, keeping
    /// `next_scan_at` `NULL` so due-selection never picks them up.
    #[must_use]
    pub fn advance(self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Hourly => Some(from + chrono::Duration::hours(1)),
            Self::Daily => Some(from + chrono::Duration::days(1)),
            Self::Weekly => Some(from + chrono::Duration::days(7)),
            Self::Monthly => Some(from + chrono::Duration::days(30)),
            Self::Manual => None,
        }
    }
}

/// Target lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    Active,
    Paused,
    FailedReview,
}

/// A notification channel a target can be reached on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Sms,
    Webhook,
}

/// A registered website to be scanned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub id: Uuid,
    pub name: String,
    pub url: String,
    pub active: bool,
    pub scan_frequency: ScanFrequency,
    pub next_scan_at: Option<DateTime<Utc>>,
    pub last_scan_at: Option<DateTime<Utc>>,
    pub consecutive_failures: i32,
    pub total_failures: i64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_error_category: Option<String>,
    pub status: TargetStatus,
    pub retry_after: Option<DateTime<Utc>>,
    pub notification_channels: HashMap<Channel, String>,
    pub created_at: DateTime<Utc>,
}

impl Target {
    /// Whether this target is currently "due":
    /// `active=true ∧ status=active ∧ next_scan_at ≤ now`.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.active
            && self.status == TargetStatus::Active
            && self.next_scan_at.is_none_or(|at| at <= now)
    }
}

/// Status of one aggregated scan invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanRunStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
    Paused,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRun {
    pub id: Uuid,
    pub target_id: Uuid,
    pub status: ScanRunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub total_probes: i32,
    pub passed: i32,
    pub failed: i32,
    pub execution_time_ms: Option<i64>,
    pub retry_count: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub error_summary: Option<String>,
}

/// Outcome of a single probe execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeOutcomeStatus {
    Passed,
    Failed,
    Error,
    Skipped,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

/// Child record of a `ScanRun`, immutable after insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub id: Uuid,
    pub scan_run_id: Uuid,
    pub probe_name: String,
    pub status: ProbeOutcomeStatus,
    pub severity: Severity,
    pub message: String,
    pub evidence: serde_json::Value,
    pub execution_time_ms: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

/// A time-bounded, renewable named lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseInfo {
    pub name: String,
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

impl LeaseInfo {
    /// A lease is held iff `expires_at > now`.
    /// `expires_at == now` is treated as expired.
    #[must_use]
    pub fn is_held(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationStatus {
    Active,
    Resolved,
}

/// Escalation level summarizing failure severity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escalation {
    pub id: Uuid,
    pub target_id: Uuid,
    pub level: u8,
    pub trigger_reason: String,
    pub status: EscalationStatus,
    pub created_at: DateTime<Utc>,
    pub cooldown_until: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_reason: Option<String>,
    pub notifications_record: Vec<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Sent,
    Failed,
    Cancelled,
}

/// An outbound notification, driven to terminal by the orchestrator's retry
/// loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub channel: Channel,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub status: NotificationStatus,
    pub attempts: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Dead,
    Cancelled,
}

/// Deferred unit of work picked up by `QueueRunner`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub priority: i16,
    pub status: JobStatus,
    pub execute_at: DateTime<Utc>,
    pub retry_count: i32,
    pub worker_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// One host-metrics sample.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceSample {
    pub timestamp: DateTime<Utc>,
    pub cpu_pct: f64,
    pub mem_pct: f64,
    pub disk_pct: f64,
    pub load1: f64,
    pub active_db_conns: i64,
    pub concurrent_scans: i64,
}

/// A structured `scheduler_log` row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerLogEntry {
    pub id: Uuid,
    pub level: String,
    pub message: String,
    pub context: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
