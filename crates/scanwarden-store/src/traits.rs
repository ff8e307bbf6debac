use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreResult;
use crate::models::{
    Escalation, EscalationStatus, Job, JobStatus, LeaseInfo, Notification, NotificationStatus,
    ProbeResult, ResourceSample, ScanRun, ScanRunStatus, SchedulerLogEntry, Target, TargetStatus,
};

/// The full persistence surface the scheduling engine needs.
///
/// One trait, two implementations: [`crate::postgres::PgStore`] for
/// production and [`crate::memory::MemoryStore`] for unit tests that need
/// real concurrency semantics (row locking, uniqueness) without a database.
/// Kept object-safe (`Arc<dyn Store>`) by expressing every read-modify-write
/// as a concrete, narrowly-scoped method rather than a generic mutate
/// closure — each one documents the atomicity it provides.
#[async_trait]
pub trait Store: Send + Sync {
    /// The store's own clock. Every time-based predicate (due-selection,
    /// lease expiry, cooldowns) compares against this, not the calling
    /// process's clock, so a clock-skewed caller can't misjudge expiry
    ///.
    async fn now(&self) -> StoreResult<DateTime<Utc>>;

    // ---- Target -----------------------------------------------------------

    async fn get_target(&self, id: Uuid) -> StoreResult<Option<Target>>;

    async fn list_targets(&self) -> StoreResult<Vec<Target>>;

    /// Targets where `active ∧ status=active ∧ next_scan_at ≤ now`, ordered
    /// by `next_scan_at` ascending (oldest-due first).
    async fn fetch_due_targets(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<Target>>;

    async fn insert_target(&self, target: Target) -> StoreResult<()>;

    async fn set_target_status(&self, id: Uuid, status: TargetStatus) -> StoreResult<()>;

    /// Row-locked transition applied when a scan of this target completes
    /// successfully: clears the failure streak, advances `next_scan_at`,
    /// stamps `last_scan_at`.
    async fn record_target_success(
        &self,
        id: Uuid,
        completed_at: DateTime<Utc>,
        next_scan_at: Option<DateTime<Utc>>,
    ) -> StoreResult<Target>;

    /// Row-locked transition applied when a scan fails: increments both
    /// failure counters, stamps `last_failure_at`/`last_error_category`, and
    /// sets `retry_after`.
    async fn record_target_failure(
        &self,
        id: Uuid,
        failed_at: DateTime<Utc>,
        error_category: &str,
        retry_after: Option<DateTime<Utc>>,
    ) -> StoreResult<Target>;

    // ---- ScanRun / ProbeResult ----------------------------------------------

    async fn insert_scan_run(&self, run: ScanRun) -> StoreResult<()>;

    async fn get_scan_run(&self, id: Uuid) -> StoreResult<Option<ScanRun>>;

    /// Count of scan runs currently `Running` across the fleet — feeds the
    /// governor's `concurrent_scans` metric and the dispatcher's health
    /// check.
    async fn count_running_scan_runs(&self) -> StoreResult<i64>;

    /// Whether `target_id` has a `Running` scan run started within the
    /// last hour — excluded from due-selection.
    async fn has_recent_running_scan_run(
        &self,
        target_id: Uuid,
        since: DateTime<Utc>,
    ) -> StoreResult<bool>;

    async fn set_scan_run_status(
        &self,
        id: Uuid,
        status: ScanRunStatus,
        ended_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()>;

    /// Records probe tallies and schedules (or clears) the next retry.
    async fn finish_scan_run(
        &self,
        id: Uuid,
        status: ScanRunStatus,
        ended_at: DateTime<Utc>,
        passed: i32,
        failed: i32,
        execution_time_ms: i64,
        next_retry_at: Option<DateTime<Utc>>,
        error_summary: Option<String>,
    ) -> StoreResult<ScanRun>;

    async fn increment_scan_run_retry(&self, id: Uuid) -> StoreResult<i32>;

    /// Transitions every `Queued` scan run to `Paused`. Returns
    /// the number of rows transitioned.
    async fn pause_queued_scan_runs(&self) -> StoreResult<u64>;

    /// Transitions every `Paused` scan run back to `Queued` once a throttle
    /// ends. Returns the number of rows transitioned.
    async fn resume_paused_scan_runs(&self) -> StoreResult<u64>;

    /// Scan runs in `Failed` status whose `next_retry_at ≤ now`, started
    /// after `created_after`, and with `retry_count < max_retries`, for the
    /// retry sweep.
    async fn fetch_retryable_scan_runs(
        &self,
        now: DateTime<Utc>,
        created_after: DateTime<Utc>,
        max_retries: i32,
        limit: i64,
    ) -> StoreResult<Vec<ScanRun>>;

    async fn insert_probe_result(&self, result: ProbeResult) -> StoreResult<()>;

    async fn list_probe_results(&self, scan_run_id: Uuid) -> StoreResult<Vec<ProbeResult>>;

    // ---- Lease --------------------------------------------------------------

    /// Acquire or idempotently re-acquire a lease. Implementations make this
    /// atomic: at most one caller succeeds when the lease is currently held
    /// by a different, unexpired owner.
    async fn acquire_lease(
        &self,
        name: &str,
        owner: &str,
        ttl_seconds: i64,
        now: DateTime<Utc>,
        metadata: serde_json::Value,
    ) -> StoreResult<Option<LeaseInfo>>;

    async fn get_lease(&self, name: &str) -> StoreResult<Option<LeaseInfo>>;

    /// Extends `expires_at`/`last_heartbeat_at`; returns `Ok(false)` without
    /// effect if `owner` no longer matches the current holder.
    async fn renew_lease(
        &self,
        name: &str,
        owner: &str,
        ttl_seconds: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    async fn release_lease(&self, name: &str, owner: &str) -> StoreResult<bool>;

    // ---- Escalation -----------------------------------------------------------

    /// The single active escalation for a target, if any.
    async fn get_active_escalation(&self, target_id: Uuid) -> StoreResult<Option<Escalation>>;

    async fn insert_escalation(&self, escalation: Escalation) -> StoreResult<()>;

    async fn bump_escalation_level(
        &self,
        id: Uuid,
        level: u8,
        trigger_reason: &str,
        cooldown_until: DateTime<Utc>,
    ) -> StoreResult<Escalation>;

    async fn resolve_escalation(
        &self,
        id: Uuid,
        resolved_at: DateTime<Utc>,
        reason: &str,
    ) -> StoreResult<()>;

    async fn record_escalation_notification(
        &self,
        id: Uuid,
        notification_id: Uuid,
    ) -> StoreResult<()>;

    async fn list_escalations_by_status(
        &self,
        status: EscalationStatus,
    ) -> StoreResult<Vec<Escalation>>;

    // ---- Notification --------------------------------------------------------

    async fn insert_notification(&self, notification: Notification) -> StoreResult<()>;

    async fn mark_notification_sent(&self, id: Uuid, sent_at: DateTime<Utc>) -> StoreResult<()>;

    async fn mark_notification_failed(
        &self,
        id: Uuid,
        error: &str,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()>;

    async fn cancel_notification(&self, id: Uuid) -> StoreResult<()>;

    async fn fetch_pending_notifications(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<Notification>>;

    /// Count of notifications in `status` sent to `recipient` since `since`,
    /// used for per-recipient rate limiting.
    async fn count_notifications_since(
        &self,
        recipient: &str,
        status: NotificationStatus,
        since: DateTime<Utc>,
    ) -> StoreResult<i64>;

    // ---- Job queue ------------------------------------------------------------

    async fn enqueue_job(&self, job: Job) -> StoreResult<()>;

    /// Atomically claims up to `limit` due jobs (`status=pending`,
    /// `execute_at ≤ now`), ordered by `priority DESC, created_at ASC`, and
    /// marks them `processing` under `worker_id` so no other worker can
    /// claim the same row.
    async fn claim_jobs(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<Job>>;

    async fn complete_job(&self, id: Uuid) -> StoreResult<()>;

    async fn fail_job(
        &self,
        id: Uuid,
        retry_count: i32,
        execute_at: Option<DateTime<Utc>>,
        dead: bool,
    ) -> StoreResult<()>;

    /// Jobs stuck in `processing` past `stale_after`, for stale-job recovery.
    async fn fetch_stale_jobs(
        &self,
        stale_after: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<Job>>;

    async fn requeue_job(&self, id: Uuid, execute_at: DateTime<Utc>) -> StoreResult<()>;

    /// Deletes jobs in a terminal status older than `older_than`.
    async fn purge_jobs(&self, status: JobStatus, older_than: DateTime<Utc>) -> StoreResult<u64>;

    // ---- Resource samples / structured log -------------------------------------

    async fn insert_resource_sample(&self, sample: ResourceSample) -> StoreResult<()>;

    async fn recent_resource_samples(
        &self,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<ResourceSample>>;

    /// Number of connections currently held open by the store's own
    /// connection pool — feeds the governor's `active_db_conns` metric. The
    /// in-memory store has no pool and reports `0`.
    async fn pool_size(&self) -> StoreResult<i64>;

    async fn append_log(&self, entry: SchedulerLogEntry) -> StoreResult<()>;

    /// The most recent `limit` `scheduler_log` rows, newest first — backs
    /// `scheduler status`'s "last N logs" report.
    async fn recent_logs(&self, limit: i64) -> StoreResult<Vec<SchedulerLogEntry>>;

    /// Deletes `scheduler_log` rows older than `older_than`.
    async fn purge_old_logs(&self, older_than: DateTime<Utc>) -> StoreResult<u64>;

    /// Deletes `ProbeResult`s whose parent `ScanRun` no longer exists.
    async fn purge_orphaned_probe_results(&self) -> StoreResult<u64>;

    /// Resets `consecutive_failures` to `0` on every target whose
    /// `last_failure_at < before`, without touching `last_scan_at`,
    /// `next_scan_at`, or `retry_after`.
    async fn reset_stale_failure_streaks(&self, before: DateTime<Utc>) -> StoreResult<u64>;
}
