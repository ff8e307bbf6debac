//! In-memory [`Store`] implementation.
//!
//! A plain `RwLock<HashMap<..>>` guarding the whole table, cloning on
//! read/write rather than handing out references — one table per entity
//! instead of one generic key/value space, because the scheduling engine's
//! invariants (row locking, uniqueness, atomic claim) need relational
//! structure a flat KV space can't express cleanly.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::models::{
    Escalation, EscalationStatus, Job, JobStatus, LeaseInfo, Notification, NotificationStatus,
    ProbeResult, ResourceSample, ScanRun, ScanRunStatus, SchedulerLogEntry, Target, TargetStatus,
};
use crate::traits::Store;

#[derive(Default)]
struct Tables {
    targets: HashMap<Uuid, Target>,
    scan_runs: HashMap<Uuid, ScanRun>,
    probe_results: HashMap<Uuid, Vec<ProbeResult>>,
    leases: HashMap<String, LeaseInfo>,
    escalations: HashMap<Uuid, Escalation>,
    notifications: HashMap<Uuid, Notification>,
    jobs: HashMap<Uuid, Job>,
    resource_samples: Vec<ResourceSample>,
    log: Vec<SchedulerLogEntry>,
}

/// Thread-safe, process-local [`Store`]. Never durable; built for tests.
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Tables> {
        self.tables
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Tables> {
        self.tables
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn not_found(what: &str, id: impl std::fmt::Display) -> StoreError {
    StoreError::NotFound(format!("{what} {id} not found"))
}

#[async_trait]
impl Store for MemoryStore {
    async fn now(&self) -> StoreResult<DateTime<Utc>> {
        Ok(Utc::now())
    }

    async fn get_target(&self, id: Uuid) -> StoreResult<Option<Target>> {
        Ok(self.read().targets.get(&id).cloned())
    }

    async fn list_targets(&self) -> StoreResult<Vec<Target>> {
        Ok(self.read().targets.values().cloned().collect())
    }

    async fn fetch_due_targets(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<Target>> {
        let guard = self.read();
        let mut due: Vec<Target> = guard
            .targets
            .values()
            .filter(|t| t.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|t| (t.next_scan_at.unwrap_or(DateTime::<Utc>::MIN_UTC), t.created_at));
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn insert_target(&self, target: Target) -> StoreResult<()> {
        self.write().targets.insert(target.id, target);
        Ok(())
    }

    async fn set_target_status(&self, id: Uuid, status: TargetStatus) -> StoreResult<()> {
        let mut guard = self.write();
        let target = guard
            .targets
            .get_mut(&id)
            .ok_or_else(|| not_found("target", id))?;
        target.status = status;
        Ok(())
    }

    async fn record_target_success(
        &self,
        id: Uuid,
        completed_at: DateTime<Utc>,
        next_scan_at: Option<DateTime<Utc>>,
    ) -> StoreResult<Target> {
        let mut guard = self.write();
        let target = guard
            .targets
            .get_mut(&id)
            .ok_or_else(|| not_found("target", id))?;
        target.consecutive_failures = 0;
        target.last_scan_at = Some(completed_at);
        target.next_scan_at = next_scan_at;
        target.retry_after = None;
        Ok(target.clone())
    }

    async fn record_target_failure(
        &self,
        id: Uuid,
        failed_at: DateTime<Utc>,
        error_category: &str,
        retry_after: Option<DateTime<Utc>>,
    ) -> StoreResult<Target> {
        let mut guard = self.write();
        let target = guard
            .targets
            .get_mut(&id)
            .ok_or_else(|| not_found("target", id))?;
        target.consecutive_failures += 1;
        target.total_failures += 1;
        target.last_failure_at = Some(failed_at);
        target.last_error_category = Some(error_category.to_string());
        target.retry_after = retry_after;
        Ok(target.clone())
    }

    async fn insert_scan_run(&self, run: ScanRun) -> StoreResult<()> {
        self.write().scan_runs.insert(run.id, run);
        Ok(())
    }

    async fn get_scan_run(&self, id: Uuid) -> StoreResult<Option<ScanRun>> {
        Ok(self.read().scan_runs.get(&id).cloned())
    }

    async fn count_running_scan_runs(&self) -> StoreResult<i64> {
        Ok(self
            .read()
            .scan_runs
            .values()
            .filter(|r| r.status == ScanRunStatus::Running)
            .count() as i64)
    }

    async fn has_recent_running_scan_run(
        &self,
        target_id: Uuid,
        since: DateTime<Utc>,
    ) -> StoreResult<bool> {
        Ok(self.read().scan_runs.values().any(|r| {
            r.target_id == target_id
                && r.status == ScanRunStatus::Running
                && r.started_at >= since
        }))
    }

    async fn set_scan_run_status(
        &self,
        id: Uuid,
        status: ScanRunStatus,
        ended_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let mut guard = self.write();
        let run = guard
            .scan_runs
            .get_mut(&id)
            .ok_or_else(|| not_found("scan run", id))?;
        run.status = status;
        if ended_at.is_some() {
            run.ended_at = ended_at;
        }
        Ok(())
    }

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
    ) -> StoreResult<ScanRun> {
        let mut guard = self.write();
        let run = guard
            .scan_runs
            .get_mut(&id)
            .ok_or_else(|| not_found("scan run", id))?;
        run.status = status;
        run.ended_at = Some(ended_at);
        run.passed = passed;
        run.failed = failed;
        run.total_probes = passed + failed;
        run.execution_time_ms = Some(execution_time_ms);
        run.next_retry_at = next_retry_at;
        run.error_summary = error_summary;
        Ok(run.clone())
    }

    async fn increment_scan_run_retry(&self, id: Uuid) -> StoreResult<i32> {
        let mut guard = self.write();
        let run = guard
            .scan_runs
            .get_mut(&id)
            .ok_or_else(|| not_found("scan run", id))?;
        run.retry_count += 1;
        Ok(run.retry_count)
    }

    async fn pause_queued_scan_runs(&self) -> StoreResult<u64> {
        let mut guard = self.write();
        let mut count = 0u64;
        for run in guard.scan_runs.values_mut() {
            if run.status == ScanRunStatus::Queued {
                run.status = ScanRunStatus::Paused;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn resume_paused_scan_runs(&self) -> StoreResult<u64> {
        let mut guard = self.write();
        let mut count = 0u64;
        for run in guard.scan_runs.values_mut() {
            if run.status == ScanRunStatus::Paused {
                run.status = ScanRunStatus::Queued;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn fetch_retryable_scan_runs(
        &self,
        now: DateTime<Utc>,
        created_after: DateTime<Utc>,
        max_retries: i32,
        limit: i64,
    ) -> StoreResult<Vec<ScanRun>> {
        let guard = self.read();
        let mut runs: Vec<ScanRun> = guard
            .scan_runs
            .values()
            .filter(|r| {
                r.status == ScanRunStatus::Failed
                    && r.next_retry_at.is_some_and(|at| at <= now)
                    && r.started_at >= created_after
                    && r.retry_count < max_retries
            })
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.next_retry_at);
        runs.truncate(limit.max(0) as usize);
        Ok(runs)
    }

    async fn insert_probe_result(&self, result: ProbeResult) -> StoreResult<()> {
        self.write()
            .probe_results
            .entry(result.scan_run_id)
            .or_default()
            .push(result);
        Ok(())
    }

    async fn list_probe_results(&self, scan_run_id: Uuid) -> StoreResult<Vec<ProbeResult>> {
        Ok(self
            .read()
            .probe_results
            .get(&scan_run_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn acquire_lease(
        &self,
        name: &str,
        owner: &str,
        ttl_seconds: i64,
        now: DateTime<Utc>,
        metadata: serde_json::Value,
    ) -> StoreResult<Option<LeaseInfo>> {
        let mut guard = self.write();
        if let Some(existing) = guard.leases.get(name) {
            if existing.is_held(now) && existing.owner != owner {
                return Ok(None);
            }
        }
        let lease = LeaseInfo {
            name: name.to_string(),
            owner: owner.to_string(),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(ttl_seconds),
            last_heartbeat_at: now,
            metadata,
        };
        guard.leases.insert(name.to_string(), lease.clone());
        Ok(Some(lease))
    }

    async fn get_lease(&self, name: &str) -> StoreResult<Option<LeaseInfo>> {
        Ok(self.read().leases.get(name).cloned())
    }

    async fn renew_lease(
        &self,
        name: &str,
        owner: &str,
        ttl_seconds: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut guard = self.write();
        let Some(lease) = guard.leases.get_mut(name) else {
            return Ok(false);
        };
        if lease.owner != owner {
            return Ok(false);
        }
        lease.expires_at = now + chrono::Duration::seconds(ttl_seconds);
        lease.last_heartbeat_at = now;
        Ok(true)
    }

    async fn release_lease(&self, name: &str, owner: &str) -> StoreResult<bool> {
        let mut guard = self.write();
        match guard.leases.get(name) {
            Some(lease) if lease.owner == owner => {
                guard.leases.remove(name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_active_escalation(&self, target_id: Uuid) -> StoreResult<Option<Escalation>> {
        Ok(self
            .read()
            .escalations
            .values()
            .find(|e| e.target_id == target_id && e.status == EscalationStatus::Active)
            .cloned())
    }

    async fn insert_escalation(&self, escalation: Escalation) -> StoreResult<()> {
        let mut guard = self.write();
        if guard
            .escalations
            .values()
            .any(|e| e.target_id == escalation.target_id && e.status == EscalationStatus::Active)
        {
            return Err(StoreError::Conflict(format!(
                "target {} already has an active escalation",
                escalation.target_id
            )));
        }
        guard.escalations.insert(escalation.id, escalation);
        Ok(())
    }

    async fn bump_escalation_level(
        &self,
        id: Uuid,
        level: u8,
        trigger_reason: &str,
        cooldown_until: DateTime<Utc>,
    ) -> StoreResult<Escalation> {
        let mut guard = self.write();
        let esc = guard
            .escalations
            .get_mut(&id)
            .ok_or_else(|| not_found("escalation", id))?;
        esc.level = level;
        esc.trigger_reason = trigger_reason.to_string();
        esc.cooldown_until = cooldown_until;
        Ok(esc.clone())
    }

    async fn resolve_escalation(
        &self,
        id: Uuid,
        resolved_at: DateTime<Utc>,
        reason: &str,
    ) -> StoreResult<()> {
        let mut guard = self.write();
        let esc = guard
            .escalations
            .get_mut(&id)
            .ok_or_else(|| not_found("escalation", id))?;
        esc.status = EscalationStatus::Resolved;
        esc.resolved_at = Some(resolved_at);
        esc.resolution_reason = Some(reason.to_string());
        Ok(())
    }

    async fn record_escalation_notification(
        &self,
        id: Uuid,
        notification_id: Uuid,
    ) -> StoreResult<()> {
        let mut guard = self.write();
        let esc = guard
            .escalations
            .get_mut(&id)
            .ok_or_else(|| not_found("escalation", id))?;
        esc.notifications_record.push(notification_id);
        Ok(())
    }

    async fn list_escalations_by_status(
        &self,
        status: EscalationStatus,
    ) -> StoreResult<Vec<Escalation>> {
        Ok(self
            .read()
            .escalations
            .values()
            .filter(|e| e.status == status)
            .cloned()
            .collect())
    }

    async fn insert_notification(&self, notification: Notification) -> StoreResult<()> {
        self.write()
            .notifications
            .insert(notification.id, notification);
        Ok(())
    }

    async fn mark_notification_sent(&self, id: Uuid, sent_at: DateTime<Utc>) -> StoreResult<()> {
        let mut guard = self.write();
        let n = guard
            .notifications
            .get_mut(&id)
            .ok_or_else(|| not_found("notification", id))?;
        n.status = NotificationStatus::Sent;
        n.sent_at = Some(sent_at);
        n.next_retry_at = None;
        Ok(())
    }

    async fn mark_notification_failed(
        &self,
        id: Uuid,
        error: &str,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let mut guard = self.write();
        let n = guard
            .notifications
            .get_mut(&id)
            .ok_or_else(|| not_found("notification", id))?;
        n.attempts += 1;
        n.last_error = Some(error.to_string());
        n.next_retry_at = next_retry_at;
        n.status = if next_retry_at.is_some() {
            NotificationStatus::Pending
        } else {
            NotificationStatus::Failed
        };
        Ok(())
    }

    async fn cancel_notification(&self, id: Uuid) -> StoreResult<()> {
        let mut guard = self.write();
        let n = guard
            .notifications
            .get_mut(&id)
            .ok_or_else(|| not_found("notification", id))?;
        n.status = NotificationStatus::Cancelled;
        Ok(())
    }

    async fn fetch_pending_notifications(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<Notification>> {
        let guard = self.read();
        let mut pending: Vec<Notification> = guard
            .notifications
            .values()
            .filter(|n| {
                n.status == NotificationStatus::Pending
                    && n.next_retry_at.is_none_or(|at| at <= now)
            })
            .cloned()
            .collect();
        pending.sort_by_key(|n| n.created_at);
        pending.truncate(limit.max(0) as usize);
        Ok(pending)
    }

    async fn count_notifications_since(
        &self,
        recipient: &str,
        status: NotificationStatus,
        since: DateTime<Utc>,
    ) -> StoreResult<i64> {
        let guard = self.read();
        let count = guard
            .notifications
            .values()
            .filter(|n| n.recipient == recipient && n.status == status && n.created_at >= since)
            .count();
        Ok(count as i64)
    }

    async fn enqueue_job(&self, job: Job) -> StoreResult<()> {
        self.write().jobs.insert(job.id, job);
        Ok(())
    }

    async fn claim_jobs(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<Job>> {
        let mut guard = self.write();
        let mut candidates: Vec<Uuid> = guard
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending && j.execute_at <= now)
            .map(|j| j.id)
            .collect();
        candidates.sort_by(|a, b| {
            let ja = &guard.jobs[a];
            let jb = &guard.jobs[b];
            jb.priority
                .cmp(&ja.priority)
                .then(ja.created_at.cmp(&jb.created_at))
        });
        candidates.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(candidates.len());
        for id in candidates {
            if let Some(job) = guard.jobs.get_mut(&id) {
                job.status = JobStatus::Processing;
                job.worker_id = Some(worker_id.to_string());
                job.started_at = Some(now);
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn complete_job(&self, id: Uuid) -> StoreResult<()> {
        let mut guard = self.write();
        let job = guard
            .jobs
            .get_mut(&id)
            .ok_or_else(|| not_found("job", id))?;
        job.status = JobStatus::Completed;
        Ok(())
    }

    async fn fail_job(
        &self,
        id: Uuid,
        retry_count: i32,
        execute_at: Option<DateTime<Utc>>,
        dead: bool,
    ) -> StoreResult<()> {
        let mut guard = self.write();
        let job = guard
            .jobs
            .get_mut(&id)
            .ok_or_else(|| not_found("job", id))?;
        job.retry_count = retry_count;
        if dead {
            job.status = JobStatus::Dead;
        } else if let Some(at) = execute_at {
            job.status = JobStatus::Pending;
            job.execute_at = at;
            job.worker_id = None;
            job.started_at = None;
        } else {
            job.status = JobStatus::Failed;
        }
        Ok(())
    }

    async fn fetch_stale_jobs(
        &self,
        stale_after: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<Job>> {
        let guard = self.read();
        let mut stale: Vec<Job> = guard
            .jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Processing
                    && j.started_at.is_some_and(|at| at <= stale_after)
            })
            .cloned()
            .collect();
        stale.sort_by_key(|j| j.started_at);
        stale.truncate(limit.max(0) as usize);
        Ok(stale)
    }

    async fn requeue_job(&self, id: Uuid, execute_at: DateTime<Utc>) -> StoreResult<()> {
        let mut guard = self.write();
        let job = guard
            .jobs
            .get_mut(&id)
            .ok_or_else(|| not_found("job", id))?;
        job.status = JobStatus::Pending;
        job.execute_at = execute_at;
        job.worker_id = None;
        job.started_at = None;
        Ok(())
    }

    async fn purge_jobs(&self, status: JobStatus, older_than: DateTime<Utc>) -> StoreResult<u64> {
        let mut guard = self.write();
        let before = guard.jobs.len();
        guard
            .jobs
            .retain(|_, j| !(j.status == status && j.created_at < older_than));
        Ok((before - guard.jobs.len()) as u64)
    }

    async fn insert_resource_sample(&self, sample: ResourceSample) -> StoreResult<()> {
        self.write().resource_samples.push(sample);
        Ok(())
    }

    async fn recent_resource_samples(
        &self,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<ResourceSample>> {
        Ok(self
            .read()
            .resource_samples
            .iter()
            .filter(|s| s.timestamp >= since)
            .copied()
            .collect())
    }

    async fn pool_size(&self) -> StoreResult<i64> {
        Ok(0)
    }

    async fn append_log(&self, entry: SchedulerLogEntry) -> StoreResult<()> {
        self.write().log.push(entry);
        Ok(())
    }

    async fn recent_logs(&self, limit: i64) -> StoreResult<Vec<SchedulerLogEntry>> {
        let inner = self.read();
        let mut entries: Vec<SchedulerLogEntry> = inner.log.clone();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        entries.truncate(limit.max(0) as usize);
        Ok(entries)
    }

    async fn purge_old_logs(&self, older_than: DateTime<Utc>) -> StoreResult<u64> {
        let mut guard = self.write();
        let before = guard.log.len();
        guard.log.retain(|entry| entry.created_at >= older_than);
        Ok((before - guard.log.len()) as u64)
    }

    async fn purge_orphaned_probe_results(&self) -> StoreResult<u64> {
        let mut guard = self.write();
        let live_runs: std::collections::HashSet<Uuid> = guard.scan_runs.keys().copied().collect();
        let before: usize = guard.probe_results.values().map(Vec::len).sum();
        guard.probe_results.retain(|scan_run_id, _| live_runs.contains(scan_run_id));
        let after: usize = guard.probe_results.values().map(Vec::len).sum();
        Ok((before - after) as u64)
    }

    async fn reset_stale_failure_streaks(&self, before: DateTime<Utc>) -> StoreResult<u64> {
        let mut guard = self.write();
        let mut reset = 0u64;
        for target in guard.targets.values_mut() {
            if target.consecutive_failures > 0 && target.last_failure_at.is_some_and(|at| at < before) {
                target.consecutive_failures = 0;
                reset += 1;
            }
        }
        Ok(reset)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    use chrono::TimeZone;

    #[tokio::test]
    async fn lease_acquire_is_mutually_exclusive() {
        let store = MemoryStore::new();
        let n = now();
        let first = store
            .acquire_lease("dispatcher", "host-a", 30, n, serde_json::json!({}))
            .await
            .unwrap();
        assert!(first.is_some());

        let second = store
            .acquire_lease("dispatcher", "host-b", 30, n, serde_json::json!({}))
            .await
            .unwrap();
        assert!(second.is_none(), "second owner must not acquire a held lease");

        let reacquire = store
            .acquire_lease("dispatcher", "host-a", 30, n, serde_json::json!({}))
            .await
            .unwrap();
        assert!(reacquire.is_some(), "same owner re-acquire is idempotent");
    }

    #[tokio::test]
    async fn lease_expiry_allows_new_owner() {
        let store = MemoryStore::new();
        let n = now();
        store
            .acquire_lease("dispatcher", "host-a", 10, n, serde_json::json!({}))
            .await
            .unwrap();

        let later = n + chrono::Duration::seconds(11);
        let takeover = store
            .acquire_lease("dispatcher", "host-b", 10, later, serde_json::json!({}))
            .await
            .unwrap();
        assert!(takeover.is_some());
    }

    #[tokio::test]
    async fn escalation_insert_enforces_single_active() {
        let store = MemoryStore::new();
        let target_id = Uuid::new_v4();
        let esc = Escalation {
            id: Uuid::new_v4(),
            target_id,
            level: 1,
            trigger_reason: "first failure".into(),
            status: EscalationStatus::Active,
            created_at: now(),
            cooldown_until: now(),
            resolved_at: None,
            resolution_reason: None,
            notifications_record: vec![],
        };
        store.insert_escalation(esc.clone()).await.unwrap();

        let mut duplicate = esc;
        duplicate.id = Uuid::new_v4();
        let err = store.insert_escalation(duplicate).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn claim_jobs_orders_by_priority_then_fifo() {
        let store = MemoryStore::new();
        let n = now();
        for (priority, offset) in [(1, 0), (5, 1), (5, 0), (1, 2)] {
            store
                .enqueue_job(Job {
                    id: Uuid::new_v4(),
                    job_type: "notify".into(),
                    payload: serde_json::json!({"priority": priority, "offset": offset}),
                    priority,
                    status: JobStatus::Pending,
                    execute_at: n + chrono::Duration::seconds(offset),
                    retry_count: 0,
                    worker_id: None,
                    started_at: None,
                    created_at: n,
                })
                .await
                .unwrap();
        }

        let claimed = store
            .claim_jobs("worker-1", n + chrono::Duration::seconds(10), 10)
            .await
            .unwrap();
        let priorities: Vec<i16> = claimed.iter().map(|j| j.priority).collect();
        assert_eq!(priorities, vec![5, 5, 1, 1]);
        assert!(claimed.iter().all(|j| j.status == JobStatus::Processing));
    }

    #[tokio::test]
    async fn record_target_failure_increments_counters() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        store
            .insert_target(Target {
                id,
                name: "example".into(),
                url: "https://example.com".into(),
                active: true,
                scan_frequency: crate::models::ScanFrequency::Daily,
                next_scan_at: Some(now()),
                last_scan_at: None,
                consecutive_failures: 0,
                total_failures: 0,
                last_failure_at: None,
                last_error_category: None,
                status: TargetStatus::Active,
                retry_after: None,
                notification_channels: std::collections::HashMap::new(),
                created_at: now(),
            })
            .await
            .unwrap();

        let updated = store
            .record_target_failure(id, now(), "transient_io", None)
            .await
            .unwrap();
        assert_eq!(updated.consecutive_failures, 1);
        assert_eq!(updated.total_failures, 1);

        let updated = store
            .record_target_failure(id, now(), "transient_io", None)
            .await
            .unwrap();
        assert_eq!(updated.consecutive_failures, 2);
        assert_eq!(updated.total_failures, 2);

        let recovered = store
            .record_target_success(id, now(), Some(now()))
            .await
            .unwrap();
        assert_eq!(recovered.consecutive_failures, 0);
    }
}
