//! PostgreSQL-backed [`Store`] implementation.
//!
//! On connect we issue `CREATE TABLE IF NOT EXISTS` / `CREATE INDEX IF NOT
//! EXISTS` for every table up front rather than shipping a separate
//! migration runner, so a fresh database is usable immediately. Row-level
//! read-modify-write invariants (failure counters, lease ownership,
//! escalation uniqueness, job claiming) are expressed with
//! `SELECT ... FOR UPDATE` inside a transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::models::*;
use crate::traits::Store;

/// Thin wrapper around a `sqlx::PgPool`.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connects, creating the schema if it does not already exist.
    ///
    /// # Errors
    /// Returns [`StoreError::Open`] if the pool cannot be established, or
    /// [`StoreError::Database`] if schema creation fails.
    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Open(e.to_string()))?;

        let store = Self { pool };
        store.create_schema().await?;
        Ok(store)
    }

    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn create_schema(&self) -> StoreResult<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS targets (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL,
                url TEXT NOT NULL,
                active BOOLEAN NOT NULL DEFAULT TRUE,
                scan_frequency TEXT NOT NULL,
                next_scan_at TIMESTAMPTZ,
                last_scan_at TIMESTAMPTZ,
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                total_failures BIGINT NOT NULL DEFAULT 0,
                last_failure_at TIMESTAMPTZ,
                last_error_category TEXT,
                status TEXT NOT NULL DEFAULT 'active',
                retry_after TIMESTAMPTZ,
                notification_channels JSONB NOT NULL DEFAULT '{}',
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_targets_due \
             ON targets (next_scan_at, active) WHERE status = 'active'",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS scan_runs (
                id UUID PRIMARY KEY,
                target_id UUID NOT NULL REFERENCES targets(id),
                status TEXT NOT NULL,
                started_at TIMESTAMPTZ NOT NULL,
                ended_at TIMESTAMPTZ,
                total_probes INTEGER NOT NULL DEFAULT 0,
                passed INTEGER NOT NULL DEFAULT 0,
                failed INTEGER NOT NULL DEFAULT 0,
                execution_time_ms BIGINT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                next_retry_at TIMESTAMPTZ,
                error_summary TEXT
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_scan_runs_retryable \
             ON scan_runs (status, next_retry_at)",
        )
        .execute(&self.pool)
        .await?;
        // scan_runs has no separate created_at; started_at is the row's
        // creation instant and serves the same "history for a target,
        // newest first" lookup.
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_scan_runs_by_target \
             ON scan_runs (target_id, started_at DESC)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS probe_results (
                id UUID PRIMARY KEY,
                scan_run_id UUID NOT NULL REFERENCES scan_runs(id),
                probe_name TEXT NOT NULL,
                status TEXT NOT NULL,
                severity TEXT NOT NULL,
                message TEXT NOT NULL,
                evidence JSONB NOT NULL DEFAULT '{}',
                execution_time_ms BIGINT NOT NULL,
                started_at TIMESTAMPTZ NOT NULL,
                ended_at TIMESTAMPTZ NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_probe_results_scan_run \
             ON probe_results (scan_run_id)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS leases (
                name TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                acquired_at TIMESTAMPTZ NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL,
                last_heartbeat_at TIMESTAMPTZ NOT NULL,
                metadata JSONB NOT NULL DEFAULT '{}'
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS escalations (
                id UUID PRIMARY KEY,
                target_id UUID NOT NULL REFERENCES targets(id),
                level SMALLINT NOT NULL,
                trigger_reason TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                cooldown_until TIMESTAMPTZ NOT NULL,
                resolved_at TIMESTAMPTZ,
                resolution_reason TEXT,
                notifications_record JSONB NOT NULL DEFAULT '[]'
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_escalations_one_active \
             ON escalations (target_id) WHERE status = 'active'",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS notifications (
                id UUID PRIMARY KEY,
                channel TEXT NOT NULL,
                recipient TEXT NOT NULL,
                subject TEXT NOT NULL,
                body TEXT NOT NULL,
                status TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                next_retry_at TIMESTAMPTZ,
                last_error TEXT,
                metadata JSONB NOT NULL DEFAULT '{}',
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                sent_at TIMESTAMPTZ
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_notifications_pending \
             ON notifications (next_retry_at) WHERE status = 'pending'",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_notifications_recipient \
             ON notifications (recipient, status, created_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS jobs (
                id UUID PRIMARY KEY,
                job_type TEXT NOT NULL,
                payload JSONB NOT NULL DEFAULT '{}',
                priority SMALLINT NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                execute_at TIMESTAMPTZ NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                worker_id TEXT,
                started_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_jobs_claimable \
             ON jobs (status, priority DESC, created_at ASC)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS resource_samples (
                timestamp TIMESTAMPTZ NOT NULL,
                cpu_pct DOUBLE PRECISION NOT NULL,
                mem_pct DOUBLE PRECISION NOT NULL,
                disk_pct DOUBLE PRECISION NOT NULL,
                load1 DOUBLE PRECISION NOT NULL,
                active_db_conns BIGINT NOT NULL,
                concurrent_scans BIGINT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS scheduler_log (
                id UUID PRIMARY KEY,
                level TEXT NOT NULL,
                message TEXT NOT NULL,
                context JSONB NOT NULL DEFAULT '{}',
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn row_to_target(row: &sqlx::postgres::PgRow) -> StoreResult<Target> {
    let scan_frequency: String = row.try_get("scan_frequency")?;
    let status: String = row.try_get("status")?;
    let channels_json: serde_json::Value = row.try_get("notification_channels")?;
    Ok(Target {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        url: row.try_get("url")?,
        active: row.try_get("active")?,
        scan_frequency: parse_enum(&scan_frequency)?,
        next_scan_at: row.try_get("next_scan_at")?,
        last_scan_at: row.try_get("last_scan_at")?,
        consecutive_failures: row.try_get("consecutive_failures")?,
        total_failures: row.try_get("total_failures")?,
        last_failure_at: row.try_get("last_failure_at")?,
        last_error_category: row.try_get("last_error_category")?,
        status: parse_enum(&status)?,
        retry_after: row.try_get("retry_after")?,
        notification_channels: serde_json::from_value(channels_json)
            .map_err(|e| StoreError::InvalidRecord(e.to_string()))?,
        created_at: row.try_get("created_at")?,
    })
}

fn parse_enum<T: serde::de::DeserializeOwned>(raw: &str) -> StoreResult<T> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|e| StoreError::InvalidRecord(format!("invalid enum value {raw:?}: {e}")))
}

fn enum_str<T: serde::Serialize>(value: &T) -> StoreResult<String> {
    match serde_json::to_value(value).map_err(|e| StoreError::InvalidRecord(e.to_string()))? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(StoreError::InvalidRecord(format!(
            "expected string enum representation, got {other}"
        ))),
    }
}

#[async_trait]
impl Store for PgStore {
    async fn now(&self) -> StoreResult<DateTime<Utc>> {
        let row = sqlx::query("SELECT now() AS now").fetch_one(&self.pool).await?;
        Ok(row.try_get("now")?)
    }

    async fn get_target(&self, id: Uuid) -> StoreResult<Option<Target>> {
        let row = sqlx::query("SELECT * FROM targets WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_target).transpose()
    }

    async fn list_targets(&self) -> StoreResult<Vec<Target>> {
        let rows = sqlx::query("SELECT * FROM targets ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_target).collect()
    }

    async fn fetch_due_targets(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<Target>> {
        let rows = sqlx::query(
            "SELECT * FROM targets \
             WHERE active AND status = 'active' AND (next_scan_at IS NULL OR next_scan_at <= $1) \
             ORDER BY next_scan_at ASC NULLS FIRST, created_at ASC LIMIT $2",
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_target).collect()
    }

    async fn insert_target(&self, target: Target) -> StoreResult<()> {
        let channels = serde_json::to_value(&target.notification_channels)
            .map_err(|e| StoreError::InvalidRecord(e.to_string()))?;
        sqlx::query(
            "INSERT INTO targets (id, name, url, active, scan_frequency, next_scan_at, \
             last_scan_at, consecutive_failures, total_failures, last_failure_at, \
             last_error_category, status, retry_after, notification_channels, created_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15)",
        )
        .bind(target.id)
        .bind(target.name)
        .bind(target.url)
        .bind(target.active)
        .bind(enum_str(&target.scan_frequency)?)
        .bind(target.next_scan_at)
        .bind(target.last_scan_at)
        .bind(target.consecutive_failures)
        .bind(target.total_failures)
        .bind(target.last_failure_at)
        .bind(target.last_error_category)
        .bind(enum_str(&target.status)?)
        .bind(target.retry_after)
        .bind(channels)
        .bind(target.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_target_status(&self, id: Uuid, status: TargetStatus) -> StoreResult<()> {
        sqlx::query("UPDATE targets SET status = $1 WHERE id = $2")
            .bind(enum_str(&status)?)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_target_success(
        &self,
        id: Uuid,
        completed_at: DateTime<Utc>,
        next_scan_at: Option<DateTime<Utc>>,
    ) -> StoreResult<Target> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT * FROM targets WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("target {id}")))?;
        let mut target = row_to_target(&row)?;
        target.consecutive_failures = 0;
        target.last_scan_at = Some(completed_at);
        target.next_scan_at = next_scan_at;
        target.retry_after = None;

        sqlx::query(
            "UPDATE targets SET consecutive_failures = 0, last_scan_at = $1, \
             next_scan_at = $2, retry_after = NULL WHERE id = $3",
        )
        .bind(completed_at)
        .bind(next_scan_at)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(target)
    }

    async fn record_target_failure(
        &self,
        id: Uuid,
        failed_at: DateTime<Utc>,
        error_category: &str,
        retry_after: Option<DateTime<Utc>>,
    ) -> StoreResult<Target> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT * FROM targets WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("target {id}")))?;
        let mut target = row_to_target(&row)?;
        target.consecutive_failures += 1;
        target.total_failures += 1;
        target.last_failure_at = Some(failed_at);
        target.last_error_category = Some(error_category.to_string());
        target.retry_after = retry_after;

        sqlx::query(
            "UPDATE targets SET consecutive_failures = consecutive_failures + 1, \
             total_failures = total_failures + 1, last_failure_at = $1, \
             last_error_category = $2, retry_after = $3 WHERE id = $4",
        )
        .bind(failed_at)
        .bind(error_category)
        .bind(retry_after)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(target)
    }

    async fn insert_scan_run(&self, run: ScanRun) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO scan_runs (id, target_id, status, started_at, ended_at, total_probes, \
             passed, failed, execution_time_ms, retry_count, next_retry_at, error_summary) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12)",
        )
        .bind(run.id)
        .bind(run.target_id)
        .bind(enum_str(&run.status)?)
        .bind(run.started_at)
        .bind(run.ended_at)
        .bind(run.total_probes)
        .bind(run.passed)
        .bind(run.failed)
        .bind(run.execution_time_ms)
        .bind(run.retry_count)
        .bind(run.next_retry_at)
        .bind(run.error_summary)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_scan_run(&self, id: Uuid) -> StoreResult<Option<ScanRun>> {
        let row = sqlx::query("SELECT * FROM scan_runs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_scan_run).transpose()
    }

    async fn count_running_scan_runs(&self) -> StoreResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM scan_runs WHERE status = 'running'")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    async fn has_recent_running_scan_run(
        &self,
        target_id: Uuid,
        since: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM scan_runs \
             WHERE target_id = $1 AND status = 'running' AND started_at >= $2) AS exists_",
        )
        .bind(target_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("exists_")?)
    }

    async fn set_scan_run_status(
        &self,
        id: Uuid,
        status: ScanRunStatus,
        ended_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE scan_runs SET status = $1, ended_at = COALESCE($2, ended_at) WHERE id = $3",
        )
        .bind(enum_str(&status)?)
        .bind(ended_at)
        .bind(id)
        .execute(&self.pool)
        .await?;
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
        let row = sqlx::query(
            "UPDATE scan_runs SET status = $1, ended_at = $2, passed = $3, failed = $4, \
             total_probes = $3 + $4, execution_time_ms = $5, next_retry_at = $6, \
             error_summary = $7 WHERE id = $8 RETURNING *",
        )
        .bind(enum_str(&status)?)
        .bind(ended_at)
        .bind(passed)
        .bind(failed)
        .bind(execution_time_ms)
        .bind(next_retry_at)
        .bind(error_summary)
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        row_to_scan_run(&row)
    }

    async fn increment_scan_run_retry(&self, id: Uuid) -> StoreResult<i32> {
        let row = sqlx::query(
            "UPDATE scan_runs SET retry_count = retry_count + 1 WHERE id = $1 \
             RETURNING retry_count",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("retry_count")?)
    }

    async fn pause_queued_scan_runs(&self) -> StoreResult<u64> {
        let result = sqlx::query("UPDATE scan_runs SET status = 'paused' WHERE status = 'queued'")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn resume_paused_scan_runs(&self) -> StoreResult<u64> {
        let result = sqlx::query("UPDATE scan_runs SET status = 'queued' WHERE status = 'paused'")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn fetch_retryable_scan_runs(
        &self,
        now: DateTime<Utc>,
        created_after: DateTime<Utc>,
        max_retries: i32,
        limit: i64,
    ) -> StoreResult<Vec<ScanRun>> {
        let rows = sqlx::query(
            "SELECT * FROM scan_runs WHERE status = 'failed' AND next_retry_at <= $1 \
             AND started_at >= $2 AND retry_count < $3 \
             ORDER BY next_retry_at ASC LIMIT $4",
        )
        .bind(now)
        .bind(created_after)
        .bind(max_retries)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_scan_run).collect()
    }

    async fn insert_probe_result(&self, result: ProbeResult) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO probe_results (id, scan_run_id, probe_name, status, severity, message, \
             evidence, execution_time_ms, started_at, ended_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)",
        )
        .bind(result.id)
        .bind(result.scan_run_id)
        .bind(result.probe_name)
        .bind(enum_str(&result.status)?)
        .bind(enum_str(&result.severity)?)
        .bind(result.message)
        .bind(result.evidence)
        .bind(result.execution_time_ms)
        .bind(result.started_at)
        .bind(result.ended_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_probe_results(&self, scan_run_id: Uuid) -> StoreResult<Vec<ProbeResult>> {
        let rows =
            sqlx::query("SELECT * FROM probe_results WHERE scan_run_id = $1 ORDER BY started_at")
                .bind(scan_run_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(row_to_probe_result).collect()
    }

    async fn acquire_lease(
        &self,
        name: &str,
        owner: &str,
        ttl_seconds: i64,
        now: DateTime<Utc>,
        metadata: serde_json::Value,
    ) -> StoreResult<Option<LeaseInfo>> {
        let mut tx = self.pool.begin().await?;
        let existing = sqlx::query("SELECT * FROM leases WHERE name = $1 FOR UPDATE")
            .bind(name)
            .fetch_optional(&mut *tx)
            .await?;
        if let Some(row) = &existing {
            let expires_at: DateTime<Utc> = row.try_get("expires_at")?;
            let current_owner: String = row.try_get("owner")?;
            if expires_at > now && current_owner != owner {
                return Ok(None);
            }
        }
        let expires_at = now + chrono::Duration::seconds(ttl_seconds);
        sqlx::query(
            "INSERT INTO leases (name, owner, acquired_at, expires_at, last_heartbeat_at, metadata) \
             VALUES ($1,$2,$3,$4,$3,$5) \
             ON CONFLICT (name) DO UPDATE SET owner = $2, acquired_at = $3, expires_at = $4, \
             last_heartbeat_at = $3, metadata = $5",
        )
        .bind(name)
        .bind(owner)
        .bind(now)
        .bind(expires_at)
        .bind(&metadata)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(Some(LeaseInfo {
            name: name.to_string(),
            owner: owner.to_string(),
            acquired_at: now,
            expires_at,
            last_heartbeat_at: now,
            metadata,
        }))
    }

    async fn get_lease(&self, name: &str) -> StoreResult<Option<LeaseInfo>> {
        let row = sqlx::query("SELECT * FROM leases WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_lease).transpose()
    }

    async fn renew_lease(
        &self,
        name: &str,
        owner: &str,
        ttl_seconds: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE leases SET expires_at = $1, last_heartbeat_at = $2 \
             WHERE name = $3 AND owner = $4",
        )
        .bind(now + chrono::Duration::seconds(ttl_seconds))
        .bind(now)
        .bind(name)
        .bind(owner)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn release_lease(&self, name: &str, owner: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM leases WHERE name = $1 AND owner = $2")
            .bind(name)
            .bind(owner)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_active_escalation(&self, target_id: Uuid) -> StoreResult<Option<Escalation>> {
        let row = sqlx::query(
            "SELECT * FROM escalations WHERE target_id = $1 AND status = 'active'",
        )
        .bind(target_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_escalation).transpose()
    }

    async fn insert_escalation(&self, escalation: Escalation) -> StoreResult<()> {
        let notifications = serde_json::to_value(&escalation.notifications_record)
            .map_err(|e| StoreError::InvalidRecord(e.to_string()))?;
        sqlx::query(
            "INSERT INTO escalations (id, target_id, level, trigger_reason, status, created_at, \
             cooldown_until, resolved_at, resolution_reason, notifications_record) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)",
        )
        .bind(escalation.id)
        .bind(escalation.target_id)
        .bind(i16::from(escalation.level))
        .bind(escalation.trigger_reason)
        .bind(enum_str(&escalation.status)?)
        .bind(escalation.created_at)
        .bind(escalation.cooldown_until)
        .bind(escalation.resolved_at)
        .bind(escalation.resolution_reason)
        .bind(notifications)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(db) = &e {
                if db.is_unique_violation() {
                    return StoreError::Conflict(format!(
                        "target already has an active escalation: {e}"
                    ));
                }
            }
            StoreError::Database(e)
        })?;
        Ok(())
    }

    async fn bump_escalation_level(
        &self,
        id: Uuid,
        level: u8,
        trigger_reason: &str,
        cooldown_until: DateTime<Utc>,
    ) -> StoreResult<Escalation> {
        let row = sqlx::query(
            "UPDATE escalations SET level = $1, trigger_reason = $2, cooldown_until = $3 \
             WHERE id = $4 RETURNING *",
        )
        .bind(i16::from(level))
        .bind(trigger_reason)
        .bind(cooldown_until)
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        row_to_escalation(&row)
    }

    async fn resolve_escalation(
        &self,
        id: Uuid,
        resolved_at: DateTime<Utc>,
        reason: &str,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE escalations SET status = 'resolved', resolved_at = $1, \
             resolution_reason = $2 WHERE id = $3",
        )
        .bind(resolved_at)
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_escalation_notification(
        &self,
        id: Uuid,
        notification_id: Uuid,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE escalations SET notifications_record = notifications_record || $1 \
             WHERE id = $2",
        )
        .bind(serde_json::json!([notification_id]))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_escalations_by_status(
        &self,
        status: EscalationStatus,
    ) -> StoreResult<Vec<Escalation>> {
        let rows = sqlx::query("SELECT * FROM escalations WHERE status = $1")
            .bind(enum_str(&status)?)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_escalation).collect()
    }

    async fn insert_notification(&self, notification: Notification) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO notifications (id, channel, recipient, subject, body, status, \
             attempts, next_retry_at, last_error, metadata, created_at, sent_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12)",
        )
        .bind(notification.id)
        .bind(enum_str(&notification.channel)?)
        .bind(notification.recipient)
        .bind(notification.subject)
        .bind(notification.body)
        .bind(enum_str(&notification.status)?)
        .bind(notification.attempts)
        .bind(notification.next_retry_at)
        .bind(notification.last_error)
        .bind(notification.metadata)
        .bind(notification.created_at)
        .bind(notification.sent_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_notification_sent(&self, id: Uuid, sent_at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query(
            "UPDATE notifications SET status = 'sent', sent_at = $1, next_retry_at = NULL \
             WHERE id = $2",
        )
        .bind(sent_at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_notification_failed(
        &self,
        id: Uuid,
        error: &str,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let status = if next_retry_at.is_some() {
            "pending"
        } else {
            "failed"
        };
        sqlx::query(
            "UPDATE notifications SET attempts = attempts + 1, last_error = $1, \
             next_retry_at = $2, status = $3 WHERE id = $4",
        )
        .bind(error)
        .bind(next_retry_at)
        .bind(status)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn cancel_notification(&self, id: Uuid) -> StoreResult<()> {
        sqlx::query("UPDATE notifications SET status = 'cancelled' WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fetch_pending_notifications(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<Notification>> {
        let rows = sqlx::query(
            "SELECT * FROM notifications \
             WHERE status = 'pending' AND (next_retry_at IS NULL OR next_retry_at <= $1) \
             ORDER BY created_at ASC LIMIT $2",
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_notification).collect()
    }

    async fn count_notifications_since(
        &self,
        recipient: &str,
        status: NotificationStatus,
        since: DateTime<Utc>,
    ) -> StoreResult<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM notifications \
             WHERE recipient = $1 AND status = $2 AND created_at >= $3",
        )
        .bind(recipient)
        .bind(enum_str(&status)?)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("n")?)
    }

    async fn enqueue_job(&self, job: Job) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO jobs (id, job_type, payload, priority, status, execute_at, \
             retry_count, worker_id, started_at, created_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)",
        )
        .bind(job.id)
        .bind(job.job_type)
        .bind(job.payload)
        .bind(job.priority)
        .bind(enum_str(&job.status)?)
        .bind(job.execute_at)
        .bind(job.retry_count)
        .bind(job.worker_id)
        .bind(job.started_at)
        .bind(job.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn claim_jobs(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<Job>> {
        let rows = sqlx::query(
            "WITH claimed AS ( \
                SELECT id FROM jobs \
                WHERE status = 'pending' AND execute_at <= $1 \
                ORDER BY priority DESC, created_at ASC \
                LIMIT $2 \
                FOR UPDATE SKIP LOCKED \
             ) \
             UPDATE jobs SET status = 'processing', worker_id = $3, started_at = $1 \
             WHERE id IN (SELECT id FROM claimed) \
             RETURNING *",
        )
        .bind(now)
        .bind(limit)
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_job).collect()
    }

    async fn complete_job(&self, id: Uuid) -> StoreResult<()> {
        sqlx::query("UPDATE jobs SET status = 'completed' WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fail_job(
        &self,
        id: Uuid,
        retry_count: i32,
        execute_at: Option<DateTime<Utc>>,
        dead: bool,
    ) -> StoreResult<()> {
        if dead {
            sqlx::query("UPDATE jobs SET status = 'dead', retry_count = $1 WHERE id = $2")
                .bind(retry_count)
                .bind(id)
                .execute(&self.pool)
                .await?;
        } else if let Some(at) = execute_at {
            sqlx::query(
                "UPDATE jobs SET status = 'pending', retry_count = $1, execute_at = $2, \
                 worker_id = NULL, started_at = NULL WHERE id = $3",
            )
            .bind(retry_count)
            .bind(at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query("UPDATE jobs SET status = 'failed', retry_count = $1 WHERE id = $2")
                .bind(retry_count)
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn fetch_stale_jobs(
        &self,
        stale_after: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE status = 'processing' AND started_at <= $1 \
             ORDER BY started_at ASC LIMIT $2",
        )
        .bind(stale_after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_job).collect()
    }

    async fn requeue_job(&self, id: Uuid, execute_at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query(
            "UPDATE jobs SET status = 'pending', execute_at = $1, worker_id = NULL, \
             started_at = NULL WHERE id = $2",
        )
        .bind(execute_at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn purge_jobs(&self, status: JobStatus, older_than: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM jobs WHERE status = $1 AND created_at < $2")
            .bind(enum_str(&status)?)
            .bind(older_than)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn insert_resource_sample(&self, sample: ResourceSample) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO resource_samples (timestamp, cpu_pct, mem_pct, disk_pct, load1, \
             active_db_conns, concurrent_scans) VALUES ($1,$2,$3,$4,$5,$6,$7)",
        )
        .bind(sample.timestamp)
        .bind(sample.cpu_pct)
        .bind(sample.mem_pct)
        .bind(sample.disk_pct)
        .bind(sample.load1)
        .bind(sample.active_db_conns)
        .bind(sample.concurrent_scans)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_resource_samples(
        &self,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<ResourceSample>> {
        let rows = sqlx::query(
            "SELECT * FROM resource_samples WHERE timestamp >= $1 ORDER BY timestamp ASC",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(ResourceSample {
                    timestamp: row.try_get("timestamp")?,
                    cpu_pct: row.try_get("cpu_pct")?,
                    mem_pct: row.try_get("mem_pct")?,
                    disk_pct: row.try_get("disk_pct")?,
                    load1: row.try_get("load1")?,
                    active_db_conns: row.try_get("active_db_conns")?,
                    concurrent_scans: row.try_get("concurrent_scans")?,
                })
            })
            .collect()
    }

    async fn pool_size(&self) -> StoreResult<i64> {
        Ok(i64::from(self.pool.size()))
    }

    async fn append_log(&self, entry: SchedulerLogEntry) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO scheduler_log (id, level, message, context, created_at) \
             VALUES ($1,$2,$3,$4,$5)",
        )
        .bind(entry.id)
        .bind(entry.level)
        .bind(entry.message)
        .bind(entry.context)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_logs(&self, limit: i64) -> StoreResult<Vec<SchedulerLogEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM scheduler_log ORDER BY created_at DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(SchedulerLogEntry {
                    id: row.try_get("id")?,
                    level: row.try_get("level")?,
                    message: row.try_get("message")?,
                    context: row.try_get("context")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    async fn purge_old_logs(&self, older_than: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM scheduler_log WHERE created_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn purge_orphaned_probe_results(&self) -> StoreResult<u64> {
        let result = sqlx::query(
            "DELETE FROM probe_results pr WHERE NOT EXISTS \
             (SELECT 1 FROM scan_runs sr WHERE sr.id = pr.scan_run_id)",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn reset_stale_failure_streaks(&self, before: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE targets SET consecutive_failures = 0 \
             WHERE consecutive_failures > 0 AND last_failure_at < $1",
        )
        .bind(before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn row_to_scan_run(row: &sqlx::postgres::PgRow) -> StoreResult<ScanRun> {
    let status: String = row.try_get("status")?;
    Ok(ScanRun {
        id: row.try_get("id")?,
        target_id: row.try_get("target_id")?,
        status: parse_enum(&status)?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
        total_probes: row.try_get("total_probes")?,
        passed: row.try_get("passed")?,
        failed: row.try_get("failed")?,
        execution_time_ms: row.try_get("execution_time_ms")?,
        retry_count: row.try_get("retry_count")?,
        next_retry_at: row.try_get("next_retry_at")?,
        error_summary: row.try_get("error_summary")?,
    })
}

fn row_to_probe_result(row: &sqlx::postgres::PgRow) -> StoreResult<ProbeResult> {
    let status: String = row.try_get("status")?;
    let severity: String = row.try_get("severity")?;
    Ok(ProbeResult {
        id: row.try_get("id")?,
        scan_run_id: row.try_get("scan_run_id")?,
        probe_name: row.try_get("probe_name")?,
        status: parse_enum(&status)?,
        severity: parse_enum(&severity)?,
        message: row.try_get("message")?,
        evidence: row.try_get("evidence")?,
        execution_time_ms: row.try_get("execution_time_ms")?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
    })
}

fn row_to_lease(row: &sqlx::postgres::PgRow) -> StoreResult<LeaseInfo> {
    Ok(LeaseInfo {
        name: row.try_get("name")?,
        owner: row.try_get("owner")?,
        acquired_at: row.try_get("acquired_at")?,
        expires_at: row.try_get("expires_at")?,
        last_heartbeat_at: row.try_get("last_heartbeat_at")?,
        metadata: row.try_get("metadata")?,
    })
}

fn row_to_escalation(row: &sqlx::postgres::PgRow) -> StoreResult<Escalation> {
    let status: String = row.try_get("status")?;
    let level: i16 = row.try_get("level")?;
    let notifications: serde_json::Value = row.try_get("notifications_record")?;
    Ok(Escalation {
        id: row.try_get("id")?,
        target_id: row.try_get("target_id")?,
        level: u8::try_from(level).unwrap_or(u8::MAX),
        trigger_reason: row.try_get("trigger_reason")?,
        status: parse_enum(&status)?,
        created_at: row.try_get("created_at")?,
        cooldown_until: row.try_get("cooldown_until")?,
        resolved_at: row.try_get("resolved_at")?,
        resolution_reason: row.try_get("resolution_reason")?,
        notifications_record: serde_json::from_value(notifications)
            .map_err(|e| StoreError::InvalidRecord(e.to_string()))?,
    })
}

fn row_to_notification(row: &sqlx::postgres::PgRow) -> StoreResult<Notification> {
    let channel: String = row.try_get("channel")?;
    let status: String = row.try_get("status")?;
    Ok(Notification {
        id: row.try_get("id")?,
        channel: parse_enum(&channel)?,
        recipient: row.try_get("recipient")?,
        subject: row.try_get("subject")?,
        body: row.try_get("body")?,
        status: parse_enum(&status)?,
        attempts: row.try_get("attempts")?,
        next_retry_at: row.try_get("next_retry_at")?,
        last_error: row.try_get("last_error")?,
        metadata: row.try_get("metadata")?,
        created_at: row.try_get("created_at")?,
        sent_at: row.try_get("sent_at")?,
    })
}

fn row_to_job(row: &sqlx::postgres::PgRow) -> StoreResult<Job> {
    let status: String = row.try_get("status")?;
    Ok(Job {
        id: row.try_get("id")?,
        job_type: row.try_get("job_type")?,
        payload: row.try_get("payload")?,
        priority: row.try_get("priority")?,
        status: parse_enum(&status)?,
        execute_at: row.try_get("execute_at")?,
        retry_count: row.try_get("retry_count")?,
        worker_id: row.try_get("worker_id")?,
        started_at: row.try_get("started_at")?,
        created_at: row.try_get("created_at")?,
    })
}
