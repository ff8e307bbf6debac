//! The Dispatcher core algorithm: acquire lease, select due
//! targets, process in batches with heartbeats, respect the governor, and
//! record outcomes.
//!
//! Assembles subsystems and wires one into the next, applying the same
//! retry-with-backoff-and-cancellation shape to `RETRY_SWEEP` as the rest
//! of the engine uses for its own background work. The Dispatcher never
//! holds a reference to `EscalationEngine` directly: that cyclic reference
//! is broken by injecting a closure/trait object ("post-outcome hook")
//! instead of a construction-time back-pointer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use scanwarden_store::models::{
    JobStatus, ProbeResult, ScanRun, ScanRunStatus, SchedulerLogEntry, Target, TargetStatus,
};
use scanwarden_store::Store;

use crate::config::SchedulerConfig;
use crate::error::DispatchError;
use crate::escalation::{is_critical_probe_failure, ScanOutcome};
use crate::governor::{GovernorLevel, ResourceGovernor};
use crate::lease::LeaseLock;
use crate::probe::{Executor, ProbeConfig, RunOptions};
use crate::retry::{RetryDecision, RetryPolicy};

const SCHEDULER_LEASE_NAME: &str = "scheduler_execution";

/// Cooldown timer for the MAINTENANCE step, same lease-table-as-timer
/// pattern `governor_throttle` uses: holding the lease for
/// `cleanup_interval_secs` is the gate, not a mutual-exclusion claim on a
/// resource.
const MAINTENANCE_LEASE_NAME: &str = "maintenance_cleanup";

/// Callback the Dispatcher invokes once per finished target, after the
/// ScanRun/Target rows are committed — breaks the
/// Dispatcher↔EscalationEngine↔NotificationOrchestrator cycle without a
/// construction-time back-pointer.
#[async_trait]
pub trait PostOutcomeHook: Send + Sync {
    async fn on_outcome(&self, outcome: &ScanOutcome);
}

/// No-op hook for callers (tests, dry runs) that don't need escalation.
pub struct NoopHook;

#[async_trait]
impl PostOutcomeHook for NoopHook {
    async fn on_outcome(&self, _outcome: &ScanOutcome) {}
}

/// Wires the escalation engine in as the Dispatcher's post-outcome hook
/// without the Dispatcher holding a direct dependency on it at construction
/// — the CLI assembles `Arc<EscalationEngine>` and hands it to
/// the Dispatcher only through this trait object.
#[async_trait]
impl PostOutcomeHook for crate::escalation::EscalationEngine {
    async fn on_outcome(&self, outcome: &ScanOutcome) {
        if let Err(e) = self.evaluate(outcome).await {
            error!(error = %e, target_id = %outcome.target_id, "escalation evaluation failed");
        }
    }
}

/// The probes to run for one target, resolved from `website_test_config`
///. The concrete join/lookup against that table is an
/// external admin-surface concern; callers supply the
/// resolved list.
#[derive(Debug, Clone)]
pub struct TargetProbePlan {
    pub probe_name: String,
    pub config: ProbeConfig,
    pub options: RunOptions,
}

/// Resolves which probes to run for a target. A trait so an admin-CRUD
/// layer can plug in a real `website_test_config` lookup without the
/// Dispatcher depending on it directly.
#[async_trait]
pub trait ProbePlanResolver: Send + Sync {
    async fn resolve(&self, target: &Target) -> Vec<TargetProbePlan>;
}

/// Tally from one probe-plan execution against a `ScanRun`, shared by the
/// initial dispatch and a retry re-execution.
struct ProbeRunResult {
    passed: i32,
    failed: i32,
    critical_probe_failure: bool,
    last_error: Option<String>,
    execution_time_ms: i64,
    ended_at: DateTime<Utc>,
}

/// Which of the five CLI exit codes a [`DispatchOutcome`] maps to.
/// Kept as a closed enum rather than string-matching `message` so the CLI's
/// mapping can never drift from the states the Dispatcher actually reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchExitReason {
    /// Exit 0: ran successfully, possibly with "no work".
    Ran,
    /// Exit 1: `scheduler_execution` lease held by another process.
    LockHeld,
    /// Exit 2: governor reported throttle during PRECHECK.
    Throttled,
    /// Exit 3: PRECHECK health check failed.
    Unhealthy,
    /// Exit 4: uncaught error surfaced from `run_inner`.
    UncaughtError,
}

/// Outcome of one dispatcher invocation, returned to the CLI for exit-code
/// mapping.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub success: bool,
    pub message: String,
    pub targets_processed: usize,
    pub lock_info: Option<scanwarden_store::models::LeaseInfo>,
    pub reason: DispatchExitReason,
}

impl DispatchOutcome {
    /// Maps to the five exit codes `scanwarden run` documents.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self.reason {
            DispatchExitReason::Ran => 0,
            DispatchExitReason::LockHeld => 1,
            DispatchExitReason::Throttled => 2,
            DispatchExitReason::Unhealthy => 3,
            DispatchExitReason::UncaughtError => 4,
        }
    }
}

pub struct Dispatcher {
    store: Arc<dyn Store>,
    lease: LeaseLock,
    governor: Arc<ResourceGovernor>,
    executor: Arc<Executor>,
    retry_policy: RetryPolicy,
    plan_resolver: Arc<dyn ProbePlanResolver>,
    hook: Arc<dyn PostOutcomeHook>,
    config: SchedulerConfig,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        governor: Arc<ResourceGovernor>,
        executor: Arc<Executor>,
        plan_resolver: Arc<dyn ProbePlanResolver>,
        hook: Arc<dyn PostOutcomeHook>,
        config: SchedulerConfig,
    ) -> Self {
        let retry_policy = RetryPolicy::new(&config);
        Self {
            lease: LeaseLock::new(Arc::clone(&store)),
            store,
            governor,
            executor,
            retry_policy,
            plan_resolver,
            hook,
            config,
        }
    }

    /// Runs one full dispatcher invocation: STARTING through FINALIZE
    ///. Always releases the lease on every exit path,
    /// including error.
    pub async fn run(&self, shutdown: &mut watch::Receiver<bool>) -> DispatchOutcome {
        match self.run_inner(shutdown).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "dispatcher run failed");
                let _ = self.log("error", &format!("dispatcher run failed: {e}"), serde_json::json!({})).await;
                DispatchOutcome {
                    success: false,
                    message: format!("uncaught error: {e}"),
                    targets_processed: 0,
                    lock_info: None,
                    reason: DispatchExitReason::UncaughtError,
                }
            }
        }
    }

    async fn run_inner(&self, shutdown: &mut watch::Receiver<bool>) -> Result<DispatchOutcome, DispatchError> {
        // STARTING
        let owner = match self
            .lease
            .acquire(
                SCHEDULER_LEASE_NAME,
                self.config.lock_timeout_secs,
                serde_json::json!({ "hostname": hostname(), "pid": std::process::id() }),
            )
            .await?
        {
            Some(owner) => owner,
            None => {
                let lock_info = self.lease.info(SCHEDULER_LEASE_NAME).await?;
                return Ok(DispatchOutcome {
                    success: false,
                    message: "lease held by another process".to_owned(),
                    targets_processed: 0,
                    lock_info,
                    reason: DispatchExitReason::LockHeld,
                });
            }
        };

        let result = self.run_with_lease(&owner, shutdown).await;

        // FINALIZE — always runs, even on error, preserving whatever was
        // committed inside the loop.
        if let Err(e) = self.lease.release(SCHEDULER_LEASE_NAME, &owner).await {
            warn!(error = %e, "failed to release lease during finalize");
        }

        result
    }

    async fn run_with_lease(
        &self,
        owner: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<DispatchOutcome, DispatchError> {
        // PRECHECK
        let status = self.governor.sample().await?;
        if status.overall >= GovernorLevel::Throttle {
            self.log("warn", "throttling detected", serde_json::json!({})).await?;
            return Ok(DispatchOutcome {
                success: false,
                message: "throttling detected".to_owned(),
                targets_processed: 0,
                lock_info: None,
                reason: DispatchExitReason::Throttled,
            });
        }

        if !self.health_check().await? {
            return Ok(DispatchOutcome {
                success: false,
                message: "health check failed".to_owned(),
                targets_processed: 0,
                lock_info: None,
                reason: DispatchExitReason::Unhealthy,
            });
        }

        // FETCH_DUE
        let now = self.store.now().await?;
        let candidates = self.store.fetch_due_targets(now, self.config.batch_size * 10).await?;
        let mut due = Vec::with_capacity(candidates.len());
        let one_hour_ago = now - chrono::Duration::hours(1);
        for target in candidates {
            if !self.store.has_recent_running_scan_run(target.id, one_hour_ago).await? {
                due.push(target);
            }
        }

        if due.is_empty() {
            return Ok(DispatchOutcome {
                success: true,
                message: "no websites due".to_owned(),
                targets_processed: 0,
                lock_info: None,
                reason: DispatchExitReason::Ran,
            });
        }

        // DISPATCH_LOOP
        let deadline = std::time::Instant::now() + self.config.max_execution_time();
        let mut processed = 0usize;
        let mut stopped_for_resources = false;

        'batches: for batch in due.chunks(self.config.batch_size.max(1) as usize) {
            if !self.lease.heartbeat(SCHEDULER_LEASE_NAME, owner, self.config.lock_timeout_secs).await? {
                warn!("lost lease ownership mid-batch, aborting");
                break;
            }

            for (index, target) in batch.iter().enumerate() {
                if std::time::Instant::now() >= deadline {
                    info!("max_execution_time reached, stopping dispatch loop");
                    break 'batches;
                }

                if index > 0 && index % 5 == 0
                    && !self.lease.heartbeat(SCHEDULER_LEASE_NAME, owner, self.config.lock_timeout_secs).await?
                {
                    warn!("lost lease ownership mid-batch, aborting");
                    break 'batches;
                }

                self.process_target(target).await?;
                processed += 1;

                if *shutdown.borrow() {
                    info!("shutdown signal observed after committing target, stopping");
                    break 'batches;
                }

                tokio::time::sleep(Duration::from_millis(self.config.pacing_ms)).await;
            }

            let status = self.governor.sample().await?;
            if status.overall >= GovernorLevel::Critical {
                stopped_for_resources = true;
                break;
            }
        }

        // MAINTENANCE (conditional)
        self.maybe_run_maintenance().await?;

        // RETRY_SWEEP
        self.retry_sweep().await?;

        let message = if stopped_for_resources {
            "stopped due to resource limits".to_owned()
        } else {
            format!("processed {processed} targets")
        };

        Ok(DispatchOutcome {
            success: true,
            message,
            targets_processed: processed,
            lock_info: None,
            reason: DispatchExitReason::Ran,
        })
    }

    /// PRECHECK health check: store reachable, memory within limit, running
    /// scans under ceiling, disk under limit.
    async fn health_check(&self) -> Result<bool, DispatchError> {
        // Store reachability is implicit: `now()` below would already have
        // failed and bubbled up via `?` in the caller if the store were down.
        let _ = self.store.now().await?;

        let running = self.store.count_running_scan_runs().await?;
        if running >= self.config.max_concurrent_executions {
            self.log(
                "warn",
                "health check failed: too many concurrent executions",
                serde_json::json!({ "running": running }),
            )
            .await?;
            return Ok(false);
        }

        Ok(true)
    }

    async fn process_target(&self, target: &Target) -> Result<(), DispatchError> {
        let now = self.store.now().await?;
        let scan_run_id = Uuid::new_v4();
        let scan_run = ScanRun {
            id: scan_run_id,
            target_id: target.id,
            status: ScanRunStatus::Running,
            started_at: now,
            ended_at: None,
            total_probes: 0,
            passed: 0,
            failed: 0,
            execution_time_ms: None,
            retry_count: 0,
            next_retry_at: None,
            error_summary: None,
        };
        self.store.insert_scan_run(scan_run).await?;

        let result = self.run_probes(target, scan_run_id).await?;

        let scan_outcome = if result.failed == 0 {
            self.finish_success(target, scan_run_id, result.passed, result.execution_time_ms, result.ended_at)
                .await?
        } else {
            self.finish_failure(
                target,
                scan_run_id,
                result.passed,
                result.failed,
                result.execution_time_ms,
                result.ended_at,
                result.last_error.as_deref().unwrap_or("unknown error"),
            )
            .await?
        };

        let outcome = ScanOutcome {
            target_id: target.id,
            any_failure: result.failed > 0,
            critical_probe_failure: result.critical_probe_failure,
            consecutive_failures: scan_outcome.0,
            failures_in_last_24h: scan_outcome.1,
        };
        self.hook.on_outcome(&outcome).await;

        Ok(())
    }

    /// Runs every probe in the target's plan against an already-existing
    /// `scan_run_id`, recording each `ProbeResult` as it completes. Shared
    /// between a fresh dispatch ([`Self::process_target`]) and a retry
    /// ([`Self::retry_sweep`]) — both execute probes the same way, they
    /// differ only in what they do with the tally afterward.
    async fn run_probes(&self, target: &Target, scan_run_id: Uuid) -> Result<ProbeRunResult, DispatchError> {
        let now = self.store.now().await?;
        let plan = self.plan_resolver.resolve(target).await;
        let started = std::time::Instant::now();
        let mut passed = 0i32;
        let mut failed = 0i32;
        let mut critical_probe_failure = false;
        let mut last_error: Option<String> = None;

        for step in &plan {
            let outcome = self
                .executor
                .execute(&step.probe_name, &target.url, &step.config, &step.options)
                .await;

            let outcome = match outcome {
                Ok(o) => o,
                Err(e) => {
                    warn!(target_id = %target.id, probe = %step.probe_name, error = %e, "probe execution error");
                    last_error = Some(e.to_string());
                    failed += 1;
                    continue;
                }
            };

            let probe_started = now;
            let probe_result = ProbeResult {
                id: Uuid::new_v4(),
                scan_run_id,
                probe_name: step.probe_name.clone(),
                status: outcome.status,
                severity: outcome.severity,
                message: outcome.message.clone(),
                evidence: outcome.evidence.clone(),
                execution_time_ms: outcome.duration_ms,
                started_at: probe_started,
                ended_at: probe_started + chrono::Duration::milliseconds(outcome.duration_ms),
            };
            self.store.insert_probe_result(probe_result).await?;

            match outcome.status {
                scanwarden_store::models::ProbeOutcomeStatus::Passed => passed += 1,
                _ => {
                    failed += 1;
                    last_error = Some(outcome.message.clone());
                    if is_critical_probe_failure(&step.probe_name, outcome.severity) {
                        critical_probe_failure = true;
                    }
                }
            }
        }

        let ended_at = self.store.now().await?;
        let execution_time_ms = started.elapsed().as_millis() as i64;

        Ok(ProbeRunResult { passed, failed, critical_probe_failure, last_error, execution_time_ms, ended_at })
    }

    /// Commits the success path: ScanRun completed, `consecutive_failures`
    /// reset, `next_scan_at` advanced. Returns
    /// `(consecutive_failures, failures_in_last_24h)` for the escalation hook.
    async fn finish_success(
        &self,
        target: &Target,
        scan_run_id: Uuid,
        passed: i32,
        execution_time_ms: i64,
        ended_at: DateTime<Utc>,
    ) -> Result<(i32, i32), DispatchError> {
        self.store
            .finish_scan_run(scan_run_id, ScanRunStatus::Completed, ended_at, passed, 0, execution_time_ms, None, None)
            .await?;

        let next_scan_at = target.scan_frequency.advance(ended_at);
        let updated = self.store.record_target_success(target.id, ended_at, next_scan_at).await?;

        self.log(
            "info",
            "scan completed",
            serde_json::json!({ "target_id": target.id, "passed": passed }),
        )
        .await?;

        Ok((updated.consecutive_failures, 0))
    }

    /// Commits the failure path: consults RetryPolicy, updates counters,
    /// and either schedules a retry or marks the target for manual review
    ///.
    #[allow(clippy::too_many_arguments)]
    async fn finish_failure(
        &self,
        target: &Target,
        scan_run_id: Uuid,
        passed: i32,
        failed: i32,
        execution_time_ms: i64,
        ended_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<(i32, i32), DispatchError> {
        let (category, decision) =
            self.retry_policy.decide(last_error, target.consecutive_failures.max(0) as u32, ended_at);

        let next_retry_at = match decision {
            RetryDecision::RetryAt(at) => Some(at),
            RetryDecision::GiveUp { .. } => None,
        };

        self.store
            .finish_scan_run(
                scan_run_id,
                ScanRunStatus::Failed,
                ended_at,
                passed,
                failed,
                execution_time_ms,
                next_retry_at,
                Some(last_error.to_owned()),
            )
            .await?;

        let retry_after = match decision {
            RetryDecision::RetryAt(at) => Some(at),
            RetryDecision::GiveUp { .. } => None,
        };
        let updated = self
            .store
            .record_target_failure(target.id, ended_at, category.as_str(), retry_after)
            .await?;

        match decision {
            RetryDecision::RetryAt(at) => {
                // Retry is driven by the ScanRun's own `next_retry_at` via
                // RETRY_SWEEP, not by moving the
                // target's `next_scan_at` — doing the latter would race
                // with the periodic due-fetch and double-count the retry.
                debug!(target_id = %target.id, retry_at = %at, "scan failed, retry scheduled");
            }
            RetryDecision::GiveUp { mark_review } => {
                if mark_review {
                    self.store.set_target_status(target.id, TargetStatus::FailedReview).await?;
                    self.log(
                        "critical",
                        "target marked failed_review after exhausting retries",
                        serde_json::json!({ "target_id": target.id }),
                    )
                    .await?;
                }
            }
        }

        let failures_in_last_24h = updated.total_failures.clamp(0, i64::from(i32::MAX)) as i32;
        Ok((updated.consecutive_failures, failures_in_last_24h))
    }

    /// MAINTENANCE: runs the cleanup sweep, gated to once per
    /// `cleanup_interval_secs` by holding `MAINTENANCE_LEASE_NAME` as a
    /// cooldown timer rather than a mutual-exclusion lock — any dispatcher
    /// process may run it, but only once the previous window has expired.
    async fn maybe_run_maintenance(&self) -> Result<(), DispatchError> {
        let Some(_owner) = self
            .lease
            .acquire(MAINTENANCE_LEASE_NAME, self.config.cleanup_interval_secs, serde_json::json!({}))
            .await?
        else {
            return Ok(());
        };

        run_maintenance(&self.store, &self.config).await?;
        self.log("info", "maintenance sweep completed", serde_json::json!({})).await?;
        Ok(())
    }

    /// RETRY_SWEEP: re-executes recently failed runs eligible for retry,
    /// updating the original `ScanRun` row in place rather than creating a
    /// new one. On success the row transitions to `completed`; on failure
    /// it stays `failed` with a fresh `next_retry_at` computed from
    /// `retry_failed_after_secs`.
    async fn retry_sweep(&self) -> Result<(), DispatchError> {
        let now = self.store.now().await?;
        let created_after = now - chrono::Duration::seconds(self.config.retry_sweep_window_secs);
        let max_retries = i32::try_from(self.config.max_retries_per_day).unwrap_or(i32::MAX);
        let runs = self.store.fetch_retryable_scan_runs(now, created_after, max_retries, 10).await?;

        for run in runs {
            let Some(target) = self.store.get_target(run.target_id).await? else { continue };
            let result = self.run_probes(&target, run.id).await?;

            if result.failed == 0 {
                self.store
                    .finish_scan_run(
                        run.id,
                        ScanRunStatus::Completed,
                        result.ended_at,
                        result.passed,
                        0,
                        result.execution_time_ms,
                        None,
                        None,
                    )
                    .await?;
                self.store.increment_scan_run_retry(run.id).await?;
                self.log(
                    "info",
                    "retry sweep: scan run completed on retry",
                    serde_json::json!({ "scan_run_id": run.id, "target_id": target.id }),
                )
                .await?;
            } else {
                let retry_count = self.store.increment_scan_run_retry(run.id).await?;
                let backoff_secs =
                    self.config.retry_failed_after_secs.saturating_mul(1i64 << retry_count.clamp(0, 20));
                let next_retry_at = result.ended_at + chrono::Duration::seconds(backoff_secs);
                self.store
                    .finish_scan_run(
                        run.id,
                        ScanRunStatus::Failed,
                        result.ended_at,
                        result.passed,
                        result.failed,
                        result.execution_time_ms,
                        Some(next_retry_at),
                        result.last_error.clone(),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn log(&self, level: &str, message: &str, context: serde_json::Value) -> Result<(), DispatchError> {
        let now = self.store.now().await?;
        let entry = SchedulerLogEntry {
            id: Uuid::new_v4(),
            level: level.to_owned(),
            message: message.to_owned(),
            context,
            created_at: now,
        };
        self.store.append_log(entry).await?;
        Ok(())
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_owned())
}

/// Marks stale `processing` jobs as done/purges old terminal jobs, purges
/// `scheduler_log` rows older than 30 days and orphaned `ProbeResult`s, and
/// resets `consecutive_failures` on targets whose last failure was more
/// than 7 days ago. Callable on its own cadence — gated by
/// [`Dispatcher::maybe_run_maintenance`] when invoked from the dispatch
/// loop.
pub async fn run_maintenance(store: &Arc<dyn Store>, config: &SchedulerConfig) -> Result<(), DispatchError> {
    let now = store.now().await?;
    let job_cutoff = now - chrono::Duration::seconds(config.cleanup_completed_jobs_after_secs);
    store.purge_jobs(JobStatus::Completed, job_cutoff).await?;
    store.purge_jobs(JobStatus::Failed, job_cutoff).await?;

    let stale_after = now - chrono::Duration::seconds(config.job_timeout_secs);
    let stale = store.fetch_stale_jobs(stale_after, 1000).await?;
    for job in stale {
        store.requeue_job(job.id, now).await?;
    }

    let log_cutoff = now - chrono::Duration::days(30);
    let purged_logs = store.purge_old_logs(log_cutoff).await?;

    let purged_probe_results = store.purge_orphaned_probe_results().await?;

    let failure_reset_before = now - chrono::Duration::days(7);
    let reset_streaks = store.reset_stale_failure_streaks(failure_reset_before).await?;

    info!(purged_logs, purged_probe_results, reset_streaks, "maintenance sweep completed");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::probe::{AlwaysFailProbe, AlwaysPassProbe, ProbeRegistry};
    use scanwarden_store::memory::MemoryStore;
    use scanwarden_store::models::ScanFrequency;

    struct AllProbesPlan(Vec<&'static str>);

    #[async_trait]
    impl ProbePlanResolver for AllProbesPlan {
        async fn resolve(&self, _target: &Target) -> Vec<TargetProbePlan> {
            self.0
                .iter()
                .map(|name| TargetProbePlan {
                    probe_name: (*name).to_owned(),
                    config: ProbeConfig::new(),
                    options: RunOptions::default(),
                })
                .collect()
        }
    }

    async fn make_dispatcher(
        probes: Vec<&'static str>,
    ) -> (Dispatcher, Arc<dyn Store>) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let config = SchedulerConfig::from_env();
        let governor = Arc::new(ResourceGovernor::new(Arc::clone(&store), config.clone()));

        let registry = Arc::new(ProbeRegistry::new());
        registry.register(Arc::new(AlwaysPassProbe)).await;
        registry.register(Arc::new(AlwaysFailProbe { severity: scanwarden_store::models::Severity::Low })).await;
        let executor = Arc::new(Executor::new(registry));

        let dispatcher = Dispatcher::new(
            Arc::clone(&store),
            governor,
            executor,
            Arc::new(AllProbesPlan(probes)),
            Arc::new(NoopHook),
            config,
        );
        (dispatcher, store)
    }

    async fn insert_target(store: &Arc<dyn Store>, next_scan_at: Option<DateTime<Utc>>) -> Uuid {
        let id = Uuid::new_v4();
        let now = store.now().await.unwrap();
        store
            .insert_target(Target {
                id,
                name: "t1".to_owned(),
                url: "https://example.com".to_owned(),
                active: true,
                scan_frequency: ScanFrequency::Daily,
                next_scan_at,
                last_scan_at: None,
                consecutive_failures: 0,
                total_failures: 0,
                last_failure_at: None,
                last_error_category: None,
                status: TargetStatus::Active,
                retry_after: None,
                notification_channels: std::collections::HashMap::new(),
                created_at: now,
            })
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn s1_happy_path_advances_next_scan_at() {
        let (dispatcher, store) = make_dispatcher(vec!["always_pass", "always_pass"]).await;
        let now = store.now().await.unwrap();
        let target_id = insert_target(&store, Some(now)).await;

        let (_tx, mut rx) = watch::channel(false);
        let outcome = dispatcher.run(&mut rx).await;

        assert!(outcome.success);
        assert_eq!(outcome.targets_processed, 1);

        let target = store.get_target(target_id).await.unwrap().unwrap();
        assert_eq!(target.consecutive_failures, 0);
        assert!(target.next_scan_at.unwrap() > now);
    }

    #[tokio::test]
    async fn s2_contention_second_dispatcher_sees_lock_info() {
        let (dispatcher, store) = make_dispatcher(vec!["always_pass"]).await;
        let now = store.now().await.unwrap();
        insert_target(&store, Some(now)).await;

        // Simulate a concurrent holder by acquiring the lease out-of-band first.
        let lock = LeaseLock::new(Arc::clone(&store));
        let _owner = lock.acquire(SCHEDULER_LEASE_NAME, 3600, serde_json::json!({})).await.unwrap().unwrap();

        let (_tx, mut rx) = watch::channel(false);
        let outcome = dispatcher.run(&mut rx).await;

        assert!(!outcome.success);
        assert!(outcome.lock_info.is_some());
    }

    #[tokio::test]
    async fn manual_frequency_targets_are_never_selected() {
        let (dispatcher, store) = make_dispatcher(vec!["always_pass"]).await;
        let id = Uuid::new_v4();
        let now = store.now().await.unwrap();
        store
            .insert_target(Target {
                id,
                name: "manual".to_owned(),
                url: "https://example.com".to_owned(),
                active: true,
                scan_frequency: ScanFrequency::Manual,
                next_scan_at: None,
                last_scan_at: None,
                consecutive_failures: 0,
                total_failures: 0,
                last_failure_at: None,
                last_error_category: None,
                status: TargetStatus::Active,
                retry_after: None,
                notification_channels: std::collections::HashMap::new(),
                created_at: now,
            })
            .await
            .unwrap();

        let (_tx, mut rx) = watch::channel(false);
        let outcome = dispatcher.run(&mut rx).await;
        assert!(outcome.success);
        assert_eq!(outcome.message, "no websites due");
    }
}
