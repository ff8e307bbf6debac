//! Scheduler configuration, loaded from the environment.
//!
//! One `SCANWARDEN_*` variable per tunable, each with a documented default,
//! all parsed once at process startup.

use std::time::Duration;

/// All tunables, with their documented defaults.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How many targets the dispatcher pulls per batch.
    pub batch_size: i64,
    /// `scheduler_execution` lease TTL in seconds.
    pub lock_timeout_secs: i64,
    /// Upper bound on a single dispatcher invocation's wall clock.
    pub max_execution_time_secs: i64,
    /// Running-scan ceiling the health check enforces.
    pub max_concurrent_executions: i64,
    /// Pace between targets in the same batch, in milliseconds.
    pub pacing_ms: u64,
    /// Per-target probe deadline in seconds unless overridden.
    pub probe_deadline_secs: u64,
    /// How often the maintenance sweep runs, in seconds.
    pub cleanup_interval_secs: i64,
    /// Retry sweep window: scan runs created within this many seconds.
    pub retry_sweep_window_secs: i64,
    /// Base delay applied between retry-sweep attempts.
    pub retry_failed_after_secs: i64,
    /// Daily cap on RetryPolicy retries per target.
    pub max_retries_per_day: u32,
    /// Base delay for RetryPolicy's backoff formula, in minutes.
    pub retry_base_delay_min: f64,

    /// Governor sampling cadence in seconds.
    pub monitoring_interval_secs: u64,
    /// Duration a throttle state persists once raised, in seconds.
    pub throttle_duration_secs: i64,
    /// Minimum gap between governor alerts, in seconds.
    pub alert_cooldown_secs: i64,
    pub cpu_thresholds: Thresholds,
    pub mem_thresholds: Thresholds,
    pub disk_thresholds: Thresholds,
    pub load1_thresholds: Thresholds,
    pub db_conns_thresholds: Thresholds,
    pub concurrent_scans_thresholds: Thresholds,

    /// Escalation cooldown in hours.
    pub escalation_cooldown_hours: i64,

    /// Per-recipient notification cap per hour.
    pub rate_limit_per_hour: i64,
    /// Base retry delay for notification sends, in seconds.
    pub notification_retry_delay_secs: i64,
    /// `max_retries` for notification sends; `attempts` bound is this plus one.
    pub notification_max_retries: u32,

    /// QueueRunner worker concurrency.
    pub max_workers: usize,
    /// Job considered stale after this many seconds in `processing`.
    pub job_timeout_secs: i64,
    /// Job retry ceiling before dead-lettering.
    pub job_max_retries: i32,
    /// Whether exceeding `job_max_retries` dead-letters or just fails.
    pub job_dead_letter_enabled: bool,
    /// Terminal jobs are purged after this many seconds.
    pub cleanup_completed_jobs_after_secs: i64,
}

/// The three escalating levels a metric can be at.
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    pub warning: f64,
    pub critical: f64,
    pub throttle: f64,
}

impl SchedulerConfig {
    /// Load every tunable from its `SCANWARDEN_*` environment variable,
    /// falling back to a documented default when unset or unparsable —
    /// mirroring `ServerConfig::from_env`'s permissive parsing.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            batch_size: env_i64("SCANWARDEN_BATCH_SIZE", 10),
            lock_timeout_secs: env_i64("SCANWARDEN_LOCK_TIMEOUT", 3600),
            max_execution_time_secs: env_i64("SCANWARDEN_MAX_EXECUTION_TIME", 3600),
            max_concurrent_executions: env_i64("SCANWARDEN_MAX_CONCURRENT_EXECUTIONS", 20),
            pacing_ms: env_u64("SCANWARDEN_PACING_MS", 100),
            probe_deadline_secs: env_u64("SCANWARDEN_PROBE_DEADLINE", 30),
            cleanup_interval_secs: env_i64("SCANWARDEN_CLEANUP_INTERVAL", 86_400),
            retry_sweep_window_secs: env_i64("SCANWARDEN_RETRY_SWEEP_WINDOW", 86_400),
            retry_failed_after_secs: env_i64("SCANWARDEN_RETRY_FAILED_AFTER", 300),
            max_retries_per_day: env_u32("SCANWARDEN_MAX_RETRIES_PER_DAY", 5),
            retry_base_delay_min: env_f64("SCANWARDEN_RETRY_BASE_DELAY_MIN", 5.0),

            monitoring_interval_secs: env_u64("SCANWARDEN_MONITORING_INTERVAL", 60),
            throttle_duration_secs: env_i64("SCANWARDEN_THROTTLE_DURATION", 600),
            alert_cooldown_secs: env_i64("SCANWARDEN_ALERT_COOLDOWN", 300),
            cpu_thresholds: thresholds_from_env("SCANWARDEN_CPU_THRESHOLDS", 70.0, 85.0, 90.0),
            mem_thresholds: thresholds_from_env("SCANWARDEN_MEM_THRESHOLDS", 75.0, 90.0, 95.0),
            disk_thresholds: thresholds_from_env("SCANWARDEN_DISK_THRESHOLDS", 80.0, 90.0, 95.0),
            load1_thresholds: thresholds_from_env("SCANWARDEN_LOAD1_THRESHOLDS", 2.0, 4.0, 6.0),
            db_conns_thresholds: thresholds_from_env(
                "SCANWARDEN_DB_CONNS_THRESHOLDS",
                100.0,
                150.0,
                200.0,
            ),
            concurrent_scans_thresholds: thresholds_from_env(
                "SCANWARDEN_CONCURRENT_SCANS_THRESHOLDS",
                10.0,
                15.0,
                20.0,
            ),

            escalation_cooldown_hours: env_i64("SCANWARDEN_ESCALATION_COOLDOWN_HOURS", 4),

            rate_limit_per_hour: env_i64("SCANWARDEN_RATE_LIMIT_PER_HOUR", 10),
            notification_retry_delay_secs: env_i64("SCANWARDEN_NOTIFICATION_RETRY_DELAY", 60),
            notification_max_retries: env_u32("SCANWARDEN_NOTIFICATION_MAX_RETRIES", 3),

            max_workers: env_u64("SCANWARDEN_MAX_WORKERS", 5) as usize,
            job_timeout_secs: env_i64("SCANWARDEN_JOB_TIMEOUT", 300),
            job_max_retries: env_i64("SCANWARDEN_JOB_MAX_RETRIES", 3) as i32,
            job_dead_letter_enabled: env_bool("SCANWARDEN_JOB_DEAD_LETTER_ENABLED", true),
            cleanup_completed_jobs_after_secs: env_i64(
                "SCANWARDEN_CLEANUP_COMPLETED_JOBS_AFTER",
                86_400,
            ),
        }
    }

    #[must_use]
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs.max(0) as u64)
    }

    #[must_use]
    pub fn max_execution_time(&self) -> Duration {
        Duration::from_secs(self.max_execution_time_secs.max(0) as u64)
    }

    /// Lease TTL must be ≥ `max_execution_time` and heartbeats must occur
    /// at least every `lock_timeout / 3`.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs((self.lock_timeout_secs.max(3) / 3) as u64)
    }
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| v != "false" && v != "0")
        .unwrap_or(default)
}

/// Parses a `"warn,critical,throttle"` triple, e.g. `SCANWARDEN_CPU_THRESHOLDS=70,85,90`.
fn thresholds_from_env(key: &str, warn: f64, critical: f64, throttle: f64) -> Thresholds {
    let Some(raw) = std::env::var(key).ok() else {
        return Thresholds { warning: warn, critical, throttle };
    };
    let parts: Vec<f64> = raw.split(',').filter_map(|p| p.trim().parse().ok()).collect();
    match parts.as_slice() {
        [w, c, t] => Thresholds { warning: *w, critical: *c, throttle: *t },
        _ => Thresholds { warning: warn, critical, throttle },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        // Clear any leaked env from other tests in-process.
        for key in [
            "SCANWARDEN_BATCH_SIZE",
            "SCANWARDEN_LOCK_TIMEOUT",
            "SCANWARDEN_CPU_THRESHOLDS",
        ] {
            std::env::remove_var(key);
        }
        let cfg = SchedulerConfig::from_env();
        assert_eq!(cfg.batch_size, 10);
        assert_eq!(cfg.lock_timeout_secs, 3600);
        assert!((cfg.cpu_thresholds.warning - 70.0).abs() < f64::EPSILON);
        assert!((cfg.cpu_thresholds.throttle - 90.0).abs() < f64::EPSILON);
    }
}
