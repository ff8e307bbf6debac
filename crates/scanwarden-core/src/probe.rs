//! The `Probe` contract, its registry, and the timeout/retry/backoff
//! executor wrapping it.
//!
//! `ProbeRegistry` is a name→`Arc<dyn Probe>` table structured exactly like
//! `MountManager`'s path→`MountEntry` table (register once at startup,
//! read-heavy lookup behind an `RwLock`). The concrete scan checks
//! themselves (SSL, headers, XSS) are explicitly out of scope — this module ships only the trait, the registry, the executor, and
//! two illustrative probes used by tests and local dry-runs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use scanwarden_store::models::{ProbeOutcomeStatus, Severity};

use crate::error::ProbeError;

/// Outcome of a single probe invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeOutcome {
    pub status: ProbeOutcomeStatus,
    pub severity: Severity,
    pub message: String,
    pub evidence: serde_json::Value,
    pub duration_ms: i64,
}

/// Per-target-test configuration passed through to a probe's `Run`.
pub type ProbeConfig = HashMap<String, serde_json::Value>;

/// External collaborator contract every concrete scan check implements
///. The probes themselves are out of this repo's scope; only
/// the contract and a uniform executor around it live here.
#[async_trait]
pub trait Probe: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, url: &str, config: &ProbeConfig, deadline: Duration) -> ProbeOutcome;
}

/// Name → probe lookup table, structured like `MountManager`'s mount table:
/// register once at startup, resolve on every scan.
#[derive(Default)]
pub struct ProbeRegistry {
    probes: RwLock<HashMap<String, Arc<dyn Probe>>>,
}

impl ProbeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, probe: Arc<dyn Probe>) {
        let name = probe.name().to_owned();
        self.probes.write().await.insert(name.clone(), probe);
        debug!(probe = %name, "probe registered");
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Probe>> {
        self.probes.read().await.get(name).cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        self.probes.read().await.keys().cloned().collect()
    }
}

impl std::fmt::Debug for ProbeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeRegistry").finish_non_exhaustive()
    }
}

/// Per-test run options read off `website_test_config`.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub timeout: Duration,
    pub retry_count: u32,
    pub invert_result: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self { timeout: Duration::from_secs(30), retry_count: 0, invert_result: false }
    }
}

/// Wraps a looked-up [`Probe`] with total timeout, retry loop, optional
/// invert-result, and exponential in-run backoff between retries.
pub struct Executor {
    registry: Arc<ProbeRegistry>,
}

impl Executor {
    #[must_use]
    pub fn new(registry: Arc<ProbeRegistry>) -> Self {
        Self { registry }
    }

    /// Runs `probe_name` against `url` per `options`, retrying up to
    /// `options.retry_count` times with `2^(attempt-1)`-second backoff
    /// (capped at 10s) between attempts. Exceptions become `status=error`;
    /// a deadline miss becomes `status=timeout`.
    ///
    /// # Errors
    /// Returns [`ProbeError::NotRegistered`] if no probe is registered
    /// under `probe_name`.
    pub async fn execute(
        &self,
        probe_name: &str,
        url: &str,
        config: &ProbeConfig,
        options: &RunOptions,
    ) -> Result<ProbeOutcome, ProbeError> {
        let probe = self
            .registry
            .get(probe_name)
            .await
            .ok_or_else(|| ProbeError::NotRegistered { name: probe_name.to_owned() })?;

        let mut last_outcome: Option<ProbeOutcome> = None;

        for attempt in 1..=(options.retry_count + 1) {
            let started = std::time::Instant::now();
            let result = tokio::time::timeout(
                options.timeout,
                probe.run(url, config, options.timeout),
            )
            .await;

            let outcome = match result {
                Ok(outcome) => outcome,
                Err(_) => ProbeOutcome {
                    status: ProbeOutcomeStatus::Timeout,
                    severity: Severity::Medium,
                    message: format!("probe '{probe_name}' exceeded deadline of {:?}", options.timeout),
                    evidence: serde_json::json!({}),
                    duration_ms: started.elapsed().as_millis() as i64,
                },
            };

            let succeeded = matches!(outcome.status, ProbeOutcomeStatus::Passed);
            if succeeded || attempt > options.retry_count {
                last_outcome = Some(outcome);
                break;
            }

            warn!(probe = probe_name, attempt, "probe attempt failed, retrying with backoff");
            let backoff_secs = 2u64.saturating_pow(attempt.saturating_sub(1)).min(10);
            tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
            last_outcome = Some(outcome);
        }

        // Unwrap is safe: the loop runs at least once (`retry_count + 1 >= 1`).
        #[allow(clippy::unwrap_used)]
        let mut outcome = last_outcome.unwrap();

        if options.invert_result {
            outcome.status = invert(outcome.status);
        }

        Ok(outcome)
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor").finish_non_exhaustive()
    }
}

fn invert(status: ProbeOutcomeStatus) -> ProbeOutcomeStatus {
    match status {
        ProbeOutcomeStatus::Passed => ProbeOutcomeStatus::Failed,
        ProbeOutcomeStatus::Failed => ProbeOutcomeStatus::Passed,
        other => other,
    }
}

/// HTTP-reachability probe: passes on any 2xx/3xx response. Illustrative
/// only — real scan checks (SSL, headers, XSS) are out of scope.
pub struct ReachabilityProbe {
    client: reqwest::Client,
}

impl ReachabilityProbe {
    #[must_use]
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

impl Default for ReachabilityProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Probe for ReachabilityProbe {
    fn name(&self) -> &str {
        "reachability"
    }

    async fn run(&self, url: &str, _config: &ProbeConfig, deadline: Duration) -> ProbeOutcome {
        let started = std::time::Instant::now();
        let result = tokio::time::timeout(deadline, self.client.get(url).send()).await;

        match result {
            Ok(Ok(response)) if response.status().is_success() || response.status().is_redirection() => {
                ProbeOutcome {
                    status: ProbeOutcomeStatus::Passed,
                    severity: Severity::Info,
                    message: format!("reachable, status {}", response.status()),
                    evidence: serde_json::json!({ "status": response.status().as_u16() }),
                    duration_ms: started.elapsed().as_millis() as i64,
                }
            }
            Ok(Ok(response)) => ProbeOutcome {
                status: ProbeOutcomeStatus::Failed,
                severity: Severity::Medium,
                message: format!("unexpected status {}", response.status()),
                evidence: serde_json::json!({ "status": response.status().as_u16() }),
                duration_ms: started.elapsed().as_millis() as i64,
            },
            Ok(Err(e)) => ProbeOutcome {
                status: ProbeOutcomeStatus::Error,
                severity: Severity::High,
                message: e.to_string(),
                evidence: serde_json::json!({}),
                duration_ms: started.elapsed().as_millis() as i64,
            },
            Err(_) => ProbeOutcome {
                status: ProbeOutcomeStatus::Timeout,
                severity: Severity::Medium,
                message: "request timed out".to_owned(),
                evidence: serde_json::json!({}),
                duration_ms: started.elapsed().as_millis() as i64,
            },
        }
    }
}

/// Deterministic always-passing probe for dispatcher unit tests.
pub struct AlwaysPassProbe;

#[async_trait]
impl Probe for AlwaysPassProbe {
    fn name(&self) -> &str {
        "always_pass"
    }

    async fn run(&self, _url: &str, _config: &ProbeConfig, _deadline: Duration) -> ProbeOutcome {
        ProbeOutcome {
            status: ProbeOutcomeStatus::Passed,
            severity: Severity::Info,
            message: "ok".to_owned(),
            evidence: serde_json::json!({}),
            duration_ms: 1,
        }
    }
}

/// Deterministic always-failing probe for dispatcher unit tests.
pub struct AlwaysFailProbe {
    pub severity: Severity,
}

#[async_trait]
impl Probe for AlwaysFailProbe {
    fn name(&self) -> &str {
        "always_fail"
    }

    async fn run(&self, _url: &str, _config: &ProbeConfig, _deadline: Duration) -> ProbeOutcome {
        ProbeOutcome {
            status: ProbeOutcomeStatus::Failed,
            severity: self.severity,
            message: "simulated failure".to_owned(),
            evidence: serde_json::json!({}),
            duration_ms: 1,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn executor_runs_registered_probe() {
        let registry = Arc::new(ProbeRegistry::new());
        registry.register(Arc::new(AlwaysPassProbe)).await;
        let executor = Executor::new(registry);

        let outcome = executor
            .execute("always_pass", "https://example.com", &ProbeConfig::new(), &RunOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.status, ProbeOutcomeStatus::Passed);
    }

    #[tokio::test]
    async fn executor_errors_on_unregistered_probe() {
        let registry = Arc::new(ProbeRegistry::new());
        let executor = Executor::new(registry);

        let err = executor
            .execute("nonexistent", "https://example.com", &ProbeConfig::new(), &RunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::NotRegistered { .. }));
    }

    #[tokio::test]
    async fn invert_result_flips_pass_to_fail() {
        let registry = Arc::new(ProbeRegistry::new());
        registry.register(Arc::new(AlwaysPassProbe)).await;
        let executor = Executor::new(registry);

        let options = RunOptions { invert_result: true, ..RunOptions::default() };
        let outcome = executor
            .execute("always_pass", "https://example.com", &ProbeConfig::new(), &options)
            .await
            .unwrap();
        assert_eq!(outcome.status, ProbeOutcomeStatus::Failed);
    }

    #[tokio::test]
    async fn retries_exhaust_before_giving_up() {
        let registry = Arc::new(ProbeRegistry::new());
        registry.register(Arc::new(AlwaysFailProbe { severity: Severity::Low })).await;
        let executor = Executor::new(registry);

        let options = RunOptions { retry_count: 1, timeout: Duration::from_secs(1), ..RunOptions::default() };
        let outcome = executor
            .execute("always_fail", "https://example.com", &ProbeConfig::new(), &options)
            .await
            .unwrap();
        assert_eq!(outcome.status, ProbeOutcomeStatus::Failed);
    }
}
