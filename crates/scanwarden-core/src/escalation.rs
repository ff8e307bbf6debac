//! Escalation level derivation and the cooldown state machine.
//!
//! Follows the same table-upsert-with-invariant pattern as a mount-manager
//! keeping "at most one mount per path", generalized here to "one active
//! `Escalation` per target". Delivery is always deferred through
//! [`crate::queue`], never called directly — breaking the
//! Dispatcher↔EscalationEngine↔NotificationOrchestrator cycle (the
//! Dispatcher's post-outcome hook calls into this engine, which enqueues a
//! `Job` rather than holding a reference to the orchestrator).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use scanwarden_store::models::{Escalation, EscalationStatus, Severity};
use scanwarden_store::Store;

use crate::config::SchedulerConfig;
use crate::error::EscalationError;
use crate::queue::QueueRunner;

/// Probe names treated as critical regardless of their own severity field
///.
pub const CRITICAL_PROBE_NAMES: &[&str] = &[
    "ssl_certificate",
    "security_headers",
    "csrf_protection",
    "sql_injection",
    "xss_protection",
];

/// Inputs EscalationEngine needs about the scan just completed.
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub target_id: Uuid,
    pub any_failure: bool,
    pub critical_probe_failure: bool,
    pub consecutive_failures: i32,
    pub failures_in_last_24h: i32,
}

/// Derived escalation level for one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EscalationLevel {
    None = 0,
    L1 = 1,
    L2 = 2,
    L3 = 3,
}

impl EscalationLevel {
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub fn channels(self) -> &'static [scanwarden_store::models::Channel] {
        use scanwarden_store::models::Channel::{Email, Sms, Webhook};
        match self {
            Self::None => &[],
            Self::L1 => &[Email],
            Self::L2 => &[Email, Sms],
            Self::L3 => &[Email, Sms, Webhook],
        }
    }

    /// Delivery delay after the evaluation instant.
    #[must_use]
    pub fn delivery_delay(self) -> chrono::Duration {
        match self {
            Self::None | Self::L1 => chrono::Duration::zero(),
            Self::L2 => chrono::Duration::minutes(30),
            Self::L3 => chrono::Duration::minutes(120),
        }
    }
}

/// Pure derivation of the escalation level from a scan outcome.
#[must_use]
pub fn derive_level(outcome: &ScanOutcome) -> EscalationLevel {
    if outcome.critical_probe_failure {
        EscalationLevel::L3
    } else if outcome.consecutive_failures >= 3 {
        EscalationLevel::L2
    } else if outcome.failures_in_last_24h >= 5 {
        EscalationLevel::L2
    } else if outcome.any_failure {
        EscalationLevel::L1
    } else {
        EscalationLevel::None
    }
}

/// Whether a probe name belongs to the critical set or carries critical
/// severity.
#[must_use]
pub fn is_critical_probe_failure(probe_name: &str, severity: Severity) -> bool {
    severity == Severity::Critical || CRITICAL_PROBE_NAMES.contains(&probe_name)
}

/// Result of one evaluation, for the caller to log/observe.
#[derive(Debug, Clone, Copy)]
pub enum EvaluationResult {
    /// No failure — any active escalation was resolved.
    Resolved,
    /// A new escalation was created at this level.
    Created { escalation_id: Uuid, level: EscalationLevel },
    /// An active escalation was upgraded to a strictly higher level.
    Upgraded { escalation_id: Uuid, level: EscalationLevel },
    /// Still within cooldown and the new level did not exceed the active one.
    InCooldown { escalation_id: Uuid },
}

pub struct EscalationEngine {
    store: Arc<dyn Store>,
    queue: Arc<QueueRunner>,
    config: SchedulerConfig,
}

impl EscalationEngine {
    #[must_use]
    pub fn new(store: Arc<dyn Store>, queue: Arc<QueueRunner>, config: SchedulerConfig) -> Self {
        Self { store, queue, config }
    }

    /// Evaluate a scan outcome against the target's active escalation,
    /// transition state, and enqueue the appropriate deferred notification
    /// jobs.
    ///
    /// # Errors
    /// Returns [`EscalationError::Store`] if a store call fails.
    pub async fn evaluate(&self, outcome: &ScanOutcome) -> Result<EvaluationResult, EscalationError> {
        let now = self.store.now().await?;
        let level = derive_level(outcome);
        let active = self.store.get_active_escalation(outcome.target_id).await?;

        match (level, active) {
            (EscalationLevel::None, Some(active)) => {
                self.store.resolve_escalation(active.id, now, "tests_passing").await?;
                info!(target_id = %outcome.target_id, "escalation resolved: tests passing");
                Ok(EvaluationResult::Resolved)
            }
            (EscalationLevel::None, None) => Ok(EvaluationResult::Resolved),
            (level, None) => {
                let escalation = self.create(outcome.target_id, level, now).await?;
                self.enqueue_channels(escalation.id, level, outcome.target_id).await?;
                Ok(EvaluationResult::Created { escalation_id: escalation.id, level })
            }
            (level, Some(active)) => {
                if now < active.cooldown_until && (level as u8) <= active.level {
                    return Ok(EvaluationResult::InCooldown { escalation_id: active.id });
                }
                if (level as u8) > active.level {
                    let cooldown_until = now + chrono::Duration::hours(self.config.escalation_cooldown_hours);
                    self.store
                        .bump_escalation_level(active.id, level.as_u8(), trigger_reason(outcome), cooldown_until)
                        .await?;
                    self.enqueue_channels(active.id, level, outcome.target_id).await?;
                    info!(target_id = %outcome.target_id, level = level.as_u8(), "escalation upgraded");
                    return Ok(EvaluationResult::Upgraded { escalation_id: active.id, level });
                }
                // Cooldown elapsed but level did not increase — re-evaluate
                // as a fresh observation at the same level without creating
                // a duplicate row; cooldown simply resets.
                let cooldown_until = now + chrono::Duration::hours(self.config.escalation_cooldown_hours);
                self.store
                    .bump_escalation_level(active.id, active.level, trigger_reason(outcome), cooldown_until)
                    .await?;
                Ok(EvaluationResult::InCooldown { escalation_id: active.id })
            }
        }
    }

    async fn create(
        &self,
        target_id: Uuid,
        level: EscalationLevel,
        now: DateTime<Utc>,
    ) -> Result<Escalation, EscalationError> {
        let id = Uuid::new_v4();
        let cooldown_until = now + chrono::Duration::hours(self.config.escalation_cooldown_hours);
        let escalation = Escalation {
            id,
            target_id,
            level: level.as_u8(),
            trigger_reason: "failure_detected".to_owned(),
            status: EscalationStatus::Active,
            created_at: now,
            cooldown_until,
            resolved_at: None,
            resolution_reason: None,
            notifications_record: Vec::new(),
        };
        self.store.insert_escalation(escalation.clone()).await?;
        info!(target_id = %target_id, level = level.as_u8(), "escalation created");
        Ok(escalation)
    }

    /// Schedules one deferred notification job per channel at `level`, at
    /// `level`'s delivery delay — never calls the orchestrator directly
    ///.
    async fn enqueue_channels(
        &self,
        escalation_id: Uuid,
        level: EscalationLevel,
        target_id: Uuid,
    ) -> Result<(), EscalationError> {
        let delay = level.delivery_delay();
        for channel in level.channels() {
            let job_id = self
                .queue
                .enqueue(
                    "escalation_notification",
                    serde_json::json!({
                        "escalation_id": escalation_id,
                        "target_id": target_id,
                        "channel": channel,
                        "level": level.as_u8(),
                    }),
                    level.as_u8() as i16,
                    delay,
                )
                .await
                .map_err(|e| EscalationError::Store(scanwarden_store::StoreError::Write(e.to_string())))?;
            self.store.record_escalation_notification(escalation_id, job_id).await?;
        }
        Ok(())
    }
}

fn trigger_reason(outcome: &ScanOutcome) -> &'static str {
    if outcome.critical_probe_failure {
        "critical_probe_failure"
    } else if outcome.consecutive_failures >= 3 {
        "consecutive_failures"
    } else if outcome.failures_in_last_24h >= 5 {
        "failures_in_period"
    } else {
        "failure_detected"
    }
}

impl std::fmt::Debug for EscalationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EscalationEngine").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use scanwarden_store::memory::MemoryStore;

    fn engine() -> (EscalationEngine, Arc<dyn Store>) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let queue = Arc::new(QueueRunner::new(Arc::clone(&store), SchedulerConfig::from_env()));
        (EscalationEngine::new(Arc::clone(&store), queue, SchedulerConfig::from_env()), store)
    }

    #[test]
    fn level_derivation_matches_spec_rules() {
        let base = ScanOutcome {
            target_id: Uuid::new_v4(),
            any_failure: false,
            critical_probe_failure: false,
            consecutive_failures: 0,
            failures_in_last_24h: 0,
        };
        assert_eq!(derive_level(&base), EscalationLevel::None);

        let one_off = ScanOutcome { any_failure: true, ..base.clone() };
        assert_eq!(derive_level(&one_off), EscalationLevel::L1);

        let streak = ScanOutcome { any_failure: true, consecutive_failures: 3, ..base.clone() };
        assert_eq!(derive_level(&streak), EscalationLevel::L2);

        let period = ScanOutcome { any_failure: true, failures_in_last_24h: 5, ..base.clone() };
        assert_eq!(derive_level(&period), EscalationLevel::L2);

        let critical = ScanOutcome { any_failure: true, critical_probe_failure: true, ..base };
        assert_eq!(derive_level(&critical), EscalationLevel::L3);
    }

    #[tokio::test]
    async fn s4_escalation_upgrade_and_cooldown_scenario() {
        let (engine, store) = engine();
        let target_id = Uuid::new_v4();

        // Failure #3: consecutive_failures=3 -> level 2, escalation created.
        let outcome3 = ScanOutcome {
            target_id,
            any_failure: true,
            critical_probe_failure: false,
            consecutive_failures: 3,
            failures_in_last_24h: 3,
        };
        let result = engine.evaluate(&outcome3).await.unwrap();
        let escalation_id = match result {
            EvaluationResult::Created { escalation_id, level } => {
                assert_eq!(level, EscalationLevel::L2);
                escalation_id
            }
            other => panic!("expected Created, got {other:?}"),
        };

        // Failure #4 within cooldown, non-critical, same level -> in_cooldown.
        let outcome4 = ScanOutcome {
            target_id,
            any_failure: true,
            critical_probe_failure: false,
            consecutive_failures: 4,
            failures_in_last_24h: 4,
        };
        let result = engine.evaluate(&outcome4).await.unwrap();
        assert!(matches!(result, EvaluationResult::InCooldown { .. }));

        // Failure #5 is critical -> upgrade to level 3.
        let outcome5 = ScanOutcome {
            target_id,
            any_failure: true,
            critical_probe_failure: true,
            consecutive_failures: 5,
            failures_in_last_24h: 5,
        };
        let result = engine.evaluate(&outcome5).await.unwrap();
        match result {
            EvaluationResult::Upgraded { escalation_id: id, level } => {
                assert_eq!(id, escalation_id);
                assert_eq!(level, EscalationLevel::L3);
            }
            other => panic!("expected Upgraded, got {other:?}"),
        }

        let active = store.get_active_escalation(target_id).await.unwrap().unwrap();
        assert_eq!(active.level, 3);
    }

    #[tokio::test]
    async fn clean_scan_resolves_active_escalation() {
        let (engine, store) = engine();
        let target_id = Uuid::new_v4();
        engine
            .evaluate(&ScanOutcome {
                target_id,
                any_failure: true,
                critical_probe_failure: false,
                consecutive_failures: 1,
                failures_in_last_24h: 1,
            })
            .await
            .unwrap();
        assert!(store.get_active_escalation(target_id).await.unwrap().is_some());

        let result = engine
            .evaluate(&ScanOutcome {
                target_id,
                any_failure: false,
                critical_probe_failure: false,
                consecutive_failures: 0,
                failures_in_last_24h: 0,
            })
            .await
            .unwrap();
        assert!(matches!(result, EvaluationResult::Resolved));
        assert!(store.get_active_escalation(target_id).await.unwrap().is_none());
    }
}
