//! Priority + delay job queue for deferred work, used by the
//! core as the Dispatcher's deferral mechanism for notification delivery
//! delays.
//!
//! One background `tokio::spawn` task per worker, each selecting against a
//! shutdown signal, generalized to `max_workers` concurrent claimers. Each
//! worker holds its picked job under row lock only for the claim
//! transaction, never across the job's execution.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use scanwarden_store::models::{Job, JobStatus};
use scanwarden_store::Store;

use crate::config::SchedulerConfig;
use crate::error::QueueError;
use crate::lease::new_owner_token;

/// What a worker does with a claimed job. Implemented per `job_type` by the
/// caller (here: notification delivery); kept as a trait so `QueueRunner`
/// never hard-codes the deferred-work catalogue.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<(), String>;
}

/// Enqueues and drains [`Job`] rows against a [`Store`].
pub struct QueueRunner {
    store: Arc<dyn Store>,
    config: SchedulerConfig,
}

impl QueueRunner {
    #[must_use]
    pub fn new(store: Arc<dyn Store>, config: SchedulerConfig) -> Self {
        Self { store, config }
    }

    /// Enqueue a unit of deferred work. `priority` is 0–3;
    /// `delay` offsets `execute_at` from now.
    ///
    /// # Errors
    /// Returns [`QueueError::Store`] if the insert fails.
    pub async fn enqueue(
        &self,
        job_type: &str,
        payload: serde_json::Value,
        priority: i16,
        delay: chrono::Duration,
    ) -> Result<Uuid, QueueError> {
        let now = self.store.now().await.map_err(QueueError::Store)?;
        let id = Uuid::new_v4();
        let job = Job {
            id,
            job_type: job_type.to_owned(),
            payload,
            priority: priority.clamp(0, 3),
            status: JobStatus::Pending,
            execute_at: now + delay,
            retry_count: 0,
            worker_id: None,
            started_at: None,
            created_at: now,
        };
        self.store.enqueue_job(job).await.map_err(QueueError::Store)?;
        debug!(job_id = %id, job_type, priority, "job enqueued");
        Ok(id)
    }

    /// One claim-and-handle pass for a single worker: claims up to
    /// `batch` due jobs and dispatches each to `handler`. Returns the
    /// number of jobs processed.
    ///
    /// # Errors
    /// Returns [`QueueError::Store`] if claiming fails.
    pub async fn run_once(
        &self,
        worker_id: &str,
        handler: &dyn JobHandler,
        batch: i64,
    ) -> Result<usize, QueueError> {
        let now = self.store.now().await.map_err(QueueError::Store)?;
        let jobs = self.store.claim_jobs(worker_id, now, batch).await.map_err(QueueError::Store)?;

        for job in &jobs {
            match handler.handle(job).await {
                Ok(()) => {
                    self.store.complete_job(job.id).await.map_err(QueueError::Store)?;
                    debug!(job_id = %job.id, "job completed");
                }
                Err(reason) => {
                    self.fail_or_dead_letter(job, &reason).await?;
                }
            }
        }

        Ok(jobs.len())
    }

    async fn fail_or_dead_letter(&self, job: &Job, reason: &str) -> Result<(), QueueError> {
        let retry_count = job.retry_count + 1;
        if retry_count >= self.config.job_max_retries {
            warn!(job_id = %job.id, reason, "job exhausted retries");
            self.store
                .fail_job(job.id, retry_count, None, self.config.job_dead_letter_enabled)
                .await
                .map_err(QueueError::Store)?;
        } else {
            let now = self.store.now().await.map_err(QueueError::Store)?;
            // Deferred work retries on the same backoff shape RetryPolicy
            // uses for scan retries (base delay doubling per attempt).
            let delay = chrono::Duration::seconds(
                self.config.job_timeout_secs.saturating_mul(1i64 << retry_count.min(10)),
            );
            self.store
                .fail_job(job.id, retry_count, Some(now + delay), false)
                .await
                .map_err(QueueError::Store)?;
        }
        Ok(())
    }

    /// Resets jobs stuck in `processing` past `job_timeout` back to
    /// `pending`.
    ///
    /// # Errors
    /// Returns [`QueueError::Store`] if the sweep fails.
    pub async fn recover_stale(&self) -> Result<usize, QueueError> {
        let now = self.store.now().await.map_err(QueueError::Store)?;
        let stale_after = now - chrono::Duration::seconds(self.config.job_timeout_secs);
        let stale = self.store.fetch_stale_jobs(stale_after, 100).await.map_err(QueueError::Store)?;

        for job in &stale {
            self.store.requeue_job(job.id, now).await.map_err(QueueError::Store)?;
            warn!(job_id = %job.id, "recovered stale job back to pending");
        }
        Ok(stale.len())
    }

    /// Deletes terminal jobs older than `cleanup_completed_jobs_after`
    ///.
    ///
    /// # Errors
    /// Returns [`QueueError::Store`] if the purge fails.
    pub async fn purge_old(&self) -> Result<u64, QueueError> {
        let now = self.store.now().await.map_err(QueueError::Store)?;
        let cutoff = now - chrono::Duration::seconds(self.config.cleanup_completed_jobs_after_secs);
        let completed = self.store.purge_jobs(JobStatus::Completed, cutoff).await.map_err(QueueError::Store)?;
        let failed = self.store.purge_jobs(JobStatus::Failed, cutoff).await.map_err(QueueError::Store)?;
        Ok(completed + failed)
    }

    /// Runs `max_workers` concurrent claim loops until `shutdown` fires,
    /// each on its own synthesized worker id.
    pub async fn run_workers(
        self: Arc<Self>,
        handler: Arc<dyn JobHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut handles = Vec::new();
        for _ in 0..self.config.max_workers {
            let runner = Arc::clone(&self);
            let handler = Arc::clone(&handler);
            let mut shutdown = shutdown.clone();
            let worker_id = new_owner_token();
            handles.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(1));
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            if let Err(e) = runner.run_once(&worker_id, handler.as_ref(), 1).await {
                                error!(worker_id, error = %e, "job worker claim failed");
                            }
                        }
                        _ = shutdown.changed() => {
                            info!(worker_id, "job worker shutting down");
                            return;
                        }
                    }
                }
            }));
        }

        let _ = shutdown.changed().await;
        for handle in handles {
            let _ = handle.await;
        }
    }
}

impl std::fmt::Debug for QueueRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueRunner").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use scanwarden_store::memory::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn handle(&self, _job: &Job) -> Result<(), String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err("simulated failure".to_owned())
            } else {
                Ok(())
            }
        }
    }

    fn runner() -> QueueRunner {
        QueueRunner::new(Arc::new(MemoryStore::new()), SchedulerConfig::from_env())
    }

    #[tokio::test]
    async fn enqueue_then_claim_round_trips() {
        let runner = runner();
        runner
            .enqueue("notify", serde_json::json!({"k": "v"}), 2, chrono::Duration::zero())
            .await
            .unwrap();

        let handler = CountingHandler { calls: AtomicUsize::new(0), fail: false };
        let processed = runner.run_once("worker-1", &handler, 10).await.unwrap();
        assert_eq!(processed, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn priority_then_fifo_ordering() {
        let runner = runner();
        runner.enqueue("low", serde_json::json!({}), 0, chrono::Duration::zero()).await.unwrap();
        runner.enqueue("high", serde_json::json!({}), 3, chrono::Duration::zero()).await.unwrap();

        let handler = Arc::new(tokio::sync::Mutex::new(Vec::<String>::new()));

        struct Recorder(Arc<tokio::sync::Mutex<Vec<String>>>);
        #[async_trait]
        impl JobHandler for Recorder {
            async fn handle(&self, job: &Job) -> Result<(), String> {
                self.0.lock().await.push(job.job_type.clone());
                Ok(())
            }
        }

        let recorder = Recorder(Arc::clone(&handler));
        runner.run_once("w", &recorder, 1).await.unwrap();
        runner.run_once("w", &recorder, 1).await.unwrap();

        let order = handler.lock().await.clone();
        assert_eq!(order, vec!["high".to_owned(), "low".to_owned()]);
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter() {
        let mut config = SchedulerConfig::from_env();
        config.job_max_retries = 1;
        config.job_dead_letter_enabled = true;
        let store = Arc::new(MemoryStore::new());
        let runner = QueueRunner::new(Arc::clone(&store) as Arc<dyn Store>, config);
        let id = runner.enqueue("notify", serde_json::json!({}), 0, chrono::Duration::zero()).await.unwrap();

        let handler = CountingHandler { calls: AtomicUsize::new(0), fail: true };
        runner.run_once("w", &handler, 1).await.unwrap();

        let jobs = store.fetch_stale_jobs(chrono::Utc::now() + chrono::Duration::days(365), 10).await.unwrap();
        // Not stale (it's Dead/Failed, not Processing) — verify via direct fetch instead.
        let _ = jobs;
        let now = store.now().await.unwrap();
        let due = store.claim_jobs("w2", now + chrono::Duration::days(1), 10).await.unwrap();
        assert!(due.iter().all(|j| j.id != id), "dead-lettered job must not be reclaimable");
    }
}
