//! Notification orchestration: create-before-send, per-recipient rate
//! limiting, exponential-backoff retries, template rendering, and masked
//! logging.
//!
//! Channel fan-out uses a `RwLock<Vec<Arc<dyn Trait>>>` registry keyed by a
//! `name()`-bearing trait, same shape as any multi-backend broadcast
//! registry, but narrowed from "write to every backend, succeed if any
//! succeeds" to "send via exactly the channel the notification names,
//! retry that channel only" — a notification is addressed to one channel,
//! not broadcast to all.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use scanwarden_store::models::{Channel, Job, Notification, NotificationStatus};
use scanwarden_store::Store;

use crate::config::SchedulerConfig;
use crate::error::NotificationError;
use crate::queue::JobHandler;

/// External collaborator contract a channel backend implements.
#[async_trait]
pub trait NotificationProvider: Send + Sync {
    fn channel(&self) -> Channel;

    async fn send(&self, recipient: &str, rendered: &str) -> Result<(), String>;

    /// Cheap health/config summary for `scanwarden status`.
    async fn status(&self) -> serde_json::Value {
        serde_json::json!({ "channel": format!("{:?}", self.channel()) })
    }

    /// Send a harmless test message; used by an operator to confirm
    /// configuration without generating a real alert.
    async fn test(&self) -> bool {
        true
    }
}

/// Replaces every `{{key}}` token with `context[key]`; unresolved tokens
/// are stripped entirely from the output.
#[must_use]
pub fn render_template(template: &str, context: &HashMap<String, String>) -> String {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        output.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];
        match after_open.find("}}") {
            Some(close) => {
                let key = after_open[..close].trim();
                if let Some(value) = context.get(key) {
                    output.push_str(value);
                }
                rest = &after_open[close + 2..];
            }
            None => {
                // Unterminated `{{` — treat as literal and stop scanning.
                output.push_str("{{");
                rest = after_open;
                break;
            }
        }
    }
    output.push_str(rest);
    output
}

/// Masks a recipient address for safe inclusion in logs.
#[must_use]
pub fn mask_recipient(channel: Channel, recipient: &str) -> String {
    match channel {
        Channel::Email => mask_email(recipient),
        Channel::Sms => mask_phone(recipient),
        Channel::Webhook => mask_webhook(recipient),
    }
}

fn mask_email(email: &str) -> String {
    match email.split_once('@') {
        Some((local, domain)) => {
            let visible: String = local.chars().take(2).collect();
            format!("{visible}@{domain}")
        }
        None => "***".to_owned(),
    }
}

fn mask_phone(phone: &str) -> String {
    let digits: Vec<char> = phone.chars().collect();
    if digits.len() < 6 {
        return "*".repeat(digits.len());
    }
    let first: String = digits[..3].iter().collect();
    let last: String = digits[digits.len() - 3..].iter().collect();
    format!("{first}*{last}")
}

fn mask_webhook(url: &str) -> String {
    let Ok(parsed) = reqwest::Url::parse(url) else {
        return "***".to_owned();
    };
    let scheme = parsed.scheme();
    let host = parsed.host_str().unwrap_or("");
    let masked_host = if host.len() <= 6 {
        host.to_owned()
    } else {
        format!("{}...{}", &host[..3], &host[host.len() - 3..])
    };
    format!("{scheme}://{masked_host}/***")
}

/// Fan-out registry plus the create-before-send/retry/rate-limit loop.
pub struct NotificationOrchestrator {
    store: Arc<dyn Store>,
    config: SchedulerConfig,
    providers: RwLock<HashMap<Channel, Arc<dyn NotificationProvider>>>,
}

impl NotificationOrchestrator {
    #[must_use]
    pub fn new(store: Arc<dyn Store>, config: SchedulerConfig) -> Self {
        Self { store, config, providers: RwLock::new(HashMap::new()) }
    }

    pub async fn register(&self, provider: Arc<dyn NotificationProvider>) {
        self.providers.write().await.insert(provider.channel(), provider);
    }

    /// Creates a `pending` notification row, then attempts delivery. A
    /// notification row always exists before any send is attempted
    ///.
    ///
    /// # Errors
    /// Returns [`NotificationError::RateLimited`] if the recipient has hit
    /// `rate_limit_per_hour`, [`NotificationError::ChannelNotRegistered`] if
    /// no provider handles `channel`, or a wrapped store error.
    pub async fn send(
        &self,
        channel: Channel,
        recipient: &str,
        subject: &str,
        template: &str,
        context: &HashMap<String, String>,
    ) -> Result<Uuid, NotificationError> {
        let now = self.store.now().await?;
        let since = now - chrono::Duration::hours(1);
        let recent = self
            .store
            .count_notifications_since(recipient, NotificationStatus::Sent, since)
            .await?;
        if recent >= self.config.rate_limit_per_hour {
            return Err(NotificationError::RateLimited { recipient: recipient.to_owned() });
        }

        let body = render_template(template, context);
        let id = Uuid::new_v4();
        let notification = Notification {
            id,
            channel,
            recipient: recipient.to_owned(),
            subject: subject.to_owned(),
            body: body.clone(),
            status: NotificationStatus::Pending,
            attempts: 0,
            next_retry_at: None,
            last_error: None,
            metadata: serde_json::json!({}),
            created_at: now,
            sent_at: None,
        };
        self.store.insert_notification(notification).await?;

        self.attempt_delivery(id, channel, recipient, &body, 0).await?;
        Ok(id)
    }

    /// `attempts` is the number of prior attempts (0 on the first try),
    /// used to compute the exponential backoff for the *next* retry if
    /// this one fails.
    async fn attempt_delivery(
        &self,
        id: Uuid,
        channel: Channel,
        recipient: &str,
        body: &str,
        attempts: u32,
    ) -> Result<(), NotificationError> {
        let provider = {
            let providers = self.providers.read().await;
            providers.get(&channel).cloned()
        };
        let Some(provider) = provider else {
            let err = NotificationError::ChannelNotRegistered { channel };
            self.store.mark_notification_failed(id, &err.to_string(), None).await?;
            return Err(err);
        };

        let masked = mask_recipient(channel, recipient);
        match provider.send(recipient, body).await {
            Ok(()) => {
                let now = self.store.now().await?;
                self.store.mark_notification_sent(id, now).await?;
                info!(notification_id = %id, recipient = %masked, channel = ?channel, "notification sent");
                Ok(())
            }
            Err(reason) => {
                warn!(notification_id = %id, recipient = %masked, channel = ?channel, error = %reason, "notification send failed");
                let now = self.store.now().await?;
                let backoff_secs = self.config.notification_retry_delay_secs.saturating_mul(1i64 << attempts.min(20));
                let retry_at = now + chrono::Duration::seconds(backoff_secs);
                self.store.mark_notification_failed(id, &reason, Some(retry_at)).await?;
                Err(NotificationError::DeliveryFailed { reason })
            }
        }
    }

    /// Retries every pending notification whose `next_retry_at ≤ now`,
    /// bounded to `attempts ≤ max_retries + 1`.
    ///
    /// # Errors
    /// Returns [`NotificationError::Store`] if fetching due notifications fails.
    pub async fn retry_due(&self, limit: i64) -> Result<usize, NotificationError> {
        let now = self.store.now().await?;
        let due = self.store.fetch_pending_notifications(now, limit).await?;
        let mut retried = 0;

        for notification in due {
            if notification.attempts as u32 >= self.config.notification_max_retries + 1 {
                self.store.cancel_notification(notification.id).await?;
                continue;
            }
            let _ = self
                .attempt_delivery(
                    notification.id,
                    notification.channel,
                    &notification.recipient,
                    &notification.body,
                    notification.attempts as u32,
                )
                .await;
            retried += 1;
        }
        Ok(retried)
    }
}

impl std::fmt::Debug for NotificationOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationOrchestrator").finish_non_exhaustive()
    }
}

/// Bridges deferred jobs the rest of the engine enqueues
/// (`escalation_notification`, `governor_alert`) to the orchestrator — the
/// `QueueRunner` side of [`PostOutcomeHook`](crate::dispatcher::PostOutcomeHook)'s
/// "enqueue rather than call directly" split.
pub struct NotificationJobHandler {
    store: Arc<dyn Store>,
    orchestrator: Arc<NotificationOrchestrator>,
}

impl NotificationJobHandler {
    #[must_use]
    pub fn new(store: Arc<dyn Store>, orchestrator: Arc<NotificationOrchestrator>) -> Self {
        Self { store, orchestrator }
    }

    async fn handle_escalation_notification(&self, job: &Job) -> Result<(), String> {
        let target_id: Uuid = serde_json::from_value(job.payload["target_id"].clone())
            .map_err(|e| format!("malformed escalation_notification payload: {e}"))?;
        let channel: Channel = serde_json::from_value(job.payload["channel"].clone())
            .map_err(|e| format!("malformed escalation_notification payload: {e}"))?;
        let level = job.payload["level"].as_u64().unwrap_or(0);
        let escalation_id: Uuid = serde_json::from_value(job.payload["escalation_id"].clone())
            .map_err(|e| format!("malformed escalation_notification payload: {e}"))?;

        let target = self
            .store
            .get_target(target_id)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("target {target_id} not found"))?;
        let recipient = target
            .notification_channels
            .get(&channel)
            .ok_or_else(|| format!("target {target_id} has no recipient configured for {channel:?}"))?;

        let mut context = HashMap::new();
        context.insert("target_name".to_owned(), target.name.clone());
        context.insert("target_url".to_owned(), target.url.clone());
        context.insert("level".to_owned(), level.to_string());
        context.insert("escalation_id".to_owned(), escalation_id.to_string());

        self.orchestrator
            .send(
                channel,
                recipient,
                &format!("scanwarden: {} escalated to level {level}", target.name),
                "{{target_name}} ({{target_url}}) escalated to level {{level}} (escalation {{escalation_id}})",
                &context,
            )
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }
}

#[async_trait]
impl JobHandler for NotificationJobHandler {
    async fn handle(&self, job: &Job) -> Result<(), String> {
        match job.job_type.as_str() {
            "escalation_notification" => self.handle_escalation_notification(job).await,
            // The alert itself is already observable via the `tracing::warn!`
            // emitted when the governor enqueued this job; no per-job
            // recipient exists for a fleet-wide resource alert.
            "governor_alert" => Ok(()),
            other => Err(format!("unknown job type: {other}")),
        }
    }
}

/// SMTP-via-HTTP-relay shape: a `reqwest`-based provider API call, the
/// ecosystem-standard async approach for outbound transactional email.
pub struct EmailChannel {
    client: reqwest::Client,
    relay_url: String,
    api_key: String,
}

impl EmailChannel {
    #[must_use]
    pub fn new(relay_url: String, api_key: String) -> Self {
        Self { client: reqwest::Client::new(), relay_url, api_key }
    }
}

#[async_trait]
impl NotificationProvider for EmailChannel {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn send(&self, recipient: &str, rendered: &str) -> Result<(), String> {
        let response = self
            .client
            .post(&self.relay_url)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({ "to": recipient, "body": rendered }))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("relay returned {}", response.status()))
        }
    }
}

/// Grounded on the Twilio Messages API shape
/// (`reqwest::Client::post(...).basic_auth(account_sid, auth_token).form(&body)`).
pub struct SmsChannel {
    client: reqwest::Client,
    account_sid: String,
    auth_token: String,
    from_number: String,
}

impl SmsChannel {
    #[must_use]
    pub fn new(account_sid: String, auth_token: String, from_number: String) -> Self {
        Self { client: reqwest::Client::new(), account_sid, auth_token, from_number }
    }
}

#[async_trait]
impl NotificationProvider for SmsChannel {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    async fn send(&self, recipient: &str, rendered: &str) -> Result<(), String> {
        let url = format!(
            "https://api.twilio.com/2010-04-01/Accounts/{}/Messages.json",
            self.account_sid
        );
        let response = self
            .client
            .post(url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[("To", recipient), ("From", self.from_number.as_str()), ("Body", rendered)])
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("twilio returned {}", response.status()))
        }
    }
}

/// Plain `reqwest::Client::post(url).json(&body)`.
pub struct WebhookChannel {
    client: reqwest::Client,
}

impl WebhookChannel {
    #[must_use]
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

impl Default for WebhookChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationProvider for WebhookChannel {
    fn channel(&self) -> Channel {
        Channel::Webhook
    }

    async fn send(&self, recipient: &str, rendered: &str) -> Result<(), String> {
        let response = self
            .client
            .post(recipient)
            .json(&serde_json::json!({ "message": rendered }))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("webhook returned {}", response.status()))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use scanwarden_store::memory::MemoryStore;

    #[test]
    fn render_substitutes_known_and_strips_unknown() {
        let mut ctx = HashMap::new();
        ctx.insert("name".to_owned(), "T1".to_owned());
        assert_eq!(render_template("hello {{name}}", &ctx), "hello T1");
        assert_eq!(render_template("hello {{missing}}", &ctx), "hello ");
        assert_eq!(render_template("{{name}}", &HashMap::new()), "");
    }

    #[test]
    fn masking_matches_spec_contract() {
        assert_eq!(mask_email("alice@example.com"), "al@example.com");
        assert_eq!(mask_phone("+15551234567"), "+15*567");
        assert_eq!(mask_webhook("https://hooks.example.com/abc/def"), "https://hoo...com/***");
    }

    struct AlwaysOk(Channel);
    #[async_trait]
    impl NotificationProvider for AlwaysOk {
        fn channel(&self) -> Channel {
            self.0
        }
        async fn send(&self, _recipient: &str, _rendered: &str) -> Result<(), String> {
            Ok(())
        }
    }

    struct AlwaysFail(Channel);
    #[async_trait]
    impl NotificationProvider for AlwaysFail {
        fn channel(&self) -> Channel {
            self.0
        }
        async fn send(&self, _recipient: &str, _rendered: &str) -> Result<(), String> {
            Err("simulated".to_owned())
        }
    }

    #[tokio::test]
    async fn send_creates_row_before_attempting_delivery() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let orch = NotificationOrchestrator::new(Arc::clone(&store), SchedulerConfig::from_env());
        orch.register(Arc::new(AlwaysOk(Channel::Email))).await;

        let id = orch
            .send(Channel::Email, "alice@example.com", "subj", "body {{x}}", &HashMap::new())
            .await
            .unwrap();

        let now = store.now().await.unwrap();
        let sent = store.count_notifications_since("alice@example.com", NotificationStatus::Sent, now - chrono::Duration::hours(1)).await.unwrap();
        assert_eq!(sent, 1);
        let _ = id;
    }

    #[tokio::test]
    async fn rate_limit_rejects_after_threshold() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let mut config = SchedulerConfig::from_env();
        config.rate_limit_per_hour = 1;
        let orch = NotificationOrchestrator::new(Arc::clone(&store), config);
        orch.register(Arc::new(AlwaysOk(Channel::Email))).await;

        orch.send(Channel::Email, "bob@example.com", "s", "b", &HashMap::new()).await.unwrap();
        let err = orch.send(Channel::Email, "bob@example.com", "s", "b", &HashMap::new()).await.unwrap_err();
        assert!(matches!(err, NotificationError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn failed_delivery_schedules_a_retry() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let orch = NotificationOrchestrator::new(Arc::clone(&store), SchedulerConfig::from_env());
        orch.register(Arc::new(AlwaysFail(Channel::Webhook))).await;

        let result = orch
            .send(Channel::Webhook, "https://example.com/hook", "s", "b", &HashMap::new())
            .await;
        assert!(result.is_err());
    }
}
