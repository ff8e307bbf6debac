//! Error classification and retry-delay computation.
//!
//! Grounded structurally on `vaultrs-core::lease`'s pure `is_expired`/
//! `expires_at` helpers: small, deterministic functions kept separate from
//! any I/O-bound manager, so they can be exhaustively unit tested without a store in the loop.

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::config::SchedulerConfig;

/// Closed set of error categories RetryPolicy classifies into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Timeout,
    ConnectionRefused,
    DnsError,
    NotFound,
    ServerError,
    Forbidden,
    SslError,
    Unknown,
}

impl ErrorCategory {
    /// Case-insensitive substring match against the last error string
    ///. Order matters where substrings could overlap; more
    /// specific categories are checked first.
    #[must_use]
    pub fn classify(error_message: &str) -> Self {
        let lower = error_message.to_lowercase();
        if lower.contains("timeout") || lower.contains("timed out") {
            Self::Timeout
        } else if lower.contains("connection refused") {
            Self::ConnectionRefused
        } else if lower.contains("dns") || lower.contains("name resolution") {
            Self::DnsError
        } else if lower.contains("not found") || lower.contains("404") {
            Self::NotFound
        } else if lower.contains("forbidden") || lower.contains("403") {
            Self::Forbidden
        } else if lower.contains("ssl") || lower.contains("tls") || lower.contains("certificate") {
            Self::SslError
        } else if lower.contains("server error") || lower.contains("50") {
            Self::ServerError
        } else {
            Self::Unknown
        }
    }

    /// Per-category retry multiplier feeding the backoff formula.
    #[must_use]
    pub fn multiplier(self) -> f64 {
        match self {
            Self::Timeout => 1.5,
            Self::ConnectionRefused => 2.0,
            Self::ServerError => 1.2,
            Self::DnsError => 3.0,
            Self::SslError => 2.5,
            Self::NotFound | Self::Forbidden | Self::Unknown => 1.5,
        }
    }

    /// Whether this category is ever worth retrying.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::NotFound | Self::Forbidden)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::ConnectionRefused => "connection_refused",
            Self::DnsError => "dns_error",
            Self::NotFound => "not_found",
            Self::ServerError => "server_error",
            Self::Forbidden => "forbidden",
            Self::SslError => "ssl_error",
            Self::Unknown => "unknown",
        }
    }
}

/// The outcome of consulting RetryPolicy about a failed scan.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    /// Schedule the next attempt at this instant.
    RetryAt(DateTime<Utc>),
    /// Stop retrying and mark the target for manual review.
    GiveUp { mark_review: bool },
}

/// Pure classification + backoff computation; no I/O.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    base_delay_min: f64,
    max_retries_per_day: u32,
}

impl RetryPolicy {
    #[must_use]
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            base_delay_min: config.retry_base_delay_min,
            max_retries_per_day: config.max_retries_per_day,
        }
    }

    /// Decide whether target `T` (currently at `attempts_today` failed
    /// attempts within the last 24h) should retry after `last_error`, and
    /// if so, when.
    #[must_use]
    pub fn decide(
        &self,
        last_error: &str,
        attempts_today: u32,
        now: DateTime<Utc>,
    ) -> (ErrorCategory, RetryDecision) {
        let category = ErrorCategory::classify(last_error);

        if !category.is_retryable() || attempts_today >= self.max_retries_per_day {
            return (category, RetryDecision::GiveUp { mark_review: true });
        }

        let delay = self.delay_for(category, attempts_today + 1);
        (category, RetryDecision::RetryAt(now + delay))
    }

    /// `delay = baseDelayMin × multiplier^min(attempts-1, 4)`, ±20% jitter,
    /// clamped to `[5, 240]` minutes.
    #[must_use]
    pub fn delay_for(&self, category: ErrorCategory, attempts: u32) -> chrono::Duration {
        let exponent = attempts.saturating_sub(1).min(4) as i32;
        let raw_minutes = self.base_delay_min * category.multiplier().powi(exponent);

        let jitter = rand::thread_rng().gen_range(0.8..=1.2);
        let jittered = raw_minutes * jitter;

        let clamped = jittered.clamp(5.0, 240.0);
        chrono::Duration::milliseconds((clamped * 60_000.0) as i64)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy { base_delay_min: 5.0, max_retries_per_day: 5 }
    }

    #[test]
    fn classifies_known_substrings_case_insensitively() {
        assert_eq!(ErrorCategory::classify("Connection Refused by host"), ErrorCategory::ConnectionRefused);
        assert_eq!(ErrorCategory::classify("DNS lookup failed"), ErrorCategory::DnsError);
        assert_eq!(ErrorCategory::classify("request TIMED OUT"), ErrorCategory::Timeout);
        assert_eq!(ErrorCategory::classify("404 not found"), ErrorCategory::NotFound);
        assert_eq!(ErrorCategory::classify("403 Forbidden"), ErrorCategory::Forbidden);
        assert_eq!(ErrorCategory::classify("SSL handshake failed"), ErrorCategory::SslError);
        assert_eq!(ErrorCategory::classify("something weird happened"), ErrorCategory::Unknown);
    }

    #[test]
    fn non_retryable_categories_give_up_immediately() {
        let p = policy();
        let now = Utc::now();
        let (cat, decision) = p.decide("404 not found", 0, now);
        assert_eq!(cat, ErrorCategory::NotFound);
        assert_eq!(decision, RetryDecision::GiveUp { mark_review: true });

        let (cat, decision) = p.decide("403 forbidden", 0, now);
        assert_eq!(cat, ErrorCategory::Forbidden);
        assert_eq!(decision, RetryDecision::GiveUp { mark_review: true });
    }

    #[test]
    fn daily_cap_forces_give_up() {
        let p = policy();
        let now = Utc::now();
        let (_, decision) = p.decide("connection refused", 5, now);
        assert_eq!(decision, RetryDecision::GiveUp { mark_review: true });
    }

    #[test]
    fn retry_delay_is_clamped_to_5_240_minutes() {
        let p = policy();
        for attempts in 1..=10u32 {
            let delay = p.delay_for(ErrorCategory::DnsError, attempts);
            let minutes = delay.num_milliseconds() as f64 / 60_000.0;
            assert!((5.0..=240.0).contains(&minutes), "delay {minutes} out of bounds");
        }
    }

    #[test]
    fn retryable_category_returns_retry_at_in_the_future() {
        let p = policy();
        let now = Utc::now();
        let (cat, decision) = p.decide("connection refused", 0, now);
        assert_eq!(cat, ErrorCategory::ConnectionRefused);
        match decision {
            RetryDecision::RetryAt(at) => assert!(at > now),
            RetryDecision::GiveUp { .. } => panic!("expected a retry"),
        }
    }
}
