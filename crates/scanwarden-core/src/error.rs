//! Error types for `scanwarden-core`.
//!
//! Each subsystem gets its own `thiserror` enum rather than one crate-wide
//! error. On top of that sits [`ErrorKind`], the closed
//! classification the retry policy and the CLI exit-code mapping both
//! switch on — every subsystem error classifies itself via [`Classify`].

use scanwarden_store::StoreError;

/// The closed set of ways an operation can fail, independent of which
/// subsystem raised it. Used by [`crate::retry::RetryPolicy`] to pick a
/// backoff strategy and by the CLI to choose an exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network blip, connection reset, DNS hiccup — retry with backoff.
    TransientIo,
    /// Lost a race for a lease, row lock, or unique constraint — retry soon,
    /// no backoff escalation needed.
    ContentionLost,
    /// The request itself cannot succeed no matter how many times it is
    /// retried (bad URL, validation failure) — do not retry.
    Unprocessable,
    /// The governor or a downstream system is out of capacity — retry after
    /// a cooldown longer than the usual backoff.
    ResourceExhausted,
    /// Programmer error or unrecoverable corruption — surface immediately.
    Fatal,
}

/// Implemented by every subsystem error so callers can classify without a
/// giant match statement duplicated at every call site.
pub trait Classify {
    fn kind(&self) -> ErrorKind;
}

impl Classify for StoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Conflict(_) => ErrorKind::ContentionLost,
            StoreError::NotFound(_) | StoreError::InvalidRecord(_) => ErrorKind::Unprocessable,
            #[cfg(feature = "postgres-backend")]
            StoreError::Database(e) if e.as_database_error().is_some() => {
                ErrorKind::TransientIo
            }
            _ => ErrorKind::TransientIo,
        }
    }
}

/// Errors from lease acquisition/renewal.
#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    #[error("lease '{name}' is already held by another owner")]
    AlreadyHeld { name: String },

    #[error("lease '{name}' is not held by this owner, cannot renew or release")]
    NotOwner { name: String },

    #[error("lease store error: {0}")]
    Store(#[from] StoreError),
}

impl Classify for LeaseError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::AlreadyHeld { .. } | Self::NotOwner { .. } => ErrorKind::ContentionLost,
            Self::Store(e) => e.kind(),
        }
    }
}

/// Errors from probe registration/execution.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("no probe registered under name '{name}'")]
    NotRegistered { name: String },

    #[error("probe '{name}' exceeded its deadline of {timeout_ms}ms")]
    Timeout { name: String, timeout_ms: u64 },

    #[error("probe '{name}' execution failed: {reason}")]
    ExecutionFailed { name: String, reason: String },
}

impl Classify for ProbeError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::NotRegistered { .. } => ErrorKind::Unprocessable,
            Self::Timeout { .. } => ErrorKind::TransientIo,
            Self::ExecutionFailed { .. } => ErrorKind::TransientIo,
        }
    }
}

/// Errors raised during dispatch of a single target's scan.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("target '{target_id}' was not found")]
    TargetNotFound { target_id: uuid::Uuid },

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error(transparent)]
    Lease(#[from] LeaseError),

    #[error("scheduler is in cooldown due to resource exhaustion: {reason}")]
    GovernorThrottled { reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Classify for DispatchError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::TargetNotFound { .. } => ErrorKind::Unprocessable,
            Self::Probe(e) => e.kind(),
            Self::Lease(e) => e.kind(),
            Self::GovernorThrottled { .. } => ErrorKind::ResourceExhausted,
            Self::Store(e) => e.kind(),
        }
    }
}

/// Errors from the escalation state machine.
#[derive(Debug, thiserror::Error)]
pub enum EscalationError {
    #[error("target '{target_id}' already has an active escalation")]
    AlreadyActive { target_id: uuid::Uuid },

    #[error("escalation '{id}' was not found")]
    NotFound { id: uuid::Uuid },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Classify for EscalationError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::AlreadyActive { .. } => ErrorKind::ContentionLost,
            Self::NotFound { .. } => ErrorKind::Unprocessable,
            Self::Store(e) => e.kind(),
        }
    }
}

/// Errors from notification dispatch.
#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("no channel registered for '{channel:?}'")]
    ChannelNotRegistered { channel: scanwarden_store::models::Channel },

    #[error("recipient '{recipient}' exceeded its rate limit")]
    RateLimited { recipient: String },

    #[error("channel delivery failed: {reason}")]
    DeliveryFailed { reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Classify for NotificationError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::ChannelNotRegistered { .. } => ErrorKind::Unprocessable,
            Self::RateLimited { .. } => ErrorKind::ResourceExhausted,
            Self::DeliveryFailed { .. } => ErrorKind::TransientIo,
            Self::Store(e) => e.kind(),
        }
    }
}

/// Errors from the job queue.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("job '{id}' was not found")]
    NotFound { id: uuid::Uuid },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Classify for QueueError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::Unprocessable,
            Self::Store(e) => e.kind(),
        }
    }
}
