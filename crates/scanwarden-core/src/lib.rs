//! `scanwarden-core` — the distributed scan-scheduling and execution engine.
//!
//! One module per subsystem, a shared [`error::Classify`] contract every
//! subsystem error implements, and a [`config::SchedulerConfig`] every
//! subsystem is constructed from. Nothing in this crate holds module-level
//! mutable state: every component is constructed with an explicit
//! `Arc<dyn scanwarden_store::Store>` handle.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod escalation;
pub mod governor;
pub mod lease;
pub mod notify;
pub mod probe;
pub mod queue;
pub mod retry;
