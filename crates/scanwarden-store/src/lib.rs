//! Row-store abstraction for ScanWarden.
//!
//! [`Store`] is the single persistence seam the rest of the engine depends
//! on. [`postgres::PgStore`] is the production backend; [`memory::MemoryStore`]
//! is a fully concurrent in-memory fake used by unit tests across the
//! workspace so the locking/uniqueness invariants can be exercised without a
//! database.

pub mod error;
pub mod memory;
pub mod models;
#[cfg(feature = "postgres-backend")]
pub mod postgres;
pub mod traits;

pub use error::{StoreError, StoreResult};
pub use traits::Store;
