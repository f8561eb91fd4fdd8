//! capstan-state — embedded state store for Capstan.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for deployment records and operation leases.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Deployment records are keyed by UUID; leases are keyed by operation kind,
//! making the table key the uniqueness constraint that guarantees at most
//! one lease per operation across all service instances.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod lease;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{DEFAULT_LEASE_TIMEOUT, StateStore};
pub use types::*;
