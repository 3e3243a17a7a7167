//! Cache tier store.
//!
//! Tiers are named key→response containers with independent retention:
//! - STATIC holds the build-time asset manifest, written once at install
//! - DYNAMIC holds responses captured lazily while serving requests
//! - OFFLINE_SNAPSHOT holds explicitly primed data and survives rollovers
//!
//! Storage is behind the [`TierStorage`] trait so the worker can run on SQLite
//! in production and on an in-memory store in tests.

#[cfg(test)]
mod memory;
mod registry;
mod storage;
mod types;

#[cfg(test)]
pub use memory::MemoryStorage;
pub use registry::{TierNames, TierRegistry};
pub use storage::{SqliteStorage, TierStorage};
pub use types::{EntryKey, ResponseSource, Served, StoredResponse, TierPurpose};
