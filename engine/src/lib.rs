//! # Stow Engine
//!
//! A reactive, in-process data store with pluggable persistence.
//!
//! The engine keeps an observable, de-duplicated collection of entities in
//! memory, mirrors it to a backing store, re-persists entities when their
//! fields change, and lets other collections derive live filtered views of it.
//!
//! ## Design Principles
//!
//! - **No IO of its own**: backing stores are injected through [`Repository`]
//!   and [`GranularRepository`]
//! - **Deterministic**: diffing is map-based and independent of input order
//! - **Single writer**: every store mutation runs on the store's owning
//!   [`Affinity`] context, or inline when there is none
//!
//! ## Core Concepts
//!
//! ### Stores
//!
//! - [`MemoryStore`] - de-duplicated, observable collection
//! - [`PersistentStore`] - a memory store wired to a backend through a
//!   [`PersistenceStrategy`]
//!
//! ### Identity
//!
//! Entities implement [`Entity`]. Types that also implement [`Identity`]
//! carry an integer surrogate key and persist granularly:
//! - `key == 0` - not yet persisted, inserted on write
//! - `key > 0` - stable, backend-assigned
//! - `key < 0` - unmanaged, never touched by diffing
//!
//! ### Live derivation
//!
//! - [`mirror`] - one-way forwarding from one store into another
//! - [`Relationship`] - a child store continuously filtered by a parent
//!
//! ## Quick Start
//!
//! ```rust
//! use stow_engine::{comparer, MemoryStore, MemoryRepository, PersistentStore, StoreOptions};
//!
//! // 1. An observable in-memory store
//! let tags = MemoryStore::new(comparer::natural::<String>());
//! assert!(tags.add("rust".to_string()).unwrap());
//! assert!(!tags.add("rust".to_string()).unwrap()); // duplicates are ignored
//!
//! // 2. A persistent store backed by a whole-collection repository
//! let store = PersistentStore::full_rewrite(
//!     MemoryRepository::<String>::new(),
//!     comparer::natural(),
//!     StoreOptions::default(),
//! );
//! store.add("draft".to_string()).unwrap();
//! assert_eq!(store.load().unwrap(), 1);
//! ```

pub mod affinity;
pub mod backend;
pub mod binder;
pub mod comparer;
pub mod config;
pub mod diff;
pub mod entity;
pub mod error;
pub mod mirror;
pub mod persistent;
pub mod provider;
pub mod relationship;
pub mod repository;
pub mod store;
pub mod strategy;
pub mod subscription;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types at crate root
pub use affinity::{Affinity, AffinityGuard, AffinityThread, Mailbox};
pub use backend::{BackendStats, MemoryRepository, MemoryTable};
pub use binder::ChangeBinder;
pub use comparer::{Comparer, FnComparer, NaturalEq, Projection, SharedComparer};
pub use config::{ConfigError, StoreOptions};
pub use diff::{diff, diff_entities, DiffResult};
pub use entity::{require_assigned, Entity, FieldNotifier, Identity, KeyState};
pub use error::{Error, ErrorKind, Result};
pub use mirror::{mirror, MirrorTarget};
pub use persistent::PersistentStore;
pub use provider::{StoreKind, StoreProvider, StoreRef};
pub use relationship::{Predicate, Relationship, RelationshipBuilder};
pub use repository::{GranularRepository, Repository};
pub use store::{CollectionChange, MemoryStore};
pub use strategy::{FullRewriteStrategy, GranularStrategy, PersistenceStrategy};
pub use subscription::{Release, Subscription};

/// Surrogate key of an [`Identity`] entity.
pub type Key = i64;

/// Lock a mutex, recovering the data if a panicking holder poisoned it.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}
