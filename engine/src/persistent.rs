//! PersistentStore - a memory store wired to a backend.
//!
//! Every mutation runs whole on the store's owning context: the memory store
//! changes first, then the strategy callback persists it. Strategy failures
//! propagate unchanged and mark the store faulted, since memory may now be
//! ahead of the backend. A faulted store rejects mutations until [`load`]
//! re-synchronizes memory from the backend.
//!
//! [`load`]: PersistentStore::load

use crate::{
    ChangeBinder, Entity, Error, FullRewriteStrategy, GranularRepository, GranularStrategy,
    Identity, MemoryStore, PersistenceStrategy, Release, Repository, Result, SharedComparer,
    StoreOptions,
};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

struct PersistentInner<T> {
    memory: MemoryStore<T>,
    strategy: Box<dyn PersistenceStrategy<T>>,
    binder: Option<ChangeBinder<T>>,
    faulted: AtomicBool,
    options: StoreOptions,
}

/// Observable store whose contents are mirrored to a backend.
///
/// Cloning yields another handle to the same store.
pub struct PersistentStore<T> {
    inner: Arc<PersistentInner<T>>,
}

impl<T> Clone for PersistentStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Entity> PersistentStore<T> {
    /// Wire `memory` to `strategy`. The strategy must observe the same
    /// memory store.
    pub fn new(
        memory: MemoryStore<T>,
        strategy: impl PersistenceStrategy<T> + 'static,
        options: StoreOptions,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<PersistentInner<T>>| {
            let binder = options.track_field_changes.then(|| {
                let weak = weak.clone();
                ChangeBinder::new(move |item: &T| match weak.upgrade() {
                    Some(inner) => inner.persist_change(item.clone()),
                    None => Ok(()),
                })
            });

            PersistentInner {
                memory,
                strategy: Box::new(strategy),
                binder,
                faulted: AtomicBool::new(false),
                options,
            }
        });

        if let Some(binder) = &inner.binder {
            // The binder keeps the store subscription and releases it with itself
            let _following = binder.attach_to_store(&inner.memory);
        }

        tracing::debug!(
            strategy = inner.strategy.name(),
            track_field_changes = options.track_field_changes,
            "Persistent store created"
        );

        Self { inner }
    }

    /// A store that rewrites the whole collection through `repository`.
    pub fn full_rewrite<R>(
        repository: R,
        comparer: SharedComparer<T>,
        options: StoreOptions,
    ) -> Self
    where
        R: Repository<T> + 'static,
    {
        let memory = MemoryStore::new(comparer);
        let strategy = FullRewriteStrategy::new(memory.clone(), repository);
        Self::new(memory, strategy, options)
    }

    /// Replace memory with the backend's contents. Clears the faulted state.
    pub fn load(&self) -> Result<usize> {
        let inner = Arc::clone(&self.inner);
        self.inner.memory.dispatch(move || inner.load())?
    }

    /// Add an item unless an equal one is present, then persist it.
    pub fn add(&self, item: T) -> Result<bool> {
        Ok(self.add_many([item])? == 1)
    }

    /// Add every item not already present, then persist the added ones.
    pub fn add_many(&self, items: impl IntoIterator<Item = T>) -> Result<usize> {
        let items: Vec<T> = items.into_iter().collect();
        let inner = Arc::clone(&self.inner);
        self.inner.memory.dispatch(move || inner.add_many(items))?
    }

    /// Remove the item equal to `item` and delete it from the backend.
    pub fn remove(&self, item: &T) -> Result<bool> {
        Ok(self.remove_many([item.clone()])? == 1)
    }

    /// Remove every listed item that is present.
    pub fn remove_many(&self, items: impl IntoIterator<Item = T>) -> Result<usize> {
        self.remove_matching(items.into_iter().collect(), None)
    }

    /// Remove every item matching `predicate`.
    pub fn remove_where<P>(&self, predicate: P) -> Result<usize>
    where
        P: Fn(&T) -> bool + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        self.inner.memory.dispatch(move || {
            inner.ensure_healthy()?;
            let removed = inner.memory.take_where(predicate)?;
            inner.persist_removed(removed)
        })?
    }

    /// Empty the store and the backend.
    pub fn clear(&self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        self.inner.memory.dispatch(move || {
            inner.ensure_healthy()?;
            inner.memory.take_all()?;
            let outcome = inner.strategy.on_cleared();
            inner.settle("clear", outcome)
        })?
    }

    /// Persist the current state of `item`.
    pub fn update(&self, item: &T) -> Result<()> {
        Arc::clone(&self.inner).persist_change(item.clone())
    }

    /// Reconcile the backend with the whole collection.
    pub fn flush(&self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        self.inner.memory.dispatch(move || {
            inner.ensure_healthy()?;
            let outcome = inner.strategy.flush();
            inner.settle("flush", outcome)
        })?
    }

    /// [`load`](Self::load) on a blocking worker, for async callers.
    pub async fn load_async(&self) -> Result<usize> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.load())
            .await
            .map_err(|e| Error::TaskFailed(e.to_string()))?
    }

    /// [`flush`](Self::flush) on a blocking worker, for async callers.
    pub async fn flush_async(&self) -> Result<()> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.flush())
            .await
            .map_err(|e| Error::TaskFailed(e.to_string()))?
    }

    pub(crate) fn remove_matching(
        &self,
        items: Vec<T>,
        comparer: Option<SharedComparer<T>>,
    ) -> Result<usize> {
        let inner = Arc::clone(&self.inner);
        self.inner.memory.dispatch(move || {
            inner.ensure_healthy()?;
            let removed = inner.memory.take_many(items, comparer)?;
            inner.persist_removed(removed)
        })?
    }

    /// The underlying observable store. Mutating it directly bypasses
    /// persistence.
    pub fn memory(&self) -> &MemoryStore<T> {
        &self.inner.memory
    }

    pub fn options(&self) -> StoreOptions {
        self.inner.options
    }

    /// Name of the persistence strategy in use.
    pub fn strategy_name(&self) -> &'static str {
        self.inner.strategy.name()
    }

    /// Whether a persistence failure left memory out of sync with the backend.
    pub fn is_faulted(&self) -> bool {
        self.inner.faulted.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.inner.memory.snapshot()
    }

    pub fn len(&self) -> usize {
        self.inner.memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.memory.is_empty()
    }

    pub fn contains(&self, item: &T) -> bool {
        self.inner.memory.contains(item)
    }
}

impl<T> PersistentStore<T>
where
    T: Identity,
{
    /// A store persisting record by record through `repository`.
    pub fn granular<R>(repository: R, comparer: SharedComparer<T>, options: StoreOptions) -> Self
    where
        R: GranularRepository<T> + 'static,
    {
        let memory = MemoryStore::new(comparer);
        let strategy = GranularStrategy::new(memory.clone(), repository);
        Self::new(memory, strategy, options)
    }
}

impl<T: Entity> PersistentInner<T> {
    fn ensure_healthy(&self) -> Result<()> {
        if self.faulted.load(Ordering::Acquire) {
            return Err(Error::StoreFaulted);
        }
        Ok(())
    }

    /// Mark the store faulted when a persistence step failed.
    fn settle<R>(&self, op: &'static str, outcome: Result<R>) -> Result<R> {
        if let Err(err) = &outcome {
            self.faulted.store(true, Ordering::Release);
            tracing::warn!(
                strategy = self.strategy.name(),
                op,
                error = %err,
                "Persistence failed; store marked faulted until reload"
            );
        }
        outcome
    }

    fn load(&self) -> Result<usize> {
        let items = self.strategy.load()?;
        let count = self.memory.replace_all(items)?;
        self.faulted.store(false, Ordering::Release);
        tracing::debug!(strategy = self.strategy.name(), count, "Store loaded");
        Ok(count)
    }

    fn add_many(&self, items: Vec<T>) -> Result<usize> {
        self.ensure_healthy()?;
        let added = self.memory.push_many(items)?;
        if added.is_empty() {
            return Ok(0);
        }
        let outcome = self.strategy.on_added(&added);
        self.settle("add", outcome).map(|_| added.len())
    }

    fn persist_removed(&self, removed: Vec<T>) -> Result<usize> {
        if removed.is_empty() {
            return Ok(0);
        }
        let outcome = self.strategy.on_removed(&removed);
        self.settle("remove", outcome).map(|_| removed.len())
    }

    /// Persist a field change, marshaled onto the owning context.
    fn persist_change(self: Arc<Self>, item: T) -> Result<()> {
        let inner = Arc::clone(&self);
        self.memory.dispatch(move || {
            inner.ensure_healthy()?;
            let outcome = inner.strategy.on_changed(&item);
            inner.settle("update", outcome)
        })?
    }
}

impl<T: Entity> Release for PersistentStore<T> {
    /// Stop tracking field changes and drop every memory listener.
    fn release(&self) {
        if let Some(binder) = &self.inner.binder {
            binder.release();
        }
        self.inner.memory.release();
    }
}

impl<T> fmt::Debug for PersistentStore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentStore")
            .field("strategy", &self.inner.strategy.name())
            .field("memory", &self.inner.memory)
            .field("faulted", &self.inner.faulted.load(Ordering::Relaxed))
            .field("options", &self.inner.options)
            .finish()
    }
}
