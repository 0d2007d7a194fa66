//! Relationship - a child collection continuously derived from a parent.
//!
//! The derived store holds exactly the candidates for which
//! `predicate(parent, candidate)` holds. It is reconciled in place, never
//! rebuilt, so its own listeners see precise `Added`/`Removed` signals:
//!
//! - parent or predicate set, or [`Relationship::refresh`]: full reconcile
//! - candidate added to or removed from the source: add or remove matches
//! - source reset: derived store emptied
//! - a field of a candidate changed: that candidate is re-evaluated
//!
//! The candidate source is either given explicitly or looked up lazily from a
//! [`StoreProvider`]. A lookup that finds nothing leaves the derived store
//! empty and is retried on the next full reconcile.

use crate::{
    lock, ChangeBinder, CollectionChange, Entity, Error, MemoryStore, Result, SharedComparer,
    StoreProvider, Subscription,
};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

/// Membership test for a candidate under a parent.
pub type Predicate<P, C> = Arc<dyn Fn(&P, &C) -> bool + Send + Sync>;

struct RelationshipInner<P, C> {
    parent: OnceLock<P>,
    predicate: Mutex<Option<Predicate<P, C>>>,
    configured_source: Option<MemoryStore<C>>,
    provider: Option<Arc<StoreProvider>>,
    source: Mutex<Option<MemoryStore<C>>>,
    source_hooks: Mutex<Vec<Subscription>>,
    children: MemoryStore<C>,
    binder: ChangeBinder<C>,
    released: AtomicBool,
}

/// Configures a [`Relationship`].
pub struct RelationshipBuilder<P, C> {
    comparer: SharedComparer<C>,
    source: Option<MemoryStore<C>>,
    provider: Option<Arc<StoreProvider>>,
    predicate: Option<Predicate<P, C>>,
    parent: Option<P>,
}

impl<P, C> RelationshipBuilder<P, C>
where
    P: Send + Sync + 'static,
    C: Entity,
{
    /// Start a builder; `comparer` defines identity in the derived store.
    pub fn new(comparer: SharedComparer<C>) -> Self {
        Self {
            comparer,
            source: None,
            provider: None,
            predicate: None,
            parent: None,
        }
    }

    /// Draw candidates from `store`.
    pub fn source(mut self, store: &MemoryStore<C>) -> Self {
        self.source = Some(store.clone());
        self
    }

    /// Look the candidate store up from `provider` when no source is given.
    pub fn provider(mut self, provider: Arc<StoreProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn predicate(mut self, predicate: impl Fn(&P, &C) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn parent(mut self, parent: P) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Create the relationship and run the first reconcile.
    pub fn build(self) -> Result<Relationship<P, C>> {
        let children = MemoryStore::new(self.comparer);
        let inner = Arc::new_cyclic(|weak: &Weak<RelationshipInner<P, C>>| {
            let weak = weak.clone();
            let binder = ChangeBinder::new(move |candidate: &C| match weak.upgrade() {
                Some(inner) => inner.on_candidate_changed(candidate),
                None => Ok(()),
            });

            RelationshipInner {
                parent: OnceLock::new(),
                predicate: Mutex::new(self.predicate),
                configured_source: self.source,
                provider: self.provider,
                source: Mutex::new(None),
                source_hooks: Mutex::new(Vec::new()),
                children,
                binder,
                released: AtomicBool::new(false),
            }
        });

        if let Some(parent) = self.parent {
            let _ = inner.parent.set(parent);
        }

        let relationship = Relationship { inner };
        relationship.inner.reconcile()?;
        Ok(relationship)
    }
}

/// A derived child store filtered by a parent.
///
/// Dropping the relationship releases it.
pub struct Relationship<P, C>
where
    P: Send + Sync + 'static,
    C: Entity,
{
    inner: Arc<RelationshipInner<P, C>>,
}

impl<P, C> Relationship<P, C>
where
    P: Send + Sync + 'static,
    C: Entity,
{
    pub fn builder(comparer: SharedComparer<C>) -> RelationshipBuilder<P, C> {
        RelationshipBuilder::new(comparer)
    }

    /// Set the parent. Fails if one is already set.
    pub fn set_parent(&self, parent: P) -> Result<()> {
        self.inner
            .parent
            .set(parent)
            .map_err(|_| Error::ParentAlreadySet)?;
        self.inner.reconcile()
    }

    /// Replace the predicate. Passing the current predicate again is a no-op.
    pub fn set_predicate(&self, predicate: Predicate<P, C>) -> Result<()> {
        {
            let mut current = lock(&self.inner.predicate);
            if current
                .as_ref()
                .is_some_and(|existing| Arc::ptr_eq(existing, &predicate))
            {
                return Ok(());
            }
            *current = Some(predicate);
        }
        self.inner.reconcile()
    }

    /// Re-resolve the source if needed and reconcile the derived store.
    pub fn refresh(&self) -> Result<()> {
        self.inner.reconcile()
    }

    /// The derived store.
    pub fn children(&self) -> &MemoryStore<C> {
        &self.inner.children
    }

    pub fn parent(&self) -> Option<&P> {
        self.inner.parent.get()
    }

    /// The candidate store, once resolved.
    pub fn source(&self) -> Option<MemoryStore<C>> {
        lock(&self.inner.source).clone()
    }

    /// Stop observing and empty the derived store. Idempotent.
    pub fn release(&self) {
        self.inner.release();
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }
}

impl<P, C> RelationshipInner<P, C>
where
    P: Send + Sync + 'static,
    C: Entity,
{
    fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Candidates among `items` that belong under the parent. Nothing
    /// matches while the parent or predicate is missing.
    fn matching(&self, items: &[C]) -> Vec<C> {
        let Some(parent) = self.parent.get() else {
            return Vec::new();
        };
        let Some(predicate) = lock(&self.predicate).clone() else {
            return Vec::new();
        };
        items
            .iter()
            .filter(|item| predicate(parent, *item))
            .cloned()
            .collect()
    }

    fn resolve_source(self: &Arc<Self>) -> Option<MemoryStore<C>> {
        let mut source = lock(&self.source);
        if let Some(store) = source.take() {
            if self.still_registered(&store) {
                *source = Some(store.clone());
                return Some(store);
            }
            self.unhook_source();
            tracing::debug!("Relationship source is no longer registered");
        }

        let store = match &self.configured_source {
            Some(store) => store.clone(),
            None => match self.provider.as_ref()?.get_existing::<C>() {
                Ok(found) => found.memory().clone(),
                Err(err) => {
                    tracing::trace!(error = %err, "Relationship source not available yet");
                    return None;
                }
            },
        };

        let weak = Arc::downgrade(self);
        let subscription = store.subscribe(move |change| {
            if let Some(inner) = weak.upgrade() {
                inner.on_source_change(change);
            }
        });
        let tracking = self.binder.attach_to_store(&store);

        *lock(&self.source_hooks) = vec![subscription, tracking];
        *source = Some(store.clone());
        Some(store)
    }

    /// An explicit source is always current. A provider-resolved one is
    /// current while the provider still hands out that same store.
    fn still_registered(&self, store: &MemoryStore<C>) -> bool {
        match (&self.configured_source, &self.provider) {
            (None, Some(provider)) => provider
                .get_existing::<C>()
                .is_ok_and(|found| found.memory().same_store(store)),
            _ => true,
        }
    }

    fn unhook_source(&self) {
        for hook in std::mem::take(&mut *lock(&self.source_hooks)) {
            hook.release();
        }
        self.binder.detach_all();
    }

    fn reconcile(self: &Arc<Self>) -> Result<()> {
        if self.is_released() {
            return Ok(());
        }

        let desired = match self.resolve_source() {
            Some(source) => self.matching(&source.snapshot()),
            None => Vec::new(),
        };

        let comparer = self.children.comparer();
        let stale: Vec<C> = self
            .children
            .snapshot()
            .into_iter()
            .filter(|child| !desired.iter().any(|want| comparer.equals(want, child)))
            .collect();

        let removed = if stale.is_empty() {
            0
        } else {
            self.children.remove_many(stale)?
        };
        let added = self.children.add_many(desired)?;

        tracing::trace!(added, removed, "Relationship reconciled");
        Ok(())
    }

    fn on_source_change(&self, change: &CollectionChange<C>) {
        if self.is_released() {
            return;
        }

        let outcome = match change {
            CollectionChange::Added(items) => {
                let matches = self.matching(items);
                if matches.is_empty() {
                    Ok(())
                } else {
                    self.children.add_many(matches).map(|_| ())
                }
            }
            CollectionChange::Removed(items) => {
                self.children.remove_many(items.clone()).map(|_| ())
            }
            CollectionChange::Reset => self.children.clear(),
        };

        if let Err(err) = outcome {
            tracing::warn!(error = %err, "Relationship failed to follow its source");
        }
    }

    fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        for hook in std::mem::take(&mut *lock(&self.source_hooks)) {
            hook.release();
        }
        self.binder.release();
        if let Err(err) = self.children.clear() {
            tracing::warn!(error = %err, "Failed to empty released relationship");
        }
        tracing::debug!("Relationship released");
    }

    fn on_candidate_changed(&self, candidate: &C) -> Result<()> {
        if self.is_released() {
            return Ok(());
        }

        let belongs = !self.matching(std::slice::from_ref(candidate)).is_empty();
        if belongs {
            self.children.add(candidate.clone())?;
        } else {
            self.children.remove(candidate)?;
        }
        Ok(())
    }
}

impl<P, C> Drop for Relationship<P, C>
where
    P: Send + Sync + 'static,
    C: Entity,
{
    fn drop(&mut self) {
        self.inner.release();
    }
}

impl<P, C> fmt::Debug for Relationship<P, C>
where
    P: fmt::Debug + Send + Sync + 'static,
    C: Entity,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relationship")
            .field("parent", &self.inner.parent.get())
            .field("children", &self.inner.children)
            .field("released", &self.inner.released.load(Ordering::Relaxed))
            .finish()
    }
}
