//! MemoryStore - the observable in-memory collection.
//!
//! The store holds an ordered, de-duplicated sequence of entities and tells
//! its listeners precisely what changed. It knows nothing about persistence.

use crate::affinity::{self, Affinity};
use crate::{lock, Comparer, Entity, Release, Result, SharedComparer, Subscription};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Membership change emitted by a store.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectionChange<T> {
    /// Items appended, in order
    Added(Vec<T>),
    /// Items removed
    Removed(Vec<T>),
    /// The store was emptied or its contents replaced wholesale
    Reset,
}

type Listener<T> = Arc<dyn Fn(&CollectionChange<T>) + Send + Sync>;

/// A stored item with its cached comparer hash.
struct Slot<T> {
    hash: u64,
    item: T,
}

struct Shared<T> {
    items: Mutex<Vec<Slot<T>>>,
    comparer: SharedComparer<T>,
    listeners: Mutex<Vec<(u64, Listener<T>)>>,
    next_listener: AtomicU64,
    affinity: Option<Affinity>,
}

/// De-duplicated, observable collection of entities.
///
/// Cloning yields another handle to the same store.
pub struct MemoryStore<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for MemoryStore<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Entity> MemoryStore<T> {
    /// Create a store bound to the calling thread's ambient affinity.
    pub fn new(comparer: SharedComparer<T>) -> Self {
        Self::with_affinity(comparer, Affinity::current())
    }

    /// Create a store bound to an explicit affinity (or none).
    pub fn with_affinity(comparer: SharedComparer<T>, affinity: Option<Affinity>) -> Self {
        Self {
            shared: Arc::new(Shared {
                items: Mutex::new(Vec::new()),
                comparer,
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(0),
                affinity,
            }),
        }
    }

    /// The comparer defining "same entity" for this store.
    pub fn comparer(&self) -> SharedComparer<T> {
        Arc::clone(&self.shared.comparer)
    }

    /// The owning context mutations are marshaled onto.
    /// Whether both handles refer to the same store.
    pub fn same_store(&self, other: &MemoryStore<T>) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn affinity(&self) -> Option<&Affinity> {
        self.shared.affinity.as_ref()
    }

    /// Run `job` under this store's affinity.
    pub fn dispatch<R, F>(&self, job: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        affinity::run_on(self.affinity(), job)
    }

    /// Add an item unless an equal one is already present.
    pub fn add(&self, item: T) -> Result<bool> {
        Ok(self.add_many([item])? == 1)
    }

    /// Add every item not already present. Returns how many were added.
    pub fn add_many(&self, items: impl IntoIterator<Item = T>) -> Result<usize> {
        Ok(self.push_many(items.into_iter().collect())?.len())
    }

    /// Add every item not already present and return the ones added.
    pub(crate) fn push_many(&self, items: Vec<T>) -> Result<Vec<T>> {
        let shared = Arc::clone(&self.shared);
        self.dispatch(move || shared.add_many(items))
    }

    /// Remove the first item equal to `item`.
    pub fn remove(&self, item: &T) -> Result<bool> {
        Ok(self.take(item)?.is_some())
    }

    /// Remove every listed item that is present. Returns how many were removed.
    pub fn remove_many(&self, items: impl IntoIterator<Item = T>) -> Result<usize> {
        Ok(self.take_many(items.into_iter().collect(), None)?.len())
    }

    /// Remove every item matching `predicate`.
    pub fn remove_where<P>(&self, predicate: P) -> Result<usize>
    where
        P: Fn(&T) -> bool + Send + 'static,
    {
        Ok(self.take_where(predicate)?.len())
    }

    /// Remove everything. A no-op on an empty store.
    pub fn clear(&self) -> Result<()> {
        self.take_all().map(|_| ())
    }

    /// Replace the whole contents, emitting `Reset` then `Added`.
    pub fn replace_all(&self, items: impl IntoIterator<Item = T>) -> Result<usize> {
        let items: Vec<T> = items.into_iter().collect();
        let shared = Arc::clone(&self.shared);
        self.dispatch(move || shared.replace_all(items))
    }

    /// Remove and return the stored element equal to `item`.
    pub(crate) fn take(&self, item: &T) -> Result<Option<T>> {
        Ok(self.take_many(vec![item.clone()], None)?.pop())
    }

    /// Remove and return stored elements equal to `items`, optionally
    /// matching with a comparer other than the store's.
    pub(crate) fn take_many(
        &self,
        items: Vec<T>,
        comparer: Option<SharedComparer<T>>,
    ) -> Result<Vec<T>> {
        let shared = Arc::clone(&self.shared);
        self.dispatch(move || shared.take_many(&items, comparer.as_deref()))
    }

    pub(crate) fn take_where<P>(&self, predicate: P) -> Result<Vec<T>>
    where
        P: Fn(&T) -> bool + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        self.dispatch(move || shared.take_where(predicate))
    }

    pub(crate) fn take_all(&self) -> Result<Vec<T>> {
        let shared = Arc::clone(&self.shared);
        self.dispatch(move || shared.take_all())
    }

    /// A copy of the current contents, in insertion order.
    pub fn snapshot(&self) -> Vec<T> {
        lock(&self.shared.items)
            .iter()
            .map(|slot| slot.item.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.shared.items).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether an item equal to `item` is present.
    pub fn contains(&self, item: &T) -> bool {
        let hash = self.shared.comparer.hash(item);
        lock(&self.shared.items)
            .iter()
            .any(|slot| slot.hash == hash && self.shared.comparer.equals(&slot.item, item))
    }

    /// The first item matching `predicate`.
    pub fn find(&self, predicate: impl Fn(&T) -> bool) -> Option<T> {
        lock(&self.shared.items)
            .iter()
            .find(|slot| predicate(&slot.item))
            .map(|slot| slot.item.clone())
    }

    /// Listen to membership changes. Listeners run on the owning context,
    /// after the change is applied and outside the store's lock.
    pub fn subscribe(
        &self,
        listener: impl Fn(&CollectionChange<T>) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.shared.next_listener.fetch_add(1, Ordering::Relaxed);
        lock(&self.shared.listeners).push((id, Arc::new(listener)));

        let weak: Weak<Shared<T>> = Arc::downgrade(&self.shared);
        Subscription::new(move || {
            if let Some(shared) = weak.upgrade() {
                lock(&shared.listeners).retain(|(listener_id, _)| *listener_id != id);
            }
        })
    }

    /// Number of active listeners.
    pub fn listener_count(&self) -> usize {
        lock(&self.shared.listeners).len()
    }

    /// Mirror `source` into this store. See [`crate::mirror`].
    pub fn mirror_from(&self, source: &MemoryStore<T>) -> Result<Subscription> {
        crate::mirror(self, source, None)
    }
}

impl<T: Entity> Shared<T> {
    /// Index of the slot equal to `item` under the store's comparer.
    fn position(&self, items: &[Slot<T>], hash: u64, item: &T) -> Option<usize> {
        items
            .iter()
            .position(|slot| slot.hash == hash && self.comparer.equals(&slot.item, item))
    }

    fn add_many(&self, incoming: Vec<T>) -> Vec<T> {
        let added: Vec<T> = {
            let mut items = lock(&self.items);
            let mut added = Vec::new();
            for item in incoming {
                let hash = self.comparer.hash(&item);
                if self.position(&items, hash, &item).is_some() {
                    continue;
                }
                items.push(Slot {
                    hash,
                    item: item.clone(),
                });
                added.push(item);
            }
            added
        };

        if !added.is_empty() {
            tracing::trace!(count = added.len(), "Items added to store");
            self.notify(&CollectionChange::Added(added.clone()));
        }
        added
    }

    /// Slot hashes come from the store's comparer, so an override comparer
    /// is matched by `equals` alone.
    fn take_many(&self, targets: &[T], comparer: Option<&dyn Comparer<T>>) -> Vec<T> {
        let removed: Vec<T> = {
            let mut items = lock(&self.items);
            let mut removed = Vec::new();
            for target in targets {
                let index = match comparer {
                    Some(comparer) => items
                        .iter()
                        .position(|slot| comparer.equals(&slot.item, target)),
                    None => self.position(&items, self.comparer.hash(target), target),
                };
                if let Some(index) = index {
                    removed.push(items.remove(index).item);
                }
            }
            removed
        };

        if !removed.is_empty() {
            tracing::trace!(count = removed.len(), "Items removed from store");
            self.notify(&CollectionChange::Removed(removed.clone()));
        }
        removed
    }

    fn take_where(&self, predicate: impl Fn(&T) -> bool) -> Vec<T> {
        let removed: Vec<T> = {
            let mut items = lock(&self.items);
            let (gone, kept): (Vec<Slot<T>>, Vec<Slot<T>>) =
                items.drain(..).partition(|slot| predicate(&slot.item));
            *items = kept;
            gone.into_iter().map(|slot| slot.item).collect()
        };

        if !removed.is_empty() {
            self.notify(&CollectionChange::Removed(removed.clone()));
        }
        removed
    }

    fn take_all(&self) -> Vec<T> {
        let removed: Vec<T> = lock(&self.items)
            .drain(..)
            .map(|slot| slot.item)
            .collect();

        if !removed.is_empty() {
            tracing::trace!(count = removed.len(), "Store cleared");
            self.notify(&CollectionChange::Reset);
        }
        removed
    }

    fn replace_all(&self, incoming: Vec<T>) -> usize {
        let had_items = {
            let mut items = lock(&self.items);
            let had_items = !items.is_empty();
            items.clear();
            had_items
        };
        if had_items {
            self.notify(&CollectionChange::Reset);
        }
        self.add_many(incoming).len()
    }

    fn notify(&self, change: &CollectionChange<T>) {
        let listeners: Vec<Listener<T>> = lock(&self.listeners)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(change);
        }
    }
}

impl<T: Entity> Release for MemoryStore<T> {
    /// Drop every listener; the store keeps its items and stays usable.
    fn release(&self) {
        let released = std::mem::take(&mut *lock(&self.shared.listeners));
        if !released.is_empty() {
            tracing::debug!(listeners = released.len(), "Memory store released");
        }
    }
}

impl<T> fmt::Debug for MemoryStore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("len", &lock(&self.shared.items).len())
            .field("affinity", &self.shared.affinity)
            .finish()
    }
}
