//! Change-notification binder.
//!
//! Keeps at most one field-change hookup per entity reference and forwards
//! every observed change to a single handler. Attaching an entity that is
//! already tracked replaces its hookup, so N attaches produce one callback
//! per change.

use crate::{lock, CollectionChange, Entity, MemoryStore, Result, Subscription};
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

type ChangeHandler<T> = Arc<dyn Fn(&T) -> Result<()> + Send + Sync>;

/// A tracked entity and its field-change hookup.
struct Tracked<T> {
    entity: T,
    subscription: Subscription,
}

struct BinderInner<T> {
    /// Hookups keyed by entity reference identity.
    tracked: DashMap<usize, Tracked<T>>,
    on_change: ChangeHandler<T>,
    store_subscriptions: Mutex<Vec<Subscription>>,
    released: AtomicBool,
}

/// Routes field changes of tracked entities to one handler.
///
/// Clones share the same registry. Dropping the last handle releases every
/// hookup.
pub struct ChangeBinder<T> {
    inner: Arc<BinderInner<T>>,
}

impl<T> Clone for ChangeBinder<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Entity> ChangeBinder<T> {
    /// Create a binder calling `on_change` with the entity whose field changed.
    /// The handler's error is returned from the entity's `notify`.
    pub fn new(on_change: impl Fn(&T) -> Result<()> + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(BinderInner {
                tracked: DashMap::new(),
                on_change: Arc::new(on_change),
                store_subscriptions: Mutex::new(Vec::new()),
                released: AtomicBool::new(false),
            }),
        }
    }

    /// Track `entity`, replacing any existing hookup for the same reference.
    ///
    /// Returns `false` for entities without a notifier and after release.
    pub fn attach(&self, entity: &T) -> bool {
        let Some(notifier) = entity.notifier() else {
            return false;
        };
        if self.inner.released.load(Ordering::Acquire) {
            return false;
        }

        let id = notifier.identity();
        if let Some((_, previous)) = self.inner.tracked.remove(&id) {
            previous.subscription.release();
        }

        let weak: Weak<BinderInner<T>> = Arc::downgrade(&self.inner);
        let subscription = notifier.subscribe(move |field| match weak.upgrade() {
            Some(inner) => inner.fire(id, field),
            None => Ok(()),
        });

        let tracked = Tracked {
            entity: entity.clone(),
            subscription,
        };
        if let Some(displaced) = self.inner.tracked.insert(id, tracked) {
            displaced.subscription.release();
        }
        true
    }

    /// Stop tracking `entity`. Returns whether it was tracked.
    pub fn detach(&self, entity: &T) -> bool {
        let Some(notifier) = entity.notifier() else {
            return false;
        };
        match self.inner.tracked.remove(&notifier.identity()) {
            Some((_, tracked)) => {
                tracked.subscription.release();
                true
            }
            None => false,
        }
    }

    /// Stop tracking every entity.
    pub fn detach_all(&self) -> usize {
        self.inner.detach_all()
    }

    /// Track the members of `store` now and as they come and go.
    ///
    /// Releasing the returned handle stops following the store; entities
    /// already tracked stay attached.
    pub fn attach_to_store(&self, store: &MemoryStore<T>) -> Subscription {
        let weak: Weak<BinderInner<T>> = Arc::downgrade(&self.inner);
        let subscription = store.subscribe(move |change| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let binder = ChangeBinder { inner };
            match change {
                CollectionChange::Added(items) => {
                    for item in items {
                        binder.attach(item);
                    }
                }
                CollectionChange::Removed(items) => {
                    for item in items {
                        binder.detach(item);
                    }
                }
                CollectionChange::Reset => {
                    binder.detach_all();
                }
            }
        });

        for item in store.snapshot() {
            self.attach(&item);
        }

        lock(&self.inner.store_subscriptions).push(subscription.clone());
        subscription
    }

    /// Whether `entity` currently has a hookup.
    pub fn is_tracking(&self, entity: &T) -> bool {
        entity
            .notifier()
            .is_some_and(|notifier| self.inner.tracked.contains_key(&notifier.identity()))
    }

    /// Number of tracked entities.
    pub fn tracked_count(&self) -> usize {
        self.inner.tracked.len()
    }

    /// Detach everything and stop following stores. Idempotent.
    pub fn release(&self) {
        self.inner.shutdown();
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }
}

impl<T: Entity> BinderInner<T> {
    fn fire(&self, id: usize, field: &str) -> Result<()> {
        // Clone out of the map so the handler runs without a shard lock
        let entity = match self.tracked.get(&id) {
            Some(tracked) => tracked.entity.clone(),
            None => return Ok(()),
        };
        tracing::trace!(field, "Field change observed");
        (self.on_change)(&entity)
    }
}

impl<T> BinderInner<T> {
    fn detach_all(&self) -> usize {
        let ids: Vec<usize> = self.tracked.iter().map(|entry| *entry.key()).collect();
        let mut detached = 0;
        for id in ids {
            if let Some((_, tracked)) = self.tracked.remove(&id) {
                tracked.subscription.release();
                detached += 1;
            }
        }
        detached
    }

    fn shutdown(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let subscriptions = std::mem::take(&mut *lock(&self.store_subscriptions));
        for subscription in &subscriptions {
            subscription.release();
        }
        let detached = self.detach_all();
        tracing::debug!(
            entities = detached,
            stores = subscriptions.len(),
            "Change binder released"
        );
    }
}

impl<T> Drop for BinderInner<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<T: Entity> crate::Release for ChangeBinder<T> {
    fn release(&self) {
        ChangeBinder::release(self);
    }
}

impl<T> fmt::Debug for ChangeBinder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeBinder")
            .field("tracked", &self.inner.tracked.len())
            .field("released", &self.inner.released.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparer::natural;
    use crate::testing::Card;
    use crate::{Error, Identity};
    use std::sync::atomic::AtomicUsize;

    fn counting_binder() -> (ChangeBinder<Card>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let binder = ChangeBinder::new(move |_: &Card| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (binder, calls)
    }

    #[test]
    fn repeated_attach_yields_one_callback() {
        let (binder, calls) = counting_binder();
        let card = Card::new(1, "a");

        for _ in 0..5 {
            assert!(binder.attach(&card));
        }
        card.set_title("b").unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(card.listener_count(), 1);
        assert_eq!(binder.tracked_count(), 1);
    }

    #[test]
    fn handle_clones_share_identity() {
        let (binder, calls) = counting_binder();
        let card = Card::new(1, "a");
        binder.attach(&card);
        binder.attach(&card.clone());

        card.set_title("b").unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn detach_stops_callbacks() {
        let (binder, calls) = counting_binder();
        let card = Card::new(1, "a");
        binder.attach(&card);

        assert!(binder.detach(&card));
        assert!(!binder.detach(&card));
        card.set_title("b").unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(card.listener_count(), 0);
    }

    #[test]
    fn plain_values_are_ignored() {
        let binder = ChangeBinder::new(|_: &String| Ok(()));
        assert!(!binder.attach(&"plain".to_string()));
        assert_eq!(binder.tracked_count(), 0);
    }

    #[test]
    fn handler_error_reaches_notifier() {
        let binder = ChangeBinder::new(|card: &Card| Err(Error::KeyNotFound(card.key())));
        let card = Card::new(3, "a");
        binder.attach(&card);

        assert!(matches!(card.set_title("b"), Err(Error::KeyNotFound(3))));
    }

    #[test]
    fn follows_store_membership() {
        let (binder, calls) = counting_binder();
        let store = MemoryStore::with_affinity(natural(), None);
        let early = Card::new(1, "early");
        store.add(early.clone()).unwrap();

        let subscription = binder.attach_to_store(&store);
        let late = Card::new(2, "late");
        store.add(late.clone()).unwrap();
        assert!(binder.is_tracking(&early));
        assert!(binder.is_tracking(&late));

        store.remove(&early).unwrap();
        early.set_title("ignored").unwrap();
        late.set_title("seen").unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        store.clear().unwrap();
        assert_eq!(binder.tracked_count(), 0);

        subscription.release();
        store.add(early.clone()).unwrap();
        assert!(!binder.is_tracking(&early));
    }

    #[test]
    fn releasing_store_handle_keeps_members_attached() {
        let (binder, calls) = counting_binder();
        let store = MemoryStore::with_affinity(natural(), None);
        let member = Card::new(1, "member");
        store.add(member.clone()).unwrap();

        let subscription = binder.attach_to_store(&store);
        subscription.release();

        member.set_title("still watched").unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(binder.is_tracking(&member));

        // Membership is no longer followed
        store.remove(&member).unwrap();
        assert!(binder.is_tracking(&member));
        let newcomer = Card::new(2, "newcomer");
        store.add(newcomer.clone()).unwrap();
        assert!(!binder.is_tracking(&newcomer));
    }

    #[test]
    fn release_detaches_everything() {
        let (binder, _) = counting_binder();
        let store = MemoryStore::with_affinity(natural(), None);
        let card = Card::new(1, "a");
        store.add(card.clone()).unwrap();
        let _subscription = binder.attach_to_store(&store);

        binder.release();
        binder.release();

        assert_eq!(card.listener_count(), 0);
        assert_eq!(store.listener_count(), 0);
        assert!(!binder.attach(&card));
    }

    #[test]
    fn dropping_binder_releases_hookups() {
        let (binder, _) = counting_binder();
        let card = Card::new(1, "a");
        binder.attach(&card);

        drop(binder);
        assert_eq!(card.listener_count(), 0);
    }
}
