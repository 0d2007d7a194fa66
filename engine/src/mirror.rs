//! One-way forwarding of membership changes between stores.

use crate::{
    CollectionChange, Entity, MemoryStore, PersistentStore, Result, SharedComparer, Subscription,
};

/// A store that can receive forwarded changes.
pub trait MirrorTarget<T>: Send + Sync + 'static {
    fn mirror_add(&self, items: Vec<T>) -> Result<()>;

    /// Remove items matched by `comparer`, or by the target's own comparer.
    /// Absent items are ignored.
    fn mirror_remove(&self, items: Vec<T>, comparer: Option<SharedComparer<T>>) -> Result<()>;

    fn mirror_reset(&self) -> Result<()>;
}

impl<T: Entity> MirrorTarget<T> for MemoryStore<T> {
    fn mirror_add(&self, items: Vec<T>) -> Result<()> {
        self.push_many(items).map(|_| ())
    }

    fn mirror_remove(&self, items: Vec<T>, comparer: Option<SharedComparer<T>>) -> Result<()> {
        self.take_many(items, comparer).map(|_| ())
    }

    fn mirror_reset(&self) -> Result<()> {
        self.clear()
    }
}

impl<T: Entity> MirrorTarget<T> for PersistentStore<T> {
    fn mirror_add(&self, items: Vec<T>) -> Result<()> {
        self.add_many(items).map(|_| ())
    }

    fn mirror_remove(&self, items: Vec<T>, comparer: Option<SharedComparer<T>>) -> Result<()> {
        self.remove_matching(items, comparer).map(|_| ())
    }

    fn mirror_reset(&self) -> Result<()> {
        self.clear()
    }
}

/// Copy `source` into `target`, then keep forwarding its changes.
///
/// The bulk copy respects the target's de-duplication. Forwarding failures
/// are logged and do not stop the mirror. Releasing the returned handle stops
/// forwarding and leaves both stores as they are.
pub fn mirror<T, M>(
    target: &M,
    source: &MemoryStore<T>,
    comparer: Option<SharedComparer<T>>,
) -> Result<Subscription>
where
    T: Entity,
    M: MirrorTarget<T> + Clone,
{
    let forward = target.clone();
    let subscription = source.subscribe(move |change| {
        let outcome = match change {
            CollectionChange::Added(items) => forward.mirror_add(items.clone()),
            CollectionChange::Removed(items) => {
                forward.mirror_remove(items.clone(), comparer.clone())
            }
            CollectionChange::Reset => forward.mirror_reset(),
        };
        if let Err(err) = outcome {
            tracing::warn!(error = %err, "Mirror forwarding failed");
        }
    });

    if let Err(err) = target.mirror_add(source.snapshot()) {
        subscription.release();
        return Err(err);
    }
    Ok(subscription)
}
