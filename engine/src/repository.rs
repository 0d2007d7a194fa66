//! Backing-store contracts consumed by persistent stores.

use crate::{DiffResult, Identity, Key, Result};
use std::sync::Arc;

/// A backing store that persists a whole collection at once.
pub trait Repository<T>: Send + Sync {
    /// Everything currently stored.
    fn load(&self) -> Result<Vec<T>>;

    /// Atomically replace the stored collection with `items`.
    fn write(&self, items: &[T]) -> Result<()>;

    /// Remove everything.
    fn clear(&self) -> Result<()>;
}

/// A backing store with per-record operations on surrogate keys.
///
/// `write` is expected to diff `items` against the stored records and apply
/// the result through [`GranularRepository::apply_batch`].
pub trait GranularRepository<T: Identity>: Repository<T> {
    /// Insert one item, assigning a key when it has none. Returns the key.
    fn insert(&self, item: &T) -> Result<Key>;

    /// Overwrite the record with the item's key. Returns rows affected.
    fn update(&self, item: &T) -> Result<usize>;

    /// Delete the record with the item's key. Returns rows affected.
    fn delete(&self, item: &T) -> Result<usize>;

    /// Apply inserts, then updates, then deletes as one atomic unit.
    fn apply_batch(&self, diff: &DiffResult<T>) -> Result<()>;
}

impl<T, R> Repository<T> for Arc<R>
where
    R: Repository<T> + ?Sized,
{
    fn load(&self) -> Result<Vec<T>> {
        (**self).load()
    }

    fn write(&self, items: &[T]) -> Result<()> {
        (**self).write(items)
    }

    fn clear(&self) -> Result<()> {
        (**self).clear()
    }
}

impl<T, R> GranularRepository<T> for Arc<R>
where
    T: Identity,
    R: GranularRepository<T> + ?Sized,
{
    fn insert(&self, item: &T) -> Result<Key> {
        (**self).insert(item)
    }

    fn update(&self, item: &T) -> Result<usize> {
        (**self).update(item)
    }

    fn delete(&self, item: &T) -> Result<usize> {
        (**self).delete(item)
    }

    fn apply_batch(&self, diff: &DiffResult<T>) -> Result<()> {
        (**self).apply_batch(diff)
    }
}
