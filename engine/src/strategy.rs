//! Persistence strategies.
//!
//! A strategy turns membership and field changes of a memory store into
//! backend calls. Two shapes exist:
//!
//! - [`FullRewriteStrategy`] rewrites the whole collection on every change
//! - [`GranularStrategy`] issues per-record inserts, updates and deletes on
//!   surrogate keys, and a diff-driven batch on flush
//!
//! Strategy callbacks run on the store's owning context, after the memory
//! store has been mutated.

use crate::{
    DiffResult, Entity, GranularRepository, Identity, KeyState, MemoryStore, Repository, Result,
};

/// Name reported by [`FullRewriteStrategy`].
pub const FULL_REWRITE: &str = "full-rewrite";

/// Name reported by [`GranularStrategy`].
pub const GRANULAR: &str = "granular";

/// Reaction of a backend to store changes.
pub trait PersistenceStrategy<T>: Send + Sync {
    /// Everything the backend holds.
    fn load(&self) -> Result<Vec<T>>;

    /// Items were added to the memory store.
    fn on_added(&self, items: &[T]) -> Result<()>;

    /// Items were removed from the memory store.
    fn on_removed(&self, items: &[T]) -> Result<()>;

    /// A field of `item` changed.
    fn on_changed(&self, item: &T) -> Result<()>;

    /// The memory store was emptied.
    fn on_cleared(&self) -> Result<()>;

    /// Reconcile the backend with the whole memory store.
    fn flush(&self) -> Result<()>;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

// ============================================================================
// Full rewrite
// ============================================================================

/// Writes the whole in-memory snapshot on every change.
pub struct FullRewriteStrategy<T, R> {
    store: MemoryStore<T>,
    repository: R,
}

impl<T, R> FullRewriteStrategy<T, R>
where
    T: Entity,
    R: Repository<T>,
{
    pub fn new(store: MemoryStore<T>, repository: R) -> Self {
        Self { store, repository }
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    fn rewrite(&self) -> Result<()> {
        let snapshot = self.store.snapshot();
        tracing::trace!(count = snapshot.len(), "Rewriting collection");
        self.repository.write(&snapshot)
    }
}

impl<T, R> PersistenceStrategy<T> for FullRewriteStrategy<T, R>
where
    T: Entity,
    R: Repository<T>,
{
    fn load(&self) -> Result<Vec<T>> {
        self.repository.load()
    }

    fn on_added(&self, _items: &[T]) -> Result<()> {
        self.rewrite()
    }

    fn on_removed(&self, _items: &[T]) -> Result<()> {
        self.rewrite()
    }

    fn on_changed(&self, _item: &T) -> Result<()> {
        self.rewrite()
    }

    fn on_cleared(&self) -> Result<()> {
        self.repository.clear()
    }

    fn flush(&self) -> Result<()> {
        self.rewrite()
    }

    fn name(&self) -> &'static str {
        FULL_REWRITE
    }
}

// ============================================================================
// Granular
// ============================================================================

/// Per-record persistence for keyed entities.
///
/// Items with an unmanaged (negative) key are never sent to the backend.
pub struct GranularStrategy<T, R> {
    store: MemoryStore<T>,
    repository: R,
}

fn managed<T: Identity>(item: &T) -> bool {
    KeyState::of(item.key()) != KeyState::Unmanaged
}

impl<T, R> GranularStrategy<T, R>
where
    T: Identity,
    R: GranularRepository<T>,
{
    pub fn new(store: MemoryStore<T>, repository: R) -> Self {
        Self { store, repository }
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }
}

impl<T, R> PersistenceStrategy<T> for GranularStrategy<T, R>
where
    T: Identity,
    R: GranularRepository<T>,
{
    fn load(&self) -> Result<Vec<T>> {
        self.repository.load()
    }

    fn on_added(&self, items: &[T]) -> Result<()> {
        let mut pending: Vec<T> = items.iter().filter(|item| managed(*item)).cloned().collect();
        match pending.len() {
            0 => Ok(()),
            1 => {
                let item = pending.remove(0);
                let key = self.repository.insert(&item)?;
                tracing::trace!(key, "Inserted record");
                Ok(())
            }
            count => {
                tracing::trace!(count, "Inserting records as one batch");
                self.repository.apply_batch(&DiffResult::inserts(pending))
            }
        }
    }

    fn on_removed(&self, items: &[T]) -> Result<()> {
        for item in items.iter().filter(|item| managed(*item)) {
            self.repository.delete(item)?;
        }
        Ok(())
    }

    fn on_changed(&self, item: &T) -> Result<()> {
        if !managed(item) {
            return Ok(());
        }
        self.repository.update(item).map(|_| ())
    }

    fn on_cleared(&self) -> Result<()> {
        self.repository.clear()
    }

    fn flush(&self) -> Result<()> {
        self.repository.write(&self.store.snapshot())
    }

    fn name(&self) -> &'static str {
        GRANULAR
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparer::natural;
    use crate::testing::Card;
    use crate::{Error, MemoryRepository, MemoryTable};
    use std::sync::Arc;

    type TableStrategy = GranularStrategy<Card, Arc<MemoryTable<Card>>>;

    fn granular() -> (MemoryStore<Card>, Arc<MemoryTable<Card>>, TableStrategy) {
        let store = MemoryStore::with_affinity(natural(), None);
        let table = Arc::new(MemoryTable::new());
        let strategy = GranularStrategy::new(store.clone(), Arc::clone(&table));
        (store, table, strategy)
    }

    #[test]
    fn full_rewrite_writes_snapshot() {
        let store = MemoryStore::with_affinity(natural::<String>(), None);
        let repo = Arc::new(MemoryRepository::new());
        let strategy = FullRewriteStrategy::new(store.clone(), Arc::clone(&repo));

        store.add_many(["a".to_string(), "b".to_string()]).unwrap();
        strategy.on_added(&[]).unwrap();
        assert_eq!(repo.load().unwrap().len(), 2);

        strategy.on_cleared().unwrap();
        assert!(repo.is_empty());
        assert_eq!(strategy.name(), "full-rewrite");
    }

    #[test]
    fn granular_single_insert_assigns_key() {
        let (_, table, strategy) = granular();
        let card = Card::new(0, "one");

        strategy.on_added(&[card.clone()]).unwrap();

        assert_eq!(card.key(), 1);
        assert_eq!(table.stats().inserts, 1);
        assert_eq!(table.stats().batches, 0);
    }

    #[test]
    fn granular_many_inserts_use_one_batch() {
        let (_, table, strategy) = granular();
        let cards = [Card::new(0, "a"), Card::new(0, "b"), Card::new(-4, "local")];

        strategy.on_added(&cards).unwrap();

        assert_eq!(table.keys(), vec![1, 2]);
        assert_eq!(table.stats().batches, 1);
        assert_eq!(cards[2].key(), -4);
    }

    #[test]
    fn granular_update_requires_assigned_key() {
        let (_, _, strategy) = granular();
        let err = strategy.on_changed(&Card::new(0, "fresh")).unwrap_err();
        assert!(matches!(err, Error::UnassignedKey(0)));
        assert!(err.to_string().contains("key must be > 0"));

        strategy.on_changed(&Card::new(-2, "local")).unwrap();
    }

    #[test]
    fn granular_remove_deletes_by_key() {
        let (_, table, strategy) = granular();
        let card = Card::new(0, "gone");
        strategy.on_added(&[card.clone()]).unwrap();

        strategy.on_removed(&[card]).unwrap();

        assert!(table.is_empty());
        assert_eq!(table.stats().deletes, 1);
    }

    #[test]
    fn granular_flush_reconciles_snapshot() {
        let (store, table, strategy) = granular();
        let kept = Card::new(0, "kept");
        let dropped = Card::new(0, "dropped");
        strategy.on_added(&[kept.clone(), dropped.clone()]).unwrap();

        store.add(kept.clone()).unwrap();
        kept.set_title("kept*").unwrap();
        strategy.flush().unwrap();

        assert_eq!(table.keys(), vec![kept.key()]);
        assert_eq!(table.get(kept.key()).unwrap().unwrap().title(), "kept*");
    }
}
