//! Store provider - the registry handing out one store per entity type.
//!
//! The provider is an ordinary value owned by the composition root and
//! shared through `Arc`. Its cache is keyed by entity type and store kind and
//! guarded by one mutex held across construction and auto-load, so two
//! threads racing for the same singleton always get the same instance.

use crate::strategy::{FULL_REWRITE, GRANULAR};
use crate::{
    lock, Entity, Error, GranularRepository, Identity, MemoryStore, PersistentStore, Release,
    Repository, Result, SharedComparer, StoreOptions,
};
use serde::{Deserialize, Serialize};
use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

/// Kind of store cached by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StoreKind {
    InMemory,
    Persistent,
}

/// A registered store of either kind.
pub enum StoreRef<T> {
    InMemory(MemoryStore<T>),
    Persistent(PersistentStore<T>),
}

impl<T: Entity> StoreRef<T> {
    pub fn kind(&self) -> StoreKind {
        match self {
            StoreRef::InMemory(_) => StoreKind::InMemory,
            StoreRef::Persistent(_) => StoreKind::Persistent,
        }
    }

    /// The observable collection behind the store.
    pub fn memory(&self) -> &MemoryStore<T> {
        match self {
            StoreRef::InMemory(store) => store,
            StoreRef::Persistent(store) => store.memory(),
        }
    }

    pub fn as_persistent(&self) -> Option<&PersistentStore<T>> {
        match self {
            StoreRef::Persistent(store) => Some(store),
            StoreRef::InMemory(_) => None,
        }
    }
}

impl<T> Clone for StoreRef<T> {
    fn clone(&self) -> Self {
        match self {
            StoreRef::InMemory(store) => StoreRef::InMemory(store.clone()),
            StoreRef::Persistent(store) => StoreRef::Persistent(store.clone()),
        }
    }
}

impl<T> fmt::Debug for StoreRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreRef::InMemory(store) => f.debug_tuple("InMemory").field(store).finish(),
            StoreRef::Persistent(store) => f.debug_tuple("Persistent").field(store).finish(),
        }
    }
}

/// Type-erased cache entry.
trait CachedStore: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn release_store(&self);
}

impl<T: Entity> CachedStore for MemoryStore<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn release_store(&self) {
        self.release();
    }
}

impl<T: Entity> CachedStore for PersistentStore<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn release_store(&self) {
        self.release();
    }
}

type CacheKey = (TypeId, StoreKind);

/// Registry of singleton stores.
pub struct StoreProvider {
    stores: Mutex<HashMap<CacheKey, Box<dyn CachedStore>>>,
    defaults: StoreOptions,
}

impl StoreProvider {
    pub fn new() -> Self {
        Self::with_defaults(StoreOptions::default())
    }

    /// A provider applying `defaults` when a call passes no options.
    pub fn with_defaults(defaults: StoreOptions) -> Self {
        Self {
            stores: Mutex::new(HashMap::new()),
            defaults,
        }
    }

    pub fn defaults(&self) -> StoreOptions {
        self.defaults
    }

    /// The shared in-memory store for `T`, or a fresh unregistered one when
    /// `singleton` is false.
    pub fn get_or_create_in_memory<T: Entity>(
        &self,
        comparer: SharedComparer<T>,
        singleton: bool,
    ) -> MemoryStore<T> {
        if !singleton {
            return MemoryStore::new(comparer);
        }

        let mut stores = lock(&self.stores);
        let key = (TypeId::of::<T>(), StoreKind::InMemory);
        if let Some(existing) = cached::<MemoryStore<T>>(&stores, &key) {
            return existing;
        }

        let store = MemoryStore::new(comparer);
        stores.insert(key, Box::new(store.clone()));
        tracing::debug!(entity = type_name::<T>(), "In-memory store registered");
        store
    }

    /// The shared persistent store for `T`, persisting by full rewrite.
    ///
    /// `factory` runs only when a new store is built.
    pub fn get_or_create_persistent<T, R, F>(
        &self,
        factory: F,
        comparer: SharedComparer<T>,
        options: Option<StoreOptions>,
    ) -> Result<PersistentStore<T>>
    where
        T: Entity,
        R: Repository<T> + 'static,
        F: FnOnce() -> R,
    {
        let options = options.unwrap_or(self.defaults);
        self.get_or_build(FULL_REWRITE, options, move || {
            PersistentStore::full_rewrite(factory(), comparer, options)
        })
    }

    /// The shared persistent store for a keyed `T`, persisting granularly.
    pub fn get_or_create_granular<T, R, F>(
        &self,
        factory: F,
        comparer: SharedComparer<T>,
        options: Option<StoreOptions>,
    ) -> Result<PersistentStore<T>>
    where
        T: Identity,
        R: GranularRepository<T> + 'static,
        F: FnOnce() -> R,
    {
        let options = options.unwrap_or(self.defaults);
        self.get_or_build(GRANULAR, options, move || {
            PersistentStore::granular(factory(), comparer, options)
        })
    }

    /// A cached singleton built by the other persistence path is rejected,
    /// so a keyed type never silently falls back to full rewrites.
    fn get_or_build<T: Entity>(
        &self,
        strategy: &'static str,
        options: StoreOptions,
        build: impl FnOnce() -> PersistentStore<T>,
    ) -> Result<PersistentStore<T>> {
        if !options.singleton {
            let store = build();
            auto_load(&store, options)?;
            return Ok(store);
        }

        let mut stores = lock(&self.stores);
        let key = (TypeId::of::<T>(), StoreKind::Persistent);
        if let Some(existing) = cached::<PersistentStore<T>>(&stores, &key) {
            if existing.strategy_name() != strategy {
                return Err(Error::StrategyMismatch {
                    type_name: type_name::<T>(),
                    registered: existing.strategy_name(),
                    requested: strategy,
                });
            }
            return Ok(existing);
        }

        let store = build();
        auto_load(&store, options)?;
        stores.insert(key, Box::new(store.clone()));
        tracing::debug!(
            entity = type_name::<T>(),
            strategy = store.strategy_name(),
            "Persistent store registered"
        );
        Ok(store)
    }

    /// The registered store for `T`, preferring a persistent one. Never
    /// constructs.
    pub fn get_existing<T: Entity>(&self) -> Result<StoreRef<T>> {
        let stores = lock(&self.stores);
        let id = TypeId::of::<T>();

        if let Some(store) = cached::<PersistentStore<T>>(&stores, &(id, StoreKind::Persistent)) {
            return Ok(StoreRef::Persistent(store));
        }
        if let Some(store) = cached::<MemoryStore<T>>(&stores, &(id, StoreKind::InMemory)) {
            return Ok(StoreRef::InMemory(store));
        }

        let name = type_name::<T>();
        Err(Error::StoreNotRegistered {
            type_name: name,
            hint: format!(
                "call get_or_create_persistent::<{name}>(..) or \
                 get_or_create_granular::<{name}>(..) with singleton options, or \
                 get_or_create_in_memory::<{name}>(.., true), before looking it up"
            ),
        })
    }

    /// Whether a store of `kind` is registered for `T`.
    pub fn is_registered<T: 'static>(&self, kind: StoreKind) -> bool {
        lock(&self.stores).contains_key(&(TypeId::of::<T>(), kind))
    }

    /// Evict and release every store registered for `T`. Returns how many
    /// were evicted.
    pub fn remove_singleton<T: 'static>(&self) -> usize {
        let id = TypeId::of::<T>();
        let evicted: Vec<Box<dyn CachedStore>> = {
            let mut stores = lock(&self.stores);
            [StoreKind::Persistent, StoreKind::InMemory]
                .into_iter()
                .filter_map(|kind| stores.remove(&(id, kind)))
                .collect()
        };
        release_all(&evicted);
        evicted.len()
    }

    /// Evict and release everything.
    pub fn clear_all(&self) -> usize {
        let evicted: Vec<Box<dyn CachedStore>> = lock(&self.stores)
            .drain()
            .map(|(_, store)| store)
            .collect();
        release_all(&evicted);
        tracing::debug!(count = evicted.len(), "Store provider cleared");
        evicted.len()
    }

    /// Number of registered stores.
    pub fn len(&self) -> usize {
        lock(&self.stores).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn cached<S: Clone + 'static>(
    stores: &HashMap<CacheKey, Box<dyn CachedStore>>,
    key: &CacheKey,
) -> Option<S> {
    stores
        .get(key)
        .and_then(|store| store.as_any().downcast_ref::<S>())
        .cloned()
}

fn auto_load<T: Entity>(store: &PersistentStore<T>, options: StoreOptions) -> Result<()> {
    if options.auto_load {
        let count = store.load()?;
        tracing::debug!(entity = type_name::<T>(), count, "Store auto-loaded");
    }
    Ok(())
}

fn release_all(stores: &[Box<dyn CachedStore>]) {
    for store in stores {
        store.release_store();
    }
}

impl Default for StoreProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StoreProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreProvider")
            .field("stores", &self.len())
            .field("defaults", &self.defaults)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparer::natural;
    use crate::testing::Card;
    use crate::{MemoryRepository, MemoryTable};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn in_memory_singleton_is_shared() {
        let provider = StoreProvider::new();
        let a = provider.get_or_create_in_memory(natural::<String>(), true);
        let b = provider.get_or_create_in_memory(natural::<String>(), true);

        a.add("x".to_string()).unwrap();
        assert!(b.contains(&"x".to_string()));

        let loose = provider.get_or_create_in_memory(natural::<String>(), false);
        assert!(loose.is_empty());
        assert_eq!(provider.len(), 1);
    }

    #[test]
    fn persistent_factory_runs_once() {
        let provider = StoreProvider::new();
        let built = AtomicUsize::new(0);

        for _ in 0..3 {
            provider
                .get_or_create_persistent::<String, _, _>(
                    || {
                        built.fetch_add(1, Ordering::SeqCst);
                        MemoryRepository::<String>::new()
                    },
                    natural(),
                    None,
                )
                .unwrap();
        }

        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert!(provider.is_registered::<String>(StoreKind::Persistent));
    }

    #[test]
    fn granular_store_is_auto_loaded() {
        let provider = StoreProvider::new();
        let table = Arc::new(MemoryTable::<Card>::new());
        table.insert(&Card::new(0, "stored")).unwrap();

        let store = provider
            .get_or_create_granular::<Card, _, _>(|| Arc::clone(&table), natural(), None)
            .unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.strategy_name(), "granular");
    }

    #[test]
    fn auto_load_can_be_disabled() {
        let provider = StoreProvider::with_defaults(StoreOptions::default().with_auto_load(false));
        let table = Arc::new(MemoryTable::<Card>::new());
        table.insert(&Card::new(0, "stored")).unwrap();

        let store = provider
            .get_or_create_granular::<Card, _, _>(|| Arc::clone(&table), natural(), None)
            .unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn get_existing_prefers_persistent() {
        let provider = StoreProvider::new();
        provider.get_or_create_in_memory(natural::<String>(), true);
        assert_eq!(
            provider.get_existing::<String>().unwrap().kind(),
            StoreKind::InMemory
        );

        provider
            .get_or_create_persistent::<String, _, _>(MemoryRepository::new, natural(), None)
            .unwrap();
        assert_eq!(
            provider.get_existing::<String>().unwrap().kind(),
            StoreKind::Persistent
        );
    }

    #[test]
    fn get_existing_names_the_calls_to_make() {
        let provider = StoreProvider::new();
        let err = provider.get_existing::<Card>().unwrap_err();
        let message = err.to_string();

        assert!(message.contains("Card"));
        assert!(message.contains("get_or_create_granular"));
        assert!(message.contains("get_or_create_in_memory"));
        assert!(provider.is_empty());
    }

    #[test]
    fn keyed_type_cannot_switch_persistence_path() {
        let provider = StoreProvider::new();
        provider
            .get_or_create_persistent::<Card, _, _>(MemoryRepository::new, natural(), None)
            .unwrap();

        let err = provider
            .get_or_create_granular::<Card, _, _>(MemoryTable::new, natural(), None)
            .unwrap_err();

        assert!(matches!(
            err,
            Error::StrategyMismatch {
                registered: "full-rewrite",
                requested: "granular",
                ..
            }
        ));
        assert_eq!(err.kind(), crate::ErrorKind::Protocol);
        assert_eq!(provider.len(), 1);
    }

    #[test]
    fn granular_singleton_is_reused_by_granular_calls() {
        let provider = StoreProvider::new();
        let first = provider
            .get_or_create_granular::<Card, _, _>(MemoryTable::new, natural(), None)
            .unwrap();
        let second = provider
            .get_or_create_granular::<Card, _, _>(MemoryTable::new, natural(), None)
            .unwrap();

        first.add(Card::new(0, "shared")).unwrap();
        assert_eq!(second.len(), 1);
        assert!(provider
            .get_or_create_persistent::<Card, _, _>(MemoryRepository::new, natural(), None)
            .is_err());
    }

    #[test]
    fn non_singleton_is_not_registered() {
        let provider = StoreProvider::new();
        let options = StoreOptions::default().with_singleton(false);
        provider
            .get_or_create_persistent::<String, _, _>(
                MemoryRepository::new,
                natural(),
                Some(options),
            )
            .unwrap();
        assert!(provider.is_empty());
    }

    #[test]
    fn remove_singleton_evicts_and_releases() {
        let provider = StoreProvider::new();
        let store = provider.get_or_create_in_memory(natural::<String>(), true);
        let _sub = store.subscribe(|_| {});
        provider
            .get_or_create_persistent::<String, _, _>(MemoryRepository::new, natural(), None)
            .unwrap();

        assert_eq!(provider.remove_singleton::<String>(), 2);
        assert_eq!(store.listener_count(), 0);
        assert!(provider.get_existing::<String>().is_err());
    }

    #[test]
    fn clear_all_empties_registry() {
        let provider = StoreProvider::new();
        provider.get_or_create_in_memory(natural::<String>(), true);
        provider.get_or_create_in_memory(natural::<u32>(), true);

        assert_eq!(provider.clear_all(), 2);
        assert!(provider.is_empty());
    }
}
