//! Reference in-memory backends.
//!
//! Both backends keep rows as `serde_json::Value` snapshots, so the stored
//! records never alias live entities: mutating an entity after a write does
//! not change what the backend holds until it is written again.
//!
//! - [`MemoryRepository`] - whole-collection replace
//! - [`MemoryTable`] - keyed records with key assignment and atomic batches

use crate::{
    diff_entities, entity::require_assigned, lock, DiffResult, Error, FnComparer,
    GranularRepository, Identity, Key, KeyState, Repository, Result,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Mutex;

/// Call counters for a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendStats {
    pub loads: usize,
    pub writes: usize,
    pub clears: usize,
    pub inserts: usize,
    pub updates: usize,
    pub deletes: usize,
    pub batches: usize,
}

fn encode<T: Serialize>(item: &T) -> Result<Value> {
    Ok(serde_json::to_value(item)?)
}

fn decode<T: DeserializeOwned>(value: &Value) -> Result<T> {
    Ok(T::deserialize(value)?)
}

// ============================================================================
// Whole-collection backend
// ============================================================================

/// Backend storing the collection as one atomically replaced list.
pub struct MemoryRepository<T> {
    rows: Mutex<Vec<Value>>,
    stats: Mutex<BackendStats>,
    _entity: PhantomData<fn() -> T>,
}

impl<T> MemoryRepository<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
            stats: Mutex::new(BackendStats::default()),
            _entity: PhantomData,
        }
    }

    /// A repository already holding `items`.
    pub fn with_items(items: &[T]) -> Result<Self> {
        let repo = Self::new();
        *lock(&repo.rows) = items.iter().map(encode).collect::<Result<_>>()?;
        Ok(repo)
    }

    pub fn len(&self) -> usize {
        lock(&self.rows).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> BackendStats {
        *lock(&self.stats)
    }
}

impl<T> Default for MemoryRepository<T>
where
    T: Serialize + DeserializeOwned,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Repository<T> for MemoryRepository<T>
where
    T: Serialize + DeserializeOwned,
{
    fn load(&self) -> Result<Vec<T>> {
        let items = lock(&self.rows).iter().map(decode).collect::<Result<Vec<T>>>()?;
        lock(&self.stats).loads += 1;
        Ok(items)
    }

    fn write(&self, items: &[T]) -> Result<()> {
        // Encode everything first so a failure leaves the rows untouched
        let encoded = items.iter().map(encode).collect::<Result<Vec<_>>>()?;
        *lock(&self.rows) = encoded;
        lock(&self.stats).writes += 1;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        lock(&self.rows).clear();
        lock(&self.stats).clears += 1;
        Ok(())
    }
}

// ============================================================================
// Keyed backend
// ============================================================================

#[derive(Debug, Clone)]
struct TableState {
    rows: BTreeMap<Key, Value>,
    next_key: Key,
}

impl Default for TableState {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
            next_key: 1,
        }
    }
}

/// Keyed backend assigning surrogate keys on insert.
///
/// Batches (and therefore `write`) are all-or-nothing: a failing step
/// restores both the rows and any keys handed out to inserted entities.
pub struct MemoryTable<T> {
    state: Mutex<TableState>,
    missing_keys_as_insert: bool,
    stats: Mutex<BackendStats>,
    _entity: PhantomData<fn() -> T>,
}

impl<T> MemoryTable<T>
where
    T: Identity + Serialize + DeserializeOwned,
{
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TableState::default()),
            missing_keys_as_insert: false,
            stats: Mutex::new(BackendStats::default()),
            _entity: PhantomData,
        }
    }

    /// Insert incoming items whose key is unknown instead of dropping them
    /// during `write`.
    pub fn missing_keys_as_insert(mut self, enabled: bool) -> Self {
        self.missing_keys_as_insert = enabled;
        self
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        lock(&self.state).rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stored keys, ascending.
    pub fn keys(&self) -> Vec<Key> {
        lock(&self.state).rows.keys().copied().collect()
    }

    /// A fresh entity decoded from the record with `key`.
    pub fn get(&self, key: Key) -> Result<Option<T>> {
        let state = lock(&self.state);
        state
            .rows
            .get(&key)
            .map(|value| Self::decode_row(key, value))
            .transpose()
    }

    pub fn stats(&self) -> BackendStats {
        *lock(&self.stats)
    }

    fn decode_row(key: Key, value: &Value) -> Result<T> {
        let item: T = decode(value)?;
        item.set_key(key);
        Ok(item)
    }

    fn decode_all(state: &TableState) -> Result<Vec<T>> {
        state
            .rows
            .iter()
            .map(|(key, value)| Self::decode_row(*key, value))
            .collect()
    }

    fn insert_row(state: &mut TableState, item: &T) -> Result<Key> {
        let previous = item.key();
        let key = match KeyState::of(previous) {
            KeyState::Unmanaged => return Err(Error::UnmanagedKey(previous)),
            KeyState::Unassigned => state.next_key,
            KeyState::Assigned if state.rows.contains_key(&previous) => {
                return Err(Error::DuplicateKey(previous))
            }
            KeyState::Assigned => previous,
        };

        item.set_key(key);
        let value = match encode(item) {
            Ok(value) => value,
            Err(err) => {
                item.set_key(previous);
                return Err(err);
            }
        };

        state.rows.insert(key, value);
        state.next_key = state.next_key.max(key.saturating_add(1));
        Ok(key)
    }

    fn update_row(state: &mut TableState, item: &T) -> Result<()> {
        let key = require_assigned(item.key())?;
        if !state.rows.contains_key(&key) {
            return Err(Error::KeyNotFound(key));
        }
        let value = encode(item)?;
        state.rows.insert(key, value);
        Ok(())
    }

    fn delete_row(state: &mut TableState, key: Key) -> Result<()> {
        let key = require_assigned(key)?;
        state
            .rows
            .remove(&key)
            .map(|_| ())
            .ok_or(Error::KeyNotFound(key))
    }

    fn apply_steps<'a>(
        state: &mut TableState,
        diff: &'a DiffResult<T>,
        assigned: &mut Vec<(&'a T, Key)>,
    ) -> Result<()> {
        for item in &diff.to_insert {
            let previous = item.key();
            Self::insert_row(state, item)?;
            assigned.push((item, previous));
        }
        for item in &diff.to_update {
            Self::update_row(state, item)?;
        }
        for key in &diff.to_delete_ids {
            Self::delete_row(state, *key)?;
        }
        Ok(())
    }

    fn apply_locked(state: &mut TableState, diff: &DiffResult<T>) -> Result<()> {
        let backup = state.clone();
        let mut assigned = Vec::new();

        if let Err(err) = Self::apply_steps(state, diff, &mut assigned) {
            *state = backup;
            for (item, previous) in assigned {
                item.set_key(previous);
            }
            tracing::debug!(error = %err, "Batch rolled back");
            return Err(err);
        }
        Ok(())
    }
}

impl<T> Default for MemoryTable<T>
where
    T: Identity + Serialize + DeserializeOwned,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Repository<T> for MemoryTable<T>
where
    T: Identity + Serialize + DeserializeOwned,
{
    fn load(&self) -> Result<Vec<T>> {
        let items = Self::decode_all(&lock(&self.state))?;
        lock(&self.stats).loads += 1;
        Ok(items)
    }

    fn write(&self, items: &[T]) -> Result<()> {
        let mut state = lock(&self.state);
        let existing = Self::decode_all(&state)?;
        let content_eq = FnComparer::new(
            |a: &T, b: &T| encode(a).ok() == encode(b).ok(),
            |item: &T| item.key() as u64,
        );
        let diff = diff_entities(&existing, items, &content_eq, self.missing_keys_as_insert)?;

        tracing::trace!(
            inserts = diff.to_insert.len(),
            updates = diff.to_update.len(),
            deletes = diff.to_delete_ids.len(),
            "Applying diff write"
        );

        Self::apply_locked(&mut state, &diff)?;
        lock(&self.stats).writes += 1;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        lock(&self.state).rows.clear();
        lock(&self.stats).clears += 1;
        Ok(())
    }
}

impl<T> GranularRepository<T> for MemoryTable<T>
where
    T: Identity + Serialize + DeserializeOwned,
{
    fn insert(&self, item: &T) -> Result<Key> {
        let key = Self::insert_row(&mut lock(&self.state), item)?;
        lock(&self.stats).inserts += 1;
        Ok(key)
    }

    fn update(&self, item: &T) -> Result<usize> {
        Self::update_row(&mut lock(&self.state), item)?;
        lock(&self.stats).updates += 1;
        Ok(1)
    }

    fn delete(&self, item: &T) -> Result<usize> {
        Self::delete_row(&mut lock(&self.state), item.key())?;
        lock(&self.stats).deletes += 1;
        Ok(1)
    }

    fn apply_batch(&self, diff: &DiffResult<T>) -> Result<()> {
        Self::apply_locked(&mut lock(&self.state), diff)?;
        lock(&self.stats).batches += 1;
        Ok(())
    }
}
