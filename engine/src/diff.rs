//! Three-way diff between a backend's contents and an incoming snapshot.
//!
//! This is what makes granular batch writes deterministic. Both sides are
//! indexed by surrogate key, so the result does not depend on input order.
//!
//! # Algorithm
//!
//! 1. Index existing and incoming items by key (duplicate incoming keys fail)
//! 2. Incoming `key == 0` is always an insert
//! 3. Incoming `key > 0` unknown to the backend is an insert only when
//!    `missing_keys_as_insert` is set, otherwise it is dropped
//! 4. Incoming `key > 0` known to the backend is an update when it differs
//! 5. Existing `key > 0` absent from incoming is a delete
//! 6. Negative keys are ignored on both sides

use crate::{Comparer, Error, Identity, Key, KeyState, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Insert/update/delete sets computed for one batch write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffResult<T> {
    /// Items to insert (unassigned keys, or unknown keys when allowed)
    pub to_insert: Vec<T>,
    /// Items whose stored content differs, in key order
    pub to_update: Vec<T>,
    /// Keys to delete, ascending
    pub to_delete_ids: Vec<Key>,
}

impl<T> DiffResult<T> {
    /// An empty diff.
    pub fn new() -> Self {
        Self {
            to_insert: Vec::new(),
            to_update: Vec::new(),
            to_delete_ids: Vec::new(),
        }
    }

    /// A diff that only inserts `items`.
    pub fn inserts(items: Vec<T>) -> Self {
        Self {
            to_insert: items,
            ..Self::new()
        }
    }

    /// True when applying the diff would change nothing.
    pub fn is_empty(&self) -> bool {
        self.to_insert.is_empty() && self.to_update.is_empty() && self.to_delete_ids.is_empty()
    }

    /// Total number of backend operations the diff implies.
    pub fn op_count(&self) -> usize {
        self.to_insert.len() + self.to_update.len() + self.to_delete_ids.len()
    }
}

impl<T> Default for DiffResult<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Compute the diff that turns `existing` into `incoming`.
pub fn diff<T, F>(
    existing: &[T],
    incoming: &[T],
    key_of: F,
    comparer: &dyn Comparer<T>,
    missing_keys_as_insert: bool,
) -> Result<DiffResult<T>>
where
    T: Clone,
    F: Fn(&T) -> Key,
{
    let mut result = DiffResult::new();

    // Index incoming, rejecting duplicate assigned keys before anything else
    let mut incoming_by_key: BTreeMap<Key, &T> = BTreeMap::new();
    for item in incoming {
        let key = key_of(item);
        match KeyState::of(key) {
            KeyState::Unmanaged => continue,
            KeyState::Unassigned => result.to_insert.push(item.clone()),
            KeyState::Assigned => {
                if incoming_by_key.insert(key, item).is_some() {
                    return Err(Error::DuplicateKey(key));
                }
            }
        }
    }

    let mut existing_by_key: BTreeMap<Key, &T> = BTreeMap::new();
    for item in existing {
        let key = key_of(item);
        if KeyState::of(key) == KeyState::Assigned {
            existing_by_key.entry(key).or_insert(item);
        }
    }

    for (key, item) in &incoming_by_key {
        match existing_by_key.get(key) {
            Some(current) => {
                if !comparer.equals(current, item) {
                    result.to_update.push((*item).clone());
                }
            }
            None if missing_keys_as_insert => result.to_insert.push((*item).clone()),
            None => {
                tracing::trace!(key = *key, "Dropping incoming item with unknown key");
            }
        }
    }

    result.to_delete_ids = existing_by_key
        .keys()
        .filter(|key| !incoming_by_key.contains_key(key))
        .copied()
        .collect();

    Ok(result)
}

/// [`diff`] for entities that carry their own key.
pub fn diff_entities<T: Identity>(
    existing: &[T],
    incoming: &[T],
    comparer: &dyn Comparer<T>,
    missing_keys_as_insert: bool,
) -> Result<DiffResult<T>> {
    diff(existing, incoming, T::key, comparer, missing_keys_as_insert)
}
