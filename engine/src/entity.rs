//! Entity traits, the surrogate key convention and field-change notification.

use crate::{lock, Key, Result, Subscription};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// A value managed by a store.
///
/// Entities that support field-change notification are shared handles
/// (cloning yields another reference to the same object) and return their
/// [`FieldNotifier`] from [`Entity::notifier`].
pub trait Entity: Clone + Send + Sync + 'static {
    /// The notifier raised when one of the entity's fields changes.
    fn notifier(&self) -> Option<&FieldNotifier> {
        None
    }
}

macro_rules! plain_entity {
    ($($ty:ty),* $(,)?) => {
        $(impl Entity for $ty {})*
    };
}

plain_entity!(
    String,
    &'static str,
    bool,
    char,
    i8,
    i16,
    i32,
    i64,
    i128,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    isize
);

/// An entity carrying an integer surrogate key.
///
/// Implementing this trait routes a type to granular persistence.
pub trait Identity: Entity {
    /// Current surrogate key.
    fn key(&self) -> Key;

    /// Overwrite the surrogate key. Called by backends when they assign one;
    /// implementations must not raise a field-change notification for it.
    fn set_key(&self, key: Key);
}

/// Classification of a surrogate key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    /// `0`: not yet persisted, candidate for insert.
    Unassigned,
    /// `> 0`: stable, backend-assigned identity.
    Assigned,
    /// `< 0`: never touched by diffing or granular persistence.
    Unmanaged,
}

impl KeyState {
    pub fn of(key: Key) -> Self {
        match key {
            0 => KeyState::Unassigned,
            k if k > 0 => KeyState::Assigned,
            _ => KeyState::Unmanaged,
        }
    }
}

/// Fail unless `key` is an assigned (`> 0`) key.
pub fn require_assigned(key: Key) -> Result<Key> {
    if key > 0 {
        Ok(key)
    } else {
        Err(crate::Error::UnassignedKey(key))
    }
}

type FieldListener = Arc<dyn Fn(&str) -> Result<()> + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: AtomicU64,
    entries: Mutex<Vec<(u64, FieldListener)>>,
}

/// Field-change signal embedded in an entity.
///
/// Listeners receive the changed field's name. [`FieldNotifier::notify`]
/// runs every listener and returns the first error, so a failure in a
/// listener (typically persistence) reaches the code that changed the field.
#[derive(Default)]
pub struct FieldNotifier {
    listeners: Arc<Listeners>,
}

impl FieldNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener.
    pub fn subscribe(
        &self,
        listener: impl Fn(&str) -> Result<()> + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.listeners.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.listeners.entries).push((id, Arc::new(listener)));

        let weak = Arc::downgrade(&self.listeners);
        Subscription::new(move || {
            if let Some(listeners) = weak.upgrade() {
                lock(&listeners.entries).retain(|(entry_id, _)| *entry_id != id);
            }
        })
    }

    /// Signal that `field` changed.
    pub fn notify(&self, field: &str) -> Result<()> {
        let listeners: Vec<FieldListener> = lock(&self.listeners.entries)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        let mut first_error = None;
        for listener in listeners {
            if let Err(err) = listener(field) {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        lock(&self.listeners.entries).len()
    }

    /// Reference identity of the entity owning this notifier.
    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.listeners) as usize
    }
}

impl fmt::Debug for FieldNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldNotifier")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn key_states() {
        assert_eq!(KeyState::of(0), KeyState::Unassigned);
        assert_eq!(KeyState::of(1), KeyState::Assigned);
        assert_eq!(KeyState::of(i64::MAX), KeyState::Assigned);
        assert_eq!(KeyState::of(-1), KeyState::Unmanaged);
    }

    #[test]
    fn require_assigned_rejects_sentinel() {
        assert_eq!(require_assigned(5).unwrap(), 5);
        let err = require_assigned(0).unwrap_err();
        assert!(err.to_string().contains("key must be > 0"));
        assert!(matches!(require_assigned(-3), Err(Error::UnassignedKey(-3))));
    }

    #[test]
    fn notify_reaches_listeners_until_released() {
        let notifier = FieldNotifier::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = notifier.subscribe(move |field| {
            sink.lock().unwrap().push(field.to_string());
            Ok(())
        });

        notifier.notify("title").unwrap();
        assert_eq!(notifier.listener_count(), 1);

        sub.release();
        notifier.notify("title").unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["title".to_string()]);
        assert_eq!(notifier.listener_count(), 0);
    }

    #[test]
    fn notify_returns_first_error_after_running_all() {
        let notifier = FieldNotifier::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let _failing = notifier.subscribe(|_| Err(Error::KeyNotFound(9)));
        let counter = Arc::clone(&calls);
        let _counting = notifier.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let result = notifier.notify("title");
        assert!(matches!(result, Err(Error::KeyNotFound(9))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_may_unsubscribe_during_notify() {
        let notifier = Arc::new(FieldNotifier::new());
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let handle = Arc::clone(&slot);
        let sub = notifier.subscribe(move |_| {
            if let Some(sub) = handle.lock().unwrap().take() {
                sub.release();
            }
            Ok(())
        });
        *slot.lock().unwrap() = Some(sub);

        notifier.notify("x").unwrap();
        assert_eq!(notifier.listener_count(), 0);
    }
}
