//! Release handles for listeners, hookups and stores.

use crate::lock;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

type Unsubscribe = Box<dyn FnOnce() + Send>;

/// Handle to an active subscription.
///
/// Dropping a handle does NOT unsubscribe; call [`Subscription::release`].
/// Clones share the same underlying hookup, and releasing is idempotent.
#[derive(Clone)]
#[must_use = "a subscription stays active until released"]
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
}

struct SubscriptionInner {
    released: AtomicBool,
    unsubscribe: Mutex<Option<Unsubscribe>>,
}

impl Subscription {
    /// Create a handle that runs `unsubscribe` once on release.
    pub fn new(unsubscribe: impl FnOnce() + Send + 'static) -> Self {
        Self {
            inner: Arc::new(SubscriptionInner {
                released: AtomicBool::new(false),
                unsubscribe: Mutex::new(Some(Box::new(unsubscribe))),
            }),
        }
    }

    /// A handle with nothing to release.
    pub fn empty() -> Self {
        Self {
            inner: Arc::new(SubscriptionInner {
                released: AtomicBool::new(true),
                unsubscribe: Mutex::new(None),
            }),
        }
    }

    /// Stop the subscription. Subsequent calls are no-ops.
    pub fn release(&self) {
        if self.inner.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let unsubscribe = lock(&self.inner.unsubscribe).take();
        if let Some(unsubscribe) = unsubscribe {
            unsubscribe();
        }
    }

    /// Whether the subscription is still active.
    pub fn is_active(&self) -> bool {
        !self.inner.released.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

/// Resources that can be released explicitly.
///
/// Released objects stay usable but inert: they no longer observe or notify.
pub trait Release {
    fn release(&self);
}

impl Release for Subscription {
    fn release(&self) {
        Subscription::release(self);
    }
}
