//! Equality comparers defining "same entity" for dedup and diffing.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

/// Equality and hashing for entities of type `T`.
///
/// `equals(a, b)` implies `hash(a) == hash(b)`.
pub trait Comparer<T>: Send + Sync {
    fn equals(&self, a: &T, b: &T) -> bool;
    fn hash(&self, value: &T) -> u64;
}

/// Shared, type-erased comparer.
pub type SharedComparer<T> = Arc<dyn Comparer<T>>;

fn hash_of<V: Hash + ?Sized>(value: &V) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// The type's natural equality (`PartialEq` + `Hash`).
#[derive(Debug, Clone, Copy, Default)]
pub struct NaturalEq;

impl<T: PartialEq + Hash> Comparer<T> for NaturalEq {
    fn equals(&self, a: &T, b: &T) -> bool {
        a == b
    }

    fn hash(&self, value: &T) -> u64 {
        hash_of(value)
    }
}

/// Natural equality as a shared comparer.
pub fn natural<T: PartialEq + Hash + 'static>() -> SharedComparer<T> {
    Arc::new(NaturalEq)
}

/// Comparer built from closures.
pub struct FnComparer<E, H> {
    eq: E,
    hash: H,
}

impl<E, H> FnComparer<E, H> {
    pub fn new(eq: E, hash: H) -> Self {
        Self { eq, hash }
    }
}

impl<T, E, H> Comparer<T> for FnComparer<E, H>
where
    E: Fn(&T, &T) -> bool + Send + Sync,
    H: Fn(&T) -> u64 + Send + Sync,
{
    fn equals(&self, a: &T, b: &T) -> bool {
        (self.eq)(a, b)
    }

    fn hash(&self, value: &T) -> u64 {
        (self.hash)(value)
    }
}

/// Compares entities by a projected value, e.g. a title or a natural key.
pub struct Projection<F, K> {
    project: F,
    _key: PhantomData<fn() -> K>,
}

impl<F, K> Projection<F, K> {
    pub fn new(project: F) -> Self {
        Self {
            project,
            _key: PhantomData,
        }
    }
}

impl<T, F, K> Comparer<T> for Projection<F, K>
where
    F: Fn(&T) -> K + Send + Sync,
    K: PartialEq + Hash,
{
    fn equals(&self, a: &T, b: &T) -> bool {
        (self.project)(a) == (self.project)(b)
    }

    fn hash(&self, value: &T) -> u64 {
        hash_of(&(self.project)(value))
    }
}

/// Shared comparer over a projection.
pub fn by<T, K, F>(project: F) -> SharedComparer<T>
where
    T: 'static,
    K: PartialEq + Hash + 'static,
    F: Fn(&T) -> K + Send + Sync + 'static,
{
    Arc::new(Projection::new(project))
}
