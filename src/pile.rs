//! Ordered, id-keyed element store.
//!
//! A [`Pile`] keeps typed elements addressable by id while preserving
//! insertion order through an [`OrderedIndex`]. The executor keeps every
//! event it has ever accepted in a pile; views over the pile (pending,
//! completed, failed) are plain filtered copies.
//!
//! # Invariants
//!
//! - `keys(items) == set(order)` at every API boundary.
//! - Iteration order equals the order index.
//!
//! # Concurrency
//!
//! One regime per container: the shared [`Pile`] handle exposes an async
//! API over a `tokio::sync::RwLock`. The lock-free core ([`RawPile`]) is
//! reachable through the `read()` / `write()` guards for user-supplied
//! critical sections. The lock is not reentrant; do not call locking
//! methods while holding a guard.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::element::Element;
use crate::error::PileError;
use crate::id::Id;
use crate::ordered_index::OrderedIndex;

// ============================================================
// SYNC CORE
// ============================================================

/// The single-threaded core of a [`Pile`]: an id-keyed map plus its
/// ordering index.
#[derive(Debug, Clone)]
pub struct RawPile<T> {
    items: HashMap<Id, T>,
    order: OrderedIndex,
}

impl<T> Default for RawPile<T> {
    fn default() -> Self {
        Self {
            items: HashMap::new(),
            order: OrderedIndex::new(),
        }
    }
}

impl<T: Element> RawPile<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a sequence, keeping first occurrence on duplicate ids.
    pub fn from_items(items: impl IntoIterator<Item = T>) -> Self {
        let mut pile = Self::new();
        for item in items {
            pile.include(item);
        }
        pile
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.items.contains_key(id)
    }

    /// Append `item` if its id is absent. Returns false (and drops the
    /// argument) when already present.
    pub fn include(&mut self, item: T) -> bool {
        let id = item.id();
        if !self.order.append(id) {
            return false;
        }
        self.items.insert(id, item);
        true
    }

    /// Remove by id; `None` when absent.
    pub fn exclude(&mut self, id: &Id) -> Option<T> {
        if !self.order.remove(id) {
            return None;
        }
        self.items.remove(id)
    }

    /// Insert at position `index`; a duplicate id fails.
    pub fn insert(&mut self, index: usize, item: T) -> Result<(), PileError> {
        let id = item.id();
        self.order.insert(index, id)?;
        self.items.insert(id, item);
        Ok(())
    }

    pub fn get(&self, id: &Id) -> Option<&T> {
        self.items.get(id)
    }

    pub fn get_at(&self, index: usize) -> Result<&T, PileError> {
        let id = self
            .order
            .get(index)
            .ok_or(PileError::IndexOutOfBounds {
                index,
                len: self.order.len(),
            })?;
        // order and items agree by invariant
        Ok(&self.items[&id])
    }

    /// Remove and return the item with `id`.
    pub fn pop(&mut self, id: &Id) -> Result<T, PileError> {
        self.exclude(id).ok_or(PileError::NotFound(*id))
    }

    /// Remove and return the item at `index`.
    pub fn pop_at(&mut self, index: usize) -> Result<T, PileError> {
        let id = self.order.pop_at(index)?;
        Ok(self.items.remove(&id).expect("order and items agree"))
    }

    /// Remove and return the oldest item.
    pub fn pop_front(&mut self) -> Option<T> {
        let id = self.order.pop_front()?;
        self.items.remove(&id)
    }

    /// Overwrite items already present (keeping their position), include
    /// the rest in order.
    pub fn update(&mut self, other: impl IntoIterator<Item = T>) {
        for item in other {
            let id = item.id();
            if self.items.contains_key(&id) {
                self.items.insert(id, item);
            } else {
                self.include(item);
            }
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &Id> {
        self.order.iter()
    }

    /// Values in insertion order.
    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.order.iter().map(|id| &self.items[id])
    }

    /// `(id, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&Id, &T)> {
        self.order.iter().map(|id| (id, &self.items[id]))
    }

    pub fn order(&self) -> &OrderedIndex {
        &self.order
    }

    /// Verify `keys(items) == set(order)`. Cheap enough to assert in
    /// tests at every boundary.
    pub fn is_coherent(&self) -> bool {
        self.items.len() == self.order.len()
            && self.order.iter().all(|id| self.items.contains_key(id))
    }
}

impl<T: Element + Clone> RawPile<T> {
    /// A new pile covering `range` of the order, bounds clamped.
    pub fn slice(&self, range: Range<usize>) -> RawPile<T> {
        let order = self.order.slice(range);
        let items = order
            .iter()
            .map(|id| (*id, self.items[id].clone()))
            .collect();
        RawPile { items, order }
    }

    /// Left-biased union: self's items in self's order, then other's
    /// extras in other's order.
    pub fn union(&self, other: &RawPile<T>) -> RawPile<T> {
        let mut out = self.clone();
        for (id, item) in other.iter() {
            if !out.contains(id) {
                out.include(item.clone());
            }
        }
        out
    }

    /// Ids present in both, self's order and self's values.
    pub fn intersection(&self, other: &RawPile<T>) -> RawPile<T> {
        let mut out = RawPile::new();
        for (id, item) in self.iter() {
            if other.contains(id) {
                out.include(item.clone());
            }
        }
        out
    }

    /// Ids present in exactly one side: self-only in self's order, then
    /// other-only in other's order.
    pub fn symmetric_difference(&self, other: &RawPile<T>) -> RawPile<T> {
        let mut out = RawPile::new();
        for (id, item) in self.iter() {
            if !other.contains(id) {
                out.include(item.clone());
            }
        }
        for (id, item) in other.iter() {
            if !self.contains(id) {
                out.include(item.clone());
            }
        }
        out
    }
}

/// Content equality: same ids in the same order, equal values.
impl<T: Element + PartialEq> PartialEq for RawPile<T> {
    fn eq(&self, other: &Self) -> bool {
        self.order == *other.order()
            && self.iter().all(|(id, item)| other.get(id) == Some(item))
    }
}

impl<T: Element + Clone> std::ops::BitOr for &RawPile<T> {
    type Output = RawPile<T>;

    fn bitor(self, rhs: Self) -> RawPile<T> {
        self.union(rhs)
    }
}

impl<T: Element + Clone> std::ops::BitAnd for &RawPile<T> {
    type Output = RawPile<T>;

    fn bitand(self, rhs: Self) -> RawPile<T> {
        self.intersection(rhs)
    }
}

impl<T: Element + Clone> std::ops::BitXor for &RawPile<T> {
    type Output = RawPile<T>;

    fn bitxor(self, rhs: Self) -> RawPile<T> {
        self.symmetric_difference(rhs)
    }
}

impl<T: Element> FromIterator<T> for RawPile<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self::from_items(iter)
    }
}

// ============================================================
// SNAPSHOT SERIALIZATION
// ============================================================

#[derive(Deserialize)]
struct PileSnapshot<T> {
    items: Vec<T>,
    order: OrderedIndex,
}

#[derive(Serialize)]
struct PileSnapshotRef<'a, T> {
    items: Vec<&'a T>,
    order: &'a OrderedIndex,
}

impl<T: Element + Serialize> Serialize for RawPile<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let snapshot = PileSnapshotRef {
            items: self.values().collect(),
            order: &self.order,
        };
        snapshot.serialize(serializer)
    }
}

impl<'de, T: Element + DeserializeOwned> Deserialize<'de> for RawPile<T> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let snapshot = PileSnapshot::<T>::deserialize(deserializer)?;
        if snapshot.items.len() != snapshot.order.len() {
            return Err(serde::de::Error::custom(format!(
                "snapshot order length {} does not match item count {}",
                snapshot.order.len(),
                snapshot.items.len()
            )));
        }
        let mut pile = RawPile::new();
        for (item, id) in snapshot.items.into_iter().zip(snapshot.order.iter()) {
            if item.id() != *id {
                return Err(serde::de::Error::custom(format!(
                    "snapshot order id {id} does not match item id {}",
                    item.id()
                )));
            }
            pile.include(item);
        }
        Ok(pile)
    }
}

// ============================================================
// SHARED ASYNC HANDLE
// ============================================================

/// Task-safe shared pile. Cloning the handle shares the store.
#[derive(Debug)]
pub struct Pile<T> {
    inner: Arc<RwLock<RawPile<T>>>,
}

impl<T> Clone for Pile<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Element> Default for Pile<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Element> Pile<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(RawPile::new())),
        }
    }

    pub fn from_raw(raw: RawPile<T>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(raw)),
        }
    }

    /// Read guard over the core, for a user-supplied critical section.
    pub async fn read(&self) -> RwLockReadGuard<'_, RawPile<T>> {
        self.inner.read().await
    }

    /// Write guard over the core, for a user-supplied critical section.
    pub async fn write(&self) -> RwLockWriteGuard<'_, RawPile<T>> {
        self.inner.write().await
    }

    pub async fn include(&self, item: T) -> bool {
        self.inner.write().await.include(item)
    }

    pub async fn exclude(&self, id: &Id) -> Option<T> {
        self.inner.write().await.exclude(id)
    }

    pub async fn insert(&self, index: usize, item: T) -> Result<(), PileError> {
        self.inner.write().await.insert(index, item)
    }

    pub async fn pop(&self, id: &Id) -> Result<T, PileError> {
        self.inner.write().await.pop(id)
    }

    pub async fn pop_at(&self, index: usize) -> Result<T, PileError> {
        self.inner.write().await.pop_at(index)
    }

    pub async fn pop_front(&self) -> Option<T> {
        self.inner.write().await.pop_front()
    }

    pub async fn update(&self, other: impl IntoIterator<Item = T>) {
        self.inner.write().await.update(other)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    pub async fn contains(&self, id: &Id) -> bool {
        self.inner.read().await.contains(id)
    }

    pub async fn keys(&self) -> Vec<Id> {
        self.inner.read().await.keys().copied().collect()
    }
}

impl<T: Element + Clone> Pile<T> {
    pub async fn get(&self, id: &Id) -> Option<T> {
        self.inner.read().await.get(id).cloned()
    }

    /// `get` with a fallback value for an absent id.
    pub async fn get_or(&self, id: &Id, default: T) -> T {
        self.get(id).await.unwrap_or(default)
    }

    /// `pop` with a fallback value for an absent id.
    pub async fn pop_or(&self, id: &Id, default: T) -> T {
        self.inner.write().await.exclude(id).unwrap_or(default)
    }

    pub async fn get_at(&self, index: usize) -> Result<T, PileError> {
        self.inner.read().await.get_at(index).cloned()
    }

    pub async fn values(&self) -> Vec<T> {
        self.inner.read().await.values().cloned().collect()
    }

    pub async fn slice(&self, range: Range<usize>) -> Pile<T> {
        Pile::from_raw(self.inner.read().await.slice(range))
    }

    pub async fn union(&self, other: &Pile<T>) -> Pile<T> {
        let left = self.inner.read().await;
        let right = other.inner.read().await;
        Pile::from_raw(left.union(&right))
    }

    pub async fn intersection(&self, other: &Pile<T>) -> Pile<T> {
        let left = self.inner.read().await;
        let right = other.inner.read().await;
        Pile::from_raw(left.intersection(&right))
    }

    pub async fn symmetric_difference(&self, other: &Pile<T>) -> Pile<T> {
        let left = self.inner.read().await;
        let right = other.inner.read().await;
        Pile::from_raw(left.symmetric_difference(&right))
    }

    /// Owned copy of the core, e.g. for serialization.
    pub async fn snapshot(&self) -> RawPile<T> {
        self.inner.read().await.clone()
    }
}

impl<T: Element + PartialEq> Pile<T> {
    /// Content equality across two handles.
    pub async fn same_content(&self, other: &Pile<T>) -> bool {
        if Arc::ptr_eq(&self.inner, &other.inner) {
            return true;
        }
        let left = self.inner.read().await;
        let right = other.inner.read().await;
        *left == *right
    }
}
