use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::flat_map::inner::FlatMapInner;

/// One slot of the active-inner array. `Empty` doubles as the terminal
/// sentinel: removal overwrites, it never compacts, so a sweep in flight
/// keeps valid indices.
pub(crate) enum Slot<R: Send + 'static> {
    Empty,
    Active(Arc<FlatMapInner<R>>),
}

struct Slots<R: Send + 'static> {
    arr: Vec<Slot<R>>,
    /// Once closed (cancellation or terminal), no inner is ever admitted.
    closed: bool,
}

/// The set of currently subscribed inners.
///
/// Structural mutation (add, remove, clear) takes the short write lock;
/// the drain reads slot by slot. Per-element traffic never touches the
/// lock: values flow through each inner's own queue.
pub(crate) struct InnerSet<R: Send + 'static> {
    slots: RwLock<Slots<R>>,
}

impl<R: Send + 'static> InnerSet<R> {
    pub(crate) fn new() -> Self {
        Self {
            slots: RwLock::new(Slots {
                arr: Vec::new(),
                closed: false,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Slots<R>> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Slots<R>> {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admits an inner, reusing the first empty slot or growing the array.
    ///
    /// Returns `false` when the set is closed; the caller must cancel the
    /// rejected inner itself (outside this lock).
    pub(crate) fn add(&self, inner: Arc<FlatMapInner<R>>) -> bool {
        let mut guard = self.write();
        if guard.closed {
            return false;
        }
        match guard.arr.iter_mut().find(|s| matches!(s, Slot::Empty)) {
            Some(slot) => *slot = Slot::Active(inner),
            None => guard.arr.push(Slot::Active(inner)),
        }
        true
    }

    /// Number of slots, empty ones included. The array only grows, so a
    /// sweep started against this count never indexes out of bounds.
    pub(crate) fn slot_count(&self) -> usize {
        self.read().arr.len()
    }

    /// The inner at `index`, if the slot is occupied.
    pub(crate) fn get(&self, index: usize) -> Option<Arc<FlatMapInner<R>>> {
        match self.read().arr.get(index) {
            Some(Slot::Active(inner)) => Some(inner.clone()),
            _ => None,
        }
    }

    /// Overwrites the slot with the terminal sentinel.
    pub(crate) fn remove(&self, index: usize) {
        let mut guard = self.write();
        if let Some(slot) = guard.arr.get_mut(index) {
            *slot = Slot::Empty;
        }
    }

    /// True when no inner is active.
    pub(crate) fn is_devoid(&self) -> bool {
        self.read().arr.iter().all(|s| matches!(s, Slot::Empty))
    }

    /// Closes the set and snapshots the active inners without clearing the
    /// slots, so the drain can still discard their queues. Used on
    /// cancellation, where the subscriptions must be cut at once but queue
    /// teardown belongs to the single consumer.
    pub(crate) fn close(&self) -> Vec<Arc<FlatMapInner<R>>> {
        let mut guard = self.write();
        guard.closed = true;
        guard
            .arr
            .iter()
            .filter_map(|s| match s {
                Slot::Active(inner) => Some(inner.clone()),
                Slot::Empty => None,
            })
            .collect()
    }

    /// Closes the set and takes every active inner out, leaving only
    /// sentinels. Drain-side teardown: breaks the inner→coordinator
    /// reference cycle.
    pub(crate) fn take_all(&self) -> Vec<Arc<FlatMapInner<R>>> {
        let mut guard = self.write();
        guard.closed = true;
        guard
            .arr
            .iter_mut()
            .filter_map(|s| match std::mem::replace(s, Slot::Empty) {
                Slot::Active(inner) => Some(inner),
                Slot::Empty => None,
            })
            .collect()
    }

    /// Total of the inners' buffered counts, for introspection.
    pub(crate) fn buffered(&self) -> usize {
        self.read()
            .arr
            .iter()
            .map(|s| match s {
                Slot::Active(inner) => inner.buffered(),
                Slot::Empty => 0,
            })
            .sum()
    }
}
