//! Shared mutable state for concurrent processes.
//!
//! Channels move values; these types hold them. [`SwapCell`] is a single independently
//! updatable value: readers get cheap immutable snapshots, writers apply pure functions that
//! retry under contention. [`TxGroup`] and [`TxVar`] coordinate several values that must
//! change together; a transaction takes the group's one lock, so transactions on the same
//! group serialize and are trivially atomic with respect to each other.
//!
//! Both are deliberately humble: a swap function may run more than once, and transactions
//! must not nest. In exchange, neither can deadlock against the other.

#[macro_use]
extern crate tracing;

use std::sync::{Arc, Mutex, RwLock};

// value plus a version stamp for optimistic retries.
struct Versioned<T> {
    version: u64,
    value: Arc<T>,
}

/// An atomically swappable value.
///
/// Reads return `Arc` snapshots and never block writers for long; updates go through
/// [`swap`](SwapCell::swap), which applies a pure function to the current value and retries
/// if another swap landed first. A snapshot taken before a swap keeps the old value alive and
/// unchanged.
pub struct SwapCell<T> {
    inner: RwLock<Versioned<T>>,
}

impl<T> SwapCell<T> {
    pub fn new(value: T) -> Self {
        SwapCell {
            inner: RwLock::new(Versioned {
                version: 0,
                value: Arc::new(value),
            }),
        }
    }

    /// Snapshot the current value.
    pub fn load(&self) -> Arc<T> {
        Arc::clone(&self.inner.read().unwrap().value)
    }

    /// Replace the value outright. Returns the previous snapshot.
    pub fn store(&self, value: T) -> Arc<T> {
        let mut inner = self.inner.write().unwrap();
        inner.version += 1;
        std::mem::replace(&mut inner.value, Arc::new(value))
    }

    /// Install `value` only if `seen` is still the current snapshot. Returns whether it was.
    ///
    /// Comparison is by snapshot identity, not by value equality; a snapshot from
    /// [`load`](SwapCell::load) stays current until any write lands.
    pub fn compare_and_set(&self, seen: &Arc<T>, value: T) -> bool {
        let mut inner = self.inner.write().unwrap();
        if Arc::ptr_eq(&inner.value, seen) {
            inner.version += 1;
            inner.value = Arc::new(value);
            true
        } else {
            false
        }
    }

    /// Update the value by applying `f` to it. Returns the new snapshot.
    ///
    /// `f` runs outside any lock and may run several times under contention, so it must be
    /// free of side effects. The function sees a consistent snapshot each attempt; the swap
    /// installs its result only if no other write landed in between.
    pub fn swap<F>(&self, mut f: F) -> Arc<T>
    where
        F: FnMut(&T) -> T,
    {
        loop {
            let (seen, current) = {
                let inner = self.inner.read().unwrap();
                (inner.version, Arc::clone(&inner.value))
            };
            let next = Arc::new(f(&current));
            let mut inner = self.inner.write().unwrap();
            if inner.version == seen {
                inner.version += 1;
                inner.value = Arc::clone(&next);
                return next;
            }
            // another swap landed first; retry against the newer value
            trace!("swap contention, retrying");
        }
    }
}

impl<T: Default> Default for SwapCell<T> {
    fn default() -> Self {
        SwapCell::new(T::default())
    }
}

/// A group of transactional variables.
///
/// All [`TxVar`]s created from one group share one lock; [`transact`](TxGroup::transact)
/// holds it for the duration of the closure, so a transaction reads and writes a consistent,
/// isolated view of every variable in the group. Transactions must not nest, on the same or
/// different groups, or they may deadlock.
pub struct TxGroup {
    lock: Arc<Mutex<()>>,
}

impl TxGroup {
    pub fn new() -> Self {
        TxGroup {
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Create a variable owned by this group.
    pub fn var<T>(&self, value: T) -> TxVar<T> {
        TxVar {
            group: Arc::clone(&self.lock),
            value: Mutex::new(value),
        }
    }

    /// Run a transaction over this group's variables.
    ///
    /// The closure receives a [`Tx`] token granting access to the group's variables; using
    /// it on a variable from another group panics. Changes are visible to other transactions
    /// and to [`TxVar::load`] as soon as the closure returns.
    pub fn transact<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut Tx) -> R,
    {
        let _guard = self.lock.lock().unwrap();
        let mut tx = Tx {
            group: Arc::as_ptr(&self.lock) as usize,
        };
        f(&mut tx)
    }
}

impl Default for TxGroup {
    fn default() -> Self {
        TxGroup::new()
    }
}

/// A variable belonging to a [`TxGroup`].
pub struct TxVar<T> {
    group: Arc<Mutex<()>>,
    value: Mutex<T>,
}

impl<T> TxVar<T> {
    /// Read the last committed value outside any transaction.
    ///
    /// Takes the group lock, so a load waits out any open transaction instead of observing
    /// its writes half-applied. Calling this from inside a transaction on the same group
    /// deadlocks; use [`Tx::get`] there.
    pub fn load(&self) -> T
    where
        T: Clone,
    {
        let _guard = self.group.lock().unwrap();
        self.value.lock().unwrap().clone()
    }
}

/// Capability to touch a group's variables, handed to [`TxGroup::transact`] closures.
pub struct Tx {
    // identity of the group whose lock is held, for membership checks.
    group: usize,
}

impl Tx {
    fn check<T>(&self, var: &TxVar<T>) {
        assert!(
            Arc::as_ptr(&var.group) as usize == self.group,
            "variable used in a transaction on a different group",
        );
    }

    /// Read a variable.
    pub fn get<T: Clone>(&self, var: &TxVar<T>) -> T {
        self.check(var);
        var.value.lock().unwrap().clone()
    }

    /// Overwrite a variable. Returns the previous value.
    pub fn set<T>(&mut self, var: &TxVar<T>, value: T) -> T {
        self.check(var);
        std::mem::replace(&mut *var.value.lock().unwrap(), value)
    }

    /// Update a variable in place.
    pub fn update<T, F>(&mut self, var: &TxVar<T>, f: F)
    where
        F: FnOnce(&mut T),
    {
        self.check(var);
        f(&mut var.value.lock().unwrap());
    }
}
