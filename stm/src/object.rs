// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use crate::{
    conflict::GlobalConflictCounter,
    latch::Latch,
    listeners::{ListenerChain, Listeners},
    orec::{ArriveStatus, LockMode, Orec, OrecState},
    stm::Stm,
    transaction::Transaction,
    TxError, TxResult,
};
use crossbeam_epoch::{self as epoch, Atomic, Owned};
use log::*;
use std::{
    fmt::{self, Debug},
    hash::{Hash, Hasher},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

/// Values that can be stored inside a [`TRef`].
///
/// Values are copied into the transaction on write, and compared against the committed value to
/// filter out writes that did not change anything.
pub trait TxValue: Clone + PartialEq + Send + Sync + 'static {}

impl<T> TxValue for T where T: Clone + PartialEq + Send + Sync + 'static {}

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// An immutable committed value together with the version it was committed with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot<T> {
    value: T,
    version: u64,
}

impl<T> Snapshot<T> {
    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn version(&self) -> u64 {
        self.version
    }
}

/// Outcome of a listener registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Registration {
    /// The latch will be opened on the next change.
    Registered,

    /// The object already changed, the latch has been opened.
    NotNeeded,

    /// There is nothing to wait for, the entry was never read.
    None,
}

/// The result of loading an object.
pub(crate) struct Loaded<T> {
    pub snapshot: Arc<Snapshot<T>>,
    pub has_depart_obligation: bool,
    pub lock_mode: LockMode,
    pub conflict: bool,
}

pub(crate) struct TRefData<T> {
    id: u64,
    orec: Orec,
    version: AtomicU64,

    /// The last committed snapshot, never null. Only replaced by the holder of the exclusive
    /// lock, readers don't write to it.
    active: Atomic<Arc<Snapshot<T>>>,
    listeners: ListenerChain,

    spin_count: usize,
    conflict_counter: GlobalConflictCounter,
}

impl<T> Drop for TRefData<T> {
    fn drop(&mut self) {
        // SAFETY: the object is dropped, so no thread can load the snapshot anymore
        unsafe {
            let active = self.active.load(Ordering::Relaxed, epoch::unprotected());
            if !active.is_null() {
                drop(active.into_owned());
            }
        }
    }
}

/// # TRef
///
/// A transactional reference to a value of type `T`. Clones of a [`TRef`] refer to the same
/// shared value.
///
/// Inside a transaction the value is accessed with [`TRef::read`], [`TRef::write`],
/// [`TRef::alter`] and [`TRef::commute`]. Outside of transactions the `atomic_*` operations
/// provide single object transactions.
///
/// ## Example
/// ```
/// use stronghold_stm::{atomic, TRef};
///
/// let account = TRef::new(100u64);
/// atomic(|tx| {
///     let balance = account.read(tx)?;
///     account.write(tx, balance - 10)
/// })
/// .expect("transaction failed");
///
/// assert_eq!(account.atomic_get(), Ok(90));
/// ```
pub struct TRef<T>
where
    T: TxValue,
{
    data: Arc<TRefData<T>>,
}

impl<T> TRef<T>
where
    T: TxValue,
{
    /// Creates a new object managed by the global [`Stm`].
    pub fn new(value: T) -> Self {
        Stm::global().create(value)
    }

    pub(crate) fn with_stm(value: T, stm: &Stm) -> Self {
        Self::from_parts(
            value,
            Orec::new(stm.config().read_biased_threshold()),
            stm.config().spin_count(),
            stm.conflict_counter().clone(),
        )
    }

    /// Creates an object that is exclusively locked by its constructing transaction.
    pub(crate) fn constructed(value: T, spin_count: usize, threshold: u32, counter: GlobalConflictCounter) -> Self {
        Self::from_parts(value, Orec::new_constructed(threshold), spin_count, counter)
    }

    fn from_parts(value: T, orec: Orec, spin_count: usize, conflict_counter: GlobalConflictCounter) -> Self {
        Self {
            data: Arc::new(TRefData {
                id: NEXT_OBJECT_ID.fetch_add(1, Ordering::SeqCst),
                orec,
                version: AtomicU64::new(0),
                active: Atomic::new(Arc::new(Snapshot { value, version: 0 })),
                listeners: ListenerChain::new(),
                spin_count,
                conflict_counter,
            }),
        }
    }

    /// The unique id of this object.
    pub fn id(&self) -> u64 {
        self.data.id
    }

    /// The version of the last committed value. Every commit increments it by one.
    pub fn version(&self) -> u64 {
        self.data.version.load(Ordering::SeqCst)
    }

    /// Returns the current state of the ownership record.
    pub fn orec_state(&self) -> OrecState {
        self.data.orec.state()
    }

    pub(crate) fn orec(&self) -> &Orec {
        &self.data.orec
    }

    fn active(&self) -> Arc<Snapshot<T>> {
        let guard = epoch::pin();
        let active = self.data.active.load(Ordering::Acquire, &guard);

        // SAFETY: the pointer is never null, and a replaced snapshot is only destroyed once no
        // pinned thread can hold it anymore
        unsafe { active.deref() }.clone()
    }

    /// Loads the committed snapshot.
    ///
    /// Without a lock the load arrives on the orec (if `arrive` is set) and verifies that the
    /// version did not move in the meantime, so the returned snapshot was never in the middle of
    /// being replaced. With a lock the snapshot is stable until the lock is released.
    pub(crate) fn load(&self, spin_count: usize, arrive: bool, lock_mode: LockMode) -> TxResult<Loaded<T>> {
        let orec = &self.data.orec;

        if lock_mode != LockMode::None {
            let arrival = orec.try_lock_and_arrive(spin_count, lock_mode == LockMode::Exclusive);
            if arrival.status == ArriveStatus::LockNotFree {
                return Err(TxError::LockedConflict(self.id()));
            }

            return Ok(Loaded {
                snapshot: self.active(),
                has_depart_obligation: arrival.status.needs_depart(),
                lock_mode,
                conflict: arrival.conflict,
            });
        }

        loop {
            if !arrive && !orec.wait_for_exclusive_lock_to_become_free(spin_count) {
                return Err(TxError::LockedConflict(self.id()));
            }

            let version = self.version();
            let snapshot = self.active();
            if snapshot.version != version {
                // a commit is publishing right now
                std::hint::spin_loop();
                continue;
            }

            if !arrive {
                if self.version() == version && !orec.has_exclusive_lock() {
                    return Ok(Loaded {
                        snapshot,
                        has_depart_obligation: false,
                        lock_mode: LockMode::None,
                        conflict: false,
                    });
                }
                continue;
            }

            let status = orec.arrive(spin_count);
            if status == ArriveStatus::LockNotFree {
                return Err(TxError::LockedConflict(self.id()));
            }

            if self.version() == version {
                return Ok(Loaded {
                    snapshot,
                    has_depart_obligation: status.needs_depart(),
                    lock_mode: LockMode::None,
                    conflict: false,
                });
            }

            if status.needs_depart() {
                orec.depart_after_failure();
            }
        }
    }

    /// Publishes a new value and releases the exclusive lock. Must only be called by the holder
    /// of the exclusive lock. Returns the listeners waiting for this object to change.
    pub(crate) fn publish(&self, value: T) -> Listeners {
        let version = self.version() + 1;

        let guard = epoch::pin();
        let replaced = self.data.active.swap(
            Owned::new(Arc::new(Snapshot { value, version })),
            Ordering::AcqRel,
            &guard,
        );
        // SAFETY: the snapshot is unlinked, later loads can't reach it
        unsafe { guard.defer_destroy(replaced) };
        self.data.version.store(version, Ordering::SeqCst);

        let listeners = self.data.listeners.take_all();
        self.data.orec.depart_after_update_and_unlock();

        trace!("TRef({}): PUBLISHED VERSION ({})", self.id(), version);
        listeners
    }

    /// Checks whether a value read at `version` is still valid. Objects locked by the caller can't
    /// have changed.
    pub(crate) fn has_read_conflict(&self, version: u64, lock_mode: LockMode) -> bool {
        if lock_mode != LockMode::None {
            return false;
        }

        if self.data.orec.has_exclusive_lock() {
            return true;
        }

        self.version() != version
    }

    /// Registers a latch that is opened once this object moves past `version`.
    pub(crate) fn register_change_listener(&self, latch: &Arc<Latch>, version: u64, era: u64) -> Registration {
        if self.version() != version {
            latch.open(era);
            return Registration::NotNeeded;
        }

        self.data.listeners.push(latch.clone(), era);

        // a commit may have detached the chain right before the push
        if self.version() != version {
            self.data.listeners.take_all().open_all();
            return Registration::NotNeeded;
        }

        Registration::Registered
    }

    /// Acquires the exclusive lock for a single object update.
    fn lock_exclusive(&self) -> TxResult<(Arc<Snapshot<T>>, ArriveStatus, bool)> {
        let arrival = self.data.orec.try_lock_and_arrive(self.data.spin_count, true);
        if arrival.status == ArriveStatus::LockNotFree {
            return Err(TxError::LockedConflict(self.id()));
        }
        Ok((self.active(), arrival.status, arrival.conflict))
    }

    fn unlock_unchanged(&self, status: ArriveStatus) {
        match status {
            ArriveStatus::Normal => self.data.orec.depart_after_reading_and_unlock(),
            _ => self.data.orec.unlock_by_unregistered(),
        }
    }

    fn publish_locked(&self, value: T, conflict: bool) {
        if conflict {
            self.data.conflict_counter.signal_conflict();
        }
        self.publish(value).open_all();
    }

    /// Reads the committed value outside of any transaction.
    pub fn atomic_get(&self) -> TxResult<T> {
        self.load(self.data.spin_count, false, LockMode::None)
            .map(|loaded| loaded.snapshot.value.clone())
    }

    /// Replaces the committed value outside of any transaction.
    pub fn atomic_set(&self, value: T) -> TxResult<()> {
        self.atomic_get_and_set(value).map(|_| ())
    }

    /// Replaces the committed value and returns the previous one.
    pub fn atomic_get_and_set(&self, value: T) -> TxResult<T> {
        let (snapshot, status, conflict) = self.lock_exclusive()?;
        let old = snapshot.value.clone();

        if old == value {
            self.unlock_unchanged(status);
        } else {
            self.publish_locked(value, conflict);
        }

        Ok(old)
    }

    /// Sets `update` if the committed value equals `expected`. Returns whether the value was set.
    pub fn atomic_compare_and_set(&self, expected: &T, update: T) -> TxResult<bool> {
        let (snapshot, status, conflict) = self.lock_exclusive()?;

        if snapshot.value != *expected {
            self.unlock_unchanged(status);
            return Ok(false);
        }

        if snapshot.value == update {
            self.unlock_unchanged(status);
        } else {
            self.publish_locked(update, conflict);
        }

        Ok(true)
    }

    /// Applies `f` to the committed value and returns the new value.
    pub fn atomic_alter<F>(&self, f: F) -> TxResult<T>
    where
        F: FnOnce(&T) -> T,
    {
        let (snapshot, status, conflict) = self.lock_exclusive()?;
        let value = f(&snapshot.value);

        if snapshot.value == value {
            self.unlock_unchanged(status);
        } else {
            self.publish_locked(value.clone(), conflict);
        }

        Ok(value)
    }

    /// Creates a new object inside a transaction. The object stays exclusively locked until the
    /// transaction commits and becomes visible with version 1.
    pub fn construct(tx: &mut Transaction, value: T) -> TxResult<Self> {
        tx.open_for_construction(value)
    }

    /// Reads the value within `tx`.
    pub fn read(&self, tx: &mut Transaction) -> TxResult<T> {
        tx.open_for_read(self)
    }

    /// Writes the value within `tx`.
    pub fn write(&self, tx: &mut Transaction, value: T) -> TxResult<()> {
        tx.open_for_write(self, |current| *current = value)
    }

    /// Writes the value within `tx` and returns the previous one.
    pub fn get_and_set(&self, tx: &mut Transaction, value: T) -> TxResult<T> {
        tx.open_for_write(self, |current| std::mem::replace(current, value))
    }

    /// Applies `f` to the value within `tx` and returns the new value.
    pub fn alter<F>(&self, tx: &mut Transaction, f: F) -> TxResult<T>
    where
        F: FnOnce(&T) -> T,
    {
        tx.open_for_write(self, |current| {
            *current = f(&*current);
            current.clone()
        })
    }

    /// Applies `f` to the value within `tx` and returns the previous value.
    pub fn get_and_alter<F>(&self, tx: &mut Transaction, f: F) -> TxResult<T>
    where
        F: FnOnce(&T) -> T,
    {
        tx.open_for_write(self, |current| {
            let next = f(&*current);
            std::mem::replace(current, next)
        })
    }

    /// Blocks `tx` until the value equals `value`. If it doesn't yet, the transaction retries
    /// and is woken up by the next change of this object.
    ///
    /// ```
    /// use stronghold_stm::{atomic, TRef};
    ///
    /// let ready = TRef::new(true);
    /// atomic(|tx| ready.await_value(tx, &true)).expect("ready is set");
    /// ```
    pub fn await_value(&self, tx: &mut Transaction, value: &T) -> TxResult<()> {
        match self.read(tx)? == *value {
            true => Ok(()),
            false => Err(tx.retry()),
        }
    }

    /// Defers `f` until commit, unless the value is read within `tx` before. A commuting update
    /// does not make `tx` depend on the current value, so concurrent commuting transactions on
    /// the same object don't conflict.
    pub fn commute<F>(&self, tx: &mut Transaction, f: F) -> TxResult<()>
    where
        F: FnOnce(T) -> T + Send + 'static,
    {
        tx.commute(self, Box::new(f))
    }

    /// Acquires a lock on this object for the rest of `tx`. Locks are only ever upgraded.
    pub fn acquire(&self, tx: &mut Transaction, lock_mode: LockMode) -> TxResult<()> {
        tx.acquire(self, lock_mode)
    }

    /// Returns the lock `tx` holds on this object.
    pub fn lock_mode(&self, tx: &mut Transaction) -> LockMode {
        tx.lock_mode_of(self)
    }
}

impl<T> Clone for TRef<T>
where
    T: TxValue,
{
    /// This creates another handle on the same object
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
        }
    }
}

impl<T> Hash for TRef<T>
where
    T: TxValue,
{
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.data.id.hash(state);
    }
}

impl<T> PartialEq for TRef<T>
where
    T: TxValue,
{
    fn eq(&self, other: &Self) -> bool {
        self.data.id == other.data.id
    }
}

impl<T> Eq for TRef<T> where T: TxValue {}

impl<T> Debug for TRef<T>
where
    T: TxValue,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TRef")
            .field("id", &self.id())
            .field("version", &self.version())
            .field("orec", &self.orec_state())
            .finish()
    }
}
