// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! A [`Tranlocal`] is the private copy a transaction keeps of every object it touched. The
//! journal stores them type erased as [`Entry`] trait objects.

use crate::{
    latch::Latch,
    listeners::Listeners,
    object::{Loaded, Registration, Snapshot, TRef, TxValue},
    orec::{ArriveStatus, LockMode},
    TxError, TxResult,
};
use std::{any::Any, sync::Arc};

pub(crate) type CommuteFn<T> = Box<dyn FnOnce(T) -> T + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TranlocalMode {
    Read,
    Write,
    Constructing,
    Commuting,
}

pub(crate) struct Tranlocal<T>
where
    T: TxValue,
{
    pub owner: TRef<T>,

    /// The committed snapshot this entry was loaded from. `None` for constructed objects and for
    /// commutes that have not been flattened.
    pub snapshot: Option<Arc<Snapshot<T>>>,

    /// The working copy, present once the entry was written.
    pub value: Option<T>,
    pub version: u64,
    pub mode: TranlocalMode,
    pub lock_mode: LockMode,
    pub is_dirty: bool,
    pub is_committed: bool,
    pub has_depart_obligation: bool,

    /// Set if an exclusive lock was acquired while other readers were present.
    pub lock_conflict: bool,
    pub commutes: Vec<CommuteFn<T>>,
}

impl<T> Tranlocal<T>
where
    T: TxValue,
{
    /// Creates a read entry, or a write entry if a working copy is given.
    pub fn loaded(owner: TRef<T>, loaded: Loaded<T>, value: Option<T>) -> Self {
        let version = loaded.snapshot.version();
        let mode = match value {
            Some(_) => TranlocalMode::Write,
            None => TranlocalMode::Read,
        };

        Self {
            owner,
            snapshot: Some(loaded.snapshot),
            value,
            version,
            mode,
            lock_mode: loaded.lock_mode,
            is_dirty: false,
            is_committed: false,
            has_depart_obligation: loaded.has_depart_obligation,
            lock_conflict: loaded.conflict,
            commutes: Vec::new(),
        }
    }

    pub fn constructing(owner: TRef<T>, value: T) -> Self {
        Self {
            owner,
            snapshot: None,
            value: Some(value),
            version: 0,
            mode: TranlocalMode::Constructing,
            lock_mode: LockMode::Exclusive,
            is_dirty: true,
            is_committed: false,
            has_depart_obligation: true,
            lock_conflict: false,
            commutes: Vec::new(),
        }
    }

    pub fn commuting(owner: TRef<T>, function: CommuteFn<T>) -> Self {
        Self {
            owner,
            snapshot: None,
            value: None,
            version: 0,
            mode: TranlocalMode::Commuting,
            lock_mode: LockMode::None,
            is_dirty: false,
            is_committed: false,
            has_depart_obligation: false,
            lock_conflict: false,
            commutes: vec![function],
        }
    }

    /// The value as seen by the owning transaction.
    pub fn current(&self) -> Option<&T> {
        self.value
            .as_ref()
            .or_else(|| self.snapshot.as_deref().map(Snapshot::value))
    }

    /// Returns a mutable working copy, turning a read entry into a write entry.
    pub fn upgrade_to_write(&mut self) -> Option<&mut T> {
        if self.value.is_none() {
            self.value = Some(self.snapshot.as_deref()?.value().clone());
        }
        if self.mode == TranlocalMode::Read {
            self.mode = TranlocalMode::Write;
        }
        self.value.as_mut()
    }

    /// Loads the committed value of a commuting entry and applies the pending functions.
    pub fn flatten(&mut self, spin_count: usize, arrive: bool, lock_mode: LockMode) -> TxResult<()> {
        debug_assert_eq!(self.mode, TranlocalMode::Commuting);

        let loaded = self.owner.load(spin_count, arrive, lock_mode)?;

        self.version = loaded.snapshot.version();
        self.lock_mode = loaded.lock_mode;
        self.has_depart_obligation = loaded.has_depart_obligation;
        self.lock_conflict |= loaded.conflict;

        let mut value = loaded.snapshot.value().clone();
        for function in self.commutes.drain(..) {
            value = function(value);
        }

        self.snapshot = Some(loaded.snapshot);
        self.value = Some(value);
        self.mode = TranlocalMode::Write;
        Ok(())
    }

    /// Upgrades the lock held on the owner. Fails if the lock is not free, or if the owner was
    /// updated since it was read.
    pub fn ensure_lock(&mut self, spin_count: usize, lock_mode: LockMode) -> TxResult<()> {
        if lock_mode <= self.lock_mode {
            return Ok(());
        }

        if self.mode == TranlocalMode::Commuting {
            return self.flatten(spin_count, true, lock_mode);
        }

        let orec = self.owner.orec();
        let exclusive = lock_mode == LockMode::Exclusive;

        if self.lock_mode == LockMode::Write {
            self.lock_conflict |= orec.upgrade_to_exclusive();
            self.lock_mode = LockMode::Exclusive;
            return Ok(());
        }

        let arrival = match self.has_depart_obligation {
            true => orec.lock_after_arrive(spin_count, exclusive),
            false => orec.try_lock_and_arrive(spin_count, exclusive),
        };

        if arrival.status == ArriveStatus::LockNotFree {
            return Err(TxError::ReadWriteConflict);
        }

        self.lock_mode = lock_mode;
        self.has_depart_obligation |= arrival.status.needs_depart();
        self.lock_conflict |= arrival.conflict;

        if self.owner.version() != self.version {
            return Err(TxError::ReadWriteConflict);
        }

        Ok(())
    }
}

/// The type erased view of a [`Tranlocal`] used by the journal and the commit protocol.
pub(crate) trait Entry: Send {
    fn id(&self) -> u64;

    fn mode(&self) -> TranlocalMode;

    fn lock_mode(&self) -> LockMode;

    fn is_dirty(&self) -> bool;

    /// Locks the entry for commit if it needs to be published. Returns whether the acquired
    /// exclusive lock saw concurrent readers.
    fn prepare(&mut self, spin_count: usize, dirty_check: bool) -> TxResult<bool>;

    /// Write locks an entry that is only read, so nobody can update it before the transaction
    /// completes. Must run after [`Entry::prepare`].
    fn lock_for_write_skew(&mut self, spin_count: usize) -> TxResult<()>;

    /// Publishes a dirty entry. Returns the listeners of the owner, or `None` if the entry was not
    /// published.
    fn commit(&mut self) -> Option<Listeners>;

    /// Releases arrival and lock after a successful transaction.
    fn release_after_reading(&mut self);

    /// Releases arrival and lock after an aborted transaction.
    fn release_after_failure(&mut self);

    fn has_read_conflict(&self) -> bool;

    fn register_change_listener(&self, latch: &Arc<Latch>, era: u64) -> Registration;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T> Entry for Tranlocal<T>
where
    T: TxValue,
{
    fn id(&self) -> u64 {
        self.owner.id()
    }

    fn mode(&self) -> TranlocalMode {
        self.mode
    }

    fn lock_mode(&self) -> LockMode {
        self.lock_mode
    }

    fn is_dirty(&self) -> bool {
        self.is_dirty
    }

    fn prepare(&mut self, spin_count: usize, dirty_check: bool) -> TxResult<bool> {
        match self.mode {
            TranlocalMode::Read => return Ok(false),
            TranlocalMode::Constructing => return Ok(false),
            TranlocalMode::Commuting => self
                .flatten(spin_count, true, LockMode::Exclusive)
                .map_err(|_| TxError::ReadWriteConflict)?,
            TranlocalMode::Write => {}
        }

        self.is_dirty = match (dirty_check, &self.value, &self.snapshot) {
            (true, Some(value), Some(snapshot)) => value != snapshot.value(),
            _ => true,
        };

        if !self.is_dirty {
            return Ok(false);
        }

        self.ensure_lock(spin_count, LockMode::Exclusive)?;
        Ok(self.lock_conflict)
    }

    fn lock_for_write_skew(&mut self, spin_count: usize) -> TxResult<()> {
        match self.mode {
            TranlocalMode::Read => self.ensure_lock(spin_count, LockMode::Write),
            TranlocalMode::Write if !self.is_dirty => self.ensure_lock(spin_count, LockMode::Write),
            TranlocalMode::Write | TranlocalMode::Constructing | TranlocalMode::Commuting => Ok(()),
        }
    }

    fn commit(&mut self) -> Option<Listeners> {
        if !self.is_dirty || self.is_committed {
            return None;
        }

        let value = self.value.take()?;
        let listeners = self.owner.publish(value);

        self.is_committed = true;
        self.lock_mode = LockMode::None;
        self.has_depart_obligation = false;
        Some(listeners)
    }

    fn release_after_reading(&mut self) {
        let orec = self.owner.orec();

        match (self.lock_mode, self.has_depart_obligation) {
            (LockMode::None, true) => orec.depart_after_reading(),
            (LockMode::None, false) => {}
            (_, true) => orec.depart_after_reading_and_unlock(),
            (_, false) => orec.unlock_by_unregistered(),
        }

        self.lock_mode = LockMode::None;
        self.has_depart_obligation = false;
    }

    fn release_after_failure(&mut self) {
        if self.is_committed {
            return;
        }

        // a constructed object was never visible to anybody and stays locked for good
        if self.mode == TranlocalMode::Constructing {
            self.lock_mode = LockMode::None;
            self.has_depart_obligation = false;
            return;
        }

        let orec = self.owner.orec();

        match (self.lock_mode, self.has_depart_obligation) {
            (LockMode::None, true) => orec.depart_after_failure(),
            (LockMode::None, false) => {}
            (_, true) => orec.depart_after_failure_and_unlock(),
            (_, false) => orec.unlock_by_unregistered(),
        }

        self.lock_mode = LockMode::None;
        self.has_depart_obligation = false;
    }

    fn has_read_conflict(&self) -> bool {
        match self.mode {
            TranlocalMode::Constructing | TranlocalMode::Commuting => false,
            TranlocalMode::Read | TranlocalMode::Write => self.owner.has_read_conflict(self.version, self.lock_mode),
        }
    }

    fn register_change_listener(&self, latch: &Arc<Latch>, era: u64) -> Registration {
        match self.mode {
            TranlocalMode::Constructing | TranlocalMode::Commuting => Registration::None,
            TranlocalMode::Read | TranlocalMode::Write => self.owner.register_change_listener(latch, self.version, era),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
