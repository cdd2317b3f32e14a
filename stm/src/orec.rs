// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The ownership record (orec) is a single word sized concurrency control record attached to
//! every transactional object. It works with an arrive/depart scheme (semi visible reads): a
//! reading transaction arrives on the orec before it trusts a value and departs when it is
//! done. An update of an object with a surplus of readers tells the updater that concurrent
//! transactions depend on the old value, which is then announced through the
//! [`GlobalConflictCounter`](crate::GlobalConflictCounter).
//!
//! Layout of the 64 bit word:
//!
//! | bits   | content                                  |
//! |--------|------------------------------------------|
//! | 62..63 | lock mode (none = 0, write = 1, exclusive = 2) |
//! | 61     | read biased flag                         |
//! | 10..60 | surplus                                  |
//! | 0..9   | readonly streak count                    |
//!
//! Lock, surplus and flags must change together, so all transitions are compare-and-swap loops
//! over the whole word. Violating the protocol (departing without arriving, unlocking an
//! unlocked orec, ...) is a bug in the engine and panics.

use crate::backoff::spin;
use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

const MASK_LOCK_MODE: u64 = 0xC000_0000_0000_0000;
const SHIFT_LOCK_MODE: u32 = 62;
const MASK_READ_BIASED: u64 = 0x2000_0000_0000_0000;
const MASK_SURPLUS: u64 = 0x1FFF_FFFF_FFFF_FC00;
const SHIFT_SURPLUS: u32 = 10;
const MASK_READONLY_COUNT: u64 = 0x0000_0000_0000_03FF;

/// The readonly streak has 10 bits, the threshold can not be larger than that.
pub const MAX_READ_BIASED_THRESHOLD: u32 = 1023;

pub const DEFAULT_READ_BIASED_THRESHOLD: u32 = 16;

/// The lock a transaction holds on an object.
///
/// A `Write` lock prevents other transactions from locking or committing the object, but still
/// lets them read it. An `Exclusive` lock prevents reads as well; it is needed to publish a new
/// value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockMode {
    None = 0,
    Write = 1,
    Exclusive = 2,
}

impl Default for LockMode {
    fn default() -> Self {
        LockMode::None
    }
}

impl LockMode {
    fn from_bits(bits: u64) -> Self {
        match bits {
            0 => LockMode::None,
            1 => LockMode::Write,
            2 => LockMode::Exclusive,
            _ => panic!("orec contains an invalid lock mode {}", bits),
        }
    }
}

/// The result of an arrive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArriveStatus {
    /// The arrival was counted, a depart is required.
    Normal,

    /// The orec is read biased, the arrival was not counted and no depart is required.
    Unregistered,

    /// The orec stayed locked during the whole spin budget.
    LockNotFree,
}

impl ArriveStatus {
    pub fn is_success(&self) -> bool {
        !matches!(self, ArriveStatus::LockNotFree)
    }

    /// Returns `true` if the caller is obliged to depart later.
    pub fn needs_depart(&self) -> bool {
        matches!(self, ArriveStatus::Normal)
    }
}

/// The result of a lock acquisition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockArrival {
    pub status: ArriveStatus,

    /// Set when an exclusive lock was acquired while other transactions had arrived on the orec
    /// (or might have, if it was read biased). The acquiring transaction is responsible for
    /// signalling the global conflict counter before it publishes.
    pub conflict: bool,
}

impl LockArrival {
    const NOT_FREE: LockArrival = LockArrival {
        status: ArriveStatus::LockNotFree,
        conflict: false,
    };
}

/// Typed view on a packed orec word.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct OrecState(u64);

impl OrecState {
    pub fn lock_mode(&self) -> LockMode {
        LockMode::from_bits((self.0 & MASK_LOCK_MODE) >> SHIFT_LOCK_MODE)
    }

    pub fn is_locked(&self) -> bool {
        self.0 & MASK_LOCK_MODE != 0
    }

    pub fn has_exclusive_lock(&self) -> bool {
        self.lock_mode() == LockMode::Exclusive
    }

    pub fn is_read_biased(&self) -> bool {
        self.0 & MASK_READ_BIASED != 0
    }

    pub fn surplus(&self) -> u64 {
        (self.0 & MASK_SURPLUS) >> SHIFT_SURPLUS
    }

    pub fn readonly_count(&self) -> u32 {
        (self.0 & MASK_READONLY_COUNT) as u32
    }

    fn with_lock_mode(self, mode: LockMode) -> Self {
        Self((self.0 & !MASK_LOCK_MODE) | ((mode as u64) << SHIFT_LOCK_MODE))
    }

    fn with_read_biased(self, read_biased: bool) -> Self {
        match read_biased {
            true => Self(self.0 | MASK_READ_BIASED),
            false => Self(self.0 & !MASK_READ_BIASED),
        }
    }

    fn with_surplus(self, surplus: u64) -> Self {
        assert!(
            surplus <= MASK_SURPLUS >> SHIFT_SURPLUS,
            "orec surplus overflow: {:?}",
            self
        );
        Self((self.0 & !MASK_SURPLUS) | (surplus << SHIFT_SURPLUS))
    }

    fn with_readonly_count(self, count: u32) -> Self {
        Self((self.0 & !MASK_READONLY_COUNT) | (count as u64 & MASK_READONLY_COUNT))
    }
}

impl fmt::Debug for OrecState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Orec(lockMode={:?}, surplus={}, isReadBiased={}, readonlyCount={})",
            self.lock_mode(),
            self.surplus(),
            self.is_read_biased(),
            self.readonly_count()
        )
    }
}

/// The ownership record.
pub struct Orec {
    state: AtomicU64,
    read_biased_threshold: u32,
}

impl Default for Orec {
    fn default() -> Self {
        Self::new(DEFAULT_READ_BIASED_THRESHOLD)
    }
}

impl fmt::Debug for Orec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.state().fmt(f)
    }
}

impl Orec {
    /// Creates a free orec. The threshold is clamped into `1..=MAX_READ_BIASED_THRESHOLD`.
    pub fn new(read_biased_threshold: u32) -> Self {
        Self {
            state: AtomicU64::new(0),
            read_biased_threshold: read_biased_threshold.clamp(1, MAX_READ_BIASED_THRESHOLD),
        }
    }

    /// Creates an orec that is exclusively locked by its constructing transaction, which also
    /// counts as arrived.
    pub(crate) fn new_constructed(read_biased_threshold: u32) -> Self {
        let orec = Self::new(read_biased_threshold);
        let state = OrecState(0).with_lock_mode(LockMode::Exclusive).with_surplus(1);
        orec.state.store(state.0, Ordering::SeqCst);
        orec
    }

    #[inline]
    pub fn state(&self) -> OrecState {
        OrecState(self.state.load(Ordering::SeqCst))
    }

    pub fn read_biased_threshold(&self) -> u32 {
        self.read_biased_threshold
    }

    pub fn lock_mode(&self) -> LockMode {
        self.state().lock_mode()
    }

    pub fn has_exclusive_lock(&self) -> bool {
        self.state().has_exclusive_lock()
    }

    pub fn is_read_biased(&self) -> bool {
        self.state().is_read_biased()
    }

    pub fn surplus(&self) -> u64 {
        self.state().surplus()
    }

    pub fn readonly_count(&self) -> u32 {
        self.state().readonly_count()
    }

    #[inline]
    fn cas(&self, current: OrecState, next: OrecState) -> bool {
        self.state
            .compare_exchange(current.0, next.0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Arrives on the orec. Only an exclusive lock blocks an arrival; the caller spins at most
    /// `spin_count` times waiting for it to be released.
    pub fn arrive(&self, spin_count: usize) -> ArriveStatus {
        let mut remaining = spin_count;
        loop {
            let current = self.state();

            if current.has_exclusive_lock() {
                if remaining == 0 {
                    return ArriveStatus::LockNotFree;
                }
                remaining -= 1;
                spin(remaining);
                continue;
            }

            let surplus = current.surplus();
            let (next, status) = if current.is_read_biased() {
                match surplus {
                    0 => (current.with_surplus(1), ArriveStatus::Unregistered),
                    1 => return ArriveStatus::Unregistered,
                    _ => panic!("surplus of a read biased orec can never be larger than 1: {:?}", current),
                }
            } else {
                (current.with_surplus(surplus + 1), ArriveStatus::Normal)
            };

            if self.cas(current, next) {
                return status;
            }
        }
    }

    /// Arrives and acquires a write lock, or an exclusive lock if `exclusive` is set. Nothing
    /// changes when the orec stays locked for the whole spin budget.
    pub fn try_lock_and_arrive(&self, spin_count: usize, exclusive: bool) -> LockArrival {
        let mode = match exclusive {
            true => LockMode::Exclusive,
            false => LockMode::Write,
        };

        let mut remaining = spin_count;
        loop {
            let current = self.state();

            if current.is_locked() {
                if remaining == 0 {
                    return LockArrival::NOT_FREE;
                }
                remaining -= 1;
                spin(remaining);
                continue;
            }

            let surplus = current.surplus();
            let read_biased = current.is_read_biased();
            let next_surplus = match read_biased {
                true if surplus > 1 => {
                    panic!("surplus of a read biased orec can never be larger than 1: {:?}", current)
                }
                true => 1,
                false => surplus + 1,
            };

            let next = current.with_surplus(next_surplus).with_lock_mode(mode);
            if self.cas(current, next) {
                return LockArrival {
                    status: match read_biased {
                        true => ArriveStatus::Unregistered,
                        false => ArriveStatus::Normal,
                    },
                    conflict: exclusive && surplus > 0,
                };
            }
        }
    }

    /// Acquires a lock for a caller that already arrived normally.
    pub fn lock_after_arrive(&self, spin_count: usize, exclusive: bool) -> LockArrival {
        let mode = match exclusive {
            true => LockMode::Exclusive,
            false => LockMode::Write,
        };

        let mut remaining = spin_count;
        loop {
            let current = self.state();

            if current.is_read_biased() {
                panic!("can't lock after arrive, the orec is read biased: {:?}", current);
            }

            if current.is_locked() {
                if remaining == 0 {
                    return LockArrival::NOT_FREE;
                }
                remaining -= 1;
                spin(remaining);
                continue;
            }

            let surplus = current.surplus();
            if surplus == 0 {
                panic!("can't lock after arrive, there is no surplus: {:?}", current);
            }

            if self.cas(current, current.with_lock_mode(mode)) {
                return LockArrival {
                    status: ArriveStatus::Normal,
                    conflict: exclusive && surplus > 1,
                };
            }
        }
    }

    /// Upgrades a write lock held by the caller to an exclusive lock. Returns `true` if other
    /// readers may depend on the current value.
    pub fn upgrade_to_exclusive(&self) -> bool {
        loop {
            let current = self.state();

            if current.lock_mode() != LockMode::Write {
                panic!("can't upgrade to an exclusive lock without the write lock: {:?}", current);
            }

            if self.cas(current, current.with_lock_mode(LockMode::Exclusive)) {
                return current.is_read_biased() || current.surplus() > 1;
            }
        }
    }

    /// Spins until no exclusive lock is present. Used by reads that do not arrive.
    pub fn wait_for_exclusive_lock_to_become_free(&self, spin_count: usize) -> bool {
        let mut remaining = spin_count;
        loop {
            if !self.has_exclusive_lock() {
                return true;
            }
            if remaining == 0 {
                return false;
            }
            remaining -= 1;
            spin(remaining);
        }
    }

    /// Departs after a successful read without a lock.
    ///
    /// This increments the readonly streak. If the streak reaches the read biased threshold
    /// while no readers are left, the orec becomes read biased and stops counting arrivals.
    pub fn depart_after_reading(&self) {
        loop {
            let current = self.state();
            let surplus = current.surplus();

            if surplus == 0 {
                panic!("can't depart after reading, there is no surplus: {:?}", current);
            }

            if current.is_read_biased() {
                panic!("can't depart after reading, the orec is read biased: {:?}", current);
            }

            if current.is_locked() && surplus <= 1 {
                panic!("can't depart after reading, the surplus belongs to the lock owner: {:?}", current);
            }

            let next = self.after_readonly_depart(current, surplus - 1);
            if self.cas(current, next) {
                return;
            }
        }
    }

    /// Departs after a successful read that held a lock, and releases the lock.
    pub fn depart_after_reading_and_unlock(&self) {
        loop {
            let current = self.state();
            let surplus = current.surplus();

            if surplus == 0 {
                panic!("can't depart after reading, there is no surplus: {:?}", current);
            }

            if !current.is_locked() {
                panic!("can't depart after reading and unlock, no lock is acquired: {:?}", current);
            }

            if current.is_read_biased() {
                panic!("can't depart after reading, the orec is read biased: {:?}", current);
            }

            let next = self
                .after_readonly_depart(current, surplus - 1)
                .with_lock_mode(LockMode::None);
            if self.cas(current, next) {
                return;
            }
        }
    }

    fn after_readonly_depart(&self, current: OrecState, surplus: u64) -> OrecState {
        let readonly_count = (current.readonly_count() + 1).min(self.read_biased_threshold);

        if surplus == 0 && readonly_count >= self.read_biased_threshold {
            current
                .with_surplus(0)
                .with_read_biased(true)
                .with_readonly_count(0)
        } else {
            current.with_surplus(surplus).with_readonly_count(readonly_count)
        }
    }

    /// Departs after a new value has been published and releases the exclusive lock.
    ///
    /// The read bias and the readonly streak are reset. Returns the number of arrivals of other
    /// transactions that are still outstanding.
    pub fn depart_after_update_and_unlock(&self) -> u64 {
        loop {
            let current = self.state();

            if !current.has_exclusive_lock() {
                panic!("can't depart after update, the exclusive lock is not acquired: {:?}", current);
            }

            let surplus = current.surplus();
            if surplus == 0 {
                panic!("can't depart after update, there is no surplus: {:?}", current);
            }

            let remaining = match current.is_read_biased() {
                true if surplus > 1 => {
                    panic!("surplus of a read biased orec can never be larger than 1: {:?}", current)
                }
                // readers of a read biased orec are not counted, they will find out by the
                // version change.
                true => 0,
                false => surplus - 1,
            };

            if self.cas(current, OrecState(0).with_surplus(remaining)) {
                return remaining;
            }
        }
    }

    /// Undoes a normal arrival of a transaction that holds no lock.
    pub fn depart_after_failure(&self) {
        loop {
            let current = self.state();

            if current.is_read_biased() {
                panic!("can't depart after failure, the orec is read biased: {:?}", current);
            }

            let surplus = current.surplus();
            if current.is_locked() && surplus < 2 {
                panic!(
                    "can't depart after failure, there must be at least 2 arrivals, the lock owner and the caller: {:?}",
                    current
                );
            }

            if surplus == 0 {
                panic!("can't depart after failure, there is no surplus: {:?}", current);
            }

            if self.cas(current, current.with_surplus(surplus - 1)) {
                return;
            }
        }
    }

    /// Undoes an arrival and releases the lock held by the caller.
    ///
    /// The surplus of a read biased orec is left as is, since it doesn't count individual readers.
    pub fn depart_after_failure_and_unlock(&self) {
        loop {
            let current = self.state();

            if !current.is_locked() {
                panic!("can't depart after failure and unlock, no lock is acquired: {:?}", current);
            }

            let surplus = current.surplus();
            if surplus == 0 {
                panic!("can't depart after failure and unlock, there is no surplus: {:?}", current);
            }

            let next = match current.is_read_biased() {
                true => current,
                false => current.with_surplus(surplus - 1),
            }
            .with_lock_mode(LockMode::None);

            if self.cas(current, next) {
                return;
            }
        }
    }

    /// Releases a lock that was acquired through an unregistered arrival on a read biased orec.
    pub fn unlock_by_unregistered(&self) {
        loop {
            let current = self.state();

            if !current.is_read_biased() {
                panic!("can't unlock by unregistered, the orec is not read biased: {:?}", current);
            }

            if !current.is_locked() {
                panic!("can't unlock by unregistered, no lock is acquired: {:?}", current);
            }

            if current.surplus() > 1 {
                panic!("surplus of a read biased orec can never be larger than 1: {:?}", current);
            }

            if self.cas(current, current.with_lock_mode(LockMode::None)) {
                return;
            }
        }
    }
}
