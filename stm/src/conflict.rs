// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The global conflict counter is a process wide (or rather runtime wide) monotonic counter.
//!
//! An update transaction bumps it when it is about to overwrite a value some other transaction
//! has arrived on. Readers keep a local copy of the counter: as long as the global value did
//! not move, none of their reads can have been invalidated and the read-set does not need to be
//! scanned.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// An atomic `GlobalConflictCounter`. Cloning shares the counter.
#[derive(Clone, Default, Debug)]
pub struct GlobalConflictCounter {
    atomic: Arc<AtomicU64>,
}

impl GlobalConflictCounter {
    pub fn new(count: u64) -> Self {
        Self {
            atomic: Arc::new(AtomicU64::new(count)),
        }
    }

    /// Returns the current count
    #[inline]
    pub fn count(&self) -> u64 {
        self.atomic.load(Ordering::SeqCst)
    }

    /// Signals a conflict and returns the new count
    #[inline]
    pub fn signal_conflict(&self) -> u64 {
        self.atomic.fetch_add(1, Ordering::SeqCst) + 1
    }
}
