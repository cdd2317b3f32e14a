// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Latch
//!
//! A blocking transaction waits on a [`Latch`]. The latch carries an era: a listener captures
//! the era it registered for, and opening the latch with an older era has no effect. This way a
//! late notification for a retry that already completed can never wake up the next retry of the
//! same transaction.

use std::{
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

#[derive(Debug, Default)]
struct LatchState {
    era: u64,
    open: bool,
}

#[derive(Debug, Default)]
pub struct Latch {
    state: Mutex<LatchState>,
    cond: Condvar,
}

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LatchState> {
        // the state is two plain integers and stays consistent even if a holder panicked
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the current era.
    pub fn era(&self) -> u64 {
        self.lock().era
    }

    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    /// Returns `true` if opening the latch for `era` would still wake somebody up.
    pub fn is_waiting_for(&self, era: u64) -> bool {
        let state = self.lock();
        state.era == era && !state.open
    }

    /// Opens the latch if `era` is the current era and wakes up all waiting threads.
    pub fn open(&self, era: u64) {
        let mut state = self.lock();
        if state.era != era || state.open {
            return;
        }
        state.open = true;
        drop(state);
        self.cond.notify_all();
    }

    /// Closes the latch and moves it into a new era, which is returned.
    pub fn reset(&self) -> u64 {
        let mut state = self.lock();
        state.era += 1;
        state.open = false;
        state.era
    }

    /// Blocks until the latch is opened for `era`. Returns immediately if the era has passed.
    pub fn await_open(&self, era: u64) {
        let mut state = self.lock();
        while state.era == era && !state.open {
            state = self.cond.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Blocks until the latch is opened for `era`, or until `timeout` passed.
    ///
    /// Returns the part of the timeout that is left, or `None` if it ran out before the latch
    /// was opened.
    pub fn try_await(&self, era: u64, timeout: Duration) -> Option<Duration> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();

        while state.era == era && !state.open {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }

            state = self
                .cond
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }

        Some(deadline.saturating_duration_since(Instant::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::Latch;
    use std::{sync::Arc, thread, time::Duration};

    #[test]
    fn test_open_wakes_waiter() {
        let latch = Arc::new(Latch::new());
        let era = latch.reset();

        let waiter = {
            let latch = latch.clone();
            thread::spawn(move || latch.try_await(era, Duration::from_secs(10)))
        };

        thread::sleep(Duration::from_millis(20));
        latch.open(era);

        let remaining = waiter.join().expect("Failed to join waiter");
        assert!(remaining.is_some());
        assert!(latch.is_open());
    }

    #[test]
    fn test_stale_era_is_ignored() {
        let latch = Latch::new();
        let old = latch.reset();
        let current = latch.reset();
        assert_ne!(old, current);

        latch.open(old);
        assert!(!latch.is_open());

        latch.open(current);
        assert!(latch.is_open());

        // waiting for a past era never blocks
        latch.await_open(old);
    }

    #[test]
    fn test_timeout() {
        let latch = Latch::new();
        let era = latch.reset();
        assert_eq!(latch.try_await(era, Duration::from_millis(10)), None);
        assert!(!latch.is_open());
    }
}
