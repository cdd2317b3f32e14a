// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Number of spin units after which busy waiting turns into yielding the cpu.
const MAX_SPIN_UNITS: u32 = 7;

/// A spinning thread yields its time slice every `SPIN_YIELD` failed attempts.
const SPIN_YIELD: usize = 8;

/// Hints the cpu that we are spinning, and yields the thread every [`SPIN_YIELD`] spins.
///
/// `remaining` is the remaining spin budget of the caller.
#[inline]
pub(crate) fn spin(remaining: usize) {
    if remaining > 0 && remaining % SPIN_YIELD == 0 {
        std::thread::yield_now();
    } else {
        core::hint::spin_loop();
    }
}

/// # ExponentialBackoff
///
/// [`ExponentialBackoff`] delays a thread that failed a transaction because of a conflict. Early
/// attempts keep the cpu busy with spin loop hints, growing exponentially in the number of spin
/// units. Once the spin units are exhausted the thread sleeps, starting at `min_delay` and
/// doubling with every attempt until `max_delay` is reached.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExponentialBackoff {
    min_delay: Duration,
    max_delay: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_micros(10),
            max_delay: Duration::from_millis(100),
        }
    }
}

impl ExponentialBackoff {
    pub fn new(min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            min_delay,
            max_delay: max_delay.max(min_delay),
        }
    }

    /// A backoff that never delays. Useful for tests that want to hammer the same objects.
    pub fn none() -> Self {
        Self {
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Returns the time this policy would sleep for the given attempt, or `None` if the
    /// attempt is still handled by spinning.
    pub fn sleep_time(&self, attempt: usize) -> Option<Duration> {
        if self.max_delay.is_zero() {
            return None;
        }

        let attempt = u32::try_from(attempt).unwrap_or(u32::MAX);
        if attempt <= MAX_SPIN_UNITS {
            return None;
        }

        let shift = (attempt - MAX_SPIN_UNITS - 1).min(31);
        let delay = self.min_delay.saturating_mul(1 << shift);
        Some(delay.min(self.max_delay))
    }

    /// Delays the calling thread according to the attempt number. Attempts start at 1.
    pub fn delay(&self, attempt: usize) {
        if self.max_delay.is_zero() {
            return;
        }

        match self.sleep_time(attempt) {
            Some(duration) => std::thread::sleep(duration),
            None => {
                for _ in 0..(1usize << attempt.min(MAX_SPIN_UNITS as usize)) {
                    core::hint::spin_loop();
                }
                std::thread::yield_now();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ExponentialBackoff;
    use std::time::Duration;

    #[test]
    fn test_sleep_time_is_bounded() {
        let backoff = ExponentialBackoff::new(Duration::from_micros(10), Duration::from_millis(1));

        for attempt in 0..=7 {
            assert_eq!(backoff.sleep_time(attempt), None);
        }

        assert_eq!(backoff.sleep_time(8), Some(Duration::from_micros(10)));
        assert_eq!(backoff.sleep_time(9), Some(Duration::from_micros(20)));
        assert_eq!(backoff.sleep_time(1000), Some(Duration::from_millis(1)));
    }

    #[test]
    fn test_huge_attempts_keep_sleeping() {
        let backoff = ExponentialBackoff::new(Duration::from_micros(10), Duration::from_millis(1));

        assert_eq!(backoff.sleep_time((u32::MAX as usize).saturating_add(1)), Some(Duration::from_millis(1)));
        assert_eq!(backoff.sleep_time(usize::MAX), Some(Duration::from_millis(1)));
    }

    #[test]
    fn test_no_backoff_never_sleeps() {
        let backoff = ExponentialBackoff::none();
        assert_eq!(backoff.sleep_time(100), None);
        backoff.delay(100);
    }
}
