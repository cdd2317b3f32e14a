// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use crate::{
    backoff::ExponentialBackoff,
    journal::JournalKind,
    orec::{LockMode, DEFAULT_READ_BIASED_THRESHOLD, MAX_READ_BIASED_THRESHOLD},
};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};

pub const DEFAULT_SPIN_COUNT: usize = 64;
pub const DEFAULT_MAX_RETRIES: usize = 1000;
pub const DEFAULT_MAX_FIXED_LENGTH: usize = 20;
pub const DEFAULT_CHEAP_SCAN_CEILING: usize = 20;
pub const DEFAULT_FAMILY_NAME: &str = "anonymous";

/// Runtime wide settings of an [`Stm`](crate::Stm).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StmConfig {
    spin_count: usize,
    read_biased_threshold: u32,
    max_retries: usize,
    backoff: ExponentialBackoff,
}

impl Default for StmConfig {
    fn default() -> Self {
        Self {
            spin_count: DEFAULT_SPIN_COUNT,
            read_biased_threshold: DEFAULT_READ_BIASED_THRESHOLD,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: ExponentialBackoff::default(),
        }
    }
}

impl StmConfig {
    /// Configures how often a lock is polled before the operation gives up.
    pub fn with_spin_count(mut self, spin_count: usize) -> Self {
        self.spin_count = spin_count;
        self
    }

    /// Configures the number of consecutive readonly accesses after which an object stops
    /// counting readers. The value is clamped into `1..=1023`.
    pub fn with_read_biased_threshold(mut self, threshold: u32) -> Self {
        self.read_biased_threshold = threshold.clamp(1, MAX_READ_BIASED_THRESHOLD);
        self
    }

    /// Configures the default maximum of retries for transactions.
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Configures the default backoff policy after conflicts.
    pub fn with_backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn spin_count(&self) -> usize {
        self.spin_count
    }

    pub fn read_biased_threshold(&self) -> u32 {
        self.read_biased_threshold
    }

    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    pub fn backoff(&self) -> ExponentialBackoff {
        self.backoff
    }
}

/// Settings of a transaction family.
///
/// ## Example
/// ```
/// use stronghold_stm::TxConfig;
/// use std::time::Duration;
///
/// let config = TxConfig::default()
///     .with_family_name("consumer")
///     .with_timeout(Some(Duration::from_secs(1)))
///     .with_max_retries(10);
/// assert_eq!(config.family_name(), "consumer");
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxConfig {
    family_name: String,
    readonly: bool,
    max_retries: usize,
    timeout: Option<Duration>,
    blocking_allowed: bool,
    track_reads: bool,
    spin_count: usize,
    dirty_check: bool,
    read_lock_mode: LockMode,
    write_lock_mode: LockMode,
    max_fixed_length: usize,
    cheap_scan_ceiling: usize,
    speculative: bool,
    write_skew_allowed: bool,
    backoff: ExponentialBackoff,
}

impl Default for TxConfig {
    fn default() -> Self {
        Self {
            family_name: DEFAULT_FAMILY_NAME.to_string(),
            readonly: false,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout: None,
            blocking_allowed: true,
            track_reads: true,
            spin_count: DEFAULT_SPIN_COUNT,
            dirty_check: true,
            read_lock_mode: LockMode::None,
            write_lock_mode: LockMode::None,
            max_fixed_length: DEFAULT_MAX_FIXED_LENGTH,
            cheap_scan_ceiling: DEFAULT_CHEAP_SCAN_CEILING,
            speculative: true,
            write_skew_allowed: true,
            backoff: ExponentialBackoff::default(),
        }
    }
}

impl TxConfig {
    /// Creates a transaction configuration with the defaults of an [`StmConfig`].
    pub fn from_stm_config(config: &StmConfig) -> Self {
        Self::default()
            .with_spin_count(config.spin_count)
            .with_max_retries(config.max_retries)
            .with_backoff(config.backoff)
    }

    /// Names the transaction family. The name shows up in logs and errors.
    pub fn with_family_name(mut self, name: impl Into<String>) -> Self {
        self.family_name = name.into();
        self
    }

    /// Readonly transactions fail on writes, commutes and constructions.
    pub fn with_readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    /// Configures how often the retry loop restarts a transaction before giving up.
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Configures the total time a transaction may spend blocked in retries. `None` waits
    /// forever.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Configures whether [`Transaction::retry`](crate::Transaction::retry) may block.
    pub fn with_blocking_allowed(mut self, allowed: bool) -> Self {
        self.blocking_allowed = allowed;
        self
    }

    /// Readonly transactions that don't track reads keep no journal entries for them. Such
    /// transactions are cheaper, but can't block on retry and don't get consistency checks for
    /// their reads.
    pub fn with_track_reads(mut self, track_reads: bool) -> Self {
        self.track_reads = track_reads;
        self
    }

    pub fn with_spin_count(mut self, spin_count: usize) -> Self {
        self.spin_count = spin_count;
        self
    }

    /// Writes that leave the value unchanged are not committed if dirty checking is enabled.
    pub fn with_dirty_check(mut self, dirty_check: bool) -> Self {
        self.dirty_check = dirty_check;
        self
    }

    /// The lock acquired on every object that is read.
    pub fn with_read_lock_mode(mut self, lock_mode: LockMode) -> Self {
        self.read_lock_mode = lock_mode;
        self
    }

    /// The lock acquired on every object that is written. It is never weaker than the read lock
    /// mode.
    pub fn with_write_lock_mode(mut self, lock_mode: LockMode) -> Self {
        self.write_lock_mode = lock_mode;
        self
    }

    pub fn with_max_fixed_length(mut self, length: usize) -> Self {
        self.max_fixed_length = length.max(1);
        self
    }

    /// Configures the largest journal for which read consistency is checked with the global
    /// conflict counter only.
    pub fn with_cheap_scan_ceiling(mut self, ceiling: usize) -> Self {
        self.cheap_scan_ceiling = ceiling;
        self
    }

    /// Speculative families start with the smallest journal and learn from their transactions.
    pub fn with_speculative(mut self, speculative: bool) -> Self {
        self.speculative = speculative;
        self
    }

    /// Transactions that don't allow write skew write lock every object they only read when they
    /// commit updates. Nothing they read can change until they completed.
    pub fn with_write_skew_allowed(mut self, allowed: bool) -> Self {
        self.write_skew_allowed = allowed;
        self
    }

    pub fn with_backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn family_name(&self) -> &str {
        &self.family_name
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn is_blocking_allowed(&self) -> bool {
        self.blocking_allowed
    }

    pub fn is_tracking_reads(&self) -> bool {
        self.track_reads
    }

    pub fn spin_count(&self) -> usize {
        self.spin_count
    }

    pub fn is_dirty_check_enabled(&self) -> bool {
        self.dirty_check
    }

    pub fn read_lock_mode(&self) -> LockMode {
        self.read_lock_mode
    }

    pub fn write_lock_mode(&self) -> LockMode {
        self.write_lock_mode.max(self.read_lock_mode)
    }

    pub fn max_fixed_length(&self) -> usize {
        self.max_fixed_length
    }

    pub fn cheap_scan_ceiling(&self) -> usize {
        self.cheap_scan_ceiling
    }

    pub fn is_speculative(&self) -> bool {
        self.speculative
    }

    pub fn is_write_skew_allowed(&self) -> bool {
        self.write_skew_allowed
    }

    pub fn backoff(&self) -> ExponentialBackoff {
        self.backoff
    }

    /// Reads that are neither locked nor kept in the journal.
    pub(crate) fn is_untracked_read(&self) -> bool {
        self.readonly && !self.track_reads && self.read_lock_mode == LockMode::None
    }
}

#[derive(Debug)]
struct SpeculativeState {
    journal_kind: AtomicU8,
    full_scan: AtomicBool,
}

/// What a transaction family has learned about its transactions. Shared by all transactions of
/// the family; the knowledge only ever grows.
#[derive(Clone, Debug)]
pub struct SpeculativeConfig {
    state: Arc<SpeculativeState>,
    enabled: bool,
}

impl SpeculativeConfig {
    pub fn new(enabled: bool) -> Self {
        let journal_kind = match enabled {
            true => JournalKind::Mono,
            false => JournalKind::Variable,
        };

        Self {
            state: Arc::new(SpeculativeState {
                journal_kind: AtomicU8::new(journal_kind as u8),
                full_scan: AtomicBool::new(false),
            }),
            enabled,
        }
    }

    /// The journal shape new transactions of the family start with.
    pub fn journal_kind(&self) -> JournalKind {
        JournalKind::from_u8(self.state.journal_kind.load(Ordering::Relaxed))
    }

    /// Records that a transaction needed a journal of `kind`.
    pub fn learn_journal_kind(&self, kind: JournalKind) {
        if self.enabled {
            self.state.journal_kind.fetch_max(kind as u8, Ordering::Relaxed);
        }
    }

    /// Returns `true` if the transactions of the family skip arriving and always scan their
    /// read set.
    pub fn is_full_scan(&self) -> bool {
        self.state.full_scan.load(Ordering::Relaxed)
    }

    pub fn learn_full_scan(&self) {
        if self.enabled {
            self.state.full_scan.store(true, Ordering::Relaxed);
        }
    }
}
