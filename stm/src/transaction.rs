// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use crate::{
    config::{SpeculativeConfig, TxConfig},
    conflict::GlobalConflictCounter,
    journal::{self, BoxedEntry, Journal, JournalKind},
    latch::Latch,
    object::{Registration, TRef, TxValue},
    orec::LockMode,
    tranlocal::{CommuteFn, Entry, Tranlocal, TranlocalMode},
    TxError, TxResult,
};
use log::*;
use std::{sync::Arc, time::Duration};

/// The lifecycle of a [`Transaction`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TxStatus {
    Active,
    Prepared,
    Committed,
    Aborted,
}

impl TxStatus {
    /// Returns `true` if the transaction can still be used.
    pub fn is_alive(&self) -> bool {
        matches!(self, TxStatus::Active | TxStatus::Prepared)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Active => "active",
            TxStatus::Prepared => "prepared",
            TxStatus::Committed => "committed",
            TxStatus::Aborted => "aborted",
        }
    }
}

/// # Transaction
///
/// A transaction collects private copies of the objects it reads and writes in a journal. Reads
/// arrive on the ownership record of an object, so concurrent updates can tell that somebody
/// depends on the old value. On commit the written objects are locked, the reads are validated,
/// and the new values are published.
///
/// Every failing operation aborts the transaction. Transactions are usually driven by a retry
/// loop ([`crate::Stm::atomic`], [`crate::TxFactory::execute`]) that restarts them on conflicts
/// and blocks them on [`Transaction::retry`].
pub struct Transaction {
    config: Arc<TxConfig>,
    speculative: SpeculativeConfig,
    conflict_counter: GlobalConflictCounter,
    read_biased_threshold: u32,

    journal: Box<dyn Journal>,
    status: TxStatus,
    attempt: usize,

    /// The global conflict count the reads were last validated against
    local_conflict_count: u64,
    remaining_timeout: Option<Duration>,

    retry_latch: Arc<Latch>,
    retry_era: u64,
    awaiting_update: bool,

    /// Whether reads arrive on the orecs of the objects
    arrive: bool,
    full_scan: bool,
}

impl Transaction {
    pub(crate) fn new(
        config: Arc<TxConfig>,
        speculative: SpeculativeConfig,
        conflict_counter: GlobalConflictCounter,
        read_biased_threshold: u32,
    ) -> Self {
        let full_scan = speculative.is_full_scan();
        let journal = journal::new_journal(speculative.journal_kind(), config.max_fixed_length());

        Self {
            remaining_timeout: config.timeout(),
            local_conflict_count: conflict_counter.count(),
            config,
            speculative,
            conflict_counter,
            read_biased_threshold,
            journal,
            status: TxStatus::Active,
            attempt: 1,
            retry_latch: Arc::new(Latch::new()),
            retry_era: 0,
            awaiting_update: false,
            arrive: !full_scan,
            full_scan,
        }
    }

    pub fn status(&self) -> TxStatus {
        self.status
    }

    /// The current attempt, starting at 1.
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn config(&self) -> &TxConfig {
        &self.config
    }

    /// The part of the configured timeout that has not been spent waiting in retries.
    pub fn remaining_timeout(&self) -> Option<Duration> {
        self.remaining_timeout
    }

    /// The shape of the journal.
    pub fn journal_kind(&self) -> JournalKind {
        self.journal.kind()
    }

    /// The number of objects in the journal.
    pub fn journal_len(&self) -> usize {
        self.journal.len()
    }

    /// Returns `true` if the read set is always validated object by object.
    pub fn is_full_scan(&self) -> bool {
        self.full_scan
    }

    fn family(&self) -> String {
        self.config.family_name().to_string()
    }

    /// Aborts the transaction and hands back `error`.
    fn fail(&mut self, error: TxError) -> TxError {
        self.abort_internal();
        error
    }

    fn ensure_alive(&mut self, operation: &'static str) -> TxResult<()> {
        match self.status {
            TxStatus::Active => Ok(()),
            TxStatus::Prepared => {
                let error = TxError::PreparedTransaction {
                    family: self.family(),
                    operation,
                };
                Err(self.fail(error))
            }
            TxStatus::Committed | TxStatus::Aborted => Err(TxError::DeadTransaction {
                family: self.family(),
                operation,
                status: self.status.as_str(),
            }),
        }
    }

    fn ensure_writable(&mut self, operation: &'static str) -> TxResult<()> {
        self.ensure_alive(operation)?;

        if self.config.is_readonly() {
            let error = TxError::ReadonlyTransaction {
                family: self.family(),
                operation,
            };
            return Err(self.fail(error));
        }
        Ok(())
    }

    fn locate<T>(&mut self, tref: &TRef<T>) -> Option<&mut Tranlocal<T>>
    where
        T: TxValue,
    {
        self.journal.locate(tref.id()).map(downcast)
    }

    fn attach(&mut self, entry: BoxedEntry) {
        if let Err(entry) = self.journal.attach(entry) {
            journal::grow(&mut self.journal, self.config.max_fixed_length());
            self.speculative.learn_journal_kind(self.journal.kind());
            debug!("TX({}): JOURNAL GREW TO {:?}", self.config.family_name(), self.journal.kind());

            if self.journal.attach(entry).is_err() {
                panic!("journal of kind {:?} refused an entry after growing", self.journal.kind());
            }
        }

        if !self.full_scan && self.journal.len() > self.config.cheap_scan_ceiling() {
            debug!("TX({}): SWITCHING TO FULL CONFLICT SCANS", self.config.family_name());
            self.full_scan = true;
            self.speculative.learn_full_scan();
        }
    }

    /// Checks that nothing this transaction read has been changed by others.
    ///
    /// If the global conflict counter did not move, no update overwrote an object this
    /// transaction arrived on, and the scan can be skipped. Otherwise every entry is checked.
    pub(crate) fn is_read_consistent(&mut self) -> bool {
        let global = self.conflict_counter.count();

        if !self.full_scan && self.arrive && global == self.local_conflict_count {
            return true;
        }

        if self.journal.iter().any(|entry| entry.has_read_conflict()) {
            return false;
        }

        self.local_conflict_count = global;
        true
    }

    fn attach_and_validate(&mut self, entry: BoxedEntry) -> TxResult<()> {
        self.attach(entry);

        match self.is_read_consistent() {
            true => Ok(()),
            false => {
                debug!("TX({}): READ CONFLICT", self.config.family_name());
                Err(self.fail(TxError::ReadWriteConflict))
            }
        }
    }

    pub(crate) fn open_for_read<T>(&mut self, tref: &TRef<T>) -> TxResult<T>
    where
        T: TxValue,
    {
        self.ensure_alive("read")?;

        let spin_count = self.config.spin_count();
        let lock_mode = self.config.read_lock_mode();
        let arrive = self.arrive;

        if let Some(tranlocal) = self.locate(tref) {
            let result = match tranlocal.mode {
                TranlocalMode::Commuting => tranlocal.flatten(spin_count, arrive, lock_mode),
                _ => tranlocal.ensure_lock(spin_count, lock_mode),
            }
            .map(|_| current_value(tranlocal));

            return result.map_err(|e| self.fail(e));
        }

        if self.config.is_untracked_read() {
            let loaded = tref
                .load(spin_count, arrive, LockMode::None)
                .map_err(|e| self.fail(e))?;
            if loaded.has_depart_obligation {
                tref.orec().depart_after_reading();
            }
            return Ok(loaded.snapshot.value().clone());
        }

        let loaded = tref.load(spin_count, arrive, lock_mode).map_err(|e| self.fail(e))?;
        let value = loaded.snapshot.value().clone();

        self.attach_and_validate(Box::new(Tranlocal::loaded(tref.clone(), loaded, None)))?;
        Ok(value)
    }

    /// Opens `tref` for writing and applies `update` to the working copy. Returns what `update`
    /// returned.
    pub(crate) fn open_for_write<T, F, R>(&mut self, tref: &TRef<T>, update: F) -> TxResult<R>
    where
        T: TxValue,
        F: FnOnce(&mut T) -> R,
    {
        self.ensure_writable("write")?;

        let spin_count = self.config.spin_count();
        let lock_mode = self.config.write_lock_mode();
        let arrive = self.arrive;

        if let Some(tranlocal) = self.locate(tref) {
            let result = match tranlocal.mode {
                TranlocalMode::Commuting => tranlocal.flatten(spin_count, arrive, lock_mode),
                _ => tranlocal.ensure_lock(spin_count, lock_mode),
            }
            .map(|_| update(working_copy(tranlocal)));

            return result.map_err(|e| self.fail(e));
        }

        let loaded = tref.load(spin_count, arrive, lock_mode).map_err(|e| self.fail(e))?;
        let mut value = loaded.snapshot.value().clone();

        // the working copy is only handed to `update` once the read has been validated
        let tranlocal = Tranlocal::loaded(tref.clone(), loaded, Some(value.clone()));
        self.attach_and_validate(Box::new(tranlocal))?;

        let result = update(&mut value);
        if let Some(tranlocal) = self.locate(tref) {
            tranlocal.value = Some(value);
        }
        Ok(result)
    }

    pub(crate) fn open_for_construction<T>(&mut self, value: T) -> TxResult<TRef<T>>
    where
        T: TxValue,
    {
        self.ensure_writable("construct")?;

        let tref = TRef::constructed(
            value.clone(),
            self.config.spin_count(),
            self.read_biased_threshold,
            self.conflict_counter.clone(),
        );
        self.attach(Box::new(Tranlocal::constructing(tref.clone(), value)));

        trace!("TX({}): CONSTRUCTED TRef({})", self.config.family_name(), tref.id());
        Ok(tref)
    }

    pub(crate) fn commute<T>(&mut self, tref: &TRef<T>, function: CommuteFn<T>) -> TxResult<()>
    where
        T: TxValue,
    {
        self.ensure_writable("commute")?;

        let spin_count = self.config.spin_count();
        let lock_mode = self.config.write_lock_mode();

        if let Some(tranlocal) = self.locate(tref) {
            if tranlocal.mode == TranlocalMode::Commuting {
                tranlocal.commutes.push(function);
                return Ok(());
            }

            // the value is already known, so the function is applied right away
            let result = tranlocal.ensure_lock(spin_count, lock_mode).map(|_| {
                working_copy(tranlocal);
                tranlocal.value = tranlocal.value.take().map(function);
            });

            return result.map_err(|e| self.fail(e));
        }

        self.attach(Box::new(Tranlocal::commuting(tref.clone(), function)));
        Ok(())
    }

    pub(crate) fn acquire<T>(&mut self, tref: &TRef<T>, lock_mode: LockMode) -> TxResult<()>
    where
        T: TxValue,
    {
        self.ensure_alive("acquire")?;

        let spin_count = self.config.spin_count();
        let lock_mode = lock_mode.max(self.config.read_lock_mode());
        let arrive = self.arrive;

        if let Some(tranlocal) = self.locate(tref) {
            let result = tranlocal.ensure_lock(spin_count, lock_mode);
            return result.map_err(|e| self.fail(e));
        }

        let loaded = tref.load(spin_count, arrive, lock_mode).map_err(|e| self.fail(e))?;
        self.attach_and_validate(Box::new(Tranlocal::loaded(tref.clone(), loaded, None)))
    }

    pub(crate) fn lock_mode_of<T>(&mut self, tref: &TRef<T>) -> LockMode
    where
        T: TxValue,
    {
        if !self.status.is_alive() {
            return LockMode::None;
        }

        self.locate(tref)
            .map(|tranlocal| tranlocal.lock_mode)
            .unwrap_or_default()
    }

    /// Runs the first phase of the commit: the written objects are locked exclusively and the
    /// reads are validated. Afterwards the transaction can only be committed or aborted.
    pub fn prepare(&mut self) -> TxResult<()> {
        match self.status {
            TxStatus::Active => self.prepare_active(),
            TxStatus::Prepared => Ok(()),
            TxStatus::Committed | TxStatus::Aborted => self.ensure_alive("prepare"),
        }
    }

    fn prepare_active(&mut self) -> TxResult<()> {
        let spin_count = self.config.spin_count();
        let dirty_check = self.config.is_dirty_check_enabled();

        let mut conflict = false;
        let mut has_writes = false;
        let mut failure = None;

        for entry in self.journal.iter_mut() {
            match entry.prepare(spin_count, dirty_check) {
                Ok(entry_conflict) => {
                    conflict |= entry_conflict;
                    has_writes |= entry.is_dirty();
                }
                Err(error) => {
                    failure = Some(error);
                    break;
                }
            }
        }

        if let Some(error) = failure {
            debug!("TX({}): LOCKING WRITE SET FAILED", self.config.family_name());
            return Err(self.fail(error));
        }

        if has_writes && !self.config.is_write_skew_allowed() {
            let locked = self
                .journal
                .iter_mut()
                .try_for_each(|entry| entry.lock_for_write_skew(spin_count));

            if let Err(error) = locked {
                debug!("TX({}): LOCKING READ SET FAILED", self.config.family_name());
                return Err(self.fail(error));
            }
        }

        // readers of the locked objects have to see the conflict before anybody validates
        // against the locks taken above
        if conflict {
            self.signal_conflict();
        }

        if has_writes && !self.is_read_consistent() {
            debug!("TX({}): VALIDATING READ SET FAILED", self.config.family_name());
            return Err(self.fail(TxError::ReadWriteConflict));
        }

        self.status = TxStatus::Prepared;
        Ok(())
    }

    fn signal_conflict(&mut self) {
        let count = self.conflict_counter.signal_conflict();

        // nobody else signalled since the last validation, the reads are still consistent
        if count == self.local_conflict_count + 1 {
            self.local_conflict_count = count;
        }
        trace!("TX({}): SIGNALLED CONFLICT ({})", self.config.family_name(), count);
    }

    /// Commits the transaction. An active transaction is prepared first.
    ///
    /// Committing a committed transaction does nothing.
    pub fn commit(&mut self) -> TxResult<()> {
        match self.status {
            TxStatus::Committed => return Ok(()),
            TxStatus::Aborted => return self.ensure_alive("commit"),
            TxStatus::Active => self.prepare_active()?,
            TxStatus::Prepared => {}
        }

        let mut listeners = Vec::new();
        for entry in self.journal.iter_mut() {
            if let Some(chain) = entry.commit() {
                listeners.push(chain);
            }
        }

        for entry in self.journal.iter_mut() {
            entry.release_after_reading();
        }

        self.status = TxStatus::Committed;

        for chain in listeners {
            chain.open_all();
        }

        debug!("TX({}): COMMITTED. ATTEMPT ({})", self.config.family_name(), self.attempt);
        Ok(())
    }

    /// Aborts the transaction and releases everything it holds. Aborting an aborted transaction
    /// does nothing, a committed transaction can't be aborted.
    pub fn abort(&mut self) -> TxResult<()> {
        match self.status {
            TxStatus::Aborted => Ok(()),
            TxStatus::Committed => self.ensure_alive("abort"),
            TxStatus::Active | TxStatus::Prepared => {
                self.abort_internal();
                Ok(())
            }
        }
    }

    pub(crate) fn abort_internal(&mut self) {
        if !self.status.is_alive() {
            return;
        }

        for entry in self.journal.iter_mut() {
            entry.release_after_failure();
        }

        self.status = TxStatus::Aborted;
        trace!("TX({}): ABORTED. ATTEMPT ({})", self.config.family_name(), self.attempt);
    }

    /// Blocks the transaction until one of the objects it read changes.
    ///
    /// The transaction registers a listener on every object it read and aborts. The returned
    /// error is meant to be handed back to the retry loop, which waits for the change and starts
    /// the transaction again:
    ///
    /// ```
    /// use stronghold_stm::{atomic, TRef};
    ///
    /// let queue = TRef::new(vec![1u32]);
    /// let item = atomic(|tx| {
    ///     let mut items = queue.read(tx)?;
    ///     match items.pop() {
    ///         Some(item) => {
    ///             queue.write(tx, items)?;
    ///             Ok(item)
    ///         }
    ///         None => Err(tx.retry()),
    ///     }
    /// });
    /// assert_eq!(item, Ok(1));
    /// ```
    pub fn retry(&mut self) -> TxError {
        if let Err(error) = self.ensure_alive("retry") {
            return error;
        }

        if !self.config.is_blocking_allowed() {
            let error = TxError::RetryNotAllowed { family: self.family() };
            return self.fail(error);
        }

        let era = self.retry_latch.reset();
        let mut registered = false;
        for entry in self.journal.iter() {
            if entry.register_change_listener(&self.retry_latch, era) != Registration::None {
                registered = true;
            }
        }

        if !registered {
            let error = TxError::RetryNotPossible { family: self.family() };
            return self.fail(error);
        }

        self.retry_era = era;
        self.awaiting_update = true;
        self.abort_internal();

        debug!("TX({}): RETRY. WAITING FOR AN UPDATE", self.config.family_name());
        TxError::Retry
    }

    /// Waits until one of the objects registered by [`Transaction::retry`] changed, within the
    /// remaining timeout.
    pub fn await_update(&mut self) -> TxResult<()> {
        if !self.awaiting_update {
            let error = TxError::RetryNotPossible { family: self.family() };
            return Err(self.fail(error));
        }
        self.awaiting_update = false;

        match self.remaining_timeout {
            None => {
                self.retry_latch.await_open(self.retry_era);
                Ok(())
            }
            Some(remaining) => match self.retry_latch.try_await(self.retry_era, remaining) {
                Some(left) => {
                    self.remaining_timeout = Some(left);
                    Ok(())
                }
                None => {
                    self.remaining_timeout = Some(Duration::ZERO);
                    debug!("TX({}): RETRY TIMED OUT", self.config.family_name());
                    Err(TxError::RetryTimeout {
                        family: self.family(),
                        timeout: self.config.timeout().unwrap_or_default(),
                    })
                }
            },
        }
    }

    /// Prepares the transaction for the next attempt. Returns `false` if the maximum number of
    /// retries has been reached.
    pub fn soft_reset(&mut self) -> bool {
        if self.attempt >= self.config.max_retries() {
            self.abort_internal();
            return false;
        }

        self.attempt += 1;
        self.reset_state();
        true
    }

    /// Resets the transaction into the state of a new transaction.
    pub fn hard_reset(&mut self) {
        self.attempt = 1;
        self.remaining_timeout = self.config.timeout();
        self.reset_state();
    }

    fn reset_state(&mut self) {
        self.abort_internal();

        let kind = self.speculative.journal_kind();
        if self.journal.kind() == kind {
            self.journal.drain();
        } else {
            self.journal = journal::new_journal(kind, self.config.max_fixed_length());
        }

        self.full_scan = self.speculative.is_full_scan();
        self.arrive = !self.full_scan;
        self.local_conflict_count = self.conflict_counter.count();
        self.awaiting_update = false;
        self.status = TxStatus::Active;
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.abort_internal();
    }
}

fn downcast<T>(entry: &mut BoxedEntry) -> &mut Tranlocal<T>
where
    T: TxValue,
{
    let id = entry.id();
    match entry.as_any_mut().downcast_mut::<Tranlocal<T>>() {
        Some(tranlocal) => tranlocal,
        None => panic!("journal entry of object {} holds a different type", id),
    }
}

fn current_value<T>(tranlocal: &Tranlocal<T>) -> T
where
    T: TxValue,
{
    match tranlocal.current() {
        Some(value) => value.clone(),
        None => panic!("tranlocal of object {} has no value", tranlocal.owner.id()),
    }
}

fn working_copy<T>(tranlocal: &mut Tranlocal<T>) -> &mut T
where
    T: TxValue,
{
    let id = tranlocal.owner.id();
    match tranlocal.upgrade_to_write() {
        Some(value) => value,
        None => panic!("tranlocal of object {} has no value", id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Stm, StmConfig};

    fn stm() -> Stm {
        Stm::new(StmConfig::default())
    }

    #[test]
    fn test_read_your_own_writes() {
        let stm = stm();
        let tref = stm.create(1);

        let mut tx = stm.begin(stm.tx_config());
        assert_eq!(tref.read(&mut tx), Ok(1));
        tref.write(&mut tx, 2).expect("write failed");
        assert_eq!(tref.read(&mut tx), Ok(2));
        assert_eq!(tref.alter(&mut tx, |v| v * 10), Ok(20));

        // nothing is visible before the commit
        assert_eq!(tref.atomic_get(), Ok(1));

        tx.commit().expect("commit failed");
        assert_eq!(tx.status(), TxStatus::Committed);
        assert_eq!(tref.atomic_get(), Ok(20));
        assert_eq!(tref.version(), 1);
        assert_eq!(tref.orec_state().surplus(), 0);
    }

    #[test]
    fn test_abort_releases_arrivals_and_locks() {
        let stm = stm();
        let a = stm.create(1);
        let b = stm.create(2);

        let mut tx = stm.begin(stm.tx_config());
        a.read(&mut tx).expect("read failed");
        b.acquire(&mut tx, LockMode::Exclusive).expect("acquire failed");
        assert_eq!(b.lock_mode(&mut tx), LockMode::Exclusive);
        assert_eq!(a.orec_state().surplus(), 1);

        tx.abort().expect("abort failed");
        tx.abort().expect("abort is idempotent");
        assert_eq!(a.orec_state().surplus(), 0);
        assert_eq!(b.orec_state().lock_mode(), LockMode::None);
        assert_eq!(b.orec_state().surplus(), 0);
        assert_eq!(b.lock_mode(&mut tx), LockMode::None);
    }

    #[test]
    fn test_drop_aborts() {
        let stm = stm();
        let tref = stm.create(1);
        {
            let mut tx = stm.begin(stm.tx_config());
            tref.acquire(&mut tx, LockMode::Write).expect("acquire failed");
            assert_eq!(tref.orec_state().lock_mode(), LockMode::Write);
        }
        assert_eq!(tref.orec_state().lock_mode(), LockMode::None);
    }

    #[test]
    fn test_prepared_transaction_rejects_operations() {
        let stm = stm();
        let tref = stm.create(1);

        let mut tx = stm.begin(stm.tx_config());
        tref.write(&mut tx, 2).expect("write failed");
        tx.prepare().expect("prepare failed");
        assert_eq!(tx.status(), TxStatus::Prepared);
        assert_eq!(tref.orec_state().lock_mode(), LockMode::Exclusive);

        match tref.write(&mut tx, 3) {
            Err(TxError::PreparedTransaction { operation, .. }) => assert_eq!(operation, "write"),
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(tx.status(), TxStatus::Aborted);
        assert_eq!(tref.orec_state().lock_mode(), LockMode::None);
    }

    #[test]
    fn test_prepared_transaction_can_not_retry() {
        let stm = stm();
        let tref = stm.create(1);

        let mut tx = stm.begin(stm.tx_config());
        tref.write(&mut tx, 2).expect("write failed");
        tx.prepare().expect("prepare failed");

        match tx.retry() {
            TxError::PreparedTransaction { operation, .. } => assert_eq!(operation, "retry"),
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(tx.status(), TxStatus::Aborted);
        assert_eq!(tref.orec_state().lock_mode(), LockMode::None);
        assert_eq!(tref.orec_state().surplus(), 0);
    }

    #[test]
    fn test_commit_after_prepare() {
        let stm = stm();
        let tref = stm.create(1);

        let mut tx = stm.begin(stm.tx_config());
        tref.write(&mut tx, 2).expect("write failed");
        tx.prepare().expect("prepare failed");
        tx.commit().expect("commit failed");
        tx.commit().expect("commit is idempotent");

        assert_eq!(tref.atomic_get(), Ok(2));
        match tx.abort() {
            Err(TxError::DeadTransaction { status, .. }) => assert_eq!(status, "committed"),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_construction() {
        let stm = stm();

        let mut tx = stm.begin(stm.tx_config());
        let tref = TRef::construct(&mut tx, 5u32).expect("construction failed");
        assert_eq!(tref.read(&mut tx), Ok(5));
        assert_eq!(tref.orec_state().lock_mode(), LockMode::Exclusive);

        tx.commit().expect("commit failed");
        assert_eq!(tref.version(), 1);
        assert_eq!(tref.atomic_get(), Ok(5));
        assert_eq!(tref.orec_state().lock_mode(), LockMode::None);
    }

    #[test]
    fn test_aborted_construction_stays_locked() {
        let stm = stm();

        let mut tx = stm.begin(stm.tx_config());
        let tref = TRef::construct(&mut tx, 5u32).expect("construction failed");
        tx.abort().expect("abort failed");

        assert_eq!(tref.orec_state().lock_mode(), LockMode::Exclusive);
        assert_eq!(tref.atomic_get(), Err(TxError::LockedConflict(tref.id())));
    }

    #[test]
    fn test_read_lock_mode() {
        let stm = stm();
        let tref = stm.create(1);

        let mut tx = stm.begin(stm.tx_config().with_read_lock_mode(LockMode::Write));
        tref.read(&mut tx).expect("read failed");
        assert_eq!(tref.lock_mode(&mut tx), LockMode::Write);

        // readers are still allowed, writers are not
        assert_eq!(tref.atomic_get(), Ok(1));
        assert_eq!(tref.atomic_set(2), Err(TxError::LockedConflict(tref.id())));

        tx.commit().expect("commit failed");
        assert_eq!(tref.orec_state().lock_mode(), LockMode::None);
        assert_eq!(tref.version(), 0);
    }

    #[test]
    fn test_untracked_reads_leave_no_entries() {
        let stm = stm();
        let tref = stm.create(1);

        let mut tx = stm.begin(stm.tx_config().with_readonly(true).with_track_reads(false));
        assert_eq!(tref.read(&mut tx), Ok(1));
        assert_eq!(tx.journal_len(), 0);
        assert_eq!(tref.orec_state().surplus(), 0);
        assert_eq!(tref.orec_state().readonly_count(), 1);
        tx.commit().expect("commit failed");
    }

    #[test]
    fn test_soft_reset_is_bounded() {
        let stm = stm();
        let mut tx = stm.begin(stm.tx_config().with_max_retries(3));

        assert!(tx.soft_reset());
        assert!(tx.soft_reset());
        assert_eq!(tx.attempt(), 3);
        assert!(!tx.soft_reset());
        assert_eq!(tx.status(), TxStatus::Aborted);

        tx.hard_reset();
        assert_eq!(tx.attempt(), 1);
        assert_eq!(tx.status(), TxStatus::Active);
    }
}
