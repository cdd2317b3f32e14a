// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use crate::{
    config::{SpeculativeConfig, StmConfig, TxConfig},
    conflict::GlobalConflictCounter,
    object::{TRef, TxValue},
    transaction::Transaction,
    TxError, TxResult,
};
use lazy_static::lazy_static;
use log::*;
use std::sync::Arc;

lazy_static! {
    static ref GLOBAL_STM: Stm = Stm::default();
}

#[derive(Debug)]
struct StmInner {
    config: StmConfig,
    conflict_counter: GlobalConflictCounter,
    default_tx_config: Arc<TxConfig>,
    default_speculative: SpeculativeConfig,
}

/// # Stm
///
/// The transactional memory runtime. All objects and transactions of one [`Stm`] share a
/// [`GlobalConflictCounter`]. Cloning an [`Stm`] shares the runtime.
///
/// Objects of different runtimes must not be used in the same transaction.
#[derive(Clone, Debug)]
pub struct Stm {
    inner: Arc<StmInner>,
}

impl Default for Stm {
    fn default() -> Self {
        Self::new(StmConfig::default())
    }
}

impl Stm {
    pub fn new(config: StmConfig) -> Self {
        let default_tx_config = TxConfig::from_stm_config(&config);
        let default_speculative = SpeculativeConfig::new(default_tx_config.is_speculative());

        Self {
            inner: Arc::new(StmInner {
                config,
                conflict_counter: GlobalConflictCounter::default(),
                default_tx_config: Arc::new(default_tx_config),
                default_speculative,
            }),
        }
    }

    /// The process wide runtime used by [`TRef::new`] and [`crate::atomic`].
    pub fn global() -> &'static Stm {
        &GLOBAL_STM
    }

    pub fn config(&self) -> &StmConfig {
        &self.inner.config
    }

    pub fn conflict_counter(&self) -> &GlobalConflictCounter {
        &self.inner.conflict_counter
    }

    /// Returns a transaction configuration with the defaults of this runtime.
    pub fn tx_config(&self) -> TxConfig {
        self.inner.default_tx_config.as_ref().clone()
    }

    /// This will create a new transactional object.
    pub fn create<T>(&self, value: T) -> TRef<T>
    where
        T: TxValue,
    {
        TRef::with_stm(value, self)
    }

    /// Starts a single transaction. The transaction doesn't belong to a family, so nothing
    /// is learned beyond its own attempts.
    pub fn begin(&self, config: TxConfig) -> Transaction {
        self.factory(config).begin()
    }

    /// Creates a transaction family. Transactions of a family share what was learned about
    /// their size and conflict behaviour.
    pub fn factory(&self, config: TxConfig) -> TxFactory {
        TxFactory {
            stm: self.clone(),
            speculative: SpeculativeConfig::new(config.is_speculative()),
            config: Arc::new(config),
        }
    }

    fn default_factory(&self) -> TxFactory {
        TxFactory {
            stm: self.clone(),
            config: self.inner.default_tx_config.clone(),
            speculative: self.inner.default_speculative.clone(),
        }
    }

    /// Runs `program` atomically with the default configuration, retrying it until it commits.
    pub fn atomic<F, R>(&self, program: F) -> TxResult<R>
    where
        F: FnMut(&mut Transaction) -> TxResult<R>,
    {
        self.default_factory().execute(program)
    }

    /// Runs `program` atomically with `config`, retrying it until it commits.
    pub fn atomic_with<F, R>(&self, config: TxConfig, program: F) -> TxResult<R>
    where
        F: FnMut(&mut Transaction) -> TxResult<R>,
    {
        self.factory(config).execute(program)
    }
}

/// A family of transactions sharing one configuration.
#[derive(Clone, Debug)]
pub struct TxFactory {
    stm: Stm,
    config: Arc<TxConfig>,
    speculative: SpeculativeConfig,
}

impl TxFactory {
    pub fn config(&self) -> &TxConfig {
        &self.config
    }

    pub fn speculative_config(&self) -> &SpeculativeConfig {
        &self.speculative
    }

    pub fn begin(&self) -> Transaction {
        Transaction::new(
            self.config.clone(),
            self.speculative.clone(),
            self.stm.conflict_counter().clone(),
            self.stm.config().read_biased_threshold(),
        )
    }

    /// Runs `program` inside a transaction until it commits.
    ///
    /// 1. run `program` with the transaction, then commit it
    /// 2. on a conflict, back off and start the next attempt
    /// 3. on [`TxError::Retry`], block until one of the read objects changed, then start the next
    ///    attempt
    /// 4. any other error aborts the transaction and is returned
    ///
    /// Fails with [`TxError::TooManyRetries`] once the configured maximum of attempts is reached.
    pub fn execute<F, R>(&self, mut program: F) -> TxResult<R>
    where
        F: FnMut(&mut Transaction) -> TxResult<R>,
    {
        let family = self.config.family_name();
        let mut tx = self.begin();

        loop {
            trace!("TX({}): START. ATTEMPT ({})", family, tx.attempt());

            let result = program(&mut tx).and_then(|value| tx.commit().map(|_| value));

            match result {
                Ok(value) => return Ok(value),
                Err(TxError::Retry) => {
                    tx.await_update()?;
                }
                Err(error) if error.is_conflict() => {
                    debug!("TX({}): {}. BACKING OFF", family, error);
                    tx.abort_internal();
                    self.config.backoff().delay(tx.attempt());
                }
                Err(error) => {
                    tx.abort_internal();
                    return Err(error);
                }
            }

            if !tx.soft_reset() {
                warn!("TX({}): GIVING UP AFTER ({}) ATTEMPTS", family, tx.attempt());
                return Err(TxError::TooManyRetries {
                    family: family.to_string(),
                    max_retries: self.config.max_retries(),
                });
            }
        }
    }
}
