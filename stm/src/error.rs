// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;
use thiserror::Error as DeriveError;

pub type TxResult<T> = Result<T, TxError>;

/// All outcomes a transaction can fail with.
///
/// The variants fall into three classes:
/// - conflicts ([`TxError::ReadWriteConflict`], [`TxError::LockedConflict`]) are expected under
///   contention and are consumed by the retry loop, which re-runs the transaction body.
/// - [`TxError::Retry`] is the control outcome of [`crate::Transaction::retry`]; the retry loop
///   blocks until one of the read objects changes and runs the body again.
/// - everything else is surfaced to the caller unchanged.
#[derive(Debug, DeriveError, Clone, PartialEq, Eq)]
pub enum TxError {
    #[error("read/write conflict: a value read by the transaction was changed concurrently")]
    ReadWriteConflict,

    #[error("locked conflict: object {0} is locked by another transaction")]
    LockedConflict(u64),

    #[error("explicit retry: waiting for one of the read objects to change")]
    Retry,

    #[error("[{family}] failed to execute {operation}, reason: the transaction is {status}")]
    DeadTransaction {
        family: String,
        operation: &'static str,
        status: &'static str,
    },

    #[error("[{family}] failed to execute {operation}, reason: the transaction is prepared")]
    PreparedTransaction { family: String, operation: &'static str },

    #[error("[{family}] failed to execute {operation}, reason: the transaction is readonly")]
    ReadonlyTransaction { family: String, operation: &'static str },

    #[error("[{family}] failed to execute retry, reason: the transaction doesn't allow blocking")]
    RetryNotAllowed { family: String },

    #[error("[{family}] failed to execute retry, reason: there are no tracked reads to wait for")]
    RetryNotPossible { family: String },

    #[error("[{family}] retry timed out after {timeout:?}")]
    RetryTimeout { family: String, timeout: Duration },

    #[error("[{family}] maximum number of {max_retries} retries has been reached")]
    TooManyRetries { family: String, max_retries: usize },
}

impl TxError {
    /// Returns `true` for failures that are resolved by running the transaction again.
    pub fn is_conflict(&self) -> bool {
        matches!(self, TxError::ReadWriteConflict | TxError::LockedConflict(_))
    }

    /// Returns `true` for failures caused by misuse of the transaction api.
    pub fn is_programmer_error(&self) -> bool {
        matches!(
            self,
            TxError::DeadTransaction { .. }
                | TxError::PreparedTransaction { .. }
                | TxError::ReadonlyTransaction { .. }
                | TxError::RetryNotAllowed { .. }
                | TxError::RetryNotPossible { .. }
        )
    }
}
