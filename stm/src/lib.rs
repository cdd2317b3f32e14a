// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Stronghold Ownership Record Software Transactional Memory
//!
//! A software transactional memory for OS threads. Shared values live in [`TRef`]s and are read
//! and written inside [`Transaction`]s, which either commit all their changes at once or none of
//! them.
//!
//! Every object carries an ownership record (orec) packed into a single atomic word. Readers
//! arrive on the orec while they depend on a value, and an update that overwrites a value other
//! transactions arrived on bumps the [`GlobalConflictCounter`]. As long as that counter does not
//! move, a transaction knows its reads are still valid without looking at them again.
//!
//! Transactions are driven by a retry loop: conflicting transactions are restarted with an
//! exponential backoff, and a transaction calling [`Transaction::retry`] sleeps until one of the
//! objects it read has changed.
//!
//! ```
//! use stronghold_stm::{atomic, TRef, TxError};
//!
//! let from = TRef::new(100i64);
//! let to = TRef::new(0i64);
//!
//! atomic(|tx| {
//!     let amount = 30;
//!     if from.read(tx)? < amount {
//!         return Err(tx.retry());
//!     }
//!     from.alter(tx, |balance| balance - amount)?;
//!     to.alter(tx, |balance| balance + amount)?;
//!     Ok(())
//! })
//! .expect("transfer failed");
//!
//! assert_eq!(from.atomic_get(), Ok(70));
//! assert_eq!(to.atomic_get(), Ok(30));
//! ```

pub mod backoff;
pub mod config;
pub mod conflict;
pub mod error;
pub mod latch;
pub mod orec;

mod journal;
mod listeners;
mod object;
mod stm;
mod tranlocal;
mod transaction;

pub use crate::stm::{Stm, TxFactory};
pub use backoff::ExponentialBackoff;
pub use config::{SpeculativeConfig, StmConfig, TxConfig};
pub use conflict::GlobalConflictCounter;
pub use error::{TxError, TxResult};
pub use journal::JournalKind;
pub use object::{Registration, Snapshot, TRef, TxValue};
pub use orec::{LockMode, OrecState};
pub use transaction::{Transaction, TxStatus};

/// Runs `program` atomically on the global [`Stm`], retrying it until it commits.
pub fn atomic<F, R>(program: F) -> TxResult<R>
where
    F: FnMut(&mut Transaction) -> TxResult<R>,
{
    Stm::global().atomic(program)
}
