// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Journals store the entries of a transaction. Small transactions are the common case, so
//! there are three shapes:
//!
//! - [`MonoJournal`] holds a single entry
//! - [`FixedJournal`] holds a bounded number of entries in an array, scanned linearly
//! - [`VariableJournal`] is an open addressing hash table without an upper bound
//!
//! A transaction starts with the shape its family has learned and migrates to the next larger
//! one when the current shape is full.

mod fixed;
mod mono;
mod variable;

pub(crate) use fixed::FixedJournal;
pub(crate) use mono::MonoJournal;
pub(crate) use variable::VariableJournal;

use crate::tranlocal::Entry;

pub(crate) type BoxedEntry = Box<dyn Entry>;

/// The shape of a journal, ordered by capacity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum JournalKind {
    Mono = 0,
    Fixed = 1,
    Variable = 2,
}

impl JournalKind {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => JournalKind::Mono,
            1 => JournalKind::Fixed,
            _ => JournalKind::Variable,
        }
    }
}

pub(crate) trait Journal: Send {
    fn kind(&self) -> JournalKind;

    /// Finds the entry of the object with `id`.
    fn locate(&mut self, id: u64) -> Option<&mut BoxedEntry>;

    /// Adds an entry for an object that is not part of the journal. A full journal hands the
    /// entry back.
    fn attach(&mut self, entry: BoxedEntry) -> Result<(), BoxedEntry>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn capacity(&self) -> usize;

    fn iter<'a>(&'a self) -> Box<dyn Iterator<Item = &'a BoxedEntry> + 'a>;

    fn iter_mut<'a>(&'a mut self) -> Box<dyn Iterator<Item = &'a mut BoxedEntry> + 'a>;

    /// Removes all entries.
    fn drain(&mut self) -> Vec<BoxedEntry>;
}

/// Creates an empty journal of the given shape.
pub(crate) fn new_journal(kind: JournalKind, max_fixed_length: usize) -> Box<dyn Journal> {
    match kind {
        JournalKind::Mono => Box::new(MonoJournal::default()),
        JournalKind::Fixed => Box::new(FixedJournal::new(max_fixed_length)),
        JournalKind::Variable => Box::new(VariableJournal::default()),
    }
}

/// Moves all entries of `journal` into the next larger shape, which can hold at least one more
/// entry.
pub(crate) fn grow(journal: &mut Box<dyn Journal>, max_fixed_length: usize) {
    let next: Box<dyn Journal> = match journal.kind() {
        JournalKind::Mono if max_fixed_length > 1 => Box::new(FixedJournal::new(max_fixed_length)),
        _ => Box::new(VariableJournal::with_capacity(journal.len() * 2)),
    };

    let previous = std::mem::replace(journal, next);
    migrate(previous, journal.as_mut());
}

fn migrate(mut from: Box<dyn Journal>, to: &mut dyn Journal) {
    for entry in from.drain() {
        if to.attach(entry).is_err() {
            panic!("journal of kind {:?} is too small for the migration", to.kind());
        }
    }
}
