// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use super::{BoxedEntry, Journal, JournalKind};

/// A bounded array of entries. A located entry is moved to the front, so objects that are used
/// repeatedly are found after a short scan.
pub(crate) struct FixedJournal {
    entries: Vec<BoxedEntry>,
    max_length: usize,
}

impl FixedJournal {
    pub fn new(max_length: usize) -> Self {
        let max_length = max_length.max(1);
        Self {
            entries: Vec::with_capacity(max_length),
            max_length,
        }
    }
}

impl Journal for FixedJournal {
    fn kind(&self) -> JournalKind {
        JournalKind::Fixed
    }

    fn locate(&mut self, id: u64) -> Option<&mut BoxedEntry> {
        let index = self.entries.iter().position(|entry| entry.id() == id)?;
        self.entries[..=index].rotate_right(1);
        self.entries.first_mut()
    }

    fn attach(&mut self, entry: BoxedEntry) -> Result<(), BoxedEntry> {
        if self.entries.len() >= self.max_length {
            return Err(entry);
        }
        self.entries.push(entry);
        Ok(())
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn capacity(&self) -> usize {
        self.max_length
    }

    fn iter<'a>(&'a self) -> Box<dyn Iterator<Item = &'a BoxedEntry> + 'a> {
        Box::new(self.entries.iter())
    }

    fn iter_mut<'a>(&'a mut self) -> Box<dyn Iterator<Item = &'a mut BoxedEntry> + 'a> {
        Box::new(self.entries.iter_mut())
    }

    fn drain(&mut self) -> Vec<BoxedEntry> {
        std::mem::take(&mut self.entries)
    }
}
