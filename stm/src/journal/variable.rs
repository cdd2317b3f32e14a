// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use super::{BoxedEntry, Journal, JournalKind};

const MIN_CAPACITY: usize = 16;

/// An open addressing table keyed by object id with linear probing. The table doubles when it
/// is filled to three quarters. Entries are never removed individually.
pub(crate) struct VariableJournal {
    slots: Vec<Option<BoxedEntry>>,
    len: usize,
}

impl Default for VariableJournal {
    fn default() -> Self {
        Self::with_capacity(MIN_CAPACITY)
    }
}

impl VariableJournal {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(MIN_CAPACITY).next_power_of_two();
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            len: 0,
        }
    }

    #[inline]
    fn home(&self, id: u64) -> usize {
        // fibonacci hashing spreads the sequential ids over the table
        (id.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32) as usize & (self.slots.len() - 1)
    }

    fn index_of(&self, id: u64) -> Option<usize> {
        let mask = self.slots.len() - 1;
        let mut index = self.home(id);
        loop {
            match &self.slots[index] {
                None => return None,
                Some(entry) if entry.id() == id => return Some(index),
                Some(_) => index = (index + 1) & mask,
            }
        }
    }

    fn insert(&mut self, entry: BoxedEntry) {
        let mask = self.slots.len() - 1;
        let mut index = self.home(entry.id());
        while self.slots[index].is_some() {
            index = (index + 1) & mask;
        }
        self.slots[index] = Some(entry);
        self.len += 1;
    }

    fn expand(&mut self) {
        let capacity = self.slots.len() * 2;
        let previous = std::mem::replace(&mut self.slots, (0..capacity).map(|_| None).collect());
        self.len = 0;
        for entry in previous.into_iter().flatten() {
            self.insert(entry);
        }
    }
}

impl Journal for VariableJournal {
    fn kind(&self) -> JournalKind {
        JournalKind::Variable
    }

    fn locate(&mut self, id: u64) -> Option<&mut BoxedEntry> {
        let index = self.index_of(id)?;
        self.slots[index].as_mut()
    }

    fn attach(&mut self, entry: BoxedEntry) -> Result<(), BoxedEntry> {
        if (self.len + 1) * 4 > self.slots.len() * 3 {
            self.expand();
        }
        self.insert(entry);
        Ok(())
    }

    fn len(&self) -> usize {
        self.len
    }

    fn capacity(&self) -> usize {
        usize::MAX
    }

    fn iter<'a>(&'a self) -> Box<dyn Iterator<Item = &'a BoxedEntry> + 'a> {
        Box::new(self.slots.iter().flatten())
    }

    fn iter_mut<'a>(&'a mut self) -> Box<dyn Iterator<Item = &'a mut BoxedEntry> + 'a> {
        Box::new(self.slots.iter_mut().flatten())
    }

    fn drain(&mut self) -> Vec<BoxedEntry> {
        self.len = 0;
        self.slots.iter_mut().filter_map(Option::take).collect()
    }
}
