// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use super::{BoxedEntry, Journal, JournalKind};

#[derive(Default)]
pub(crate) struct MonoJournal {
    slot: Option<BoxedEntry>,
}

impl Journal for MonoJournal {
    fn kind(&self) -> JournalKind {
        JournalKind::Mono
    }

    fn locate(&mut self, id: u64) -> Option<&mut BoxedEntry> {
        self.slot.as_mut().filter(|entry| entry.id() == id)
    }

    fn attach(&mut self, entry: BoxedEntry) -> Result<(), BoxedEntry> {
        match self.slot {
            Some(_) => Err(entry),
            None => {
                self.slot = Some(entry);
                Ok(())
            }
        }
    }

    fn len(&self) -> usize {
        self.slot.is_some() as usize
    }

    fn capacity(&self) -> usize {
        1
    }

    fn iter<'a>(&'a self) -> Box<dyn Iterator<Item = &'a BoxedEntry> + 'a> {
        Box::new(self.slot.iter())
    }

    fn iter_mut<'a>(&'a mut self) -> Box<dyn Iterator<Item = &'a mut BoxedEntry> + 'a> {
        Box::new(self.slot.iter_mut())
    }

    fn drain(&mut self) -> Vec<BoxedEntry> {
        self.slot.take().into_iter().collect()
    }
}
