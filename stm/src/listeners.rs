// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Lock free chain of latches waiting for an object to change.
//!
//! Transactions push themselves on the chain with a compare-and-swap; the committing transaction
//! detaches the whole chain in one swap and opens every latch after it released its locks.

use crate::latch::Latch;
use std::{
    ptr,
    sync::{
        atomic::{AtomicPtr, AtomicUsize, Ordering},
        Arc,
    },
};

/// Chains that grow to this length are swept for listeners of passed eras.
const SWEEP_LENGTH: usize = 64;

struct ListenerNode {
    latch: Arc<Latch>,
    era: u64,
    next: *mut ListenerNode,
}

#[derive(Debug)]
pub struct ListenerChain {
    head: AtomicPtr<ListenerNode>,

    /// Approximate number of linked nodes
    len: AtomicUsize,
    sweep_at: AtomicUsize,
}

// SAFETY: nodes are only reachable through the atomic head until they are detached, after which
// a single owner frees them.
unsafe impl Send for ListenerChain {}
unsafe impl Sync for ListenerChain {}

impl Default for ListenerChain {
    fn default() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            len: AtomicUsize::new(0),
            sweep_at: AtomicUsize::new(SWEEP_LENGTH),
        }
    }
}

impl ListenerChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::SeqCst).is_null()
    }

    /// Links a latch that should be opened for `era` at the next change.
    ///
    /// A chain that got long is swept first: listeners whose latch moved on to another era are
    /// dropped, the others are linked again. A change published during the sweep may miss the
    /// relinked listeners, so callers must check the object for changes after pushing.
    pub fn push(&self, latch: Arc<Latch>, era: u64) {
        if self.len.load(Ordering::SeqCst) >= self.sweep_at.load(Ordering::SeqCst) {
            self.sweep();
        }

        let node = Box::into_raw(Box::new(ListenerNode {
            latch,
            era,
            next: ptr::null_mut(),
        }));
        self.link(node);
    }

    fn link(&self, node: *mut ListenerNode) {
        let mut head = self.head.load(Ordering::SeqCst);
        loop {
            // SAFETY: the node is not published yet, we are its only owner
            unsafe { (*node).next = head };

            match self
                .head
                .compare_exchange(head, node, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }
        self.len.fetch_add(1, Ordering::SeqCst);
    }

    fn sweep(&self) {
        let mut detached = self.take_all();
        let mut node = std::mem::replace(&mut detached.head, ptr::null_mut());
        let mut live = 0;

        while !node.is_null() {
            // SAFETY: the chain was detached by `take_all`, every node is visited exactly once
            let next = unsafe { (*node).next };
            let waiting = unsafe { (*node).latch.is_waiting_for((*node).era) };

            if waiting {
                self.link(node);
                live += 1;
            } else {
                // SAFETY: see above, the node is not linked anymore
                drop(unsafe { Box::from_raw(node) });
            }
            node = next;
        }

        self.sweep_at.store((live * 2).max(SWEEP_LENGTH), Ordering::SeqCst);
    }

    /// Detaches all listeners.
    pub fn take_all(&self) -> Listeners {
        let head = self.head.swap(ptr::null_mut(), Ordering::SeqCst);
        self.len.store(0, Ordering::SeqCst);
        self.sweep_at.store(SWEEP_LENGTH, Ordering::SeqCst);

        Listeners { head }
    }
}

impl Drop for ListenerChain {
    fn drop(&mut self) {
        drop(self.take_all());
    }
}

/// An owned, detached chain of listeners.
#[derive(Debug)]
pub struct Listeners {
    head: *mut ListenerNode,
}

// SAFETY: the detached chain is exclusively owned.
unsafe impl Send for Listeners {}

impl Listeners {
    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    pub fn len(&self) -> usize {
        let mut count = 0;
        let mut node = self.head;
        while !node.is_null() {
            count += 1;
            // SAFETY: owned chain, see `Drop`
            node = unsafe { (*node).next };
        }
        count
    }

    /// Opens every latch of the chain for the era it was registered with.
    pub fn open_all(mut self) {
        let mut node = std::mem::replace(&mut self.head, ptr::null_mut());
        while !node.is_null() {
            // SAFETY: the chain was detached by `take_all`, every node is visited exactly once
            let boxed = unsafe { Box::from_raw(node) };
            boxed.latch.open(boxed.era);
            node = boxed.next;
        }
    }
}

impl Drop for Listeners {
    fn drop(&mut self) {
        let mut node = self.head;
        while !node.is_null() {
            // SAFETY: see `open_all`
            let boxed = unsafe { Box::from_raw(node) };
            node = boxed.next;
        }
    }
}
