// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-key shared state.

use std::sync::OnceLock;

use crossbeam_channel::Sender;
use event_listener::{Event, Listener};
use parking_lot::Mutex;

use crate::{error::ResolveError, flight::Flight};

/// Terminal fields of a call: written exactly once, strictly before the
/// completion latch is released, and read-only afterwards.
pub(crate) type Settled<V, E> = Result<Option<V>, ResolveError<E>>;

/// An in-flight or completed coalesced call for one key.
pub(crate) struct Call<V, E> {
    slot: OnceLock<Settled<V, E>>,
    done: Event,
    waiters: Mutex<Waiters<V, E>>,
}

/// Waiter bookkeeping, mutated only under coordinated locking while the
/// latch is unreleased.
pub(crate) struct Waiters<V, E> {
    /// Callers beyond the first that attached to this call.
    pub(crate) dups: usize,
    /// Result channels handed out by the channel API.
    pub(crate) senders: Vec<Sender<Flight<V, E>>>,
}

impl<V, E> Call<V, E> {
    pub(crate) fn new() -> Self {
        Self {
            slot: OnceLock::new(),
            done: Event::new(),
            waiters: Mutex::new(Waiters {
                dups: 0,
                senders: Vec::new(),
            }),
        }
    }

    pub(crate) fn with_sender(sender: Sender<Flight<V, E>>) -> Self {
        let call = Self::new();
        call.waiters.lock().senders.push(sender);
        call
    }

    pub(crate) fn waiters(&self) -> &Mutex<Waiters<V, E>> {
        &self.waiters
    }

    /// Record the terminal outcome. Dispatch owns the batch exclusively, so
    /// the slot sees exactly one write.
    pub(crate) fn settle(&self, settled: Settled<V, E>) {
        let first_write = self.slot.set(settled).is_ok();
        debug_assert!(first_write, "call settled twice");
    }

    /// Release every waiter parked on the latch.
    pub(crate) fn release(&self) {
        self.done.notify(usize::MAX);
    }

    pub(crate) fn get(&self) -> Option<&Settled<V, E>> {
        self.slot.get()
    }

    /// Block until the call settles.
    ///
    /// The listen / re-check / wait discipline closes the race between a
    /// settle that lands before the listener registers and one that lands
    /// after.
    pub(crate) fn wait(&self) -> &Settled<V, E> {
        loop {
            if let Some(settled) = self.slot.get() {
                return settled;
            }
            let listener = self.done.listen();
            if let Some(settled) = self.slot.get() {
                return settled;
            }
            listener.wait();
        }
    }
}
