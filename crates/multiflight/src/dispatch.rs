// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Batch dispatch: idempotent commit, resolver invocation, result fan-out.

use std::{
    collections::HashMap,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use tracing::{debug, error};

use crate::{
    call::{Call, Settled},
    error::{PanicError, ResolveError},
    flight::Flight,
    group::Inner,
};

/// How the resolver's invocation ended.
pub(crate) enum BatchOutcome<V, E> {
    /// The resolver returned a result map or a batch-wide error.
    Resolved(Result<HashMap<String, V>, E>),
    /// The resolver panicked; the value and stack were captured.
    Panicked(PanicError),
    /// The resolver unwound its thread without a panic value.
    Exited,
}

/// Releases every waiter of a batch even when the resolver never hands
/// control back: dropped without [`CompletionGuard::settle`], it classifies
/// the exit as abnormal. Forced unwinds pass straight through
/// `catch_unwind`, and this guard is what keeps waiters from hanging when
/// one does.
pub(crate) struct CompletionGuard<'a, V, E, F>
where
    V: Clone,
    E: Clone,
{
    inner: &'a Inner<V, E, F>,
    keys: Option<Arc<[String]>>,
}

impl<'a, V, E, F> CompletionGuard<'a, V, E, F>
where
    V: Clone,
    E: Clone,
{
    pub(crate) fn new(inner: &'a Inner<V, E, F>, keys: Arc<[String]>) -> Self {
        Self {
            inner,
            keys: Some(keys),
        }
    }

    /// Records the classified outcome and releases the batch's waiters.
    pub(crate) fn settle(mut self, outcome: &BatchOutcome<V, E>) {
        if let Some(keys) = self.keys.take() {
            self.inner.settle_batch(&keys, outcome);
        }
    }
}

impl<V, E, F> Drop for CompletionGuard<'_, V, E, F>
where
    V: Clone,
    E: Clone,
{
    fn drop(&mut self) {
        if let Some(keys) = self.keys.take() {
            error!(keys = keys.len(), "resolver terminated its dispatch thread");
            self.inner.settle_batch(&keys, &BatchOutcome::Exited);
        }
    }
}

impl<V, E, F> Inner<V, E, F>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
    F: Fn(&[String]) -> Result<HashMap<String, V>, E> + Send + Sync + 'static,
{
    /// Dispatches a batch at most once.
    ///
    /// The first of the size and window triggers to arrive removes the batch
    /// from the pool; the loser observes an absent id and returns.
    pub(crate) fn commit(&self, batch: u64) {
        let keys = self.state.lock().pool.remove(&batch);
        let Some(keys) = keys else {
            return;
        };
        debug!(batch, keys = keys.len(), "dispatching batch");
        self.dispatch(keys);
    }

    /// Invokes the resolver on a batch it now exclusively owns and fans the
    /// results back out.
    fn dispatch(&self, keys: Vec<String>) {
        let keys: Arc<[String]> = keys.into();
        let guard = CompletionGuard::new(self, Arc::clone(&keys));

        match panic::catch_unwind(AssertUnwindSafe(|| (self.resolver)(&keys))) {
            Ok(resolved) => guard.settle(&BatchOutcome::Resolved(resolved)),
            Err(payload) => {
                let err = PanicError::from_payload(payload.as_ref());
                error!(panic = %err.payload(), "resolver panicked");
                guard.settle(&BatchOutcome::Panicked(err.clone()));
                // Every waiter has its result; re-raise so the crash stays
                // visible on the dispatch context as well. For a synchronous
                // size-triggered commit that context is the filling caller,
                // otherwise the timer or spawned commit thread.
                panic::panic_any(err);
            }
        }
    }
}

impl<V, E, F> Inner<V, E, F>
where
    V: Clone,
    E: Clone,
{
    /// Populates every call of the batch, releases the latches, then retires
    /// the index entries and performs the channel fan-out in one critical
    /// section, so a late channel caller either joins the sends or opens a
    /// new call.
    fn settle_batch(&self, keys: &[String], outcome: &BatchOutcome<V, E>) {
        let calls: Vec<(&String, Arc<Call<V, E>>)> = {
            let state = self.state.lock();
            keys.iter()
                .filter_map(|key| state.calls.get(key).map(|call| (key, Arc::clone(call))))
                .collect()
        };

        for (key, call) in &calls {
            let settled: Settled<V, E> = match outcome {
                BatchOutcome::Resolved(Ok(values)) => Ok(values.get(*key).cloned()),
                BatchOutcome::Resolved(Err(err)) => Err(ResolveError::Resolver(err.clone())),
                BatchOutcome::Panicked(err) => Err(ResolveError::Panicked(err.clone())),
                BatchOutcome::Exited => Err(ResolveError::Exited),
            };
            call.settle(settled);
        }

        for (_, call) in &calls {
            call.release();
        }

        let mut state = self.state.lock();
        for (key, call) in &calls {
            state.calls.remove(*key);

            if matches!(outcome, BatchOutcome::Exited) {
                // Blocking waiters unwind on their own threads; channel
                // waiters observe the dropped senders as disconnection.
                continue;
            }

            let waiters = call.waiters().lock();
            let shared = waiters.dups > 0;
            for sender in &waiters.senders {
                if let Some(settled) = call.get() {
                    let _ = sender.send(Flight {
                        outcome: settled.clone(),
                        shared,
                    });
                }
            }
        }
    }
}
