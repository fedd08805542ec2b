// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The coordinator: key index, batch pool, admission, and dispatch triggers.

use std::{
    collections::HashMap,
    fmt::{self, Debug, Formatter},
    panic,
    sync::Arc,
    thread,
    time::Duration,
};

use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;
use tracing::trace;

use crate::{call::Call, error::ResolveError, flight::Flight};

/// Batch capacity used when the requested capacity is below 2.
pub const DEFAULT_CAPACITY: usize = 32;

/// Batch window used when the requested window is one millisecond or less.
pub const DEFAULT_WINDOW: Duration = Duration::from_millis(5);

/// A request-coalescing batch dispatcher.
///
/// A `Group` represents a class of work and forms a namespace in which
/// lookups for the same key are executed with duplicate suppression, and
/// lookups for distinct keys are aggregated into batches resolved by a single
/// call to the resolver.
///
/// The resolver receives a nonempty list of distinct keys and returns either
/// a map of results (keys it omits surface as "empty" to their callers) or an
/// error that fails the whole batch.
///
/// Cloned handles share the same coordinator state.
///
/// # Example
///
/// ```
/// use std::{collections::HashMap, time::Duration};
///
/// use multiflight::Group;
///
/// let group = Group::new(4, Duration::from_millis(5), |keys: &[String]| {
///     Ok::<_, String>(keys.iter().map(|k| (k.clone(), k.len())).collect::<HashMap<_, _>>())
/// });
///
/// let flight = group.work("alpha");
/// assert_eq!(flight.value(), Some(&5));
/// ```
pub struct Group<V, E, F> {
    pub(crate) inner: Arc<Inner<V, E, F>>,
}

impl<V, E, F> Clone for Group<V, E, F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V, E, F> Debug for Group<V, E, F> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Group")
            .field("capacity", &self.inner.capacity)
            .field("window", &self.inner.window)
            .field("pending_keys", &state.calls.len())
            .field("resolver", &"<closure>")
            .finish()
    }
}

pub(crate) struct Inner<V, E, F> {
    pub(crate) state: Mutex<State<V, E>>,
    pub(crate) capacity: usize,
    pub(crate) window: Duration,
    pub(crate) resolver: F,
}

/// Everything guarded by the coordinator mutex.
pub(crate) struct State<V, E> {
    /// Active key to call index (duplicate suppression).
    pub(crate) calls: HashMap<String, Arc<Call<V, E>>>,
    /// Batch id to its ordered key list.
    pub(crate) pool: HashMap<u64, Vec<String>>,
    /// The batch currently accepting keys.
    pub(crate) current: u64,
}

impl<V, E> State<V, E> {
    fn new(capacity: usize) -> Self {
        let mut pool = HashMap::new();
        pool.insert(1, Vec::with_capacity(capacity));
        Self {
            calls: HashMap::new(),
            pool,
            current: 1,
        }
    }

    /// Append a key (guaranteed new to the index) to the current batch.
    ///
    /// Returns the batch to dispatch plus the trigger flags: `first` fires
    /// once per batch on the opening key and arms the window timer, `full`
    /// fires once on the filling key. When the batch fills, the current id
    /// rotates so new arrivals accumulate in a fresh batch while the full
    /// one is dispatched under the old id.
    fn push_key(&mut self, key: String, capacity: usize) -> (u64, bool, bool) {
        let id = self.current;
        let batch = self
            .pool
            .entry(id)
            .or_insert_with(|| Vec::with_capacity(capacity));
        batch.push(key);

        if batch.len() == 1 {
            return (id, false, true);
        }

        if batch.len() == capacity {
            self.current += 1;
            let next = self.current;
            self.pool.insert(next, Vec::with_capacity(capacity));
            return (id, true, false);
        }

        (id, false, false)
    }
}

enum Admission<V, E> {
    /// Attached to an existing in-flight call for the same key.
    Joined(Arc<Call<V, E>>),
    /// Opened a fresh call; the flags mirror [`State::push_key`].
    Opened {
        call: Arc<Call<V, E>>,
        batch: u64,
        full: bool,
        first: bool,
    },
}

impl<V, E, F> Group<V, E, F>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
    F: Fn(&[String]) -> Result<HashMap<String, V>, E> + Send + Sync + 'static,
{
    /// Creates a group with the given batch capacity, batch window, and
    /// resolver.
    ///
    /// A capacity below 2 falls back to [`DEFAULT_CAPACITY`]; a window of one
    /// millisecond or less falls back to [`DEFAULT_WINDOW`].
    #[must_use]
    pub fn new(capacity: usize, window: Duration, resolver: F) -> Self {
        let capacity = if capacity >= 2 {
            capacity
        } else {
            DEFAULT_CAPACITY
        };
        let window = if window > Duration::from_millis(1) {
            window
        } else {
            DEFAULT_WINDOW
        };

        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::new(capacity)),
                capacity,
                window,
                resolver,
            }),
        }
    }

    /// Blocking coalesced lookup.
    ///
    /// Waits until the key's batch is dispatched and resolved, then returns
    /// this key's [`Flight`]. Concurrent callers for the same key share one
    /// resolution and all observe the same outcome.
    ///
    /// # Panics
    ///
    /// Re-raises the resolver's panic on this thread when the batch failed
    /// that way, and unwinds this thread when the resolver tore down its
    /// dispatch thread.
    pub fn work(&self, key: impl Into<String>) -> Flight<V, E> {
        let call = match self.admit(key.into(), None) {
            Admission::Joined(call) => call,
            Admission::Opened {
                call,
                batch,
                full,
                first,
            } => {
                if full {
                    // The filling caller pays for the whole batch's
                    // resolution; callers that cannot afford that use the
                    // channel API.
                    self.inner.commit(batch);
                }
                if first {
                    self.arm_window(batch);
                }
                call
            }
        };

        let settled = call.wait();
        let shared = call.waiters().lock().dups > 0;
        match settled {
            Ok(value) => Flight {
                outcome: Ok(value.clone()),
                shared,
            },
            Err(ResolveError::Panicked(err)) => panic::panic_any(err.clone()),
            Err(ResolveError::Exited) => {
                panic!("batch resolver terminated its dispatch thread")
            }
            Err(err) => Flight {
                outcome: Err(err.clone()),
                shared,
            },
        }
    }

    /// Asynchronous coalesced lookup.
    ///
    /// Returns a receiver that observes exactly one [`Flight`] when the
    /// key's batch resolves. The channel has capacity 1 and the send never
    /// blocks, so dropping the receiver is a safe way to lose interest.
    ///
    /// If the resolver tears down its dispatch thread, nothing is sent and
    /// the receiver reports disconnection once the call is retired.
    pub fn work_channel(&self, key: impl Into<String>) -> Receiver<Flight<V, E>> {
        let (sender, receiver) = bounded(1);
        match self.admit(key.into(), Some(sender)) {
            Admission::Joined(_) => {}
            Admission::Opened {
                batch, full, first, ..
            } => {
                if full {
                    let inner = Arc::clone(&self.inner);
                    thread::spawn(move || inner.commit(batch));
                }
                if first {
                    self.arm_window(batch);
                }
            }
        }
        receiver
    }

    /// Batch capacity in effect after default clamping.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Batch window in effect after default clamping.
    #[must_use]
    pub fn window(&self) -> Duration {
        self.inner.window
    }

    /// Number of keys currently in flight.
    #[must_use]
    pub fn pending_keys(&self) -> usize {
        self.inner.state.lock().calls.len()
    }

    fn admit(&self, key: String, sender: Option<Sender<Flight<V, E>>>) -> Admission<V, E> {
        let mut state = self.inner.state.lock();

        if let Some(call) = state.calls.get(&key) {
            let call = Arc::clone(call);
            let mut waiters = call.waiters().lock();
            waiters.dups += 1;
            if let Some(sender) = sender {
                waiters.senders.push(sender);
            }
            drop(waiters);
            return Admission::Joined(call);
        }

        let call = Arc::new(match sender {
            Some(sender) => Call::with_sender(sender),
            None => Call::new(),
        });
        state.calls.insert(key.clone(), Arc::clone(&call));
        let (batch, full, first) = state.push_key(key, self.inner.capacity);
        trace!(batch, full, first, "admitted key");

        Admission::Opened {
            call,
            batch,
            full,
            first,
        }
    }

    /// Arms the one-shot window timer for a freshly opened batch.
    ///
    /// The timer races the size trigger; commit's idempotence resolves the
    /// race, so a late timer is a no-op.
    fn arm_window(&self, batch: u64) {
        let inner = Arc::clone(&self.inner);
        thread::Builder::new()
            .name("multiflight-timer".to_owned())
            .spawn(move || {
                thread::sleep(inner.window);
                inner.commit(batch);
            })
            .expect("failed to spawn multiflight-timer thread");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_resolver(_keys: &[String]) -> Result<HashMap<String, String>, String> {
        Ok(HashMap::new())
    }

    #[test]
    fn first_key_opens_the_batch() {
        let mut state = State::<String, String>::new(4);
        assert_eq!(state.push_key("a".into(), 4), (1, false, true));
    }

    #[test]
    fn intermediate_keys_just_queue() {
        let mut state = State::<String, String>::new(4);
        state.push_key("a".into(), 4);
        assert_eq!(state.push_key("b".into(), 4), (1, false, false));
        assert_eq!(state.push_key("c".into(), 4), (1, false, false));
    }

    #[test]
    fn filling_key_rotates_the_batch() {
        let mut state = State::<String, String>::new(2);
        state.push_key("a".into(), 2);
        assert_eq!(state.push_key("b".into(), 2), (1, true, false));

        // The full batch keeps its old id; accumulation continues under the
        // next one.
        assert_eq!(state.current, 2);
        assert_eq!(state.push_key("c".into(), 2), (2, false, true));
        assert_eq!(state.pool[&1], vec!["a".to_owned(), "b".to_owned()]);
    }

    #[test]
    fn invalid_parameters_fall_back_to_defaults() {
        let group = Group::new(0, Duration::ZERO, noop_resolver);
        assert_eq!(group.capacity(), DEFAULT_CAPACITY);
        assert_eq!(group.window(), DEFAULT_WINDOW);

        let group = Group::new(1, Duration::from_millis(1), noop_resolver);
        assert_eq!(group.capacity(), DEFAULT_CAPACITY);
        assert_eq!(group.window(), DEFAULT_WINDOW);
    }

    #[test]
    fn valid_parameters_pass_through() {
        let group = Group::new(2, Duration::from_millis(2), noop_resolver);
        assert_eq!(group.capacity(), 2);
        assert_eq!(group.window(), Duration::from_millis(2));
    }

    #[test]
    fn debug_reports_coordinator_state() {
        let group = Group::new(8, Duration::from_millis(20), noop_resolver);
        let rendered = format!("{group:?}");
        assert!(rendered.contains("Group"));
        assert!(rendered.contains("pending_keys: 0"));
    }
}
