// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Coalesces duplicate requests and batches distinct keys into single backend calls.
//!
//! This crate provides [`Group`], a dispatcher that fronts an expensive data source
//! (database, RPC) with two complementary disciplines:
//!
//! - **Duplicate suppression**: concurrent callers asking for the same key share a
//!   single in-flight resolution. The backend sees the key once; every caller
//!   observes the same result.
//! - **Batch aggregation**: distinct keys arriving within a short window accumulate
//!   into one batch, resolved by a single backend call that accepts many keys and
//!   returns a map of results.
//!
//! A batch is dispatched on the earlier of two triggers: it fills to the configured
//! capacity, or the window expires after its first key arrived.
//!
//! # When to Use
//!
//! Use a `Group` when the workload has high fan-in, heavy key repetition, and a
//! latency budget that tolerates a few milliseconds of aggregation delay in
//! exchange for far fewer downstream calls:
//!
//! - **Cache fill**: collapse a thundering herd of misses into one multi-get
//! - **Database point reads**: turn N concurrent `SELECT ... WHERE id = ?` into
//!   one `SELECT ... WHERE id IN (...)`
//! - **RPC fan-in**: aggregate lookups from many request handlers into one
//!   upstream batch call
//!
//! # Example
//!
//! ```
//! use std::{collections::HashMap, time::Duration};
//!
//! use multiflight::Group;
//!
//! let group = Group::new(32, Duration::from_millis(5), |keys: &[String]| {
//!     // One backend call for the whole batch.
//!     let mut values = HashMap::new();
//!     for key in keys {
//!         values.insert(key.clone(), format!("row:{key}"));
//!     }
//!     Ok::<_, String>(values)
//! });
//!
//! let flight = group.work("user:123");
//! assert_eq!(flight.value(), Some(&"row:user:123".to_string()));
//! ```
//!
//! # Blocking and Channel APIs
//!
//! [`Group::work`] blocks the calling thread until the key's batch resolves.
//! [`Group::work_channel`] returns immediately with a bounded channel that receives
//! the [`Flight`] once; the send never blocks, so a caller that loses interest can
//! simply drop the receiver.
//!
//! # Panic Safety
//!
//! The resolver is user code and may panic. A panic is captured together with a
//! stack trace, converted into [`ResolveError::Panicked`] for channel waiters, and
//! re-raised both on the dispatch thread and on every blocking waiter, so the
//! failure stays loud instead of stranding waiters.
//!
//! # Thread Safety
//!
//! [`Group`] is `Send` and `Sync`, and `Clone`d handles share the same coordinator
//! state. All bookkeeping runs under a single mutex held for O(batch size) at
//! worst; the resolver itself is always invoked with no locks held.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
#![doc(html_logo_url = "https://media.githubusercontent.com/media/microsoft/multiflight/refs/heads/main/crates/multiflight/logo.png")]
#![doc(html_favicon_url = "https://media.githubusercontent.com/media/microsoft/multiflight/refs/heads/main/crates/multiflight/favicon.ico")]

mod call;
mod dispatch;
mod error;
mod flight;
mod group;

pub use error::{PanicError, ResolveError};
pub use flight::Flight;
pub use group::{DEFAULT_CAPACITY, DEFAULT_WINDOW, Group};
