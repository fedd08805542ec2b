// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The result envelope delivered to every waiter of a key.

use crate::error::ResolveError;

/// Outcome of a coalesced lookup, as observed by one caller.
#[derive(Debug, Clone)]
pub struct Flight<V, E> {
    /// The key's resolution.
    ///
    /// `Ok(None)` means the resolver completed but produced no entry for this
    /// key ("empty"), which is distinct from the resolver failing.
    pub outcome: Result<Option<V>, ResolveError<E>>,

    /// Whether more than one caller observed this resolution.
    pub shared: bool,
}

impl<V, E> Flight<V, E> {
    /// The resolved value, if any.
    #[must_use]
    pub fn value(&self) -> Option<&V> {
        self.outcome.as_ref().ok().and_then(Option::as_ref)
    }

    /// True when the resolver succeeded but had no entry for this key.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self.outcome, Ok(None))
    }

    /// True when this resolution was observed by more than one caller.
    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.shared
    }
}
