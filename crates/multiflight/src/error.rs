// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Error types surfaced to waiters.

use std::{any::Any, backtrace::Backtrace};

use thiserror::Error;

/// A panic recovered from the resolver, with the stack captured at the point
/// the panic was classified.
#[derive(Debug, Clone, Error)]
#[error("{payload}\n\n{backtrace}")]
pub struct PanicError {
    payload: String,
    backtrace: String,
}

impl PanicError {
    pub(crate) fn from_payload(payload: &(dyn Any + Send)) -> Self {
        let rendered = if let Some(message) = payload.downcast_ref::<&str>() {
            (*message).to_owned()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "opaque panic payload".to_owned()
        };

        // The first line of the capture points at the capture machinery
        // rather than the resolver; trim it out.
        let stack = Backtrace::force_capture().to_string();
        let stack = match stack.split_once('\n') {
            Some((_, rest)) => rest.to_owned(),
            None => stack,
        };

        Self {
            payload: rendered,
            backtrace: stack,
        }
    }

    /// The rendered panic payload.
    #[must_use]
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// The stack captured when the panic was recovered.
    #[must_use]
    pub fn backtrace(&self) -> &str {
        &self.backtrace
    }
}

/// Why a key failed to resolve.
///
/// A resolver failure is batch-wide: every key that was in the batch observes
/// the same error.
#[derive(Debug, Clone, Error)]
pub enum ResolveError<E> {
    /// The resolver returned an error for the whole batch.
    #[error("resolver failed: {0}")]
    Resolver(E),

    /// The resolver panicked while the batch was in flight.
    #[error("resolver panicked: {0}")]
    Panicked(PanicError),

    /// The resolver tore down its dispatch thread without returning.
    #[error("resolver terminated its dispatch thread")]
    Exited,
}
