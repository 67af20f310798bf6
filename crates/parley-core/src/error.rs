// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use parley_model::{ContentError, OperationCanceled, RequestError};

use crate::conversation::ConversationState;

/// Errors surfaced by conversation operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConversationError {
    /// The operation is not legal in the conversation's current state
    /// (send while busy, clear while streaming, cancel while idle, double
    /// dispose).  Raised synchronously, never retried.
    #[error("cannot {operation} while {state:?}")]
    InvalidState {
        operation: &'static str,
        state: ConversationState,
    },

    /// The active request was cancelled.
    #[error(transparent)]
    Canceled(#[from] OperationCanceled),

    /// The provider request failed (connection, HTTP, or mid-stream).
    #[error(transparent)]
    Request(#[from] RequestError),

    /// A checkpoint operation could not run or produced nothing usable.
    #[error("checkpoint failed: {0}")]
    Checkpoint(String),

    /// Invalid message construction (role/variant mismatch).
    #[error(transparent)]
    Content(#[from] ContentError),

    /// A pluggable strategy broke its contract — a programmer error, never
    /// swallowed.
    #[error("strategy contract violation: {0}")]
    Strategy(String),
}
