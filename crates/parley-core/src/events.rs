// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde_json::{Map, Value};

use parley_model::{CheckpointState, Message, RequestError, StopReason, Usage};

use crate::conversation::ConversationState;

/// Events emitted by a conversation.
///
/// Streaming events are re-emitted with the owning `request_id` and the
/// cumulative assistant message rebuilt so far.  Events from descendants
/// bubble as [`ConversationEvent::ChildEvent`], transitively — a
/// grandchild's completion arrives at the root wrapped twice, with the
/// innermost payload intact.
#[derive(Debug, Clone)]
pub enum ConversationEvent {
    StateChange {
        from: ConversationState,
        to: ConversationState,
    },
    /// A user message is about to be sent.
    PromptSend {
        request_id: String,
        message: Message,
    },
    /// Pre-wire observability passthroughs.
    BeforeRequest {
        request_id: String,
        raw: Value,
    },
    RawRequest {
        request_id: String,
        raw: Value,
    },
    RawStream {
        request_id: String,
        chunk: String,
    },
    RawResponse {
        request_id: String,
        raw: Value,
    },
    /// The provider announced the assistant message.
    StreamStart {
        request_id: String,
    },
    /// Any streaming content progress; `message` is the cumulative
    /// assistant message assembled so far.
    StreamUpdate {
        request_id: String,
        message: Message,
    },
    /// The finalized assistant message was appended to history.  By the
    /// time observers see this, the conversation is already idle again.
    MessageComplete {
        request_id: String,
        message: Message,
        stop_reason: StopReason,
        usage: Option<Usage>,
    },
    /// The policy-wrapped request resolved successfully.
    RequestSuccess {
        request_id: String,
        metadata: Map<String, Value>,
    },
    /// The request failed; the conversation is idle and history unchanged.
    RequestFailed {
        request_id: Option<String>,
        error: RequestError,
    },
    CheckpointBegin,
    CheckpointComplete(CheckpointState),
    CreateChild {
        child_id: String,
    },
    /// An event bubbled up from a child (or deeper descendant).
    ChildEvent {
        child_id: String,
        event: Box<ConversationEvent>,
    },
    /// Infrastructure failure outside the request path.  Reported, never
    /// thrown upward.
    LifecycleError {
        operation: &'static str,
        message: String,
    },
    Dispose {
        conversation_id: String,
    },
}

impl ConversationEvent {
    /// Strip any number of [`ConversationEvent::ChildEvent`] wrappers and
    /// return the innermost event.  Policies and trackers that listen to a
    /// whole conversation tree use this to see descendant activity.
    pub fn innermost(&self) -> &ConversationEvent {
        match self {
            ConversationEvent::ChildEvent { event, .. } => event.innermost(),
            other => other,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
