// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::content::{Content, Role};
use crate::request::{RequestError, StopReason, Usage};

/// Message-level metadata announced when streaming begins.
#[derive(Debug, Clone)]
pub struct MessageStart {
    pub role: Role,
    /// Provider adornments for the message as a whole.
    pub extended: Map<String, Value>,
}

impl MessageStart {
    pub fn assistant() -> Self {
        Self {
            role: Role::Assistant,
            extended: Map::new(),
        }
    }
}

/// Incremental message-level metadata.  Merged into the accumulated
/// metadata with [`crate::merge::deep_merge`] semantics.
#[derive(Debug, Clone, Default)]
pub struct MessageDelta {
    pub extended: Map<String, Value>,
}

/// A monotonic accumulation step for one in-progress content block.
///
/// - text appends
/// - thinking (and its signature) accrete
/// - tool params accrete as partial JSON and parse on completion
/// - raw data appends
#[derive(Debug, Clone)]
pub enum ContentDelta {
    Text {
        text: String,
    },
    Thinking {
        thought: String,
        signature: Option<String>,
    },
    ToolParams {
        partial_json: String,
    },
    Raw {
        data: String,
    },
}

/// Terminal event for a successful stream.
#[derive(Debug, Clone)]
pub struct StreamEnd {
    pub stop_reason: StopReason,
    pub usage: Option<Usage>,
}

/// The full normalized event stream a provider can emit for one request.
///
/// Providers must serialize events (no concurrent emission) and stop
/// emitting after `CompleteMessage`, `Error`, or `Cancelled`.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Pre-wire observability: the request is about to be sent.
    BeforeRequest(Value),
    /// The raw request body as the provider serialized it.
    RequestRaw(Value),
    StartMessage(MessageStart),
    UpdateMessage(MessageDelta),
    /// A new content block at `index`, possibly pre-populated (a tool block
    /// arrives with its id and name before any params stream in).
    StartContent { index: usize, content: Content },
    UpdateContent { index: usize, delta: ContentDelta },
    /// The complete canonical block for `index`.  Overrides anything
    /// accumulated from deltas.
    CompleteContent { index: usize, content: Content },
    CompleteMessage(StreamEnd),
    /// A raw wire chunk, for observability only.
    StreamRaw(String),
    /// The provider's final raw response payload, if it has one.
    ResponseRaw(Value),
    Error(RequestError),
    Cancelled,
}

impl StreamEvent {
    /// Whether this event ends the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamEvent::CompleteMessage(_) | StreamEvent::Error(_) | StreamEvent::Cancelled
        )
    }
}

/// The sink a provider drives while streaming one response.
///
/// One method per normalized operation; the raw observability hooks default
/// to no-ops so simple providers only implement the content path.
#[async_trait]
pub trait StreamReceiver: Send + Sync {
    async fn before_request(&self, _raw: Value) {}
    async fn request_raw(&self, _raw: Value) {}
    async fn start_message(&self, evt: MessageStart);
    async fn update_message(&self, evt: MessageDelta);
    async fn start_content(&self, index: usize, content: Content);
    async fn update_content(&self, index: usize, delta: ContentDelta);
    async fn complete_content(&self, index: usize, content: Content);
    async fn complete_message(&self, evt: StreamEnd);
    async fn stream_raw(&self, _chunk: String) {}
    async fn response_raw(&self, _raw: Value) {}
    async fn error(&self, err: RequestError);
    async fn cancel(&self);
}
