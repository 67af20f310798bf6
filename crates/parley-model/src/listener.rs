// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use crate::content::Content;
use crate::receiver::{
    ContentDelta, MessageDelta, MessageStart, StreamEnd, StreamEvent, StreamReceiver,
};
use crate::request::RequestError;

/// Adapts the [`StreamReceiver`] operation surface into a single serialized
/// event stream the conversation consumes.
///
/// Cheap to clone (all attempts of one request share the same channel and
/// terminal latch).  Once a terminal event passes through, further events
/// are dropped; a consumer that went away turns the next event into an
/// `Error` — unless that event already was one, which would loop.
#[derive(Clone)]
pub struct StreamListener {
    tx: mpsc::UnboundedSender<StreamEvent>,
    done: Arc<AtomicBool>,
}

/// Create a connected listener/stream pair for one request.
pub fn stream_channel() -> (StreamListener, mpsc::UnboundedReceiver<StreamEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        StreamListener {
            tx,
            done: Arc::new(AtomicBool::new(false)),
        },
        rx,
    )
}

impl StreamListener {
    fn push(&self, event: StreamEvent) {
        if self.done.load(Ordering::SeqCst) {
            warn!(event = ?event_name(&event), "stream event after terminal event dropped");
            return;
        }
        let terminal = event.is_terminal();
        let was_error = matches!(event, StreamEvent::Error(_));
        if self.tx.send(event).is_err() {
            // The consumer dropped its end.  Route the failure through
            // `error` exactly once; if the failed event itself was an error
            // there is nobody left to tell.
            self.done.store(true, Ordering::SeqCst);
            if !was_error {
                let _ = self.tx.send(StreamEvent::Error(RequestError::stream(
                    "stream consumer dropped",
                )));
            }
            return;
        }
        if terminal {
            self.done.store(true, Ordering::SeqCst);
        }
    }

    /// Whether a terminal event has already been delivered.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamReceiver for StreamListener {
    async fn before_request(&self, raw: Value) {
        self.push(StreamEvent::BeforeRequest(raw));
    }

    async fn request_raw(&self, raw: Value) {
        self.push(StreamEvent::RequestRaw(raw));
    }

    async fn start_message(&self, evt: MessageStart) {
        self.push(StreamEvent::StartMessage(evt));
    }

    async fn update_message(&self, evt: MessageDelta) {
        self.push(StreamEvent::UpdateMessage(evt));
    }

    async fn start_content(&self, index: usize, content: Content) {
        self.push(StreamEvent::StartContent { index, content });
    }

    async fn update_content(&self, index: usize, delta: ContentDelta) {
        self.push(StreamEvent::UpdateContent { index, delta });
    }

    async fn complete_content(&self, index: usize, content: Content) {
        self.push(StreamEvent::CompleteContent { index, content });
    }

    async fn complete_message(&self, evt: StreamEnd) {
        self.push(StreamEvent::CompleteMessage(evt));
    }

    async fn stream_raw(&self, chunk: String) {
        self.push(StreamEvent::StreamRaw(chunk));
    }

    async fn response_raw(&self, raw: Value) {
        self.push(StreamEvent::ResponseRaw(raw));
    }

    async fn error(&self, err: RequestError) {
        self.push(StreamEvent::Error(err));
    }

    async fn cancel(&self) {
        self.push(StreamEvent::Cancelled);
    }
}

fn event_name(event: &StreamEvent) -> &'static str {
    match event {
        StreamEvent::BeforeRequest(_) => "before_request",
        StreamEvent::RequestRaw(_) => "request_raw",
        StreamEvent::StartMessage(_) => "start_message",
        StreamEvent::UpdateMessage(_) => "update_message",
        StreamEvent::StartContent { .. } => "start_content",
        StreamEvent::UpdateContent { .. } => "update_content",
        StreamEvent::CompleteContent { .. } => "complete_content",
        StreamEvent::CompleteMessage(_) => "complete_message",
        StreamEvent::StreamRaw(_) => "stream_raw",
        StreamEvent::ResponseRaw(_) => "response_raw",
        StreamEvent::Error(_) => "error",
        StreamEvent::Cancelled => "cancel",
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
