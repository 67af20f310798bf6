// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Map;

use crate::cancel::CancellationToken;
use crate::content::{Content, Role};
use crate::listener::StreamListener;
use crate::provider::ModelProvider;
use crate::receiver::{ContentDelta, MessageStart, StreamEnd, StreamEvent, StreamReceiver};
use crate::request::{ModelRequest, RequestError, StopReason, Usage};

/// One pre-programmed provider turn.
#[derive(Debug, Clone)]
pub enum Script {
    /// Connection succeeds; these events stream through the receiver.
    Events(Vec<StreamEvent>),
    /// Connection itself fails — `execute_request` returns this error and
    /// nothing streams.  This is what execution policies can retry.
    ConnectError(RequestError),
}

/// Deterministic mock provider for tests.  Echoes the last user message
/// back as the assistant response.
#[derive(Default, Clone)]
pub struct MockProvider;

#[async_trait]
impl ModelProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "mock-model"
    }

    async fn execute_request(
        &self,
        request: ModelRequest,
        receiver: StreamListener,
        token: CancellationToken,
    ) -> Result<(), RequestError> {
        let reply = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.text())
            .unwrap_or_else(|| "[no input]".into());
        let events = text_events(&format!("MOCK: {reply}"));
        tokio::spawn(async move { drive(&receiver, events, &token).await });
        Ok(())
    }

    fn clone_provider(&self) -> Arc<dyn ModelProvider> {
        Arc::new(self.clone())
    }
}

/// A pre-scripted provider.  Each call pops the next [`Script`] from the
/// front of the queue, so tests can specify exact event sequences —
/// including tool calls and connection failures — without network access.
#[derive(Clone)]
pub struct ScriptedProvider {
    scripts: Arc<Mutex<Vec<Script>>>,
    /// Every `ModelRequest` seen, in call order, so tests can inspect what
    /// was actually sent (e.g. transformer output).
    pub requests: Arc<Mutex<Vec<ModelRequest>>>,
}

impl ScriptedProvider {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Provider that replies to every call with a single text message.
    pub fn always_text(reply: impl Into<String>) -> Self {
        let reply = reply.into();
        Self::new(vec![Script::Events(text_events(&reply))])
    }

    /// Provider that first requests one tool call, then answers with text
    /// once the result comes back.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        params_json: &str,
        final_text: impl Into<String>,
    ) -> Self {
        let tool_id: String = tool_id.into();
        let tool_name: String = tool_name.into();
        let final_text: String = final_text.into();
        Self::new(vec![
            Script::Events(tool_call_events(&[(&tool_id, &tool_name, params_json)])),
            Script::Events(text_events(&final_text)),
        ])
    }

    /// Provider that fails connection `failures` times, then replies with text.
    pub fn flaky(failures: usize, error: RequestError, reply: impl Into<String>) -> Self {
        let mut scripts: Vec<Script> =
            std::iter::repeat_with(|| Script::ConnectError(error.clone()))
                .take(failures)
                .collect();
        scripts.push(Script::Events(text_events(&reply.into())));
        Self::new(scripts)
    }

    /// The last request seen, if any.
    pub fn last_request(&self) -> Option<ModelRequest> {
        self.requests.lock().unwrap().last().cloned()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted-mock"
    }
    fn model_name(&self) -> &str {
        "scripted-mock-model"
    }

    async fn execute_request(
        &self,
        request: ModelRequest,
        receiver: StreamListener,
        token: CancellationToken,
    ) -> Result<(), RequestError> {
        self.requests.lock().unwrap().push(request);
        let script = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                // Fallback when all scripts are consumed.
                Script::Events(text_events("[no more scripts]"))
            } else {
                scripts.remove(0)
            }
        };
        match script {
            Script::ConnectError(err) => Err(err),
            Script::Events(events) => {
                tokio::spawn(async move { drive(&receiver, events, &token).await });
                Ok(())
            }
        }
    }

    fn clone_provider(&self) -> Arc<dyn ModelProvider> {
        // Clones share the script queue: a child conversation consumes the
        // next script just like the parent would.
        Arc::new(self.clone())
    }
}

/// Drive a receiver with a scripted event sequence, honoring cancellation
/// between events the way a real streaming provider observes its token.
async fn drive(receiver: &StreamListener, events: Vec<StreamEvent>, token: &CancellationToken) {
    for event in events {
        if token.is_cancellation_requested() {
            receiver.cancel().await;
            return;
        }
        emit(receiver, event).await;
        tokio::task::yield_now().await;
    }
}

async fn emit(receiver: &StreamListener, event: StreamEvent) {
    match event {
        StreamEvent::BeforeRequest(v) => receiver.before_request(v).await,
        StreamEvent::RequestRaw(v) => receiver.request_raw(v).await,
        StreamEvent::StartMessage(evt) => receiver.start_message(evt).await,
        StreamEvent::UpdateMessage(evt) => receiver.update_message(evt).await,
        StreamEvent::StartContent { index, content } => {
            receiver.start_content(index, content).await
        }
        StreamEvent::UpdateContent { index, delta } => {
            receiver.update_content(index, delta).await
        }
        StreamEvent::CompleteContent { index, content } => {
            receiver.complete_content(index, content).await
        }
        StreamEvent::CompleteMessage(evt) => receiver.complete_message(evt).await,
        StreamEvent::StreamRaw(chunk) => receiver.stream_raw(chunk).await,
        StreamEvent::ResponseRaw(v) => receiver.response_raw(v).await,
        StreamEvent::Error(err) => receiver.error(err).await,
        StreamEvent::Cancelled => receiver.cancel().await,
    }
}

// ─── Script builders ──────────────────────────────────────────────────────────

fn default_usage() -> Usage {
    Usage {
        input_tokens: Some(10),
        output_tokens: Some(10),
        ..Default::default()
    }
}

/// A complete single-text-block response ending with `end_turn`.
pub fn text_events(text: &str) -> Vec<StreamEvent> {
    vec![
        StreamEvent::StartMessage(MessageStart::assistant()),
        StreamEvent::StartContent {
            index: 0,
            content: Content::text(""),
        },
        StreamEvent::UpdateContent {
            index: 0,
            delta: ContentDelta::Text { text: text.into() },
        },
        StreamEvent::CompleteContent {
            index: 0,
            content: Content::text(text),
        },
        StreamEvent::CompleteMessage(StreamEnd {
            stop_reason: StopReason::EndTurn,
            usage: Some(default_usage()),
        }),
    ]
}

/// A response requesting the given tool calls, ending with `tool_use`.
/// Each entry is `(tool_request_id, tool_name, params_json)`.
pub fn tool_call_events(calls: &[(&str, &str, &str)]) -> Vec<StreamEvent> {
    let mut events = vec![StreamEvent::StartMessage(MessageStart::assistant())];
    for (index, (id, name, params_json)) in calls.iter().enumerate() {
        events.push(StreamEvent::StartContent {
            index,
            content: Content::tool(*id, *name, Map::new()),
        });
        events.push(StreamEvent::UpdateContent {
            index,
            delta: ContentDelta::ToolParams {
                partial_json: (*params_json).into(),
            },
        });
        let params = serde_json::from_str(params_json).unwrap_or_default();
        events.push(StreamEvent::CompleteContent {
            index,
            content: Content::tool(*id, *name, params),
        });
    }
    events.push(StreamEvent::CompleteMessage(StreamEnd {
        stop_reason: StopReason::ToolUse,
        usage: Some(default_usage()),
    }));
    events
}

/// A stream that starts, emits one text chunk, and dies mid-flight.
pub fn error_events(partial: &str, error: RequestError) -> Vec<StreamEvent> {
    vec![
        StreamEvent::StartMessage(MessageStart::assistant()),
        StreamEvent::StartContent {
            index: 0,
            content: Content::text(""),
        },
        StreamEvent::UpdateContent {
            index: 0,
            delta: ContentDelta::Text {
                text: partial.into(),
            },
        },
        StreamEvent::Error(error),
    ]
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
