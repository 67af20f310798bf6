// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::cancel::CancellationToken;
use crate::content::{Content, ContentBody};
use crate::listener::StreamListener;
use crate::provider::ModelProvider;
use crate::receiver::{ContentDelta, MessageStart, StreamEnd, StreamReceiver};
use crate::request::{ModelRequest, RequestError, StopReason, Usage};

/// Streaming driver for the Anthropic Messages API.
pub struct AnthropicProvider {
    model: String,
    api_key: String,
    base_url: String,
    max_tokens: u32,
    temperature: f32,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(
        model: impl Into<String>,
        api_key: impl Into<String>,
        base_url: Option<String>,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
    ) -> Self {
        Self {
            model: model.into(),
            api_key: api_key.into(),
            base_url: base_url.unwrap_or_else(|| "https://api.anthropic.com".into()),
            max_tokens: max_tokens.unwrap_or(4096),
            temperature: temperature.unwrap_or(0.2),
            client: reqwest::Client::new(),
        }
    }

    fn build_body(&self, request: &ModelRequest) -> Value {
        let messages = build_wire_messages(&request.messages);
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "stream": true,
        });
        if let Some(system) = &request.system {
            if !system.is_empty() {
                body["system"] = json!(system);
            }
        }
        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.input_schema(),
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }
        body
    }
}

#[async_trait]
impl ModelProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn execute_request(
        &self,
        request: ModelRequest,
        receiver: StreamListener,
        token: CancellationToken,
    ) -> Result<(), RequestError> {
        let body = self.build_body(&request);
        receiver.before_request(json!({"model": self.model})).await;
        receiver.request_raw(body.clone()).await;

        debug!(model = %self.model, messages = request.messages.len(), "sending anthropic request");

        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .map_err(RequestError::from)?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(RequestError::http(status, format!("anthropic error {status}: {text}")));
        }

        // Connection established — consume the SSE stream on its own task so
        // the policy-wrapped call can resolve now.
        tokio::spawn(async move {
            pump_sse(resp, receiver, token).await;
        });
        Ok(())
    }

    fn clone_provider(&self) -> Arc<dyn ModelProvider> {
        Arc::new(Self {
            model: self.model.clone(),
            api_key: self.api_key.clone(),
            base_url: self.base_url.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            client: self.client.clone(),
        })
    }
}

// ─── Stream pump ──────────────────────────────────────────────────────────────

/// An in-progress content block, accumulated so `content_block_stop` can
/// emit the complete canonical block the receiver contract requires.
enum Pending {
    Text(String),
    Thinking { thought: String, signature: String },
    Tool { id: String, name: String, params_json: String },
}

struct SseState {
    blocks: HashMap<usize, Pending>,
    stop_reason: StopReason,
    usage: Usage,
}

async fn pump_sse(resp: reqwest::Response, receiver: StreamListener, token: CancellationToken) {
    let mut stream = resp.bytes_stream();
    // SSE lines can be split across TCP chunks; carry the remainder forward
    // and only parse complete lines.
    let mut buf = String::new();
    let mut state = SseState {
        blocks: HashMap::new(),
        stop_reason: StopReason::EndTurn,
        usage: Usage::default(),
    };

    loop {
        let chunk = tokio::select! {
            biased;
            _ = token.await_cancellation() => {
                receiver.cancel().await;
                return;
            }
            chunk = stream.next() => chunk,
        };
        let bytes = match chunk {
            None => break,
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => {
                receiver
                    .error(RequestError::stream(format!("anthropic stream failed: {e}")))
                    .await;
                return;
            }
        };
        buf.push_str(&String::from_utf8_lossy(&bytes));
        while let Some(pos) = buf.find('\n') {
            let line = buf[..pos].trim_end_matches('\r').to_string();
            buf.drain(..=pos);
            if line.is_empty() {
                continue;
            }
            receiver.stream_raw(line.clone()).await;
            let Some(data) = line.strip_prefix("data: ") else {
                continue;
            };
            let Ok(event) = serde_json::from_str::<Value>(data.trim()) else {
                continue;
            };
            if handle_event(&event, &mut state, &receiver).await {
                return;
            }
        }
    }

    // Stream ended without message_stop: the connection dropped mid-response.
    if !receiver.is_done() {
        receiver
            .error(RequestError::stream("anthropic stream ended before message_stop"))
            .await;
    }
}

/// Apply one wire event.  Returns `true` when the stream is finished.
async fn handle_event(event: &Value, state: &mut SseState, receiver: &StreamListener) -> bool {
    match event["type"].as_str().unwrap_or("") {
        "message_start" => {
            if let Some(usage) = event["message"].get("usage") {
                state.usage.add(&wire_usage(usage));
            }
            receiver.start_message(MessageStart::assistant()).await;
            false
        }
        "content_block_start" => {
            let index = event["index"].as_u64().unwrap_or(0) as usize;
            let block = &event["content_block"];
            let (pending, content) = match block["type"].as_str().unwrap_or("") {
                "tool_use" => {
                    let id = block["id"].as_str().unwrap_or("").to_string();
                    let name = block["name"].as_str().unwrap_or("").to_string();
                    (
                        Pending::Tool {
                            id: id.clone(),
                            name: name.clone(),
                            params_json: String::new(),
                        },
                        Content::tool(id, name, Map::new()),
                    )
                }
                "thinking" => (
                    Pending::Thinking {
                        thought: String::new(),
                        signature: String::new(),
                    },
                    Content::thinking(""),
                ),
                _ => {
                    let text = block["text"].as_str().unwrap_or("").to_string();
                    (Pending::Text(text.clone()), Content::text(text))
                }
            };
            state.blocks.insert(index, pending);
            receiver.start_content(index, content).await;
            false
        }
        "content_block_delta" => {
            let index = event["index"].as_u64().unwrap_or(0) as usize;
            let delta = &event["delta"];
            let update = match delta["type"].as_str().unwrap_or("") {
                "text_delta" => {
                    let text = delta["text"].as_str().unwrap_or("").to_string();
                    if let Some(Pending::Text(buf)) = state.blocks.get_mut(&index) {
                        buf.push_str(&text);
                    }
                    Some(ContentDelta::Text { text })
                }
                "input_json_delta" => {
                    let partial = delta["partial_json"].as_str().unwrap_or("").to_string();
                    if let Some(Pending::Tool { params_json, .. }) = state.blocks.get_mut(&index) {
                        params_json.push_str(&partial);
                    }
                    Some(ContentDelta::ToolParams {
                        partial_json: partial,
                    })
                }
                "thinking_delta" => {
                    let text = delta["thinking"].as_str().unwrap_or("").to_string();
                    if let Some(Pending::Thinking { thought, .. }) = state.blocks.get_mut(&index) {
                        thought.push_str(&text);
                    }
                    Some(ContentDelta::Thinking {
                        thought: text,
                        signature: None,
                    })
                }
                "signature_delta" => {
                    let sig = delta["signature"].as_str().unwrap_or("").to_string();
                    if let Some(Pending::Thinking { signature, .. }) = state.blocks.get_mut(&index) {
                        signature.push_str(&sig);
                    }
                    Some(ContentDelta::Thinking {
                        thought: String::new(),
                        signature: Some(sig),
                    })
                }
                _ => None,
            };
            if let Some(delta) = update {
                receiver.update_content(index, delta).await;
            }
            false
        }
        "content_block_stop" => {
            let index = event["index"].as_u64().unwrap_or(0) as usize;
            if let Some(pending) = state.blocks.remove(&index) {
                receiver.complete_content(index, finish_block(pending)).await;
            }
            false
        }
        "message_delta" => {
            if let Some(reason) = event["delta"]["stop_reason"].as_str() {
                state.stop_reason = map_stop_reason(reason);
            }
            if let Some(usage) = event.get("usage") {
                state.usage.add(&wire_usage(usage));
            }
            false
        }
        "message_stop" => {
            receiver.response_raw(event.clone()).await;
            receiver
                .complete_message(StreamEnd {
                    stop_reason: state.stop_reason,
                    usage: Some(state.usage),
                })
                .await;
            true
        }
        "error" => {
            let message = event["error"]["message"]
                .as_str()
                .unwrap_or("anthropic stream error")
                .to_string();
            receiver.error(RequestError::stream(message)).await;
            true
        }
        _ => false,
    }
}

fn finish_block(pending: Pending) -> Content {
    match pending {
        Pending::Text(text) => Content::text(text),
        Pending::Thinking { thought, signature } => {
            let mut content = Content::thinking(thought);
            if !signature.is_empty() {
                let mut extended = Map::new();
                extended.insert("signature".into(), Value::String(signature));
                content.extended = Some(extended);
            }
            content
        }
        Pending::Tool {
            id,
            name,
            params_json,
        } => {
            let params = if params_json.trim().is_empty() {
                Map::new()
            } else {
                serde_json::from_str(&params_json).unwrap_or_else(|e| {
                    warn!(tool = %name, error = %e, "tool_use input did not parse");
                    Map::new()
                })
            };
            Content::tool(id, name, params)
        }
    }
}

fn wire_usage(usage: &Value) -> Usage {
    fn field(usage: &Value, key: &str) -> Option<u64> {
        usage.get(key).and_then(Value::as_u64)
    }
    Usage {
        input_tokens: field(usage, "input_tokens"),
        output_tokens: field(usage, "output_tokens"),
        cache_creation_input_tokens: field(usage, "cache_creation_input_tokens"),
        cache_read_input_tokens: field(usage, "cache_read_input_tokens"),
    }
}

fn map_stop_reason(reason: &str) -> StopReason {
    match reason {
        "end_turn" => StopReason::EndTurn,
        "max_tokens" => StopReason::MaxTokens,
        "stop_sequence" => StopReason::StopSequence,
        "tool_use" => StopReason::ToolUse,
        _ => StopReason::Other,
    }
}

// ─── Wire message building ────────────────────────────────────────────────────

/// Convert normalized messages into the Anthropic messages array.
///
/// Raw blocks tagged `anthropic` splice their payload through verbatim;
/// raw blocks from other providers degrade to text so a conversation
/// switched across providers still round-trips.
fn build_wire_messages(messages: &[crate::content::Message]) -> Vec<Value> {
    let mut out = Vec::with_capacity(messages.len());
    for message in messages {
        let role = message.role.to_string();
        let mut blocks: Vec<Value> = Vec::with_capacity(message.content.len());
        for content in &message.content {
            match &content.body {
                ContentBody::Text { text } => {
                    blocks.push(json!({"type": "text", "text": text}));
                }
                ContentBody::Thinking { thought } => {
                    let signature = content
                        .extended
                        .as_ref()
                        .and_then(|e| e.get("signature"))
                        .and_then(Value::as_str)
                        .unwrap_or("");
                    blocks.push(json!({
                        "type": "thinking",
                        "thinking": thought,
                        "signature": signature,
                    }));
                }
                ContentBody::Tool {
                    tool_request_id,
                    tool,
                    params,
                } => {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": tool_request_id,
                        "name": tool,
                        "input": params,
                    }));
                }
                ContentBody::ToolResult {
                    tool_request_id,
                    result,
                    ..
                } => {
                    let text = serde_json::to_string(result).unwrap_or_default();
                    blocks.push(json!({
                        "type": "tool_result",
                        "tool_use_id": tool_request_id,
                        "content": text,
                        "is_error": !result.is_success(),
                    }));
                }
                ContentBody::Raw { model_kind, data } => {
                    if model_kind == "anthropic" {
                        match serde_json::from_str::<Value>(data) {
                            Ok(v) => blocks.push(v),
                            Err(_) => blocks.push(json!({"type": "text", "text": data})),
                        }
                    } else {
                        blocks.push(json!({"type": "text", "text": data}));
                    }
                }
            }
        }
        out.push(json!({"role": role, "content": blocks}));
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
