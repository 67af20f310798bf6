// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashSet;
use std::sync::Arc;

use parley_model::{CheckpointState, Content, ContentBody, Message, Role};

/// Context handed to conversation-level transformers.
#[derive(Debug, Clone, Default)]
pub struct TransformContext {
    pub checkpoint: Option<CheckpointState>,
}

/// A request-boundary rewrite pair.
///
/// `transform_prompt` rewrites the outgoing message list; it never mutates
/// stored history — the conversation hands it a copy.  `transform_completion`
/// rewrites the incoming assistant message before it is appended.
pub trait ContextTransformer: Send + Sync {
    fn transform_prompt(&self, messages: Vec<Message>, _ctx: &TransformContext) -> Vec<Message> {
        messages
    }

    fn transform_completion(&self, message: Message) -> Message {
        message
    }
}

/// Applies child transformers in registration order, both directions.
pub struct CompositeTransformer {
    children: Vec<Arc<dyn ContextTransformer>>,
}

impl CompositeTransformer {
    pub fn new(children: Vec<Arc<dyn ContextTransformer>>) -> Self {
        Self { children }
    }

    pub fn transform_prompt(&self, messages: Vec<Message>, ctx: &TransformContext) -> Vec<Message> {
        self.children
            .iter()
            .fold(messages, |messages, t| t.transform_prompt(messages, ctx))
    }

    pub fn transform_completion(&self, message: Message) -> Message {
        self.children
            .iter()
            .fold(message, |message, t| t.transform_completion(message))
    }
}

impl Default for CompositeTransformer {
    /// The standard pipeline: orphaned tool calls are scrubbed first, then
    /// checkpoint substitution rewrites the summarized prefix.
    fn default() -> Self {
        Self::new(vec![
            Arc::new(ToolOrphanTransformer),
            Arc::new(CheckpointTransformer),
        ])
    }
}

// ─── Built-ins ────────────────────────────────────────────────────────────────

/// Drops assistant `tool` blocks that have no matching `tool_result` in any
/// later message, so the outgoing list never contains a request the model
/// would wait on.  A message left empty keeps a single empty text block to
/// preserve turn alternation.
pub struct ToolOrphanTransformer;

impl ContextTransformer for ToolOrphanTransformer {
    fn transform_prompt(&self, mut messages: Vec<Message>, _ctx: &TransformContext) -> Vec<Message> {
        let mut resolved: HashSet<String> = HashSet::new();
        for message in messages.iter_mut().rev() {
            match message.role {
                Role::User => {
                    for content in &message.content {
                        if let ContentBody::ToolResult {
                            tool_request_id, ..
                        } = &content.body
                        {
                            resolved.insert(tool_request_id.clone());
                        }
                    }
                }
                Role::Assistant => {
                    message.content.retain(|content| match &content.body {
                        ContentBody::Tool {
                            tool_request_id, ..
                        } => resolved.contains(tool_request_id),
                        _ => true,
                    });
                    if message.content.is_empty() {
                        message.content.push(Content::text(""));
                    }
                }
            }
        }
        messages
    }
}

/// Substitutes the summarized prefix of the conversation with a single
/// synthetic user message carrying the checkpoint summary.
///
/// The boundary message is kept when it is an assistant message (it reads
/// as the natural reply to the summary) and skipped when it is a user
/// message.  A missing boundary id passes the list through untouched.
pub struct CheckpointTransformer;

impl ContextTransformer for CheckpointTransformer {
    fn transform_prompt(&self, messages: Vec<Message>, ctx: &TransformContext) -> Vec<Message> {
        let Some(checkpoint) = &ctx.checkpoint else {
            return messages;
        };
        let Some(boundary) = messages
            .iter()
            .position(|m| m.stable_id() == checkpoint.message_id)
        else {
            return messages;
        };

        let mut out = Vec::with_capacity(messages.len() - boundary + 1);
        out.push(Message::user(checkpoint.summary.clone()));
        let keep_from = if messages[boundary].role == Role::Assistant {
            boundary
        } else {
            boundary + 1
        };
        out.extend(messages.into_iter().skip(keep_from));
        out
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
