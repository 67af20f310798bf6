// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::BTreeMap;

use serde_json::{Map, Value};
use tracing::warn;

use crate::content::{Content, ContentBody, Message, Role};
use crate::merge::deep_merge;
use crate::receiver::{ContentDelta, MessageDelta, MessageStart, StreamEvent};

/// Assembles partial stream output into a canonical assistant message.
///
/// Feed it every [`StreamEvent`] of one request; ask for a [`snapshot`]
/// after any event to get the cumulative message so far, and for
/// [`finalize`] once the stream completes.  Accumulation is monotonic:
/// text appends, thinking and signatures accrete, tool params accrete as
/// partial JSON and parse on completion.  An explicit `CompleteContent`
/// always overrides whatever was accumulated for that index.
///
/// [`snapshot`]: MessageAssembler::snapshot
/// [`finalize`]: MessageAssembler::finalize
pub struct MessageAssembler {
    role: Role,
    blocks: BTreeMap<usize, Slot>,
    extended: Map<String, Value>,
    started: bool,
}

enum Slot {
    Building(Building),
    Done(Content),
}

enum Building {
    Text {
        text: String,
    },
    Thinking {
        thought: String,
        signature: String,
    },
    Tool {
        tool_request_id: String,
        tool: String,
        params_json: String,
    },
    Raw {
        model_kind: String,
        data: String,
    },
}

impl Building {
    fn from_content(content: &Content) -> Option<Self> {
        match &content.body {
            ContentBody::Text { text } => Some(Building::Text { text: text.clone() }),
            ContentBody::Thinking { thought } => Some(Building::Thinking {
                thought: thought.clone(),
                signature: String::new(),
            }),
            ContentBody::Tool {
                tool_request_id,
                tool,
                params,
            } => Some(Building::Tool {
                tool_request_id: tool_request_id.clone(),
                tool: tool.clone(),
                params_json: if params.is_empty() {
                    String::new()
                } else {
                    serde_json::to_string(params).unwrap_or_default()
                },
            }),
            ContentBody::Raw { model_kind, data } => Some(Building::Raw {
                model_kind: model_kind.clone(),
                data: data.clone(),
            }),
            // Tool results never stream out of a model.
            ContentBody::ToolResult { .. } => None,
        }
    }

    fn apply(&mut self, delta: &ContentDelta) {
        match (self, delta) {
            (Building::Text { text }, ContentDelta::Text { text: chunk }) => {
                text.push_str(chunk);
            }
            (
                Building::Thinking { thought, signature },
                ContentDelta::Thinking {
                    thought: chunk,
                    signature: sig,
                },
            ) => {
                thought.push_str(chunk);
                if let Some(sig) = sig {
                    signature.push_str(sig);
                }
            }
            (Building::Tool { params_json, .. }, ContentDelta::ToolParams { partial_json }) => {
                params_json.push_str(partial_json);
            }
            (Building::Raw { data, .. }, ContentDelta::Raw { data: chunk }) => {
                data.push_str(chunk);
            }
            (_, delta) => {
                warn!(?delta, "content delta does not match its block variant; ignored");
            }
        }
    }

    fn build(&self, strict: bool) -> Content {
        match self {
            Building::Text { text } => Content::text(text.clone()),
            Building::Thinking { thought, signature } => {
                let mut content = Content::thinking(thought.clone());
                if !signature.is_empty() {
                    let mut extended = Map::new();
                    extended.insert("signature".into(), Value::String(signature.clone()));
                    content.extended = Some(extended);
                }
                content
            }
            Building::Tool {
                tool_request_id,
                tool,
                params_json,
            } => {
                let params = if params_json.trim().is_empty() {
                    Map::new()
                } else {
                    match serde_json::from_str::<Map<String, Value>>(params_json) {
                        Ok(params) => params,
                        Err(e) => {
                            // Mid-stream the JSON is usually incomplete;
                            // only a finalized block warrants a warning.
                            if strict {
                                warn!(tool, error = %e, "tool params did not parse; using empty map");
                            }
                            Map::new()
                        }
                    }
                };
                Content::tool(tool_request_id.clone(), tool.clone(), params)
            }
            Building::Raw { model_kind, data } => {
                Content::raw(model_kind.clone(), data.clone())
            }
        }
    }
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self {
            role: Role::Assistant,
            blocks: BTreeMap::new(),
            extended: Map::new(),
            started: false,
        }
    }

    /// Whether `StartMessage` has been observed.
    pub fn started(&self) -> bool {
        self.started
    }

    /// Message-level adornments accumulated from `start_message` /
    /// `update_message`.  Not part of the normalized message; exposed for
    /// observability.
    pub fn message_extended(&self) -> &Map<String, Value> {
        &self.extended
    }

    /// Number of blocks assembled or in progress.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Apply one stream event.  Non-content events (raw observability,
    /// terminal events) are ignored here; the caller routes those itself.
    pub fn apply(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::StartMessage(MessageStart { role, extended }) => {
                self.started = true;
                self.role = *role;
                self.merge_extended(extended);
            }
            StreamEvent::UpdateMessage(MessageDelta { extended }) => {
                self.merge_extended(extended);
            }
            StreamEvent::StartContent { index, content } => {
                match Building::from_content(content) {
                    Some(building) => {
                        self.blocks.insert(*index, Slot::Building(building));
                    }
                    None => {
                        warn!(index, "ignoring streamed block variant not producible by a model");
                    }
                }
            }
            StreamEvent::UpdateContent { index, delta } => match self.blocks.get_mut(index) {
                Some(Slot::Building(building)) => building.apply(delta),
                Some(Slot::Done(_)) => {
                    warn!(index, "content delta for a completed block; ignored");
                }
                None => {
                    warn!(index, "content delta without start_content; ignored");
                }
            },
            StreamEvent::CompleteContent { index, content } => {
                self.blocks.insert(*index, Slot::Done(content.clone()));
            }
            _ => {}
        }
    }

    fn merge_extended(&mut self, patch: &Map<String, Value>) {
        if patch.is_empty() {
            return;
        }
        let base = Value::Object(std::mem::take(&mut self.extended));
        match deep_merge(&base, &Value::Object(patch.clone())) {
            Ok(Value::Object(merged)) => self.extended = merged,
            Ok(_) => unreachable!("object merge yields an object"),
            Err(e) => {
                warn!(error = %e, "message metadata patch has incompatible shape; kept previous");
                if let Value::Object(prev) = base {
                    self.extended = prev;
                }
            }
        }
    }

    fn assemble(&self, strict: bool) -> Message {
        let content: Vec<Content> = self
            .blocks
            .values()
            .map(|slot| match slot {
                Slot::Done(content) => content.clone(),
                Slot::Building(building) => building.build(strict),
            })
            .filter(|c| c.body.allowed_for(self.role))
            .collect();
        Message {
            role: self.role,
            content,
            id: None,
            timestamp: None,
        }
    }

    /// The cumulative message rebuilt from everything observed so far.
    /// In-progress tool params that do not yet parse yield an empty map.
    pub fn snapshot(&self) -> Message {
        self.assemble(false)
    }

    /// The finalized assistant message.  Unlike [`snapshot`], unparseable
    /// tool params are reported.
    ///
    /// [`snapshot`]: MessageAssembler::snapshot
    pub fn finalize(self) -> Message {
        self.assemble(true)
    }
}

impl Default for MessageAssembler {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::content::ContentBody;
    use crate::receiver::StreamEnd;
    use crate::request::StopReason;

    use super::*;

    fn start() -> StreamEvent {
        StreamEvent::StartMessage(MessageStart::assistant())
    }

    #[test]
    fn text_deltas_append_in_order() {
        let mut a = MessageAssembler::new();
        a.apply(&start());
        a.apply(&StreamEvent::StartContent {
            index: 0,
            content: Content::text(""),
        });
        for chunk in ["Hel", "lo ", "world"] {
            a.apply(&StreamEvent::UpdateContent {
                index: 0,
                delta: ContentDelta::Text { text: chunk.into() },
            });
        }
        assert_eq!(a.snapshot().text(), "Hello world");
    }

    #[test]
    fn tool_params_accrete_and_parse_on_completion() {
        let mut a = MessageAssembler::new();
        a.apply(&start());
        a.apply(&StreamEvent::StartContent {
            index: 0,
            content: Content::tool("c1", "get_weather", Map::new()),
        });
        for chunk in [r#"{"ci"#, r#"ty":"Pa"#, r#"ris"}"#] {
            a.apply(&StreamEvent::UpdateContent {
                index: 0,
                delta: ContentDelta::ToolParams {
                    partial_json: chunk.into(),
                },
            });
        }
        let message = a.finalize();
        match &message.content[0].body {
            ContentBody::Tool { tool, params, .. } => {
                assert_eq!(tool, "get_weather");
                assert_eq!(params.get("city"), Some(&json!("Paris")));
            }
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[test]
    fn mid_stream_snapshot_tolerates_partial_tool_json() {
        let mut a = MessageAssembler::new();
        a.apply(&start());
        a.apply(&StreamEvent::StartContent {
            index: 0,
            content: Content::tool("c1", "t", Map::new()),
        });
        a.apply(&StreamEvent::UpdateContent {
            index: 0,
            delta: ContentDelta::ToolParams {
                partial_json: r#"{"cit"#.into(),
            },
        });
        let snap = a.snapshot();
        match &snap.content[0].body {
            ContentBody::Tool { params, .. } => assert!(params.is_empty()),
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[test]
    fn complete_content_overrides_accumulation() {
        let mut a = MessageAssembler::new();
        a.apply(&start());
        a.apply(&StreamEvent::StartContent {
            index: 0,
            content: Content::text(""),
        });
        a.apply(&StreamEvent::UpdateContent {
            index: 0,
            delta: ContentDelta::Text {
                text: "partial".into(),
            },
        });
        a.apply(&StreamEvent::CompleteContent {
            index: 0,
            content: Content::text("canonical"),
        });
        assert_eq!(a.finalize().text(), "canonical");
    }

    #[test]
    fn thinking_accretes_with_signature() {
        let mut a = MessageAssembler::new();
        a.apply(&start());
        a.apply(&StreamEvent::StartContent {
            index: 0,
            content: Content::thinking(""),
        });
        a.apply(&StreamEvent::UpdateContent {
            index: 0,
            delta: ContentDelta::Thinking {
                thought: "because…".into(),
                signature: None,
            },
        });
        a.apply(&StreamEvent::UpdateContent {
            index: 0,
            delta: ContentDelta::Thinking {
                thought: String::new(),
                signature: Some("sig-abc".into()),
            },
        });
        let message = a.finalize();
        let block = &message.content[0];
        assert!(matches!(&block.body, ContentBody::Thinking { thought } if thought == "because…"));
        assert_eq!(
            block.extended.as_ref().and_then(|e| e.get("signature")),
            Some(&json!("sig-abc"))
        );
    }

    #[test]
    fn blocks_come_out_in_index_order() {
        let mut a = MessageAssembler::new();
        a.apply(&start());
        // Indices observed out of order.
        a.apply(&StreamEvent::CompleteContent {
            index: 1,
            content: Content::text("second"),
        });
        a.apply(&StreamEvent::CompleteContent {
            index: 0,
            content: Content::text("first"),
        });
        let message = a.finalize();
        assert_eq!(message.text(), "firstsecond");
    }

    #[test]
    fn message_metadata_merges_across_updates() {
        let mut a = MessageAssembler::new();
        let mut first = Map::new();
        first.insert("citations".into(), json!([1]));
        a.apply(&StreamEvent::StartMessage(MessageStart {
            role: Role::Assistant,
            extended: first,
        }));
        let mut second = Map::new();
        second.insert("citations".into(), json!([2]));
        a.apply(&StreamEvent::UpdateMessage(MessageDelta { extended: second }));
        assert_eq!(a.message_extended().get("citations"), Some(&json!([1, 2])));
    }

    #[test]
    fn terminal_events_do_not_disturb_assembly() {
        let mut a = MessageAssembler::new();
        a.apply(&start());
        a.apply(&StreamEvent::CompleteContent {
            index: 0,
            content: Content::text("done"),
        });
        a.apply(&StreamEvent::CompleteMessage(StreamEnd {
            stop_reason: StopReason::EndTurn,
            usage: None,
        }));
        assert_eq!(a.finalize().text(), "done");
    }

    #[test]
    fn delta_without_start_is_ignored() {
        let mut a = MessageAssembler::new();
        a.apply(&start());
        a.apply(&StreamEvent::UpdateContent {
            index: 3,
            delta: ContentDelta::Text { text: "??".into() },
        });
        assert_eq!(a.snapshot().content.len(), 0);
    }
}
