// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use parley_model::{CheckpointState, ContentBody, Message, Role};

/// Everything a summarization strategy gets to work with.
pub struct SummarizationContext<'a> {
    pub session_id: &'a str,
    /// The messages to summarize (those since the previous checkpoint).
    pub messages: &'a [Message],
    pub previous_checkpoint: Option<&'a CheckpointState>,
    pub system: Option<&'a str>,
    /// Free-form extra guidance from the caller.
    pub context: Option<&'a str>,
}

/// Builds the prompt a checkpoint child conversation is driven with.
///
/// Contract: the returned list must end with a user message — the child is
/// preloaded with everything before it and then prompted with the last
/// one.  A violating strategy is a programmer error and is thrown, never
/// swallowed.
pub trait SummarizationStrategy: Send + Sync {
    fn build_prompt(&self, ctx: &SummarizationContext<'_>) -> Vec<Message>;
}

const BRIEFING_INSTRUCTIONS: &str = "\
Write a concise structured briefing of the conversation above for an \
assistant that will continue it without access to the original history. \
Preserve: decisions made and their rationale, the state of any in-progress \
work, established facts, tool invocations and their outcomes, and every \
explicit user instruction or preference. Omit superseded plans and \
abandoned approaches. Reply with the briefing only.";

/// The default strategy: one user message holding the previous summary,
/// the system prompt, a rendered transcript, and the briefing instructions.
pub struct TranscriptStrategy;

impl SummarizationStrategy for TranscriptStrategy {
    fn build_prompt(&self, ctx: &SummarizationContext<'_>) -> Vec<Message> {
        let mut sections: Vec<String> = Vec::new();
        if let Some(previous) = ctx.previous_checkpoint {
            sections.push(format!(
                "Summary of the conversation so far:\n{}",
                previous.summary
            ));
        }
        if let Some(system) = ctx.system {
            if !system.is_empty() {
                sections.push(format!("System prompt in effect:\n{system}"));
            }
        }
        sections.push(format!("Transcript:\n{}", render_transcript(ctx.messages)));
        if let Some(context) = ctx.context {
            if !context.is_empty() {
                sections.push(context.to_string());
            }
        }
        sections.push(BRIEFING_INSTRUCTIONS.to_string());
        vec![Message::user(sections.join("\n\n"))]
    }
}

/// Render messages as a plain-text transcript with tool and thinking
/// annotations.
fn render_transcript(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|message| {
            let speaker = match message.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
            };
            let body = message
                .content
                .iter()
                .map(|content| match &content.body {
                    ContentBody::Text { text } => text.clone(),
                    ContentBody::Thinking { thought } => format!("[Thinking: {thought}]"),
                    ContentBody::Tool { tool, params, .. } => {
                        let params =
                            serde_json::to_string(params).unwrap_or_else(|_| "{}".into());
                        format!("[Called tool: {tool} with {params}]")
                    }
                    ContentBody::ToolResult { tool, result, .. } => {
                        let rendered =
                            serde_json::to_string(result).unwrap_or_else(|_| "{}".into());
                        format!("[Tool {tool} returned: {rendered}]")
                    }
                    ContentBody::Raw { model_kind, .. } => {
                        format!("[{model_kind} raw content]")
                    }
                })
                .collect::<Vec<_>>()
                .join("\n");
            format!("{speaker}: {body}")
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::Map;

    use parley_model::{Content, ToolResult};

    use super::*;

    fn ctx<'a>(messages: &'a [Message]) -> SummarizationContext<'a> {
        SummarizationContext {
            session_id: "s1",
            messages,
            previous_checkpoint: None,
            system: None,
            context: None,
        }
    }

    #[test]
    fn prompt_is_a_single_user_message() {
        let messages = vec![Message::user("hi"), Message::assistant("hello")];
        let prompt = TranscriptStrategy.build_prompt(&ctx(&messages));
        assert_eq!(prompt.len(), 1);
        assert_eq!(prompt[0].role, Role::User);
    }

    #[test]
    fn transcript_names_speakers_in_order() {
        let messages = vec![Message::user("question"), Message::assistant("answer")];
        let text = TranscriptStrategy.build_prompt(&ctx(&messages))[0].text();
        let q = text.find("User: question").expect("user turn present");
        let a = text.find("Assistant: answer").expect("assistant turn present");
        assert!(q < a);
    }

    #[test]
    fn tool_turns_are_annotated() {
        let mut params = Map::new();
        params.insert("city".into(), serde_json::json!("Paris"));
        let messages = vec![
            Message::new(
                Role::Assistant,
                vec![
                    Content::thinking("need the weather"),
                    Content::tool("c1", "get_weather", params),
                ],
            )
            .unwrap(),
            Message::new(
                Role::User,
                vec![Content::tool_result("c1", "get_weather", ToolResult::ok())],
            )
            .unwrap(),
        ];
        let text = TranscriptStrategy.build_prompt(&ctx(&messages))[0].text();
        assert!(text.contains("[Thinking: need the weather]"));
        assert!(text.contains("[Called tool: get_weather"));
        assert!(text.contains("[Tool get_weather returned:"));
    }

    #[test]
    fn previous_summary_and_system_lead_the_prompt() {
        let previous = CheckpointState {
            message_id: "m1".into(),
            summary: "Earlier we fixed the build.".into(),
        };
        let messages = vec![Message::user("next")];
        let context = SummarizationContext {
            session_id: "s1",
            messages: &messages,
            previous_checkpoint: Some(&previous),
            system: Some("You are terse."),
            context: None,
        };
        let text = TranscriptStrategy.build_prompt(&context)[0].text();
        let summary_at = text.find("Earlier we fixed the build.").unwrap();
        let system_at = text.find("You are terse.").unwrap();
        let transcript_at = text.find("Transcript:").unwrap();
        assert!(summary_at < system_at && system_at < transcript_at);
    }

    #[test]
    fn instructions_close_the_prompt() {
        let messages = vec![Message::user("x")];
        let text = TranscriptStrategy.build_prompt(&ctx(&messages))[0].text();
        assert!(text.trim_end().ends_with("Reply with the briefing only."));
    }
}
