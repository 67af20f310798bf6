// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use parley_model::{ParamDef, ToolDefinition, ToolResult};
use parley_tools::{Orchestrator, Tool, ToolClass, ToolContext};

/// Delegates a focused task to an isolated sub-agent and returns its final
/// text output.  The sub-agent runs its own conversation and workflow;
/// nesting depth is bounded by the orchestrator.
pub struct SpawnAgentTool;

impl ToolClass for SpawnAgentTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "spawn_agent",
            "Spawn a sub-agent to complete a focused task and return its final \
             text output. Useful for delegating isolated sub-tasks.",
        )
        .with_parameters(vec![
            ParamDef::string("prompt")
                .required()
                .with_description("The task description for the sub-agent"),
            ParamDef::string("system")
                .with_description("System prompt override for the sub-agent"),
            ParamDef::boolean("fork_session")
                .with_default(json!(false))
                .with_description("Preload the sub-agent with the parent conversation history"),
        ])
    }

    fn instantiate(&self, ctx: &ToolContext) -> Arc<dyn Tool> {
        Arc::new(SpawnAgentInstance {
            orchestrator: Arc::clone(&ctx.orchestrator),
        })
    }
}

struct SpawnAgentInstance {
    orchestrator: Arc<dyn Orchestrator>,
}

#[async_trait]
impl Tool for SpawnAgentInstance {
    async fn execute(&self, params: Map<String, Value>) -> ToolResult {
        let Some(prompt) = params.get("prompt").and_then(Value::as_str) else {
            return ToolResult::fail("missing 'prompt'");
        };
        let system = params
            .get("system")
            .and_then(Value::as_str)
            .map(str::to_string);
        let fork_session = params
            .get("fork_session")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        match self
            .orchestrator
            .spawn_agent(prompt.to_string(), system, fork_session)
            .await
        {
            Ok(output) if output.is_empty() => {
                ToolResult::output("(sub-agent produced no text output)")
            }
            Ok(output) => ToolResult::output(output),
            Err(e) => ToolResult::fail(format!("sub-agent error: {e}")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
