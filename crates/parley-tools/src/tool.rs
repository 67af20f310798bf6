// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use parley_model::{ToolDefinition, ToolResult};

/// The seam through which tools reach back into the engine.
///
/// Subagent-style tools spawn an isolated child conversation and wait for
/// its final text; queueing adds a follow-up prompt that drains when the
/// current agentic loop would otherwise end.  The engine crate provides the
/// implementation; tools only ever see this trait.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Run `prompt` in an isolated child conversation and return the final
    /// assistant text.  `fork_session` preloads the parent's history.
    async fn spawn_agent(
        &self,
        prompt: String,
        system: Option<String>,
        fork_session: bool,
    ) -> anyhow::Result<String>;

    /// Queue a follow-up user message on the driving workflow.
    fn queue_follow_up(&self, text: String);
}

/// Everything a tool instance gets at construction time.
#[derive(Clone)]
pub struct ToolContext {
    pub orchestrator: Arc<dyn Orchestrator>,
    /// Workflow-scoped context data, read-only for tools.  Child workflows
    /// see their parent's data merged with their own.
    pub data: Map<String, Value>,
}

impl ToolContext {
    pub fn new(orchestrator: Arc<dyn Orchestrator>, data: Map<String, Value>) -> Self {
        Self { orchestrator, data }
    }

    /// A context with no live engine behind it.  Spawning from it fails;
    /// useful for tools that never orchestrate, and in tests.
    pub fn detached(data: Map<String, Value>) -> Self {
        Self {
            orchestrator: Arc::new(DetachedOrchestrator),
            data,
        }
    }
}

struct DetachedOrchestrator;

#[async_trait]
impl Orchestrator for DetachedOrchestrator {
    async fn spawn_agent(
        &self,
        _prompt: String,
        _system: Option<String>,
        _fork_session: bool,
    ) -> anyhow::Result<String> {
        anyhow::bail!("no orchestrator attached")
    }

    fn queue_follow_up(&self, _text: String) {}
}

/// A live tool instance.  `execute` reports failures as
/// [`ToolResult::Failure`] values; anything it returns flows back to the
/// model as a `tool_result` block.
#[async_trait]
pub trait Tool: Send + Sync {
    async fn execute(&self, params: Map<String, Value>) -> ToolResult;
}

/// A registrable tool: its schema plus an instance factory.
///
/// Instantiation is infallible — a tool that needs fallible setup defers it
/// to `execute` and reports the failure there, so the workflow never loses
/// a whole batch to a constructor.
pub trait ToolClass: Send + Sync {
    fn definition(&self) -> ToolDefinition;
    fn instantiate(&self, ctx: &ToolContext) -> Arc<dyn Tool>;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
