// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use anyhow::Context as _;
use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use parley_model::{deep_merge, Content, ContentBody, Message, Role, StopReason, ToolResult};
use parley_tools::{Orchestrator, Tool, ToolContext, Toolkit};
use tokio::sync::mpsc;

use crate::conversation::{ChildOptions, Conversation};
use crate::error::ConversationError;
use crate::events::ConversationEvent;

const MAX_AGENT_DEPTH: usize = 3;
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowState {
    Idle,
    Busy,
    Disposed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowEndReason {
    Complete,
    Error,
    Cancel,
}

/// Events emitted by a workflow.  Child workflow events bubble wrapped in
/// [`WorkflowEvent::ChildWorkflowEvent`].
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    Started,
    /// A queued follow-up message is about to be prompted.
    MessageDequeued { text: String },
    ToolBatchStart { size: usize },
    ToolBatchEnd { size: usize },
    End { reason: WorkflowEndReason },
    Disposed { workflow_id: String },
    ChildWorkflowEvent {
        workflow_id: String,
        event: Box<WorkflowEvent>,
    },
}

struct PendingCall {
    tool_request_id: String,
    tool: String,
    params: Map<String, Value>,
}

/// Where the driver reads conversation events from: its own subscription
/// (standalone use — subscribe happens before any prompt), or a channel
/// fed by a manager whose subscription predates every request.
enum EventSource {
    Broadcast(broadcast::Receiver<ConversationEvent>),
    Channel(mpsc::UnboundedReceiver<ConversationEvent>),
}

impl EventSource {
    /// Next event, skipping lag gaps.  `None` when the source is closed.
    async fn recv(&mut self) -> Option<ConversationEvent> {
        match self {
            EventSource::Channel(rx) => rx.recv().await,
            EventSource::Broadcast(rx) => loop {
                match rx.recv().await {
                    Ok(event) => return Some(event),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
        }
    }

    /// Discard everything currently buffered.
    fn drain(&mut self) {
        match self {
            EventSource::Channel(rx) => while rx.try_recv().is_ok() {},
            EventSource::Broadcast(rx) => loop {
                match rx.try_recv() {
                    Ok(_) => continue,
                    Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                    Err(_) => break,
                }
            },
        }
    }
}

/// Drives the agentic loop on one conversation: waits for a completed
/// assistant message, executes requested tools in parallelizable batches,
/// feeds the results back, and drains queued follow-ups when the loop
/// would otherwise end.
pub struct Workflow {
    id: String,
    conversation: Arc<Conversation>,
    toolkit: Arc<Toolkit>,
    state: Mutex<WorkflowState>,
    queue: Mutex<VecDeque<String>>,
    context_data: Map<String, Value>,
    /// Tool instances memoized per name for the lifetime of the workflow.
    instances: Mutex<HashMap<String, Arc<dyn Tool>>>,
    /// The most recent user message observed (from `start` or
    /// `prompt_send`).
    last_user: Mutex<Option<Message>>,
    events: broadcast::Sender<WorkflowEvent>,
    depth: usize,
}

impl Workflow {
    pub fn new(
        conversation: Arc<Conversation>,
        id: Option<String>,
        context_data: Map<String, Value>,
    ) -> Arc<Self> {
        Self::with_depth(conversation, id, context_data, 0)
    }

    fn with_depth(
        conversation: Arc<Conversation>,
        id: Option<String>,
        context_data: Map<String, Value>,
        depth: usize,
    ) -> Arc<Self> {
        let toolkit = conversation.toolkit();
        Arc::new(Self {
            id: id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            conversation,
            toolkit,
            state: Mutex::new(WorkflowState::Idle),
            queue: Mutex::new(VecDeque::new()),
            context_data,
            instances: Mutex::new(HashMap::new()),
            last_user: Mutex::new(None),
            events: broadcast::channel(EVENT_CAPACITY).0,
            depth,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> WorkflowState {
        *self.state.lock().unwrap()
    }

    pub fn conversation(&self) -> &Arc<Conversation> {
        &self.conversation
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }

    /// The most recent user message this workflow observed.
    pub fn last_user_message(&self) -> Option<Message> {
        self.last_user.lock().unwrap().clone()
    }

    fn emit(&self, event: WorkflowEvent) {
        let _ = self.events.send(event);
    }

    // ── Queueing ──────────────────────────────────────────────────────────────

    /// Append a follow-up prompt; drained only when the agentic loop would
    /// otherwise terminate normally.
    pub fn queue_message(&self, text: impl Into<String>) {
        self.queue.lock().unwrap().push_back(text.into());
    }

    pub fn clear_queue(&self) {
        self.queue.lock().unwrap().clear();
    }

    pub fn queued_messages(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Begin observing the conversation.  The driver ends the workflow on
    /// the first turn that neither requests tools nor has queued
    /// follow-ups.
    ///
    /// Call `start` before issuing the prompt this workflow should drive,
    /// so the subscription cannot miss its completion.
    pub fn start(self: &Arc<Self>, initial_user_message: Option<String>) {
        let source = EventSource::Broadcast(self.conversation.subscribe());
        self.start_from(source, initial_user_message);
    }

    /// Manager entry point: drive from a channel fed by a subscription
    /// older than the in-flight request.
    pub(crate) fn start_with_events(
        self: &Arc<Self>,
        rx: mpsc::UnboundedReceiver<ConversationEvent>,
        initial_user_message: Option<String>,
    ) {
        self.start_from(EventSource::Channel(rx), initial_user_message);
    }

    fn start_from(self: &Arc<Self>, source: EventSource, initial_user_message: Option<String>) {
        {
            let mut state = self.state.lock().unwrap();
            if *state != WorkflowState::Idle {
                warn!(workflow = %self.id, state = ?*state, "start ignored");
                return;
            }
            *state = WorkflowState::Busy;
        }
        if let Some(text) = initial_user_message {
            *self.last_user.lock().unwrap() = Some(Message::user(text));
        }
        self.emit(WorkflowEvent::Started);

        let workflow = Arc::clone(self);
        tokio::spawn(async move { workflow.drive(source).await });
    }

    /// Cancel the workflow: interrupt the conversation if mid-request,
    /// then end with reason `cancel`.
    pub fn cancel(&self) {
        if self.state() != WorkflowState::Busy {
            return;
        }
        if let Err(e) = self.conversation.cancel_response() {
            // Not mid-request; nothing to interrupt.
            debug!(workflow = %self.id, error = %e, "cancel without in-flight request");
        }
        self.end(WorkflowEndReason::Cancel);
    }

    fn end(&self, reason: WorkflowEndReason) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == WorkflowState::Disposed {
                return;
            }
            *state = WorkflowState::Idle;
        }
        self.emit(WorkflowEvent::End { reason });
        self.dispose();
    }

    fn dispose(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == WorkflowState::Disposed {
                return;
            }
            *state = WorkflowState::Disposed;
        }
        self.instances.lock().unwrap().clear();
        self.emit(WorkflowEvent::Disposed {
            workflow_id: self.id.clone(),
        });
    }

    // ── Driver ────────────────────────────────────────────────────────────────

    async fn drive(self: Arc<Self>, mut source: EventSource) {
        // Wait for the first completion of the externally-initiated prompt.
        let (mut message, mut stop_reason) = loop {
            match source.recv().await {
                Some(ConversationEvent::PromptSend { message, .. }) => {
                    *self.last_user.lock().unwrap() = Some(message);
                }
                Some(ConversationEvent::MessageComplete {
                    message,
                    stop_reason,
                    ..
                }) => break (message, stop_reason),
                Some(ConversationEvent::RequestFailed { .. }) => {
                    self.end(WorkflowEndReason::Error);
                    return;
                }
                Some(ConversationEvent::Dispose { conversation_id })
                    if conversation_id == *self.conversation.id() =>
                {
                    self.dispose();
                    return;
                }
                Some(_) => {}
                None => {
                    self.dispose();
                    return;
                }
            }
        };

        // From here on the workflow owns the conversation: each iteration
        // either feeds tool results back or drains the follow-up queue.
        loop {
            if self.state() != WorkflowState::Busy {
                return;
            }
            if stop_reason == StopReason::ToolUse {
                let Some(results) = self.execute_tool_calls(&message).await else {
                    // Abandoned between batches (cancel or dispose).
                    return;
                };
                if self.state() != WorkflowState::Busy {
                    return;
                }
                match self.conversation.send_message(results).await {
                    Ok(outcome) => {
                        source.drain();
                        message = outcome.message;
                        stop_reason = outcome.stop_reason;
                    }
                    Err(ConversationError::Canceled(_)) => {
                        self.end(WorkflowEndReason::Cancel);
                        return;
                    }
                    Err(e) => {
                        warn!(workflow = %self.id, error = %e, "tool-result request failed");
                        self.end(WorkflowEndReason::Error);
                        return;
                    }
                }
            } else {
                let next = self.queue.lock().unwrap().pop_front();
                match next {
                    Some(text) => {
                        self.emit(WorkflowEvent::MessageDequeued { text: text.clone() });
                        match self.conversation.prompt(text).await {
                            Ok(outcome) => {
                                source.drain();
                                message = outcome.message;
                                stop_reason = outcome.stop_reason;
                            }
                            Err(ConversationError::Canceled(_)) => {
                                self.end(WorkflowEndReason::Cancel);
                                return;
                            }
                            Err(e) => {
                                warn!(workflow = %self.id, error = %e, "queued prompt failed");
                                self.end(WorkflowEndReason::Error);
                                return;
                            }
                        }
                    }
                    None => {
                        self.end(WorkflowEndReason::Complete);
                        return;
                    }
                }
            }
        }
    }

    // ── Tool execution ────────────────────────────────────────────────────────

    /// Execute the assistant's tool calls in batches and return the result
    /// blocks in request order.  `None` means the workflow stopped being
    /// busy between batches and the remainder was abandoned.
    async fn execute_tool_calls(self: &Arc<Self>, message: &Message) -> Option<Vec<Content>> {
        let calls: Vec<PendingCall> = message
            .content
            .iter()
            .filter_map(|content| match &content.body {
                ContentBody::Tool {
                    tool_request_id,
                    tool,
                    params,
                } => Some(PendingCall {
                    tool_request_id: tool_request_id.clone(),
                    tool: tool.clone(),
                    params: params.clone(),
                }),
                _ => None,
            })
            .collect();

        // Partition into maximal runs of parallelizable calls; every
        // non-parallelizable call is its own singleton batch.
        let mut batches: Vec<Vec<PendingCall>> = Vec::new();
        let mut current: Vec<PendingCall> = Vec::new();
        for call in calls {
            if self.toolkit.parallelizable(&call.tool) {
                current.push(call);
            } else {
                if !current.is_empty() {
                    batches.push(std::mem::take(&mut current));
                }
                batches.push(vec![call]);
            }
        }
        if !current.is_empty() {
            batches.push(current);
        }

        let mut results: Vec<Content> = Vec::new();
        for batch in batches {
            if self.state() != WorkflowState::Busy {
                return None;
            }
            self.emit(WorkflowEvent::ToolBatchStart { size: batch.len() });
            let mut handles = Vec::with_capacity(batch.len());
            for call in batch {
                let handle = self.instance(&call.tool).map(|tool| {
                    let params = call.params.clone();
                    tokio::spawn(async move { tool.execute(params).await })
                });
                handles.push((call, handle));
            }
            // Await in request order so result blocks line up with the
            // triggering tool blocks regardless of completion order.
            let mut finished = 0usize;
            for (call, handle) in handles {
                let result = match handle {
                    None => ToolResult::fail("invalid tool"),
                    Some(handle) => match handle.await {
                        Ok(result) => result,
                        Err(e) => {
                            warn!(tool = %call.tool, error = %e, "tool task failed");
                            ToolResult::fail("Tool execution failed")
                        }
                    },
                };
                finished += 1;
                results.push(Content::tool_result(call.tool_request_id, call.tool, result));
            }
            self.emit(WorkflowEvent::ToolBatchEnd { size: finished });
        }
        Some(results)
    }

    /// Memoized tool instance for `name`; `None` for unknown tools.
    fn instance(self: &Arc<Self>, name: &str) -> Option<Arc<dyn Tool>> {
        let mut instances = self.instances.lock().unwrap();
        if let Some(tool) = instances.get(name) {
            return Some(Arc::clone(tool));
        }
        let class = self.toolkit.get(name)?;
        let ctx = ToolContext::new(
            Arc::new(WorkflowOrchestrator {
                workflow: Arc::downgrade(self),
            }),
            self.context_data.clone(),
        );
        let tool = class.instantiate(&ctx);
        instances.insert(name.to_string(), Arc::clone(&tool));
        Some(tool)
    }

    // ── Children ──────────────────────────────────────────────────────────────

    /// Construct a child workflow over `child_conversation` with this
    /// workflow's context data merged under the child's.  Child events
    /// bubble as `ChildWorkflowEvent`; a parent ending with reason
    /// `cancel` cascades the cancel to children still alive.
    pub fn spawn_child(
        self: &Arc<Self>,
        child_conversation: Arc<Conversation>,
        id: Option<String>,
        context_data: Map<String, Value>,
    ) -> Arc<Workflow> {
        let merged = match deep_merge(
            &Value::Object(self.context_data.clone()),
            &Value::Object(context_data),
        ) {
            Ok(Value::Object(m)) => m,
            Ok(_) | Err(_) => self.context_data.clone(),
        };
        let child = Workflow::with_depth(child_conversation, id, merged, self.depth + 1);

        // Bubble child events until the child disposes.
        let mut child_rx = child.subscribe();
        let parent_events = self.events.clone();
        let child_id = child.id.clone();
        tokio::spawn(async move {
            loop {
                match child_rx.recv().await {
                    Ok(event) => {
                        let done = matches!(&event, WorkflowEvent::Disposed { workflow_id } if *workflow_id == child_id);
                        let _ = parent_events.send(WorkflowEvent::ChildWorkflowEvent {
                            workflow_id: child_id.clone(),
                            event: Box::new(event),
                        });
                        if done {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        // Cascade a parent cancel to the child while it is still alive.
        let mut parent_rx = self.subscribe();
        let child_weak = Arc::downgrade(&child);
        tokio::spawn(async move {
            loop {
                match parent_rx.recv().await {
                    Ok(WorkflowEvent::End { reason }) => {
                        if reason == WorkflowEndReason::Cancel {
                            if let Some(child) = child_weak.upgrade() {
                                child.cancel();
                            }
                        }
                        break;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        child
    }

    /// Run a prompt in an isolated child conversation driven by its own
    /// workflow, and return the final assistant text.
    async fn spawn_agent(
        self: &Arc<Self>,
        prompt: String,
        system: Option<String>,
        fork_session: bool,
    ) -> anyhow::Result<String> {
        if self.depth >= MAX_AGENT_DEPTH {
            anyhow::bail!("maximum sub-agent depth ({MAX_AGENT_DEPTH}) reached");
        }
        let child_conversation = self.conversation.spawn_child(ChildOptions {
            fork_session,
            system,
            ..Default::default()
        })?;
        let child = self.spawn_child(Arc::clone(&child_conversation), None, Map::new());
        let mut child_events = child.subscribe();
        child.start(Some(prompt.clone()));

        debug!(workflow = %self.id, depth = self.depth + 1, "spawning sub-agent");
        let first = child_conversation.prompt(prompt).await;
        if let Err(e) = first {
            child.cancel();
            let _ = child_conversation.dispose();
            return Err(e).context("sub-agent first turn failed");
        }

        // The child workflow continues the loop if tools were requested;
        // wait for it to end either way.
        let reason = loop {
            match child_events.recv().await {
                Ok(WorkflowEvent::End { reason }) => break reason,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break WorkflowEndReason::Error,
            }
        };

        let text = child_conversation
            .messages()
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(|m| m.text())
            .unwrap_or_default();
        let _ = child_conversation.dispose();

        match reason {
            WorkflowEndReason::Complete => Ok(text),
            WorkflowEndReason::Error => anyhow::bail!("sub-agent failed"),
            WorkflowEndReason::Cancel => anyhow::bail!("sub-agent cancelled"),
        }
    }
}

/// The orchestrator seam handed to tools; holds the workflow weakly so a
/// memoized tool instance never keeps its workflow alive.
struct WorkflowOrchestrator {
    workflow: Weak<Workflow>,
}

#[async_trait]
impl Orchestrator for WorkflowOrchestrator {
    async fn spawn_agent(
        &self,
        prompt: String,
        system: Option<String>,
        fork_session: bool,
    ) -> anyhow::Result<String> {
        let workflow = self
            .workflow
            .upgrade()
            .context("workflow already disposed")?;
        workflow.spawn_agent(prompt, system, fork_session).await
    }

    fn queue_follow_up(&self, text: String) {
        if let Some(workflow) = self.workflow.upgrade() {
            workflow.queue_message(text);
        }
    }
}
