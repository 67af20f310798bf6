// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use parley_model::{
    stream_channel, CancellationTokenSource, CheckpointState, Content, Message, MessageAssembler,
    ModelProvider, ModelRequest, OperationCanceled, RequestError, Role, StopReason, StreamEnd,
    StreamEvent, Usage,
};
use parley_tools::Toolkit;

use crate::checkpoint::{SummarizationContext, SummarizationStrategy, TranscriptStrategy};
use crate::error::ConversationError;
use crate::events::ConversationEvent;
use crate::policy::{default_policy, Policy, RequestCall, RequestFuture};
use crate::transform::{CompositeTransformer, TransformContext};

const EVENT_CAPACITY: usize = 1024;

/// Conversation lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    Idle,
    AwaitingResponse,
    StreamingResponse,
    /// A cancel was requested; the in-flight request is being torn down.
    Stopping,
    Disposed,
}

/// What a completed request hands back to the caller.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub request_id: String,
    /// The finalized assistant message, as appended to history.
    pub message: Message,
    pub stop_reason: StopReason,
    pub usage: Option<Usage>,
}

/// Options for [`Conversation::spawn_child`].
#[derive(Debug, Clone, Default)]
pub struct ChildOptions {
    /// Preload the child with a copy of the parent's messages (and
    /// checkpoint state).
    pub fork_session: bool,
    pub id: Option<String>,
    /// System prompt override; defaults to the parent's.
    pub system: Option<String>,
    pub is_checkpoint: bool,
}

enum RequestEnd {
    Complete(Box<TurnOutcome>),
    Failed(RequestError),
    Canceled,
}

/// A single model conversation: owns its history and checkpoint state,
/// runs policy-wrapped requests end-to-end, emits events, and spawns
/// children whose events bubble up the tree.
pub struct Conversation {
    id: String,
    provider: Arc<dyn ModelProvider>,
    policy: Arc<dyn Policy>,
    transformer: Arc<CompositeTransformer>,
    summarizer: Arc<dyn SummarizationStrategy>,
    toolkit: Arc<Toolkit>,
    system: Mutex<Option<String>>,
    is_checkpoint: bool,
    state: Mutex<ConversationState>,
    history: Mutex<Vec<Message>>,
    checkpoint: Mutex<Option<CheckpointState>>,
    active_cancel: Mutex<Option<Arc<CancellationTokenSource>>>,
    events: broadcast::Sender<ConversationEvent>,
    children: Mutex<Vec<Arc<Conversation>>>,
}

/// Configures and creates a [`Conversation`].
pub struct ConversationBuilder {
    provider: Arc<dyn ModelProvider>,
    policy: Option<Arc<dyn Policy>>,
    transformer: Option<Arc<CompositeTransformer>>,
    summarizer: Option<Arc<dyn SummarizationStrategy>>,
    toolkit: Option<Arc<Toolkit>>,
    system: Option<String>,
    id: Option<String>,
}

impl ConversationBuilder {
    pub fn new(provider: Arc<dyn ModelProvider>) -> Self {
        Self {
            provider,
            policy: None,
            transformer: None,
            summarizer: None,
            toolkit: None,
            system: None,
            id: None,
        }
    }

    pub fn policy(mut self, policy: Arc<dyn Policy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn transformer(mut self, transformer: Arc<CompositeTransformer>) -> Self {
        self.transformer = Some(transformer);
        self
    }

    pub fn summarizer(mut self, summarizer: Arc<dyn SummarizationStrategy>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn toolkit(mut self, toolkit: Arc<Toolkit>) -> Self {
        self.toolkit = Some(toolkit);
        self
    }

    pub fn system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn build(self) -> Arc<Conversation> {
        Arc::new(Conversation {
            id: self.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            provider: self.provider,
            policy: self.policy.unwrap_or_else(default_policy),
            transformer: self
                .transformer
                .unwrap_or_else(|| Arc::new(CompositeTransformer::default())),
            summarizer: self.summarizer.unwrap_or_else(|| Arc::new(TranscriptStrategy)),
            toolkit: self.toolkit.unwrap_or_default(),
            system: Mutex::new(self.system),
            is_checkpoint: false,
            state: Mutex::new(ConversationState::Idle),
            history: Mutex::new(Vec::new()),
            checkpoint: Mutex::new(None),
            active_cancel: Mutex::new(None),
            events: broadcast::channel(EVENT_CAPACITY).0,
            children: Mutex::new(Vec::new()),
        })
    }
}

impl Conversation {
    pub fn builder(provider: Arc<dyn ModelProvider>) -> ConversationBuilder {
        ConversationBuilder::new(provider)
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ConversationState {
        *self.state.lock().unwrap()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.history.lock().unwrap().clone()
    }

    pub fn checkpoint_state(&self) -> Option<CheckpointState> {
        self.checkpoint.lock().unwrap().clone()
    }

    pub fn system(&self) -> Option<String> {
        self.system.lock().unwrap().clone()
    }

    pub fn is_checkpoint(&self) -> bool {
        self.is_checkpoint
    }

    pub fn toolkit(&self) -> Arc<Toolkit> {
        Arc::clone(&self.toolkit)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ConversationEvent) {
        let _ = self.events.send(event);
    }

    // ── State machine ─────────────────────────────────────────────────────────

    fn require_idle(&self, operation: &'static str) -> Result<(), ConversationError> {
        let state = self.state();
        if state == ConversationState::Idle {
            Ok(())
        } else {
            Err(ConversationError::InvalidState { operation, state })
        }
    }

    fn transition(
        &self,
        from: ConversationState,
        to: ConversationState,
        operation: &'static str,
    ) -> Result<(), ConversationError> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != from {
                return Err(ConversationError::InvalidState {
                    operation,
                    state: *state,
                });
            }
            *state = to;
        }
        self.emit(ConversationEvent::StateChange { from, to });
        Ok(())
    }

    /// `AwaitingResponse` → `StreamingResponse` on the first stream event;
    /// a no-op once a cancel has moved the state elsewhere.
    fn advance_streaming(&self) {
        let changed = {
            let mut state = self.state.lock().unwrap();
            if *state == ConversationState::AwaitingResponse {
                *state = ConversationState::StreamingResponse;
                true
            } else {
                false
            }
        };
        if changed {
            self.emit(ConversationEvent::StateChange {
                from: ConversationState::AwaitingResponse,
                to: ConversationState::StreamingResponse,
            });
        }
    }

    /// Return to `Idle` from any transient request state.
    fn settle_idle(&self) {
        let from = {
            let mut state = self.state.lock().unwrap();
            match *state {
                ConversationState::Idle | ConversationState::Disposed => return,
                other => {
                    *state = ConversationState::Idle;
                    other
                }
            }
        };
        self.emit(ConversationEvent::StateChange {
            from,
            to: ConversationState::Idle,
        });
    }

    // ── Requests ──────────────────────────────────────────────────────────────

    /// Send a plain-text user prompt and run the request to completion.
    pub async fn prompt(&self, text: impl Into<String>) -> Result<TurnOutcome, ConversationError> {
        self.send_message(vec![Content::text(text.into())]).await
    }

    /// Send a user message (any legal user content) and run the request to
    /// completion.  Requires `Idle`; on success exactly two messages have
    /// been appended (the user message and the finalized assistant reply).
    pub async fn send_message(
        &self,
        content: Vec<Content>,
    ) -> Result<TurnOutcome, ConversationError> {
        let mut user_message = Message::new(Role::User, content)?;
        user_message.stamp();

        self.transition(
            ConversationState::Idle,
            ConversationState::AwaitingResponse,
            "send message",
        )?;

        let request_id = Uuid::new_v4().to_string();
        let end = self.drive_request(&request_id, user_message).await;

        *self.active_cancel.lock().unwrap() = None;
        // Observers see the completion only after the state is idle again,
        // so a follow-up send from a handler is immediately legal.
        self.settle_idle();

        match end {
            RequestEnd::Complete(outcome) => {
                self.emit(ConversationEvent::MessageComplete {
                    request_id: outcome.request_id.clone(),
                    message: outcome.message.clone(),
                    stop_reason: outcome.stop_reason,
                    usage: outcome.usage,
                });
                Ok(*outcome)
            }
            RequestEnd::Failed(error) => {
                self.emit(ConversationEvent::RequestFailed {
                    request_id: Some(request_id),
                    error: error.clone(),
                });
                Err(ConversationError::Request(error))
            }
            RequestEnd::Canceled => Err(ConversationError::Canceled(OperationCanceled)),
        }
    }

    async fn drive_request(&self, request_id: &str, user_message: Message) -> RequestEnd {
        // Compose the outgoing list: history plus the new user message.
        let mut outgoing = self.history.lock().unwrap().clone();
        outgoing.push(user_message.clone());

        // Provider transformers first (wire quirks, no context), then the
        // conversation pipeline with the active checkpoint.
        let provider_transformers = self.provider.context_transformers();
        for transformer in &provider_transformers {
            outgoing = transformer.transform_prompt(outgoing);
        }
        let ctx = TransformContext {
            checkpoint: self.checkpoint.lock().unwrap().clone(),
        };
        outgoing = self.transformer.transform_prompt(outgoing, &ctx);

        let request = ModelRequest {
            messages: outgoing,
            tools: self.toolkit.definitions(),
            system: self.system.lock().unwrap().clone(),
        };

        // Fresh cancellation source for this request; `cancel_response`
        // trips it via `active_cancel`.
        let source = Arc::new(CancellationTokenSource::new());
        let token = source.token();
        *self.active_cancel.lock().unwrap() = Some(source);

        self.emit(ConversationEvent::PromptSend {
            request_id: request_id.to_string(),
            message: user_message.clone(),
        });

        let (listener, mut rx) = stream_channel();
        let call: RequestCall = {
            let provider = Arc::clone(&self.provider);
            let request = request.clone();
            let listener = listener.clone();
            let token = token.clone();
            Arc::new(move || {
                let provider = Arc::clone(&provider);
                let request = request.clone();
                let listener = listener.clone();
                let token = token.clone();
                Box::pin(async move { provider.execute_request(request, listener, token).await })
                    as RequestFuture
            })
        };

        let outcome = match self.policy.execute(&token, call).await {
            Ok(outcome) => outcome,
            Err(OperationCanceled) => return RequestEnd::Canceled,
        };
        match outcome.result {
            Ok(()) => self.emit(ConversationEvent::RequestSuccess {
                request_id: request_id.to_string(),
                metadata: outcome.metadata,
            }),
            Err(error) => return RequestEnd::Failed(error),
        }

        // Streaming has been arranged; consume events until a terminal one,
        // racing against cancellation so a stop surfaces promptly even if
        // the provider never observes the token.
        let mut assembler = MessageAssembler::new();
        let end: StreamEnd = loop {
            let event = tokio::select! {
                biased;
                _ = token.await_cancellation() => return RequestEnd::Canceled,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => {
                        return RequestEnd::Failed(RequestError::stream(
                            "stream ended without a terminal event",
                        ))
                    }
                },
            };
            assembler.apply(&event);
            match event {
                StreamEvent::BeforeRequest(raw) => self.emit(ConversationEvent::BeforeRequest {
                    request_id: request_id.to_string(),
                    raw,
                }),
                StreamEvent::RequestRaw(raw) => self.emit(ConversationEvent::RawRequest {
                    request_id: request_id.to_string(),
                    raw,
                }),
                StreamEvent::StreamRaw(chunk) => self.emit(ConversationEvent::RawStream {
                    request_id: request_id.to_string(),
                    chunk,
                }),
                StreamEvent::ResponseRaw(raw) => self.emit(ConversationEvent::RawResponse {
                    request_id: request_id.to_string(),
                    raw,
                }),
                StreamEvent::StartMessage(_) => {
                    self.advance_streaming();
                    self.emit(ConversationEvent::StreamStart {
                        request_id: request_id.to_string(),
                    });
                }
                StreamEvent::UpdateMessage(_)
                | StreamEvent::StartContent { .. }
                | StreamEvent::UpdateContent { .. }
                | StreamEvent::CompleteContent { .. } => {
                    self.emit(ConversationEvent::StreamUpdate {
                        request_id: request_id.to_string(),
                        message: assembler.snapshot(),
                    });
                }
                StreamEvent::CompleteMessage(end) => break end,
                StreamEvent::Error(error) => {
                    // Never retried: by the time bytes streamed, replaying
                    // the request would not be idempotent.  Surface how far
                    // assembly got instead.
                    let blocks = assembler.block_count();
                    let error = if blocks > 0 {
                        RequestError {
                            message: format!(
                                "{} (partial response: {blocks} content blocks assembled)",
                                error.message
                            ),
                            ..error
                        }
                    } else {
                        error
                    };
                    return RequestEnd::Failed(error);
                }
                StreamEvent::Cancelled => return RequestEnd::Canceled,
            }
        };

        let mut assistant = assembler.finalize();
        for transformer in &provider_transformers {
            assistant = transformer.transform_completion(assistant);
        }
        assistant = self.transformer.transform_completion(assistant);

        // Post-transform stop reason: the presence of tool requests wins
        // over whatever the provider reported.
        let stop_reason = if assistant.has_tool_requests() {
            StopReason::ToolUse
        } else {
            end.stop_reason
        };
        assistant.stamp();

        {
            let mut history = self.history.lock().unwrap();
            history.push(user_message);
            history.push(assistant.clone());
        }
        debug!(
            conversation = %self.id,
            request_id,
            stop_reason = %stop_reason,
            "request complete"
        );

        RequestEnd::Complete(Box::new(TurnOutcome {
            request_id: request_id.to_string(),
            message: assistant,
            stop_reason,
            usage: end.usage,
        }))
    }

    /// Request cancellation of the in-flight response.  Legal only while a
    /// request is running.
    pub fn cancel_response(&self) -> Result<(), ConversationError> {
        let from = {
            let mut state = self.state.lock().unwrap();
            match *state {
                ConversationState::AwaitingResponse | ConversationState::StreamingResponse => {
                    let from = *state;
                    *state = ConversationState::Stopping;
                    from
                }
                other => {
                    return Err(ConversationError::InvalidState {
                        operation: "cancel response",
                        state: other,
                    })
                }
            }
        };
        self.emit(ConversationEvent::StateChange {
            from,
            to: ConversationState::Stopping,
        });
        if let Some(source) = self.active_cancel.lock().unwrap().as_ref() {
            if let Err(e) = source.cancel() {
                warn!(conversation = %self.id, error = %e, "cancel raced with request teardown");
            }
        }
        Ok(())
    }

    // ── History management ────────────────────────────────────────────────────

    /// Drop all messages and any checkpoint.  Requires `Idle`.
    pub fn clear(&self) -> Result<(), ConversationError> {
        self.require_idle("clear")?;
        self.history.lock().unwrap().clear();
        *self.checkpoint.lock().unwrap() = None;
        Ok(())
    }

    /// Replace the whole history (and optionally the checkpoint state).
    /// Requires `Idle`.  A checkpoint whose boundary message is not in the
    /// loaded list is rejected — that invariant belongs to the loader.
    pub fn load(
        &self,
        messages: Vec<Message>,
        checkpoint: Option<CheckpointState>,
    ) -> Result<(), ConversationError> {
        self.require_idle("load")?;
        if let Some(cp) = &checkpoint {
            if !messages.iter().any(|m| m.stable_id() == cp.message_id) {
                return Err(ConversationError::Checkpoint(format!(
                    "checkpoint boundary {} not present in loaded messages",
                    cp.message_id
                )));
            }
        }
        let mut messages = messages;
        for message in &mut messages {
            message.stamp();
        }
        *self.history.lock().unwrap() = messages;
        *self.checkpoint.lock().unwrap() = checkpoint;
        Ok(())
    }

    // ── Children ──────────────────────────────────────────────────────────────

    /// Create a child conversation: cloned provider, shared policy,
    /// transformer, summarizer and toolkit.  Every child event bubbles to
    /// this conversation as a `ChildEvent`, transitively.
    pub fn spawn_child(
        self: &Arc<Self>,
        options: ChildOptions,
    ) -> Result<Arc<Conversation>, ConversationError> {
        {
            let state = self.state.lock().unwrap();
            if *state == ConversationState::Disposed {
                return Err(ConversationError::InvalidState {
                    operation: "spawn child",
                    state: *state,
                });
            }
        }
        let child = Arc::new(Conversation {
            id: options
                .id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            provider: self.provider.clone_provider(),
            policy: Arc::clone(&self.policy),
            transformer: Arc::clone(&self.transformer),
            summarizer: Arc::clone(&self.summarizer),
            toolkit: Arc::clone(&self.toolkit),
            system: Mutex::new(
                options
                    .system
                    .or_else(|| self.system.lock().unwrap().clone()),
            ),
            is_checkpoint: options.is_checkpoint,
            state: Mutex::new(ConversationState::Idle),
            history: Mutex::new(if options.fork_session {
                self.history.lock().unwrap().clone()
            } else {
                Vec::new()
            }),
            checkpoint: Mutex::new(if options.fork_session {
                self.checkpoint.lock().unwrap().clone()
            } else {
                None
            }),
            active_cancel: Mutex::new(None),
            events: broadcast::channel(EVENT_CAPACITY).0,
            children: Mutex::new(Vec::new()),
        });
        self.children.lock().unwrap().push(Arc::clone(&child));
        self.emit(ConversationEvent::CreateChild {
            child_id: child.id.clone(),
        });

        // Bubble every child event; detach only after the child's final
        // dispose event has been forwarded (deferred one tick so observers
        // of the parent stream see it first).
        let mut rx = child.subscribe();
        let parent_events = self.events.clone();
        let child_id = child.id.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let is_dispose = matches!(
                            &event,
                            ConversationEvent::Dispose { conversation_id }
                                if *conversation_id == child_id
                        );
                        let _ = parent_events.send(ConversationEvent::ChildEvent {
                            child_id: child_id.clone(),
                            event: Box::new(event),
                        });
                        if is_dispose {
                            tokio::task::yield_now().await;
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(child)
    }

    // ── Checkpointing ─────────────────────────────────────────────────────────

    /// Summarize everything since the last checkpoint into a new
    /// [`CheckpointState`].  Requires `Idle` and at least one new message.
    ///
    /// The summary is produced by a dedicated checkpoint child: it is
    /// preloaded with all but the last strategy message, prompted with the
    /// last one, and disposed afterwards.
    pub async fn checkpoint(self: &Arc<Self>) -> Result<CheckpointState, ConversationError> {
        self.require_idle("checkpoint")?;
        let previous = self.checkpoint.lock().unwrap().clone();
        let since: Vec<Message> = {
            let history = self.history.lock().unwrap();
            let start = previous
                .as_ref()
                .and_then(|cp| {
                    history
                        .iter()
                        .position(|m| m.stable_id() == cp.message_id)
                        .map(|i| i + 1)
                })
                .unwrap_or(0);
            history[start..].to_vec()
        };
        let Some(boundary) = since.last() else {
            return Err(ConversationError::Checkpoint(
                "no new messages since last checkpoint".into(),
            ));
        };
        let boundary_id = boundary.stable_id();

        self.emit(ConversationEvent::CheckpointBegin);
        let result = self
            .run_checkpoint(&since, previous.as_ref(), boundary_id)
            .await;
        match result {
            Ok(state) => {
                *self.checkpoint.lock().unwrap() = Some(state.clone());
                self.emit(ConversationEvent::CheckpointComplete(state.clone()));
                Ok(state)
            }
            Err(error) => Err(error),
        }
    }

    async fn run_checkpoint(
        self: &Arc<Self>,
        since: &[Message],
        previous: Option<&CheckpointState>,
        boundary_id: String,
    ) -> Result<CheckpointState, ConversationError> {
        let system = self.system.lock().unwrap().clone();
        let prompt = self.summarizer.build_prompt(&SummarizationContext {
            session_id: &self.id,
            messages: since,
            previous_checkpoint: previous,
            system: system.as_deref(),
            context: None,
        });
        let Some(last) = prompt.last() else {
            return Err(ConversationError::Strategy(
                "summarization strategy returned no messages".into(),
            ));
        };
        if last.role != Role::User {
            return Err(ConversationError::Strategy(
                "summarization prompt must end with a user message".into(),
            ));
        }

        let child = self.spawn_child(ChildOptions {
            is_checkpoint: true,
            ..Default::default()
        })?;
        let preload = prompt[..prompt.len() - 1].to_vec();
        let last_content = last.content.clone();

        let result = async {
            if !preload.is_empty() {
                child.load(preload, None)?;
            }
            let outcome = child.send_message(last_content).await?;
            let summary = outcome.message.text();
            if summary.is_empty() {
                return Err(ConversationError::Checkpoint(
                    "summarization produced an empty summary".into(),
                ));
            }
            Ok(CheckpointState {
                message_id: boundary_id,
                summary,
            })
        }
        .await;

        if let Err(e) = child.dispose() {
            self.emit(ConversationEvent::LifecycleError {
                operation: "dispose checkpoint child",
                message: e.to_string(),
            });
        }
        result
    }

    // ── Disposal ──────────────────────────────────────────────────────────────

    /// Tear the conversation down: cancel any in-flight request, dispose
    /// owned children, emit the final events.  Double dispose is an error.
    pub fn dispose(&self) -> Result<(), ConversationError> {
        let from = {
            let mut state = self.state.lock().unwrap();
            if *state == ConversationState::Disposed {
                return Err(ConversationError::InvalidState {
                    operation: "dispose",
                    state: *state,
                });
            }
            let from = *state;
            *state = ConversationState::Disposed;
            from
        };
        if let Some(source) = self.active_cancel.lock().unwrap().take() {
            let _ = source.cancel();
        }
        let children: Vec<Arc<Conversation>> =
            std::mem::take(&mut *self.children.lock().unwrap());
        for child in children {
            // Children already disposed on their own are fine.
            let _ = child.dispose();
        }
        self.emit(ConversationEvent::StateChange {
            from,
            to: ConversationState::Disposed,
        });
        self.emit(ConversationEvent::Dispose {
            conversation_id: self.id.clone(),
        });
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use parley_model::ScriptedProvider;

    use super::*;

    fn conversation() -> Arc<Conversation> {
        Conversation::builder(Arc::new(ScriptedProvider::always_text("hello"))).build()
    }

    #[test]
    fn new_conversation_is_idle_and_empty() {
        let convo = conversation();
        assert_eq!(convo.state(), ConversationState::Idle);
        assert!(convo.messages().is_empty());
        assert!(convo.checkpoint_state().is_none());
    }

    #[test]
    fn cancel_while_idle_is_invalid() {
        let convo = conversation();
        let err = convo.cancel_response().unwrap_err();
        assert!(matches!(err, ConversationError::InvalidState { .. }));
    }

    #[test]
    fn clear_requires_idle_and_resets_checkpoint() {
        let convo = conversation();
        convo
            .load(
                vec![Message::user("a"), Message::assistant("b")],
                None,
            )
            .unwrap();
        convo.clear().unwrap();
        assert!(convo.messages().is_empty());
    }

    #[test]
    fn load_validates_checkpoint_boundary() {
        let convo = conversation();
        let err = convo
            .load(
                vec![Message::user("a")],
                Some(CheckpointState {
                    message_id: "missing".into(),
                    summary: "S".into(),
                }),
            )
            .unwrap_err();
        assert!(matches!(err, ConversationError::Checkpoint(_)));

        let mut boundary = Message::user("a");
        boundary.stamp();
        let id = boundary.stable_id();
        convo
            .load(
                vec![boundary],
                Some(CheckpointState {
                    message_id: id,
                    summary: "S".into(),
                }),
            )
            .unwrap();
        assert!(convo.checkpoint_state().is_some());
    }

    #[test]
    fn double_dispose_is_an_error() {
        let convo = conversation();
        convo.dispose().unwrap();
        assert!(matches!(
            convo.dispose(),
            Err(ConversationError::InvalidState { .. })
        ));
    }

    #[test]
    fn disposed_conversation_rejects_spawn() {
        let convo = conversation();
        convo.dispose().unwrap();
        assert!(convo.spawn_child(ChildOptions::default()).is_err());
    }

    #[tokio::test]
    async fn send_while_busy_is_invalid_state() {
        // Drive the state by hand: a second send must be rejected while the
        // first is in flight.  Use a conversation whose provider never
        // completes within this test's window.
        let convo = conversation();
        {
            let mut state = convo.state.lock().unwrap();
            *state = ConversationState::AwaitingResponse;
        }
        let err = convo.prompt("second").await.unwrap_err();
        assert!(matches!(err, ConversationError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn spawn_child_forks_history_on_request() {
        let convo = conversation();
        convo
            .load(vec![Message::user("q"), Message::assistant("a")], None)
            .unwrap();

        let forked = convo
            .spawn_child(ChildOptions {
                fork_session: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(forked.messages().len(), 2);

        let fresh = convo.spawn_child(ChildOptions::default()).unwrap();
        assert!(fresh.messages().is_empty());
    }

    #[tokio::test]
    async fn child_inherits_system_unless_overridden() {
        let convo = Conversation::builder(Arc::new(ScriptedProvider::always_text("x")))
            .system("be brief")
            .build();
        let child = convo.spawn_child(ChildOptions::default()).unwrap();
        assert_eq!(child.system().as_deref(), Some("be brief"));

        let overridden = convo
            .spawn_child(ChildOptions {
                system: Some("be thorough".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(overridden.system().as_deref(), Some("be thorough"));
    }
}
