// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::conversation::Conversation;
use crate::events::ConversationEvent;
use crate::workflow::{Workflow, WorkflowEvent};

/// Events emitted by a [`WorkflowManager`].
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    /// The aggregate busy indicator changed.
    StateChange { busy: bool },
    /// An event from the currently managed workflow.
    Workflow(WorkflowEvent),
    Disposed,
}

struct ManagerInner {
    current: Option<Arc<Workflow>>,
    /// Feed for the current workflow's driver.  The manager's own
    /// subscription predates every request, so forwarding through this
    /// channel cannot miss a completion the way a late subscription could.
    feed: Option<mpsc::UnboundedSender<ConversationEvent>>,
    workflow_active: bool,
    checkpoint_active: bool,
    /// Id of the checkpoint's own child conversation, captured from the
    /// `CreateChild` that follows `CheckpointBegin`.  Subagent children
    /// can come and go on the same conversation while a checkpoint runs;
    /// only this child's dispose ends the checkpoint-busy window.
    checkpoint_child: Option<String>,
    busy: bool,
    disposed: bool,
}

/// Lifecycle broker between a conversation and per-turn workflows.
///
/// On each `prompt_send` with no workflow active it instantiates one,
/// bubbles its events, and tears it down when the workflow disposes.
/// Checkpoint summarization also counts as busy, so observers get one
/// aggregate "system busy" indicator.
pub struct WorkflowManager {
    conversation: Arc<Conversation>,
    context_data: Map<String, Value>,
    inner: Mutex<ManagerInner>,
    events: broadcast::Sender<ManagerEvent>,
}

impl WorkflowManager {
    /// Attach a manager to a conversation.  The observer task lives until
    /// the conversation disposes.
    pub fn attach(conversation: Arc<Conversation>, context_data: Map<String, Value>) -> Arc<Self> {
        let manager = Arc::new(Self {
            conversation: Arc::clone(&conversation),
            context_data,
            inner: Mutex::new(ManagerInner {
                current: None,
                feed: None,
                workflow_active: false,
                checkpoint_active: false,
                checkpoint_child: None,
                busy: false,
                disposed: false,
            }),
            events: broadcast::channel(256).0,
        });

        let observer = Arc::clone(&manager);
        let mut rx = conversation.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if observer.handle(event) {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        manager
    }

    pub fn is_busy(&self) -> bool {
        self.inner.lock().unwrap().busy
    }

    pub fn current_workflow(&self) -> Option<Arc<Workflow>> {
        self.inner.lock().unwrap().current.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ManagerEvent) {
        let _ = self.events.send(event);
    }

    /// React to one conversation event.  Returns `true` when the manager
    /// should stop observing.
    fn handle(self: &Arc<Self>, event: ConversationEvent) -> bool {
        let stop = match &event {
            ConversationEvent::PromptSend { .. } => {
                self.ensure_workflow();
                false
            }
            ConversationEvent::CheckpointBegin => {
                let mut inner = self.inner.lock().unwrap();
                inner.checkpoint_active = true;
                inner.checkpoint_child = None;
                drop(inner);
                self.update_busy();
                false
            }
            // The conversation announces the checkpoint child right after
            // `CheckpointBegin`; remember its id so an unrelated child
            // (e.g. a subagent spawned mid-checkpoint) cannot be mistaken
            // for it.
            ConversationEvent::CreateChild { child_id } => {
                let mut inner = self.inner.lock().unwrap();
                if inner.checkpoint_active && inner.checkpoint_child.is_none() {
                    inner.checkpoint_child = Some(child_id.clone());
                }
                false
            }
            // The checkpoint child's dispose bubbles up as a child event;
            // that is the moment checkpoint work is over (success or not).
            ConversationEvent::ChildEvent { child_id, event }
                if matches!(&**event, ConversationEvent::Dispose { .. }) =>
            {
                let mut inner = self.inner.lock().unwrap();
                if inner.checkpoint_active
                    && inner.checkpoint_child.as_deref() == Some(child_id.as_str())
                {
                    inner.checkpoint_active = false;
                    inner.checkpoint_child = None;
                    drop(inner);
                    self.update_busy();
                }
                false
            }
            ConversationEvent::Dispose { conversation_id }
                if conversation_id == self.conversation.id() =>
            {
                self.dispose();
                true
            }
            _ => false,
        };

        // Keep the current workflow's driver fed regardless of which arm
        // ran; it filters for what it needs.
        let feed = self.inner.lock().unwrap().feed.clone();
        if let Some(feed) = feed {
            let _ = feed.send(event);
        }
        stop
    }

    fn ensure_workflow(self: &Arc<Self>) {
        let (workflow, feed_rx) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.disposed || inner.workflow_active {
                return;
            }
            let workflow = Workflow::new(
                Arc::clone(&self.conversation),
                None,
                self.context_data.clone(),
            );
            let (feed_tx, feed_rx) = mpsc::unbounded_channel();
            inner.current = Some(Arc::clone(&workflow));
            inner.feed = Some(feed_tx);
            inner.workflow_active = true;
            (workflow, feed_rx)
        };
        debug!(workflow = %workflow.id(), "manager created workflow");
        self.update_busy();

        // Bubble workflow events; release the workflow when it disposes.
        let mut wf_rx = workflow.subscribe();
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match wf_rx.recv().await {
                    Ok(event) => {
                        let done = matches!(event, WorkflowEvent::Disposed { .. });
                        manager.emit(ManagerEvent::Workflow(event));
                        if done {
                            let mut inner = manager.inner.lock().unwrap();
                            inner.workflow_active = false;
                            inner.current = None;
                            inner.feed = None;
                            drop(inner);
                            manager.update_busy();
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        workflow.start_with_events(feed_rx, None);
    }

    fn update_busy(&self) {
        let changed = {
            let mut inner = self.inner.lock().unwrap();
            let busy = inner.workflow_active || inner.checkpoint_active;
            if busy == inner.busy {
                None
            } else {
                inner.busy = busy;
                Some(busy)
            }
        };
        if let Some(busy) = changed {
            self.emit(ManagerEvent::StateChange { busy });
        }
    }

    fn dispose(&self) {
        let workflow = {
            let mut inner = self.inner.lock().unwrap();
            if inner.disposed {
                return;
            }
            inner.disposed = true;
            inner.workflow_active = false;
            inner.checkpoint_active = false;
            inner.checkpoint_child = None;
            inner.busy = false;
            inner.feed = None;
            inner.current.take()
        };
        if let Some(workflow) = workflow {
            workflow.cancel();
        }
        self.emit(ManagerEvent::Disposed);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use parley_model::{Message, ScriptedProvider};

    use crate::conversation::Conversation;

    use super::*;

    fn manager_on(conversation: Arc<Conversation>) -> Arc<WorkflowManager> {
        WorkflowManager::attach(conversation, Map::new())
    }

    fn child_dispose(child_id: &str) -> ConversationEvent {
        ConversationEvent::ChildEvent {
            child_id: child_id.into(),
            event: Box::new(ConversationEvent::Dispose {
                conversation_id: child_id.into(),
            }),
        }
    }

    #[tokio::test]
    async fn unrelated_child_dispose_does_not_end_the_checkpoint_window() {
        let convo = Conversation::builder(Arc::new(ScriptedProvider::always_text("x"))).build();
        let manager = manager_on(Arc::clone(&convo));

        manager.handle(ConversationEvent::CheckpointBegin);
        manager.handle(ConversationEvent::CreateChild {
            child_id: "cp-child".into(),
        });
        assert!(manager.is_busy());

        // A subagent's child conversation disposing mid-checkpoint must
        // not flip the aggregate indicator.
        manager.handle(child_dispose("subagent-child"));
        assert!(manager.is_busy());

        manager.handle(child_dispose("cp-child"));
        assert!(!manager.is_busy());
    }

    #[tokio::test]
    async fn later_children_are_not_mistaken_for_the_checkpoint_child() {
        let convo = Conversation::builder(Arc::new(ScriptedProvider::always_text("x"))).build();
        let manager = manager_on(Arc::clone(&convo));

        manager.handle(ConversationEvent::CheckpointBegin);
        manager.handle(ConversationEvent::CreateChild {
            child_id: "cp-child".into(),
        });
        // A second child created while the checkpoint runs.
        manager.handle(ConversationEvent::CreateChild {
            child_id: "another".into(),
        });

        manager.handle(child_dispose("another"));
        assert!(manager.is_busy(), "only the first child ends the window");
        manager.handle(child_dispose("cp-child"));
        assert!(!manager.is_busy());
    }

    #[tokio::test]
    async fn manager_cycles_busy_around_a_real_checkpoint() {
        let convo = Conversation::builder(Arc::new(ScriptedProvider::always_text("Summary.")))
            .build();
        convo
            .load(
                vec![Message::user("q"), Message::assistant("a")],
                None,
            )
            .unwrap();
        let manager = manager_on(Arc::clone(&convo));
        let mut events = manager.subscribe();

        convo.checkpoint().await.unwrap();

        timeout(Duration::from_secs(5), async {
            let mut saw_busy = false;
            loop {
                match events.recv().await.unwrap() {
                    ManagerEvent::StateChange { busy: true } => saw_busy = true,
                    ManagerEvent::StateChange { busy: false } if saw_busy => break,
                    _ => continue,
                }
            }
        })
        .await
        .expect("manager never cycled busy→idle around the checkpoint");
        assert!(!manager.is_busy());
    }
}
