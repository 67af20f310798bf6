// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use parley_model::Usage;

use crate::conversation::Conversation;
use crate::events::ConversationEvent;

/// A snapshot of token consumption across a conversation tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenStats {
    /// Usage reported by the most recent completed request.
    pub last_request: Usage,
    pub total_input: u64,
    pub total_output: u64,
}

impl TokenStats {
    pub fn total(&self) -> u64 {
        self.total_input + self.total_output
    }
}

/// Passive usage aggregation over a conversation and all its descendants.
///
/// Observes `message_complete` directly and through any depth of bubbled
/// `child_event`s; missing usage fields count as zero.  Emits a
/// `stats_update` snapshot on every change.
pub struct TokenTracker {
    stats: Arc<Mutex<TokenStats>>,
    updates: broadcast::Sender<TokenStats>,
}

impl TokenTracker {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(64);
        Self {
            stats: Arc::new(Mutex::new(TokenStats::default())),
            updates,
        }
    }

    /// Start observing a conversation tree.  One tracker may be attached to
    /// several conversations; their usage accumulates into the same totals.
    pub fn attach(self: &Arc<Self>, conversation: &Conversation) {
        let mut rx = conversation.subscribe();
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let ConversationEvent::MessageComplete {
                            usage: Some(usage), ..
                        } = event.innermost()
                        {
                            tracker.record(usage);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Record one request's usage.
    pub fn record(&self, usage: &Usage) {
        let snapshot = {
            let mut stats = self.stats.lock().unwrap();
            stats.last_request = *usage;
            stats.total_input += usage.input();
            stats.total_output += usage.output();
            stats.clone()
        };
        let _ = self.updates.send(snapshot);
    }

    pub fn stats(&self) -> TokenStats {
        self.stats.lock().unwrap().clone()
    }

    /// Subscribe to `stats_update` snapshots.
    pub fn subscribe(&self) -> broadcast::Receiver<TokenStats> {
        self.updates.subscribe()
    }
}

impl Default for TokenTracker {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
