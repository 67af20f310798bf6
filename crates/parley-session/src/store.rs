// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use parley_model::{CheckpointState, Message};

/// Errors from session store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(String),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("invalid session id: {0}")]
    InvalidId(String),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Codec(e.to_string())
    }
}

/// Metadata the store maintains for every session.
///
/// `created_at`, `updated_at` and `message_count` are owned by the store;
/// everything else comes from callers via [`MetadataPatch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fork_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub detached: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_checkpoint: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_state: Option<CheckpointState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl SessionMetadata {
    pub(crate) fn new(id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            created_at: now,
            updated_at: now,
            message_count: 0,
            label: None,
            parent_id: None,
            fork_message_id: None,
            detached: false,
            is_checkpoint: false,
            checkpoint_state: None,
            provider: None,
            model: None,
        }
    }

    /// Apply caller-supplied fields.  `None` leaves a field untouched.
    pub(crate) fn apply(&mut self, patch: MetadataPatch) {
        if let Some(label) = patch.label {
            self.label = Some(label);
        }
        if let Some(parent_id) = patch.parent_id {
            self.parent_id = Some(parent_id);
        }
        if let Some(fork_message_id) = patch.fork_message_id {
            self.fork_message_id = Some(fork_message_id);
        }
        if let Some(detached) = patch.detached {
            self.detached = detached;
        }
        if let Some(is_checkpoint) = patch.is_checkpoint {
            self.is_checkpoint = is_checkpoint;
        }
        if let Some(checkpoint_state) = patch.checkpoint_state {
            self.checkpoint_state = Some(checkpoint_state);
        }
        if let Some(provider) = patch.provider {
            self.provider = Some(provider);
        }
        if let Some(model) = patch.model {
            self.model = Some(model);
        }
    }
}

/// Caller-settable metadata fields for [`SessionStore::save`].
#[derive(Debug, Clone, Default)]
pub struct MetadataPatch {
    pub label: Option<String>,
    pub parent_id: Option<String>,
    pub fork_message_id: Option<String>,
    pub detached: Option<bool>,
    pub is_checkpoint: Option<bool>,
    pub checkpoint_state: Option<CheckpointState>,
    pub provider: Option<String>,
    pub model: Option<String>,
}

/// A loaded session: metadata plus the full message list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSession {
    pub metadata: SessionMetadata,
    pub messages: Vec<Message>,
}

/// Persistence adapter for conversation sessions.
///
/// Ordering by `updated_at` descending in [`list`] is the store's
/// responsibility, so callers can show "most recent first" without
/// re-sorting.
///
/// [`list`]: SessionStore::list
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn list(&self) -> Result<Vec<SessionMetadata>, StoreError>;

    async fn load(&self, id: &str) -> Result<Option<StoredSession>, StoreError>;

    /// Create or replace a session.  The store stamps `created_at` on
    /// first save, bumps `updated_at`, and recounts messages.
    async fn save(
        &self,
        id: &str,
        messages: &[Message],
        patch: Option<MetadataPatch>,
    ) -> Result<SessionMetadata, StoreError>;

    /// Remove a session.  Returns whether it existed.
    async fn delete(&self, id: &str) -> Result<bool, StoreError>;
}
