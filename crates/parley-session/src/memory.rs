// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use parley_model::Message;

use crate::store::{MetadataPatch, SessionMetadata, SessionStore, StoreError, StoredSession};

/// In-memory session store.  Sessions live as long as the store does;
/// useful for tests and embedded deployments without persistence.
pub struct MemoryStore {
    sessions: Mutex<HashMap<String, StoredSession>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn list(&self) -> Result<Vec<SessionMetadata>, StoreError> {
        let sessions = self.sessions.lock().await;
        let mut all: Vec<SessionMetadata> =
            sessions.values().map(|s| s.metadata.clone()).collect();
        all.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(all)
    }

    async fn load(&self, id: &str) -> Result<Option<StoredSession>, StoreError> {
        Ok(self.sessions.lock().await.get(id).cloned())
    }

    async fn save(
        &self,
        id: &str,
        messages: &[Message],
        patch: Option<MetadataPatch>,
    ) -> Result<SessionMetadata, StoreError> {
        let now = Utc::now();
        let mut sessions = self.sessions.lock().await;
        let entry = sessions
            .entry(id.to_string())
            .or_insert_with(|| StoredSession {
                metadata: SessionMetadata::new(id, now),
                messages: Vec::new(),
            });
        entry.messages = messages.to_vec();
        entry.metadata.updated_at = now;
        entry.metadata.message_count = messages.len();
        if let Some(patch) = patch {
            entry.metadata.apply(patch);
        }
        Ok(entry.metadata.clone())
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.sessions.lock().await.remove(id).is_some())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use parley_model::Message;

    use super::*;

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let store = MemoryStore::new();
        let messages = vec![Message::user("hi"), Message::assistant("hello")];
        store.save("s1", &messages, None).await.unwrap();

        let loaded = store.load("s1").await.unwrap().unwrap();
        assert_eq!(loaded.messages.len(), 2);
        assert_eq!(loaded.metadata.message_count, 2);
    }

    #[tokio::test]
    async fn load_missing_session_is_none() {
        let store = MemoryStore::new();
        assert!(store.load("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_preserves_created_at_and_bumps_updated_at() {
        let store = MemoryStore::new();
        let first = store.save("s1", &[Message::user("a")], None).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = store
            .save("s1", &[Message::user("a"), Message::assistant("b")], None)
            .await
            .unwrap();
        assert_eq!(first.created_at, second.created_at);
        assert!(second.updated_at > first.updated_at);
        assert_eq!(second.message_count, 2);
    }

    #[tokio::test]
    async fn metadata_patch_applies_without_clobbering() {
        let store = MemoryStore::new();
        store
            .save(
                "s1",
                &[],
                Some(MetadataPatch {
                    label: Some("experiment".into()),
                    ..Default::default()
                }),
            )
            .await
            .unwrap();
        let meta = store
            .save(
                "s1",
                &[],
                Some(MetadataPatch {
                    model: Some("mock-model".into()),
                    ..Default::default()
                }),
            )
            .await
            .unwrap();
        assert_eq!(meta.label.as_deref(), Some("experiment"));
        assert_eq!(meta.model.as_deref(), Some("mock-model"));
    }

    #[tokio::test]
    async fn list_orders_by_updated_at_descending() {
        let store = MemoryStore::new();
        store.save("old", &[], None).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.save("new", &[], None).await.unwrap();

        let listed = store.list().await.unwrap();
        let ids: Vec<&str> = listed.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["new", "old"]);
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let store = MemoryStore::new();
        store.save("s1", &[], None).await.unwrap();
        assert!(store.delete("s1").await.unwrap());
        assert!(!store.delete("s1").await.unwrap());
    }
}
