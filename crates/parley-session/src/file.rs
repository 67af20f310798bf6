// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tracing::warn;

use parley_model::Message;

use crate::store::{MetadataPatch, SessionMetadata, SessionStore, StoreError, StoredSession};

/// File-backed session store: one JSON document per session under a root
/// directory.  Writes go through a temp file and an atomic rename so a
/// crash mid-save never leaves a truncated session behind.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, StoreError> {
        validate_id(id)?;
        Ok(self.root.join(format!("{id}.json")))
    }

    async fn read_session(path: &Path) -> Result<StoredSession, StoreError> {
        let bytes = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Session ids become file names; restrict them to a filename-safe set so
/// an id can never traverse out of the root.
fn validate_id(id: &str) -> Result<(), StoreError> {
    let ok = !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !id.starts_with('.');
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidId(id.to_string()))
    }
}

#[async_trait]
impl SessionStore for FileStore {
    async fn list(&self) -> Result<Vec<SessionMetadata>, StoreError> {
        let mut all = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            // A store that was never saved to lists as empty.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(all),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_session(&path).await {
                Ok(session) => all.push(session.metadata),
                Err(e) => {
                    // One corrupt file must not hide every other session.
                    warn!(path = %path.display(), error = %e, "skipping unreadable session file");
                }
            }
        }
        all.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(all)
    }

    async fn load(&self, id: &str) -> Result<Option<StoredSession>, StoreError> {
        let path = self.path_for(id)?;
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        Ok(Some(Self::read_session(&path).await?))
    }

    async fn save(
        &self,
        id: &str,
        messages: &[Message],
        patch: Option<MetadataPatch>,
    ) -> Result<SessionMetadata, StoreError> {
        let path = self.path_for(id)?;
        tokio::fs::create_dir_all(&self.root).await?;

        let now = Utc::now();
        let mut metadata = match Self::read_session(&path).await {
            Ok(existing) => existing.metadata,
            Err(_) => SessionMetadata::new(id, now),
        };
        metadata.updated_at = now;
        metadata.message_count = messages.len();
        if let Some(patch) = patch {
            metadata.apply(patch);
        }

        let session = StoredSession {
            metadata: metadata.clone(),
            messages: messages.to_vec(),
        };
        let bytes = serde_json::to_vec_pretty(&session)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(metadata)
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let path = self.path_for(id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use parley_model::Message;

    use super::*;

    fn store() -> (tempfile::TempDir, FileStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("sessions"));
        (dir, store)
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let (_dir, store) = store();
        let messages = vec![Message::user("hi"), Message::assistant("hello")];
        store.save("s1", &messages, None).await.unwrap();

        let loaded = store.load("s1").await.unwrap().unwrap();
        assert_eq!(loaded.messages.len(), 2);
        assert_eq!(loaded.messages[0].text(), "hi");
        assert_eq!(loaded.metadata.message_count, 2);
    }

    #[tokio::test]
    async fn load_missing_session_is_none() {
        let (_dir, store) = store();
        assert!(store.load("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_on_missing_root_is_empty() {
        let (_dir, store) = store();
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_orders_by_updated_at_descending() {
        let (_dir, store) = store();
        store.save("old", &[], None).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.save("new", &[], None).await.unwrap();

        let ids: Vec<String> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["new", "old"]);
    }

    #[tokio::test]
    async fn created_at_survives_resave() {
        let (_dir, store) = store();
        let first = store.save("s1", &[], None).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = store.save("s1", &[Message::user("x")], None).await.unwrap();
        assert_eq!(first.created_at, second.created_at);
        assert!(second.updated_at > first.updated_at);
    }

    #[tokio::test]
    async fn traversal_ids_are_rejected() {
        let (_dir, store) = store();
        for bad in ["../escape", "a/b", "", ".hidden", "name with spaces"] {
            let err = store.save(bad, &[], None).await.unwrap_err();
            assert!(matches!(err, StoreError::InvalidId(_)), "{bad}");
        }
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let (_dir, store) = store();
        store.save("s1", &[], None).await.unwrap();
        assert!(store.delete("s1").await.unwrap());
        assert!(!store.delete("s1").await.unwrap());
    }

    #[tokio::test]
    async fn corrupt_file_does_not_break_listing() {
        let (_dir, store) = store();
        store.save("good", &[], None).await.unwrap();
        tokio::fs::write(store.root.join("bad.json"), b"{not json")
            .await
            .unwrap();

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "good");
    }
}
