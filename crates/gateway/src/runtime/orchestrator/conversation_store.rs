//! Conversation Store (C9) — per-ticket JSON file, per-ticket lock, no cache.
//!
//! One file per ticket (`convos-<ticketId>.json`) maps conversationId to
//! [`ConversationData`]. Every call reads and writes the file directly so
//! human edits to the file on disk are visible on the very next call — this
//! rules out the in-memory-cache-plus-single-file pattern used elsewhere in
//! this runtime (see [`super::super::session_lock`]); the lock map here
//! guards raw file I/O instead of turn execution.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use sa_domain::conversation::ConversationData;
use sa_domain::error::{Error, Result};
use tokio::sync::Mutex as AsyncMutex;

pub struct ConversationStore {
    dir: PathBuf,
    /// ticketId -> per-ticket async lock, lazily created.
    locks: SyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// One row of [`ConversationStore::info_list`].
#[derive(Debug, Clone)]
pub struct ConversationInfo {
    pub id: String,
    pub display_name: String,
    pub finished: bool,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

impl ConversationStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            locks: SyncMutex::new(HashMap::new()),
        }
    }

    fn path_for(&self, ticket_id: &str) -> PathBuf {
        self.dir.join(format!("convos-{ticket_id}.json"))
    }

    fn lock_for(&self, ticket_id: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .entry(ticket_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    async fn read_all(&self, ticket_id: &str) -> Result<HashMap<String, ConversationData>> {
        let path = self.path_for(ticket_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn write_all(&self, ticket_id: &str, data: &HashMap<String, ConversationData>) -> Result<()> {
        if !self.dir.exists() {
            tokio::fs::create_dir_all(&self.dir).await?;
        }
        let path = self.path_for(ticket_id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(data)?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    pub async fn get(&self, ticket_id: &str, conversation_id: &str) -> Result<Option<ConversationData>> {
        let lock = self.lock_for(ticket_id);
        let _guard = lock.lock().await;
        let all = self.read_all(ticket_id).await?;
        Ok(all.get(conversation_id).cloned())
    }

    /// First non-finished conversation with `display_name == "Planning"`.
    pub async fn get_active_planning(&self, ticket_id: &str) -> Result<Option<ConversationData>> {
        let lock = self.lock_for(ticket_id);
        let _guard = lock.lock().await;
        let all = self.read_all(ticket_id).await?;
        Ok(all
            .into_values()
            .find(|c| !c.finished && c.display_name == "Planning"))
    }

    pub async fn get_non_finalized(&self, ticket_id: &str) -> Result<Vec<ConversationData>> {
        let lock = self.lock_for(ticket_id);
        let _guard = lock.lock().await;
        let all = self.read_all(ticket_id).await?;
        Ok(all.into_values().filter(|c| !c.finished).collect())
    }

    pub async fn info_list(&self, ticket_id: &str) -> Result<Vec<ConversationInfo>> {
        let lock = self.lock_for(ticket_id);
        let _guard = lock.lock().await;
        let all = self.read_all(ticket_id).await?;
        let mut list: Vec<ConversationInfo> = all
            .into_values()
            .map(|c| ConversationInfo {
                id: c.id,
                display_name: c.display_name,
                finished: c.finished,
                started_at: c.started_at,
            })
            .collect();
        list.sort_by_key(|c| c.started_at);
        Ok(list)
    }

    pub async fn upsert(&self, ticket_id: &str, conversation: &ConversationData) -> Result<()> {
        let lock = self.lock_for(ticket_id);
        let _guard = lock.lock().await;
        let mut all = self.read_all(ticket_id).await?;
        all.insert(conversation.id.clone(), conversation.clone());
        self.write_all(ticket_id, &all).await
    }

    pub async fn finish(&self, ticket_id: &str, conversation_id: &str) -> Result<()> {
        let lock = self.lock_for(ticket_id);
        let _guard = lock.lock().await;
        let mut all = self.read_all(ticket_id).await?;
        if let Some(c) = all.get_mut(conversation_id) {
            c.finish();
        }
        self.write_all(ticket_id, &all).await
    }

    pub async fn delete(&self, ticket_id: &str, conversation_id: &str) -> Result<()> {
        let lock = self.lock_for(ticket_id);
        let _guard = lock.lock().await;
        let mut all = self.read_all(ticket_id).await?;
        all.remove(conversation_id);
        self.write_all(ticket_id, &all).await
    }

    pub async fn delete_finished(&self, ticket_id: &str) -> Result<()> {
        let lock = self.lock_for(ticket_id);
        let _guard = lock.lock().await;
        let mut all = self.read_all(ticket_id).await?;
        all.retain(|_, c| !c.finished);
        self.write_all(ticket_id, &all).await
    }

    /// Remove the whole per-ticket file (e.g. after a ticket is deleted).
    pub async fn delete_for_ticket(&self, ticket_id: &str) -> Result<()> {
        let lock = self.lock_for(ticket_id);
        let _guard = lock.lock().await;
        let path = self.path_for(ticket_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
        .map(|()| {
            self.locks.lock().remove(ticket_id);
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sa_domain::conversation::{ConversationRole, ConversationStrategy};

    fn sample(ticket: &str, name: &str) -> ConversationData {
        ConversationData::new(
            ticket.to_string(),
            name.to_string(),
            ConversationRole::Planning,
            ConversationStrategy::Compacting,
            "gpt-4o".to_string(),
        )
    }

    #[tokio::test]
    async fn upsert_then_get_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(dir.path());
        let convo = sample("t1", "Planning");
        store.upsert("t1", &convo).await.unwrap();

        let fetched = store.get("t1", &convo.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, convo.id);
        assert_eq!(fetched.display_name, "Planning");
    }

    #[tokio::test]
    async fn get_active_planning_skips_finished() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(dir.path());
        let mut done = sample("t1", "Planning");
        done.finish();
        let active = sample("t1", "Planning");
        store.upsert("t1", &done).await.unwrap();
        store.upsert("t1", &active).await.unwrap();

        let found = store.get_active_planning("t1").await.unwrap().unwrap();
        assert_eq!(found.id, active.id);
    }

    #[tokio::test]
    async fn delete_for_ticket_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(dir.path());
        let convo = sample("t1", "Planning");
        store.upsert("t1", &convo).await.unwrap();
        store.delete_for_ticket("t1").await.unwrap();

        let found = store.get("t1", &convo.id).await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn separate_tickets_do_not_interfere() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(dir.path());
        let a = sample("t1", "Planning");
        let b = sample("t2", "Planning");
        store.upsert("t1", &a).await.unwrap();
        store.upsert("t2", &b).await.unwrap();

        assert!(store.get("t1", &b.id).await.unwrap().is_none());
        assert!(store.get("t2", &a.id).await.unwrap().is_none());
    }
}
