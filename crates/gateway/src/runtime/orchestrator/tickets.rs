//! Ticket Service (C8, store half) — one file per ticket under `tickets_dir`,
//! monotonic id allocation, append-only activity log.
//!
//! The watchdog (periodic staleness sweep) lives in [`super::watchdog`] and
//! is layered on top of this store rather than folded into it, mirroring how
//! [`super::conversation_store`] keeps persistence separate from the
//! compaction/SFCM strategies that use it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use sa_domain::error::{Error, Result};
use sa_domain::ticket::{Subtask, SubtaskStatus, Task, Ticket, TicketStatus};
use tokio::sync::Mutex as AsyncMutex;

/// Broadcast payload emitted whenever a ticket changes, for SSE/dashboard
/// consumers. Kept separate from [`Ticket`] itself so internal fields (the
/// allocator counter, lock map) never leak into the wire representation.
#[derive(Debug, Clone)]
pub struct TicketUpdated {
    pub ticket_id: String,
    pub status: TicketStatus,
}

pub struct TicketStore {
    dir: PathBuf,
    /// Serializes id allocation; held only for the duration of the bump.
    next_id: SyncMutex<u64>,
    /// ticketId -> per-ticket async lock, lazily created, guarding the file.
    locks: SyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    updates: tokio::sync::broadcast::Sender<TicketUpdated>,
}

impl TicketStore {
    /// Scans `dir` for existing ticket files to seed the id allocator at
    /// `max(existing ids) + 1`, so restarts never reuse an id.
    pub async fn load(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let mut max_id: u64 = 0;
        if dir.exists() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let Some(stem) = entry.path().file_stem().and_then(|s| s.to_str().map(str::to_string)) else {
                    continue;
                };
                if let Some(id_str) = stem.strip_prefix("ticket-") {
                    if let Ok(id) = id_str.parse::<u64>() {
                        max_id = max_id.max(id);
                    }
                }
            }
        }
        let (tx, _rx) = tokio::sync::broadcast::channel(256);
        Ok(Self {
            dir,
            next_id: SyncMutex::new(max_id + 1),
            locks: SyncMutex::new(HashMap::new()),
            updates: tx,
        })
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<TicketUpdated> {
        self.updates.subscribe()
    }

    fn path_for(&self, ticket_id: &str) -> PathBuf {
        self.dir.join(format!("ticket-{ticket_id}.json"))
    }

    fn lock_for(&self, ticket_id: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .entry(ticket_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn allocate_id(&self) -> String {
        let mut guard = self.next_id.lock();
        let id = *guard;
        *guard += 1;
        id.to_string()
    }

    async fn read(&self, ticket_id: &str) -> Result<Ticket> {
        let bytes = tokio::fs::read(self.path_for(ticket_id))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => Error::TicketNotFound(ticket_id.to_string()),
                _ => Error::Io(e),
            })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn write(&self, ticket: &Ticket) -> Result<()> {
        if !self.dir.exists() {
            tokio::fs::create_dir_all(&self.dir).await?;
        }
        let path = self.path_for(&ticket.id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(ticket)?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await
    }

    pub async fn create(&self, title: String, description: String, branch_name: String) -> Result<Ticket> {
        let id = self.allocate_id();
        let lock = self.lock_for(&id);
        let _guard = lock.lock().await;
        let ticket = Ticket::new(id, title, description, branch_name);
        self.write(&ticket).await?;
        Ok(ticket)
    }

    pub async fn get(&self, ticket_id: &str) -> Result<Ticket> {
        let lock = self.lock_for(ticket_id);
        let _guard = lock.lock().await;
        self.read(ticket_id).await
    }

    pub async fn list(&self) -> Result<Vec<Ticket>> {
        let mut out = Vec::new();
        if !self.dir.exists() {
            return Ok(out);
        }
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            out.push(serde_json::from_slice::<Ticket>(&bytes)?);
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    /// First ticket in `Backlog`, sorted by id — used to find the next work
    /// item to activate.
    pub async fn next_backlog(&self) -> Result<Option<Ticket>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .find(|t| t.status == TicketStatus::Backlog))
    }

    async fn mutate<F>(&self, ticket_id: &str, f: F) -> Result<Ticket>
    where
        F: FnOnce(&mut Ticket) -> Result<()>,
    {
        let lock = self.lock_for(ticket_id);
        let _guard = lock.lock().await;
        let mut ticket = self.read(ticket_id).await?;
        f(&mut ticket)?;
        self.write(&ticket).await?;
        let _ = self.updates.send(TicketUpdated {
            ticket_id: ticket.id.clone(),
            status: ticket.status,
        });
        Ok(ticket)
    }

    pub async fn transition(&self, ticket_id: &str, next: TicketStatus) -> Result<Ticket> {
        self.mutate(ticket_id, |t| t.try_transition(next)).await
    }

    pub async fn log_activity(&self, ticket_id: &str, message: impl Into<String> + Send + 'static) -> Result<Ticket> {
        self.mutate(ticket_id, move |t| {
            t.log_activity(message);
            Ok(())
        })
        .await
    }

    pub async fn add_llm_cost(&self, ticket_id: &str, delta: f64) -> Result<Ticket> {
        self.mutate(ticket_id, move |t| {
            t.add_llm_cost(delta);
            Ok(())
        })
        .await
    }

    /// Set which configured LLM service plans this ticket. Only meaningful
    /// before the ticket is activated.
    pub async fn set_planner_llm(&self, ticket_id: &str, llm_id: String) -> Result<Ticket> {
        self.mutate(ticket_id, move |t| {
            t.planner_llm_id = llm_id;
            Ok(())
        })
        .await
    }

    pub async fn add_task(&self, ticket_id: &str, name: String, description: String) -> Result<Task> {
        let name_owned = name.clone();
        let ticket = self
            .mutate(ticket_id, move |t| {
                t.add_task(&name, &description);
                Ok(())
            })
            .await?;
        ticket
            .tasks
            .into_iter()
            .find(|t| t.name == name_owned)
            .ok_or_else(|| Error::TaskNotFound(name_owned))
    }

    pub async fn add_subtask(
        &self,
        ticket_id: &str,
        task_id: &str,
        name: String,
        description: String,
    ) -> Result<Subtask> {
        let task_id_owned = task_id.to_string();
        let ticket = self
            .mutate(ticket_id, move |t| {
                let task = t
                    .find_task_mut(&task_id_owned)
                    .ok_or_else(|| Error::TaskNotFound(task_id_owned.clone()))?;
                task.add_subtask(&name, &description);
                Ok(())
            })
            .await?;
        let task = ticket
            .tasks
            .iter()
            .find(|t| t.id == task_id)
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;
        task.subtasks
            .last()
            .cloned()
            .ok_or_else(|| Error::SubtaskNotFound("just added".to_string()))
    }

    pub async fn transition_subtask(
        &self,
        ticket_id: &str,
        task_id: &str,
        subtask_id: &str,
        next: SubtaskStatus,
    ) -> Result<Ticket> {
        let task_id = task_id.to_string();
        let subtask_id = subtask_id.to_string();
        self.mutate(ticket_id, move |t| {
            let task = t
                .find_task_mut(&task_id)
                .ok_or_else(|| Error::TaskNotFound(task_id.clone()))?;
            let subtask = task
                .find_subtask_mut(&subtask_id)
                .ok_or_else(|| Error::SubtaskNotFound(subtask_id.clone()))?;
            subtask.try_transition(next)
        })
        .await
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_allocates_monotonic_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = TicketStore::load(dir.path()).await.unwrap();
        let a = store.create("a".into(), "d".into(), "b1".into()).await.unwrap();
        let b = store.create("b".into(), "d".into(), "b2".into()).await.unwrap();
        assert_eq!(a.id, "1");
        assert_eq!(b.id, "2");
    }

    #[tokio::test]
    async fn reload_continues_id_sequence() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = TicketStore::load(dir.path()).await.unwrap();
            store.create("a".into(), "d".into(), "b1".into()).await.unwrap();
        }
        let store = TicketStore::load(dir.path()).await.unwrap();
        let next = store.create("b".into(), "d".into(), "b2".into()).await.unwrap();
        assert_eq!(next.id, "2");
    }

    #[tokio::test]
    async fn transition_enforces_state_machine() {
        let dir = tempfile::tempdir().unwrap();
        let store = TicketStore::load(dir.path()).await.unwrap();
        let ticket = store.create("a".into(), "d".into(), "b1".into()).await.unwrap();
        assert!(store.transition(&ticket.id, TicketStatus::Done).await.is_err());
        let active = store.transition(&ticket.id, TicketStatus::Active).await.unwrap();
        assert_eq!(active.status, TicketStatus::Active);
    }

    #[tokio::test]
    async fn log_activity_persists_across_reads() {
        let dir = tempfile::tempdir().unwrap();
        let store = TicketStore::load(dir.path()).await.unwrap();
        let ticket = store.create("a".into(), "d".into(), "b1".into()).await.unwrap();
        store.log_activity(&ticket.id, "Started subtask: x").await.unwrap();
        let reloaded = store.get(&ticket.id).await.unwrap();
        assert_eq!(reloaded.activity_log.len(), 1);
    }

    #[tokio::test]
    async fn next_backlog_finds_first_unstarted() {
        let dir = tempfile::tempdir().unwrap();
        let store = TicketStore::load(dir.path()).await.unwrap();
        let ticket = store.create("a".into(), "d".into(), "b1".into()).await.unwrap();
        store.transition(&ticket.id, TicketStatus::Active).await.unwrap();
        let second = store.create("b".into(), "d".into(), "b2".into()).await.unwrap();
        let found = store.next_backlog().await.unwrap().unwrap();
        assert_eq!(found.id, second.id);
    }
}
