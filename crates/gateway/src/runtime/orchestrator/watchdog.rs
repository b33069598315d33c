//! Ticket watchdog (C8, watchdog half).
//!
//! Runs alongside [`super::tickets::TicketStore`] rather than inside it — a
//! ticket can be read/written without a watchdog ever being spun up (e.g. in
//! tests), and the watchdog itself holds no state the store needs to know
//! about beyond a heartbeat map.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use sa_domain::ticket::TicketStatus;

use super::tickets::TicketStore;

/// Tracks the last heartbeat per active ticket. A ticket absent from this
/// map is never considered stale — a newly-assigned worker may not have
/// sent one yet.
#[derive(Default)]
pub struct HeartbeatMap {
    last_seen: Mutex<HashMap<String, chrono::DateTime<Utc>>>,
}

impl HeartbeatMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn beat(&self, ticket_id: &str) {
        self.last_seen.lock().insert(ticket_id.to_string(), Utc::now());
    }

    pub fn clear(&self, ticket_id: &str) {
        self.last_seen.lock().remove(ticket_id);
    }

    fn last(&self, ticket_id: &str) -> Option<chrono::DateTime<Utc>> {
        self.last_seen.lock().get(ticket_id).copied()
    }
}

/// Sweeps every Active ticket once; transitions any whose heartbeat is
/// older than `stale_after_secs` to Failed.
pub async fn sweep_once(store: &TicketStore, heartbeats: &HeartbeatMap, stale_after_secs: i64) {
    let tickets = match store.list().await {
        Ok(t) => t,
        Err(e) => {
            tracing::warn!(error = %e, "watchdog: failed to list tickets");
            return;
        }
    };

    for ticket in tickets.into_iter().filter(|t| t.status == TicketStatus::Active) {
        let Some(last) = heartbeats.last(&ticket.id) else {
            continue;
        };
        let stale_secs = (Utc::now() - last).num_seconds();
        if stale_secs <= stale_after_secs {
            continue;
        }

        if let Err(e) = store
            .log_activity(&ticket.id, format!("watchdog: no heartbeat in {stale_secs}s, marking failed"))
            .await
        {
            tracing::warn!(ticket_id = %ticket.id, error = %e, "watchdog: failed to log stale ticket");
            continue;
        }
        match store.transition(&ticket.id, TicketStatus::Failed).await {
            Ok(_) => heartbeats.clear(&ticket.id),
            Err(e) => tracing::warn!(ticket_id = %ticket.id, error = %e, "watchdog: failed to transition stale ticket"),
        }
    }
}

/// Runs [`sweep_once`] on a fixed interval until cancelled.
pub async fn run(
    store: Arc<TicketStore>,
    heartbeats: Arc<HeartbeatMap>,
    sweep_interval_secs: u64,
    stale_after_secs: i64,
    cancel: crate::runtime::cancel::CancelToken,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(sweep_interval_secs));
    loop {
        interval.tick().await;
        if cancel.is_cancelled() {
            return;
        }
        sweep_once(&store, &heartbeats, stale_after_secs).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stale_active_ticket_is_marked_failed() {
        let dir = tempfile::tempdir().unwrap();
        let store = TicketStore::load(dir.path()).await.unwrap();
        let ticket = store.create("a".into(), "d".into(), "b1".into()).await.unwrap();
        store.transition(&ticket.id, TicketStatus::Active).await.unwrap();

        let heartbeats = HeartbeatMap::new();
        heartbeats.last_seen.lock().insert(ticket.id.clone(), Utc::now() - chrono::Duration::seconds(600));

        sweep_once(&store, &heartbeats, 300).await;

        let reloaded = store.get(&ticket.id).await.unwrap();
        assert_eq!(reloaded.status, TicketStatus::Failed);
        assert!(heartbeats.last(&ticket.id).is_none());
    }

    #[tokio::test]
    async fn ticket_without_heartbeat_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let store = TicketStore::load(dir.path()).await.unwrap();
        let ticket = store.create("a".into(), "d".into(), "b1".into()).await.unwrap();
        store.transition(&ticket.id, TicketStatus::Active).await.unwrap();

        let heartbeats = HeartbeatMap::new();
        sweep_once(&store, &heartbeats, 300).await;

        let reloaded = store.get(&ticket.id).await.unwrap();
        assert_eq!(reloaded.status, TicketStatus::Active);
    }

    #[tokio::test]
    async fn fresh_heartbeat_keeps_ticket_active() {
        let dir = tempfile::tempdir().unwrap();
        let store = TicketStore::load(dir.path()).await.unwrap();
        let ticket = store.create("a".into(), "d".into(), "b1".into()).await.unwrap();
        store.transition(&ticket.id, TicketStatus::Active).await.unwrap();

        let heartbeats = HeartbeatMap::new();
        heartbeats.beat(&ticket.id);
        sweep_once(&store, &heartbeats, 300).await;

        let reloaded = store.get(&ticket.id).await.unwrap();
        assert_eq!(reloaded.status, TicketStatus::Active);
    }
}
