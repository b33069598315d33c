//! Mid-run model switch requests — lets an operator redirect a ticket's
//! in-flight conversation to a different configured LLM service without
//! restarting it.
//!
//! Mirrors [`crate::runtime::approval::ApprovalStore`]'s shape: a small
//! lock-guarded map that a running loop polls, rather than a channel the
//! loop blocks on, since a switch request with no conversation currently
//! running simply expires unread.

use std::collections::HashMap;

use parking_lot::RwLock;

/// Thread-safe store of pending switch requests, one per ticket.
pub struct ModelSwitchQueue {
    pending: RwLock<HashMap<String, String>>,
}

impl ModelSwitchQueue {
    pub fn new() -> Self {
        Self {
            pending: RwLock::new(HashMap::new()),
        }
    }

    /// Request that `ticket_id`'s running conversation switch to `provider_id`
    /// before its next LLM call. Overwrites any earlier unconsumed request.
    pub fn request_switch(&self, ticket_id: &str, provider_id: &str) {
        self.pending
            .write()
            .insert(ticket_id.to_string(), provider_id.to_string());
    }

    /// Take (and clear) the pending switch for `ticket_id`, if any.
    pub fn take_pending(&self, ticket_id: &str) -> Option<String> {
        self.pending.write().remove(ticket_id)
    }
}

impl Default for ModelSwitchQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_pending_clears_the_request() {
        let q = ModelSwitchQueue::new();
        q.request_switch("t1", "anthropic-main");
        assert_eq!(q.take_pending("t1"), Some("anthropic-main".to_string()));
        assert_eq!(q.take_pending("t1"), None);
    }

    #[test]
    fn requests_are_scoped_per_ticket() {
        let q = ModelSwitchQueue::new();
        q.request_switch("t1", "a");
        assert_eq!(q.take_pending("t2"), None);
        assert_eq!(q.take_pending("t1"), Some("a".to_string()));
    }

    #[test]
    fn a_later_request_overwrites_an_unconsumed_earlier_one() {
        let q = ModelSwitchQueue::new();
        q.request_switch("t1", "a");
        q.request_switch("t1", "b");
        assert_eq!(q.take_pending("t1"), Some("b".to_string()));
    }
}
