//! Ticket, Task, and Subtask — the board's persisted work model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Ticket
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TicketStatus {
    Backlog,
    Active,
    Failed,
    Done,
}

impl TicketStatus {
    /// Whether `self -> next` is a permitted transition.
    pub fn can_transition_to(self, next: TicketStatus) -> bool {
        use TicketStatus::*;
        matches!(
            (self, next),
            (Backlog, Active)
                | (Active, Done)
                | (Active, Failed)
                | (Failed, Backlog)
                | (Active, Backlog)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticket {
    /// Monotonically increasing integer, encoded as a string.
    pub id: String,
    pub title: String,
    pub description: String,
    pub status: TicketStatus,
    pub branch_name: String,
    pub planner_llm_id: String,
    #[serde(default)]
    pub tasks: Vec<Task>,
    /// Append-only, timestamp-prefixed entries.
    #[serde(default)]
    pub activity_log: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub container_name: String,
    #[serde(default)]
    pub llm_cost: f64,
    /// 0 means unlimited.
    #[serde(default)]
    pub max_cost: f64,
}

impl Ticket {
    pub fn new(id: String, title: String, description: String, branch_name: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            title,
            description,
            status: TicketStatus::Backlog,
            branch_name,
            planner_llm_id: String::new(),
            tasks: Vec::new(),
            activity_log: Vec::new(),
            created_at: now,
            updated_at: now,
            container_name: String::new(),
            llm_cost: 0.0,
            max_cost: 0.0,
        }
    }

    /// `remaining = max(0, maxCost - llmCost)`. `0` (from `max_cost == 0`) means unlimited.
    pub fn remaining_budget(&self) -> Option<f64> {
        if self.max_cost == 0.0 {
            None
        } else {
            Some((self.max_cost - self.llm_cost).max(0.0))
        }
    }

    pub fn try_transition(&mut self, next: TicketStatus) -> crate::error::Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(crate::error::Error::InvalidTransition(
                format!("{:?}", self.status),
                format!("{next:?}"),
            ));
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Append a UTC-timestamped entry, formatted `yyyy-MM-dd HH:mm:ss`.
    pub fn log_activity(&mut self, message: impl Into<String>) {
        let ts = Utc::now().format("%Y-%m-%d %H:%M:%S");
        self.activity_log.push(format!("{ts} {}", message.into()));
        self.updated_at = Utc::now();
    }

    /// `AddTaskToTicket`: update description in place if a task with this
    /// name already exists, otherwise append a new one. Idempotent.
    pub fn add_task(&mut self, name: &str, description: &str) -> &mut Task {
        if let Some(idx) = self.tasks.iter().position(|t| t.name == name) {
            let task = &mut self.tasks[idx];
            task.description = description.to_string();
            task.updated_at = Utc::now();
            &mut self.tasks[idx]
        } else {
            self.tasks.push(Task::new(name.to_string(), description.to_string()));
            self.tasks.last_mut().expect("just pushed")
        }
    }

    pub fn add_llm_cost(&mut self, delta: f64) {
        self.llm_cost += delta;
        self.updated_at = Utc::now();
    }

    pub fn find_task_mut(&mut self, task_id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == task_id)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Task / Subtask
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub subtasks: Vec<Subtask>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(name: String, description: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            description,
            subtasks: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// `AddSubtaskToTask`: idempotent by name, like `Ticket::add_task`.
    pub fn add_subtask(&mut self, name: &str, description: &str) -> &mut Subtask {
        if let Some(idx) = self.subtasks.iter().position(|s| s.name == name) {
            let sub = &mut self.subtasks[idx];
            sub.description = description.to_string();
            sub.updated_at = Utc::now();
            &mut self.subtasks[idx]
        } else {
            self.subtasks
                .push(Subtask::new(name.to_string(), description.to_string()));
            self.updated_at = Utc::now();
            self.subtasks.last_mut().expect("just pushed")
        }
    }

    pub fn find_subtask_mut(&mut self, subtask_id: &str) -> Option<&mut Subtask> {
        self.subtasks.iter_mut().find(|s| s.id == subtask_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SubtaskStatus {
    Incomplete,
    InProgress,
    AwaitingReview,
    Complete,
    Rejected,
}

impl SubtaskStatus {
    /// `Incomplete -> InProgress -> (Complete | Rejected | AwaitingReview)`.
    ///
    /// `AwaitingReview` and `Rejected` are reachable states but no driver
    /// code in this system moves a subtask through them yet. They exist so
    /// a future reviewer tool can use them without a schema migration.
    pub fn can_transition_to(self, next: SubtaskStatus) -> bool {
        use SubtaskStatus::*;
        matches!(
            (self, next),
            (Incomplete, InProgress)
                | (InProgress, Complete)
                | (InProgress, Rejected)
                | (InProgress, AwaitingReview)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subtask {
    pub id: String,
    pub name: String,
    pub description: String,
    pub status: SubtaskStatus,
    pub updated_at: DateTime<Utc>,
}

impl Subtask {
    pub fn new(name: String, description: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            description,
            status: SubtaskStatus::Incomplete,
            updated_at: Utc::now(),
        }
    }

    pub fn try_transition(&mut self, next: SubtaskStatus) -> crate::error::Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(crate::error::Error::InvalidTransition(
                format!("{:?}", self.status),
                format!("{next:?}"),
            ));
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticket_status_transitions() {
        assert!(TicketStatus::Backlog.can_transition_to(TicketStatus::Active));
        assert!(!TicketStatus::Backlog.can_transition_to(TicketStatus::Done));
        assert!(TicketStatus::Failed.can_transition_to(TicketStatus::Backlog));
        assert!(TicketStatus::Active.can_transition_to(TicketStatus::Backlog));
        assert!(!TicketStatus::Done.can_transition_to(TicketStatus::Active));
    }

    #[test]
    fn remaining_budget_zero_means_unlimited() {
        let mut t = Ticket::new("1".into(), "t".into(), "d".into(), "b".into());
        assert_eq!(t.remaining_budget(), None);
        t.max_cost = 10.0;
        t.llm_cost = 3.0;
        assert_eq!(t.remaining_budget(), Some(7.0));
        t.llm_cost = 15.0;
        assert_eq!(t.remaining_budget(), Some(0.0));
    }

    #[test]
    fn add_task_is_idempotent_by_name() {
        let mut t = Ticket::new("1".into(), "t".into(), "d".into(), "b".into());
        t.add_task("health", "initial");
        t.add_task("health", "updated");
        assert_eq!(t.tasks.len(), 1);
        assert_eq!(t.tasks[0].description, "updated");
    }

    #[test]
    fn add_subtask_is_idempotent_by_name() {
        let mut task = Task::new("health".into(), "d".into());
        task.add_subtask("add handler", "v1");
        task.add_subtask("add handler", "v2");
        assert_eq!(task.subtasks.len(), 1);
        assert_eq!(task.subtasks[0].description, "v2");
    }

    #[test]
    fn subtask_status_transitions() {
        let mut s = Subtask::new("x".into(), "d".into());
        assert!(s.try_transition(SubtaskStatus::InProgress).is_ok());
        assert!(s.try_transition(SubtaskStatus::Complete).is_ok());
        assert_eq!(s.status, SubtaskStatus::Complete);
    }

    #[test]
    fn invalid_subtask_transition_is_rejected() {
        let mut s = Subtask::new("x".into(), "d".into());
        assert!(s.try_transition(SubtaskStatus::Complete).is_err());
    }

    #[test]
    fn log_activity_is_timestamp_prefixed() {
        let mut t = Ticket::new("1".into(), "t".into(), "d".into(), "b".into());
        t.log_activity("Started subtask: add handler");
        assert_eq!(t.activity_log.len(), 1);
        assert!(t.activity_log[0].ends_with("Started subtask: add handler"));
        // "yyyy-MM-dd HH:mm:ss " prefix is 20 bytes.
        assert!(t.activity_log[0].len() > 20);
    }
}
