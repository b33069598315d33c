//! Conversation, Memory, and Frame — the agent's persisted context model.
//!
//! `Message`/`Role`/`ToolCall` live in [`crate::tool`]; this module adds the
//! conversation-level wrapper: role tagging, strategy tag, chapter summaries,
//! and the shared memories map that lets sub-agents see a parent's learnings.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tool::Message;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Role / strategy tags
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConversationRole {
    Planning,
    Developer,
    SubAgent,
    Compaction,
    Qa,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConversationStrategy {
    Compacting,
    Sfcm,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Memory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemoryLabel {
    Invariant,
    Constraint,
    Decision,
    Reference,
    OpenItem,
}

/// Minimum shared-prefix length for tolerant `remove_memory` matching.
const REMOVE_MATCH_MIN_PREFIX: usize = 6;

/// A shared, reference-counted map of memories.
///
/// Cloning a `MemoriesMap` clones the `Arc`, not the contents — this is how
/// a sub-agent "shares by reference" with its parent: mutations made
/// through either handle are visible through the other.
#[derive(Debug, Clone, Default)]
pub struct MemoriesMap(Arc<Mutex<HashMap<MemoryLabel, Vec<String>>>>);

impl MemoriesMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: HashMap<MemoryLabel, Vec<String>>) -> Self {
        Self(Arc::new(Mutex::new(snapshot)))
    }

    pub fn snapshot(&self) -> HashMap<MemoryLabel, Vec<String>> {
        self.0.lock().expect("memories mutex poisoned").clone()
    }

    /// De-duplicated append. No-op if `text` is already present under `label`.
    pub fn add(&self, label: MemoryLabel, text: impl Into<String>) {
        let text = text.into();
        let mut guard = self.0.lock().expect("memories mutex poisoned");
        let bucket = guard.entry(label).or_default();
        if !bucket.iter().any(|existing| existing == &text) {
            bucket.push(text);
        }
    }

    /// Tolerant removal: drops entries whose longest common prefix with
    /// `text` is at least [`REMOVE_MATCH_MIN_PREFIX`] characters (or the
    /// full length of the shorter string, if shorter than the minimum).
    /// Returns the number of entries removed.
    pub fn remove(&self, label: MemoryLabel, text: &str) -> usize {
        let mut guard = self.0.lock().expect("memories mutex poisoned");
        let Some(bucket) = guard.get_mut(&label) else {
            return 0;
        };
        let before = bucket.len();
        bucket.retain(|existing| !prefix_matches(existing, text));
        before - bucket.len()
    }

    /// Render the `[Memories]` block used as fixed-prefix content (C4 index 2
    /// and C5 index 2). Empty labels are omitted.
    pub fn render_block(&self) -> String {
        let guard = self.0.lock().expect("memories mutex poisoned");
        let mut out = String::from("[Memories]\n");
        for label in [
            MemoryLabel::Invariant,
            MemoryLabel::Constraint,
            MemoryLabel::Decision,
            MemoryLabel::Reference,
            MemoryLabel::OpenItem,
        ] {
            if let Some(items) = guard.get(&label) {
                if items.is_empty() {
                    continue;
                }
                out.push_str(&format!("{label:?}:\n"));
                for item in items {
                    out.push_str(&format!("- {item}\n"));
                }
            }
        }
        out
    }
}

/// True if `a` and `b` share a common prefix of at least
/// `min(REMOVE_MATCH_MIN_PREFIX, shorter string's length)` characters.
fn prefix_matches(a: &str, b: &str) -> bool {
    let common = a.chars().zip(b.chars()).take_while(|(x, y)| x == y).count();
    let shorter_len = a.chars().count().min(b.chars().count());
    let required = REMOVE_MATCH_MIN_PREFIX.min(shorter_len);
    required > 0 && common >= required
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Chapter summary (Compacting strategy)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Max chapter summaries retained; oldest evicted on overflow.
pub const MAX_CHAPTER_SUMMARIES: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterSummary {
    pub text: String,
    pub created_at: DateTime<Utc>,
    /// Number of messages this summary replaced.
    pub turns_compacted: usize,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Frame (SFCM strategy)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Max push_context nesting depth.
pub const MAX_FRAME_DEPTH: usize = 6;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    /// `FRAME_N`, N = depth.
    pub id: String,
    pub task: String,
    pub details: String,
    pub depth: usize,
    /// Index of the assistant message whose `push_context` call opened this frame.
    pub boundary_index: usize,
    /// Index of the `FRAME_N` marker message that starts this frame.
    pub start_index: usize,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Conversation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationData {
    pub id: String,
    pub ticket_id: String,
    pub display_name: String,
    pub role: ConversationRole,
    pub strategy: ConversationStrategy,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub chapter_summaries: Vec<ChapterSummary>,
    #[serde(default)]
    pub memories: HashMap<MemoryLabel, Vec<String>>,
    #[serde(default)]
    pub frames: Vec<Frame>,
    #[serde(default)]
    pub finished: bool,
    pub active_model: String,
}

impl ConversationData {
    pub fn new(
        ticket_id: String,
        display_name: String,
        role: ConversationRole,
        strategy: ConversationStrategy,
        active_model: String,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            ticket_id,
            display_name,
            role,
            strategy,
            started_at: Utc::now(),
            completed_at: None,
            messages: Vec::new(),
            chapter_summaries: Vec::new(),
            memories: HashMap::new(),
            frames: Vec::new(),
            finished: false,
            active_model,
        }
    }

    pub fn finish(&mut self) {
        self.finished = true;
        self.completed_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memories_add_is_deduplicated() {
        let m = MemoriesMap::new();
        m.add(MemoryLabel::Invariant, "one worker per ticket");
        m.add(MemoryLabel::Invariant, "one worker per ticket");
        assert_eq!(m.snapshot()[&MemoryLabel::Invariant].len(), 1);
    }

    #[test]
    fn memories_shared_between_clones() {
        let parent = MemoriesMap::new();
        let child = parent.clone();
        child.add(MemoryLabel::Decision, "use axum");
        assert_eq!(parent.snapshot()[&MemoryLabel::Decision][0], "use axum");
    }

    #[test]
    fn memories_remove_is_prefix_tolerant() {
        let m = MemoriesMap::new();
        m.add(MemoryLabel::Reference, "see docs/auth.md for token format");
        let removed = m.remove(MemoryLabel::Reference, "see docs/auth.md but truncated");
        assert_eq!(removed, 1);
        assert!(m.snapshot().get(&MemoryLabel::Reference).map(|v| v.is_empty()).unwrap_or(true));
    }

    #[test]
    fn memories_remove_requires_minimum_prefix() {
        let m = MemoriesMap::new();
        m.add(MemoryLabel::Reference, "abc");
        // "abd" shares only 2 chars with "abc", below the 6-char floor,
        // and both strings are shorter than the floor too — no match.
        let removed = m.remove(MemoryLabel::Reference, "xyz");
        assert_eq!(removed, 0);
    }

    #[test]
    fn chapter_summaries_cap_is_ten() {
        assert_eq!(MAX_CHAPTER_SUMMARIES, 10);
    }

    #[test]
    fn frame_depth_cap_is_six() {
        assert_eq!(MAX_FRAME_DEPTH, 6);
    }
}
