//! Compacting Conversation strategy (C4).
//!
//! Messages 0–3 are a fixed prefix (system prompt, user goal, memories
//! block, chapter summaries) that is never summarized; everything from
//! index 4 on is the compressible tail. When the tail grows past a
//! threshold, the oldest portion of it is replaced by a chapter summary
//! produced by a nested Compaction conversation.

use sa_domain::conversation::{
    ChapterSummary, ConversationData, MemoriesMap, MAX_CHAPTER_SUMMARIES,
};
use sa_domain::error::Result;
use sa_domain::tool::{Message, Role};

/// Below this size the tail is never compacted, even if the caller's
/// configured threshold is lower.
const MIN_THRESHOLD: usize = 3072;

pub const FIXED_PREFIX_LEN: usize = 4;

fn message_len(m: &Message) -> usize {
    format!("{:?}", m.role).len() + m.content.extract_all_text().len()
}

/// Sum of role+content sizes, ignoring system messages (index 0).
pub fn approx_size(messages: &[Message]) -> usize {
    messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(message_len)
        .sum()
}

pub fn needs_compaction(data: &ConversationData, configured_threshold: usize) -> bool {
    let threshold = configured_threshold.max(MIN_THRESHOLD);
    approx_size(&data.messages) > threshold
}

/// Rebuild the `[Memories]` block (index 2) from the conversation's own
/// memories snapshot.
pub fn memories_block(data: &ConversationData) -> String {
    MemoriesMap::from_snapshot(data.memories.clone()).render_block()
}

/// Rebuild the chapter-summaries block (index 3).
pub fn chapter_summaries_block(data: &ConversationData) -> String {
    if data.chapter_summaries.is_empty() {
        return "[Chapter Summaries]\n(none yet)".to_string();
    }
    let mut out = String::from("[Chapter Summaries]\n");
    for (i, chapter) in data.chapter_summaries.iter().enumerate() {
        out.push_str(&format!("{}. {}\n", i + 1, chapter.text));
    }
    out
}

/// Rewrite the fixed prefix (0–3) in place. Called on construction and on
/// reconstitution (system prompt re-read from disk, memories/summaries
/// re-rendered from the current snapshot).
pub fn refresh_fixed_prefix(data: &mut ConversationData, system_prompt: &str, user_instructions: &str) {
    let memories = Message::system(memories_block(data));
    let summaries = Message::system(chapter_summaries_block(data));
    let prefix = vec![
        Message::system(system_prompt),
        Message::user(user_instructions),
        memories,
        summaries,
    ];
    if data.messages.len() < FIXED_PREFIX_LEN {
        data.messages = prefix;
    } else {
        data.messages.splice(0..FIXED_PREFIX_LEN, prefix);
    }
}

fn escape_quotes(s: &str) -> String {
    s.replace('"', "\\\"")
}

/// `role: "content"` lines for the range being summarized.
fn format_history_block(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| format!("{:?}: \"{}\"", m.role, escape_quotes(&m.content.extract_all_text())))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Build the user message handed to the Compaction sub-conversation: the
/// original task, current memories, and the history block to be summarized.
pub fn build_compaction_prompt(data: &ConversationData, range: &[Message]) -> String {
    let task = data
        .messages
        .get(1)
        .map(|m| m.content.extract_all_text())
        .unwrap_or_default();
    format!(
        "Original task:\n\"{}\"\n\nCurrent memories:\n{}\n\nHistory to summarize:\n{}",
        escape_quotes(&task),
        memories_block(data),
        format_history_block(range)
    )
}

/// Compact the tail if it exceeds the threshold. `run_compaction` drives a
/// Compaction sub-conversation (role `Compaction`, tools `add_memory` /
/// `remove_memory` / `summarize_history`) and returns the text passed to
/// `summarize_history` when it calls `exitLoop`. Returns `true` if a
/// compaction happened.
pub async fn maybe_compact<F, Fut>(
    data: &mut ConversationData,
    configured_threshold: usize,
    run_compaction: F,
) -> Result<bool>
where
    F: FnOnce(String) -> Fut,
    Fut: std::future::Future<Output = Result<String>>,
{
    if !needs_compaction(data, configured_threshold) {
        return Ok(false);
    }

    let total = data.messages.len().saturating_sub(FIXED_PREFIX_LEN);
    if total < 2 {
        return Ok(false);
    }
    let keep_recent = (total as f64 * 0.2).floor().max(1.0) as usize;
    let end = data.messages.len() - keep_recent;

    let range = data.messages[FIXED_PREFIX_LEN..end].to_vec();
    let prompt = build_compaction_prompt(data, &range);
    let summary_text = run_compaction(prompt).await?;

    data.messages.drain(FIXED_PREFIX_LEN..end);
    data.chapter_summaries.push(ChapterSummary {
        text: summary_text,
        created_at: chrono::Utc::now(),
        turns_compacted: range.len(),
    });
    if data.chapter_summaries.len() > MAX_CHAPTER_SUMMARIES {
        let overflow = data.chapter_summaries.len() - MAX_CHAPTER_SUMMARIES;
        data.chapter_summaries.drain(0..overflow);
    }
    data.messages[3] = Message::system(chapter_summaries_block(data));
    Ok(true)
}

/// Log file name for this conversation's `c`-th chapter — a fresh file
/// after each compaction rather than one growing log per conversation.
pub fn log_file_name(ticket_id: &str, timestamp: &str, seq: u32, chapter: u32) -> String {
    if chapter == 0 {
        format!("{ticket_id}-{timestamp}-{seq:03}.log")
    } else {
        format!("{ticket_id}-{timestamp}-{seq:03}-c{chapter}.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sa_domain::conversation::{ConversationRole, ConversationStrategy};

    fn sample(tail_len: usize) -> ConversationData {
        let mut data = ConversationData::new(
            "t1".into(),
            "Developer".into(),
            ConversationRole::Developer,
            ConversationStrategy::Compacting,
            "gpt-4o".into(),
        );
        refresh_fixed_prefix(&mut data, "system prompt", "do the thing");
        for i in 0..tail_len {
            data.messages.push(Message::assistant(format!("turn {i}")));
        }
        data
    }

    #[test]
    fn small_tail_does_not_need_compaction() {
        let data = sample(3);
        assert!(!needs_compaction(&data, 100));
    }

    #[test]
    fn oversized_tail_needs_compaction() {
        let mut data = sample(0);
        data.messages.push(Message::assistant("x".repeat(5000)));
        assert!(needs_compaction(&data, 100));
    }

    #[tokio::test]
    async fn maybe_compact_keeps_twenty_percent_recent() {
        let mut data = sample(0);
        for i in 0..20 {
            data.messages.push(Message::assistant("x".repeat(300) + &i.to_string()));
        }
        let before_len = data.messages.len();
        let compacted = maybe_compact(&mut data, 100, |_prompt| async { Ok("summary text".to_string()) })
            .await
            .unwrap();
        assert!(compacted);
        assert_eq!(data.chapter_summaries.len(), 1);
        assert_eq!(data.chapter_summaries[0].text, "summary text");
        // keepRecent = floor(0.2 * 20) = 4, so messages shrink by 16.
        assert_eq!(data.messages.len(), before_len - 16);
    }

    #[test]
    fn chapter_summaries_cap_enforced_by_eviction() {
        let mut data = sample(0);
        for i in 0..(MAX_CHAPTER_SUMMARIES + 3) {
            data.chapter_summaries.push(ChapterSummary {
                text: format!("chapter {i}"),
                created_at: chrono::Utc::now(),
                turns_compacted: 1,
            });
        }
        if data.chapter_summaries.len() > MAX_CHAPTER_SUMMARIES {
            let overflow = data.chapter_summaries.len() - MAX_CHAPTER_SUMMARIES;
            data.chapter_summaries.drain(0..overflow);
        }
        assert_eq!(data.chapter_summaries.len(), MAX_CHAPTER_SUMMARIES);
        assert_eq!(data.chapter_summaries[0].text, "chapter 3");
    }
}
