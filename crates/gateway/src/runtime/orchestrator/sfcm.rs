//! SFCM (Stack-Frame Context Management) conversation strategy (C5).
//!
//! An alternative to [`super::compacting`] for models with solid
//! instruction-following: instead of summarizing old turns, work is nested
//! in explicit frames that get truncated away as they close.

use sa_domain::conversation::{ConversationData, Frame, MAX_FRAME_DEPTH};
use sa_domain::error::{Error, Result};
use sa_domain::tool::{ContentPart, Message, MessageContent, Role};

pub const MEMORIES_INDEX: usize = 2;
pub const FRAME_0_MARKER_INDEX: usize = 3;
pub const USER_INSTRUCTIONS_INDEX: usize = 4;

fn frame_marker_text(depth: usize) -> String {
    format!("FRAME_{depth}")
}

fn marker_depth(m: &Message) -> Option<usize> {
    if m.role != Role::System {
        return None;
    }
    m.content.extract_all_text().strip_prefix("FRAME_")?.parse().ok()
}

/// Rewrite the fixed prefix (0–4) in place. Called on construction and on
/// reconstitution (instructions re-read from disk).
pub fn refresh_fixed_prefix(
    data: &mut ConversationData,
    sfcm_instructions: &str,
    user_goal: &str,
    current_focus: &str,
) {
    let memories_text = if data.messages.len() > MEMORIES_INDEX {
        data.messages[MEMORIES_INDEX].content.extract_all_text()
    } else {
        "[Memories]".to_string()
    };
    let prefix = vec![
        Message::system(sfcm_instructions),
        Message::user(user_goal),
        Message::system(memories_text),
        Message::system(frame_marker_text(0)),
        Message::user(current_focus),
    ];
    if data.messages.len() < prefix.len() {
        data.messages = prefix;
    } else {
        data.messages.splice(0..prefix.len(), prefix);
    }
    if data.frames.is_empty() {
        data.frames.push(Frame {
            id: frame_marker_text(0),
            task: current_focus.to_string(),
            details: String::new(),
            depth: 0,
            boundary_index: 0,
            start_index: FRAME_0_MARKER_INDEX,
        });
    }
}

pub fn current_depth(data: &ConversationData) -> usize {
    data.frames.last().map(|f| f.depth).unwrap_or(0)
}

/// Tool description for `pop_context`, rebuilt so the model sees
/// frame-aware guidance as depth changes.
pub fn pop_context_description(depth: usize) -> String {
    if depth == 0 {
        "Finish the current top-level focus: fold your result into memories and move to the next step.".to_string()
    } else {
        format!(
            "Close the current sub-task (depth {depth}) and return its result to the parent frame."
        )
    }
}

/// Whether `push_context` should be offered at all (omitted once max depth
/// is reached).
pub fn push_context_available(data: &ConversationData) -> bool {
    current_depth(data) < MAX_FRAME_DEPTH
}

/// Opens a new frame. Appends a `FRAME_N` marker followed by a user message
/// `"{task}\n\n{details}"`. `boundary_index` is the index of the assistant
/// message (already appended to `data.messages`) that carries this call.
pub fn push_context(data: &mut ConversationData, task: &str, details: &str) -> Result<()> {
    let depth = current_depth(data) + 1;
    if depth > MAX_FRAME_DEPTH {
        return Err(Error::Other(format!("max SFCM frame depth {MAX_FRAME_DEPTH} reached")));
    }
    let boundary_index = data.messages.len().saturating_sub(1);
    let start_index = data.messages.len();
    data.messages.push(Message::system(frame_marker_text(depth)));
    data.messages.push(Message::user(format!("{task}\n\n{details}")));
    data.frames.push(Frame {
        id: frame_marker_text(depth),
        task: task.to_string(),
        details: details.to_string(),
        depth,
        boundary_index,
        start_index,
    });
    Ok(())
}

/// Drop the `push_context` tool-use part from the boundary assistant
/// message. The boundary message itself is always kept, even when the call
/// was its only content — callers rely on the boundary message staying in
/// place so `messages.len()` after a pop is predictable.
fn strip_push_context_call(data: &mut ConversationData, boundary_index: usize) {
    let Some(msg) = data.messages.get_mut(boundary_index) else {
        return;
    };
    if let MessageContent::Parts(parts) = &mut msg.content {
        parts.retain(|p| !matches!(p, ContentPart::ToolUse { name, .. } if name == "push_context"));
        if parts.is_empty() {
            parts.push(ContentPart::Text { text: String::new() });
        }
    }
}

/// Closes the active frame.
///
/// Depth ≥ 1: truncates back to the boundary, drops the spent
/// `push_context` call from the boundary message (keeping the message
/// itself even if that call was its only content), and appends a user
/// message carrying the result — leaving exactly `boundary_index + 2`
/// messages behind.
/// Depth 0 (closing `FRAME_0`): truncates to the marker, folds `result`
/// into the memories message, and re-opens `FRAME_0` with `next_steps` as
/// the new focus.
pub fn pop_context(data: &mut ConversationData, result: &str, next_steps: &str) -> Result<()> {
    let Some(frame) = data.frames.pop() else {
        return Err(Error::Other("pop_context called with no open frame".to_string()));
    };

    if frame.depth >= 1 {
        data.messages.truncate(frame.boundary_index + 1);
        strip_push_context_call(data, frame.boundary_index);
        data.messages
            .push(Message::user(format!("{}\n{result}\n[Next: {next_steps}]", frame.task)));
    } else {
        data.messages.truncate(frame.start_index);
        if let Some(memories_msg) = data.messages.get_mut(MEMORIES_INDEX) {
            let existing = memories_msg.content.extract_all_text();
            *memories_msg = Message::system(format!("{existing}\n{result}"));
        }
        data.messages.push(Message::system(frame_marker_text(0)));
        data.messages.push(Message::user(next_steps.to_string()));
        data.frames.push(Frame {
            id: frame_marker_text(0),
            task: next_steps.to_string(),
            details: String::new(),
            depth: 0,
            boundary_index: 0,
            start_index: data.messages.len() - 2,
        });
    }
    Ok(())
}

pub const NUDGE_TEXT: &str = "Continue. When this sub-task is complete, call pop_context with your findings.";

/// Whether a text-only (no tool call) assistant turn should trigger the
/// nudge, or be treated as completion (depth 0, no deeper frame).
pub fn should_nudge(data: &ConversationData) -> bool {
    current_depth(data) > 0
}

/// Rebuild the frame stack by scanning for `FRAME_N` markers. The boundary
/// index for each frame is the nearest prior assistant message carrying a
/// `push_context` call. If no markers are found but the fixed prefix
/// exists, a clean `FRAME_0` is rebuilt from messages 0 and 1.
pub fn reconstitute_frames(data: &mut ConversationData) {
    let mut frames = Vec::new();
    for (idx, msg) in data.messages.iter().enumerate() {
        let Some(depth) = marker_depth(msg) else { continue };
        let boundary_index = data.messages[..idx]
            .iter()
            .enumerate()
            .rev()
            .find(|(_, m)| {
                matches!(&m.content, MessageContent::Parts(parts) if parts.iter().any(|p| matches!(p, ContentPart::ToolUse { name, .. } if name == "push_context")))
            })
            .map(|(i, _)| i)
            .unwrap_or(0);
        let task = data
            .messages
            .get(idx + 1)
            .map(|m| m.content.extract_all_text())
            .unwrap_or_default();
        frames.push(Frame {
            id: frame_marker_text(depth),
            task,
            details: String::new(),
            depth,
            boundary_index,
            start_index: idx,
        });
    }

    if frames.is_empty() && data.messages.len() >= 2 {
        frames.push(Frame {
            id: frame_marker_text(0),
            task: data.messages[1].content.extract_all_text(),
            details: String::new(),
            depth: 0,
            boundary_index: 0,
            start_index: FRAME_0_MARKER_INDEX.min(data.messages.len().saturating_sub(1)),
        });
    }

    data.frames = frames;
}

#[cfg(test)]
mod tests {
    use super::*;
    use sa_domain::conversation::{ConversationRole, ConversationStrategy};

    fn sample() -> ConversationData {
        let mut data = ConversationData::new(
            "t1".into(),
            "Developer".into(),
            ConversationRole::Developer,
            ConversationStrategy::Sfcm,
            "gpt-4o".into(),
        );
        refresh_fixed_prefix(&mut data, "sfcm instructions", "ship the feature", "start with the schema");
        data
    }

    #[test]
    fn fresh_conversation_starts_at_depth_zero() {
        let data = sample();
        assert_eq!(current_depth(&data), 0);
        assert!(push_context_available(&data));
    }

    #[test]
    fn push_context_increments_depth_and_appends_marker() {
        let mut data = sample();
        data.messages.push(Message::assistant("calling push_context"));
        push_context(&mut data, "sub task", "details here").unwrap();
        assert_eq!(current_depth(&data), 1);
        assert_eq!(data.messages.last().unwrap().content.extract_all_text(), "sub task\n\ndetails here");
    }

    #[test]
    fn push_context_blocked_past_max_depth() {
        let mut data = sample();
        for i in 0..MAX_FRAME_DEPTH {
            data.messages.push(Message::assistant("push"));
            push_context(&mut data, &format!("task {i}"), "d").unwrap();
        }
        assert!(!push_context_available(&data));
        data.messages.push(Message::assistant("push"));
        assert!(push_context(&mut data, "one too many", "d").is_err());
    }

    #[test]
    fn pop_context_depth_one_truncates_to_boundary() {
        let mut data = sample();
        data.messages.push(Message::assistant("calling push_context"));
        push_context(&mut data, "sub task", "details here").unwrap();
        let len_before_pop = data.messages.len();
        pop_context(&mut data, "done", "move on").unwrap();
        assert_eq!(current_depth(&data), 0);
        assert!(data.messages.len() < len_before_pop);
        assert!(data.messages.last().unwrap().content.extract_all_text().contains("move on"));
    }

    #[test]
    fn pop_context_keeps_boundary_message_when_it_is_calls_only() {
        let mut data = sample();
        data.messages.push(Message {
            role: Role::Assistant,
            content: MessageContent::Parts(vec![ContentPart::ToolUse {
                id: "call-1".to_string(),
                name: "push_context".to_string(),
                input: serde_json::json!({"task": "sub task", "details": "details here"}),
            }]),
        });
        push_context(&mut data, "sub task", "details here").unwrap();
        let boundary_index = data.frames.last().unwrap().boundary_index;
        pop_context(&mut data, "done", "move on").unwrap();
        assert_eq!(data.messages.len(), boundary_index + 2);
        assert_eq!(data.messages[boundary_index].role, Role::Assistant);
        assert!(data.messages.last().unwrap().content.extract_all_text().contains("move on"));
    }

    #[test]
    fn pop_context_depth_zero_folds_into_memories() {
        let mut data = sample();
        pop_context(&mut data, "initial result", "next focus").unwrap();
        assert_eq!(current_depth(&data), 0);
        assert!(data.messages[MEMORIES_INDEX].content.extract_all_text().contains("initial result"));
        assert_eq!(data.frames.last().unwrap().task, "next focus");
    }

    #[test]
    fn should_nudge_only_when_depth_positive() {
        let mut data = sample();
        assert!(!should_nudge(&data));
        data.messages.push(Message::assistant("calling push_context"));
        push_context(&mut data, "sub task", "d").unwrap();
        assert!(should_nudge(&data));
    }

    #[test]
    fn reconstitute_rebuilds_frame_zero_when_no_markers_present() {
        let mut data = sample();
        data.frames.clear();
        reconstitute_frames(&mut data);
        assert_eq!(data.frames.len(), 1);
        assert_eq!(data.frames[0].depth, 0);
    }
}
