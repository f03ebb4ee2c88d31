use std::fmt::Write as _;
use std::sync::Arc;

use tokio::sync::watch;

use crate::entry::ConversationEntry;
use crate::project::ProjectMemory;
use crate::summarizer::excerpt;

const REQUIREMENTS_CHARS: usize = 200;
const ACTIVITY_CHARS: usize = 120;
const LIST_TAIL: usize = 5;
const TRUNCATION_MARKER: &str = "\n[context truncated]";

/// Point-in-time view published by the manager after every mutation.
#[derive(Debug, Clone)]
pub struct ContextSnapshot {
    pub memory: ProjectMemory,
    pub pending_entries: usize,
    pub recent: Vec<ConversationEntry>,
    pub auto_summarize_suspended: bool,
}

/// Cloneable reader of the latest [`ContextSnapshot`].
///
/// Never waits on the manager, so it can be used while a summarization
/// pass is in flight.
#[derive(Debug, Clone)]
pub struct ContextHandle {
    rx: watch::Receiver<Arc<ContextSnapshot>>,
    char_budget: usize,
}

impl ContextHandle {
    pub(crate) fn new(rx: watch::Receiver<Arc<ContextSnapshot>>, char_budget: usize) -> Self {
        Self { rx, char_budget }
    }

    pub fn snapshot(&self) -> Arc<ContextSnapshot> {
        Arc::clone(&self.rx.borrow())
    }

    pub fn context_summary(&self) -> String {
        render_context(&self.snapshot(), self.char_budget)
    }

    /// Wait until the manager publishes a newer snapshot. Returns `false`
    /// once the manager is gone.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}

/// Render a snapshot as text of at most `char_budget` chars.
pub fn render_context(snapshot: &ContextSnapshot, char_budget: usize) -> String {
    let memory = &snapshot.memory;
    let mut out = String::new();

    let _ = writeln!(out, "PROJECT: {}", memory.project_name);
    let _ = writeln!(
        out,
        "Created: {} | Updated: {}",
        memory.created_at.format("%Y-%m-%d %H:%M UTC"),
        memory.last_updated.format("%Y-%m-%d %H:%M UTC")
    );
    if !memory.original_requirements.trim().is_empty() {
        let _ = writeln!(
            out,
            "Requirements: {}",
            clip(memory.original_requirements.trim(), REQUIREMENTS_CHARS)
        );
    }
    let _ = write!(
        out,
        "Pending entries: {} (not yet summarized)",
        snapshot.pending_entries
    );
    if snapshot.auto_summarize_suspended {
        out.push_str(" [summarization suspended after failure]");
    }
    out.push('\n');

    push_list(&mut out, "Objectives", &memory.current_objectives);
    push_list(&mut out, "Files created", &memory.files_created);
    push_list(&mut out, "Files modified", &memory.files_modified);
    push_list(&mut out, "Decisions", &memory.architecture_decisions);
    push_list(&mut out, "Lessons", &memory.lessons_learned);
    push_list(&mut out, "Current blockers", &memory.current_blockers);
    push_list(&mut out, "Next steps", &memory.next_steps);

    if let Some(digest) = memory.conversation_digests.last() {
        let _ = writeln!(
            out,
            "\nLast digest ({} entries, {} digests total):",
            digest.entry_count,
            memory.conversation_digests.len()
        );
        for line in digest.text.lines().take(LIST_TAIL + 1) {
            let _ = writeln!(out, "  {line}");
        }
    }

    if !snapshot.recent.is_empty() {
        out.push_str("\nRecent activity:\n");
        for entry in &snapshot.recent {
            let _ = writeln!(
                out,
                "  [{}] {} ({}): {}",
                entry.timestamp.format("%H:%M:%S"),
                entry.agent,
                entry.kind,
                excerpt(&entry.content, ACTIVITY_CHARS)
            );
        }
    }

    bound(out, char_budget)
}

/// Last few items of a list, with a count of the hidden ones.
fn push_list(out: &mut String, title: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    let hidden = items.len().saturating_sub(LIST_TAIL);
    if hidden > 0 {
        let _ = writeln!(out, "\n{title} (last {LIST_TAIL} of {}):", items.len());
    } else {
        let _ = writeln!(out, "\n{title}:");
    }
    for item in &items[hidden..] {
        let _ = writeln!(out, "  - {item}");
    }
}

fn clip(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

fn bound(text: String, char_budget: usize) -> String {
    if text.chars().count() <= char_budget {
        return text;
    }
    let marker_chars = TRUNCATION_MARKER.chars().count();
    if char_budget < marker_chars {
        return text.chars().take(char_budget).collect();
    }
    let keep = char_budget - marker_chars;
    let mut bounded: String = text.chars().take(keep).collect();
    bounded.push_str(TRUNCATION_MARKER);
    bounded
}
