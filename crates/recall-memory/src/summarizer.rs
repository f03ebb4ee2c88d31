use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use recall_config::MemoryConfig;
use recall_core::{MemoryError, MessageKind, Result};
use tracing::debug;

use crate::entry::ConversationEntry;
use crate::llm_client::{ApiClient, CompletionClient};
use crate::project::{DigestRecord, MemoryUpdates};

const EXCERPT_CHARS: usize = 160;
const PROMPT_EXCERPT_CHARS: usize = 500;

/// Output of one summarization pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Digest {
    pub text: String,
    pub updates: MemoryUpdates,
    pub entry_count: usize,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

impl Digest {
    pub fn to_record(&self) -> DigestRecord {
        DigestRecord {
            created_at: Utc::now(),
            entry_count: self.entry_count,
            window_start: self.window_start,
            window_end: self.window_end,
            text: self.text.clone(),
        }
    }
}

/// Condenses a batch of conversation entries.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, entries: &[ConversationEntry]) -> Result<Digest>;
}

/// Rule-based digests; identical input gives identical output.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeterministicSummarizer;

#[async_trait]
impl Summarizer for DeterministicSummarizer {
    async fn summarize(&self, entries: &[ConversationEntry]) -> Result<Digest> {
        let batch = Batch::new(entries)?;
        let mut text = batch.header();
        text.push_str("\n\nAgent activity:\n");
        text.push_str(&batch.agent_activity());
        text.push_str(&batch.handoff_section());
        text.push_str(&batch.error_section());
        Ok(batch.into_digest(text))
    }
}

/// Digests narrated by a hosted completion service.
///
/// The header, handoffs, and verbatim error section are still produced
/// locally; only the narrative comes from the service.
pub struct LlmSummarizer {
    client: Arc<dyn CompletionClient>,
    model_hint: String,
}

impl LlmSummarizer {
    pub fn new(client: Arc<dyn CompletionClient>, model_hint: impl Into<String>) -> Self {
        Self {
            client,
            model_hint: model_hint.into(),
        }
    }
}

impl std::fmt::Debug for LlmSummarizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmSummarizer")
            .field("model_hint", &self.model_hint)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(&self, entries: &[ConversationEntry]) -> Result<Digest> {
        let batch = Batch::new(entries)?;
        let prompt = batch.prompt();
        debug!(
            entries = entries.len(),
            prompt_chars = prompt.len(),
            "requesting digest narration"
        );

        let narrative = self
            .client
            .complete(&prompt, &self.model_hint)
            .await
            .map_err(|error| MemoryError::SummarizationUnavailable(format!("{error:#}")))?;
        let narrative = narrative.trim();
        if narrative.is_empty() {
            return Err(MemoryError::SummarizationUnavailable(
                "completion service returned an empty digest".to_string(),
            ));
        }

        let mut text = batch.header();
        text.push_str("\n\n");
        text.push_str(narrative);
        text.push('\n');
        text.push_str(&batch.handoff_section());
        text.push_str(&batch.error_section());
        Ok(batch.into_digest(text))
    }
}

/// Hosted narration when `[memory.llm]` is enabled, rule-based otherwise.
pub fn summarizer_from_config(config: &MemoryConfig) -> anyhow::Result<Arc<dyn Summarizer>> {
    if !config.llm.enabled {
        return Ok(Arc::new(DeterministicSummarizer));
    }
    let client = ApiClient::from_config(&config.llm)?;
    debug!(models = %config.llm.models, "using hosted digest narration");
    Ok(Arc::new(LlmSummarizer::new(
        Arc::new(client),
        config.model_hint.clone(),
    )))
}

/// Entries grouped by agent in first-seen order.
struct Batch<'a> {
    entries: &'a [ConversationEntry],
    by_agent: Vec<(&'a str, Vec<&'a ConversationEntry>)>,
}

impl<'a> Batch<'a> {
    fn new(entries: &'a [ConversationEntry]) -> Result<Self> {
        if entries.is_empty() {
            return Err(MemoryError::Validation(
                "cannot summarize an empty batch".to_string(),
            ));
        }

        let mut by_agent: Vec<(&str, Vec<&ConversationEntry>)> = Vec::new();
        for entry in entries {
            match by_agent.iter_mut().find(|(agent, _)| *agent == entry.agent) {
                Some((_, group)) => group.push(entry),
                None => by_agent.push((entry.agent.as_str(), vec![entry])),
            }
        }
        Ok(Self { entries, by_agent })
    }

    fn window(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        let start = self.entries.first().map(|entry| entry.timestamp);
        let end = self.entries.last().map(|entry| entry.timestamp);
        let now = Utc::now();
        (start.unwrap_or(now), end.unwrap_or(now))
    }

    fn header(&self) -> String {
        let (start, end) = self.window();
        format!(
            "CONVERSATION SUMMARY ({} entries, {} - {} UTC)",
            self.entries.len(),
            start.format("%H:%M:%S"),
            end.format("%H:%M:%S")
        )
    }

    fn agent_activity(&self) -> String {
        let mut out = String::new();
        for (agent, group) in &self.by_agent {
            let kinds: Vec<&str> = MessageKind::ALL
                .iter()
                .filter(|kind| group.iter().any(|entry| entry.kind == **kind))
                .map(MessageKind::as_str)
                .collect();
            let tokens: u64 = group.iter().map(|entry| u64::from(entry.tokens)).sum();
            let _ = writeln!(
                out,
                "  - {agent}: {} entries ({}), ~{tokens} tokens",
                group.len(),
                kinds.join(", ")
            );
            if let Some(last) = group
                .iter()
                .rev()
                .find(|entry| entry.kind == MessageKind::Output)
            {
                let _ = writeln!(
                    out,
                    "      last output: {}",
                    excerpt(&last.content, EXCERPT_CHARS)
                );
            }
        }
        out
    }

    fn handoffs(&self) -> impl Iterator<Item = (&'a ConversationEntry, String)> + '_ {
        self.entries
            .iter()
            .filter(|entry| entry.kind == MessageKind::Handoff)
            .map(|entry| (entry, handoff_target(entry)))
    }

    fn handoff_section(&self) -> String {
        let mut out = String::new();
        for (entry, target) in self.handoffs() {
            if out.is_empty() {
                out.push_str("\nHandoffs:\n");
            }
            let _ = writeln!(
                out,
                "  - {} {} -> {target}",
                entry.timestamp.format("%H:%M:%S"),
                entry.agent
            );
        }
        out
    }

    /// Error entries with their content untouched.
    fn error_section(&self) -> String {
        let mut out = String::new();
        for entry in self.entries.iter().filter(|entry| entry.is_error()) {
            if out.is_empty() {
                out.push_str("\nErrors (verbatim):\n");
            }
            let _ = writeln!(
                out,
                "- [{}] {}: {}",
                entry.timestamp.format("%H:%M:%S"),
                entry.agent,
                entry.content
            );
        }
        out
    }

    fn prompt(&self) -> String {
        let mut prompt = String::from(
            "Summarize the following multi-agent conversation log for a project memory file. \
             Keep each agent's narrative together, mention decisions, produced files and \
             unresolved problems. Reply with plain text bullet points.\n",
        );
        for (agent, group) in &self.by_agent {
            let _ = writeln!(prompt, "\n## {agent}");
            for entry in group {
                let content = if entry.is_error() {
                    entry.content.clone()
                } else {
                    excerpt(&entry.content, PROMPT_EXCERPT_CHARS)
                };
                let _ = writeln!(
                    prompt,
                    "[{}] ({}) {}",
                    entry.timestamp.format("%H:%M:%S"),
                    entry.kind,
                    content
                );
            }
        }
        prompt
    }

    fn updates(&self) -> MemoryUpdates {
        let mut updates = MemoryUpdates::default();
        let (start, end) = self.window();

        let errors: Vec<&ConversationEntry> =
            self.entries.iter().filter(|entry| entry.is_error()).collect();
        if !errors.is_empty() {
            updates.lessons.push(format!(
                "Encountered {} error(s) between {} and {} UTC",
                errors.len(),
                start.format("%Y-%m-%d %H:%M"),
                end.format("%H:%M")
            ));
            for entry in &errors {
                updates.failed_approaches.push(format!(
                    "{}: {}",
                    entry.agent,
                    excerpt(&entry.content, EXCERPT_CHARS)
                ));
            }
        }

        for (agent, group) in &self.by_agent {
            if let Some(last) = group.last().filter(|entry| entry.is_error()) {
                updates
                    .blockers
                    .push(format!("{agent}: {}", excerpt(&last.content, EXCERPT_CHARS)));
            }
        }

        for (entry, target) in self.handoffs() {
            let pattern = format!("{} -> {target}", entry.agent);
            if !updates.handoff_patterns.contains(&pattern) {
                updates.handoff_patterns.push(pattern);
            }
        }

        updates
    }

    fn into_digest(self, text: String) -> Digest {
        let (window_start, window_end) = self.window();
        Digest {
            updates: self.updates(),
            entry_count: self.entries.len(),
            window_start,
            window_end,
            text,
        }
    }
}

fn handoff_target(entry: &ConversationEntry) -> String {
    entry
        .metadata
        .get("to_agent")
        .map(ToString::to_string)
        .unwrap_or_else(|| "unknown".to_string())
}

/// First line of `text`, cut to `max_chars` on a char boundary.
pub(crate) fn excerpt(text: &str, max_chars: usize) -> String {
    let line = text.lines().next().unwrap_or_default().trim();
    let truncated: String = line.chars().take(max_chars).collect();
    if truncated.len() < line.len() || text.trim().lines().nth(1).is_some() {
        format!("{truncated}...")
    } else {
        truncated
    }
}
