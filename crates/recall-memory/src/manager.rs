use std::sync::Arc;
use std::time::Duration;

use recall_config::MemoryConfig;
use recall_core::{MemoryError, MessageKind, Result};
use recall_lock::{ProjectLock, acquire_project_lock};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::context::{ContextHandle, ContextSnapshot, render_context};
use crate::entry::ConversationEntry;
use crate::log::ConversationLog;
use crate::persist::{LoadOutcome, ProjectStore};
use crate::project::{MemoryUpdates, ProjectMemory};
use crate::summarizer::Summarizer;
use crate::tools::{FileToolOutput, FileToolRequest, extract_file_path, is_create_tool, is_edit_tool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    /// Nothing recorded since the manager opened.
    Idle,
    Accumulating,
    /// A summarization pass is awaiting its digest.
    Summarizing,
}

/// Result of one completed summarization pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryReport {
    pub drained: usize,
    pub retained: usize,
    pub digest_chars: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Appended { live: usize },
    /// The append pushed the log over the threshold and a pass ran.
    Summarized(SummaryReport),
}

/// Free-form fact added to a project's memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryNote {
    Objective(String),
    Decision(String),
    KeyFunction(String),
    Pattern(String),
    FailedApproach(String),
    Lesson(String),
    Milestone(String),
    Blocker(String),
    NextStep(String),
}

impl MemoryNote {
    fn into_updates(self) -> MemoryUpdates {
        let mut updates = MemoryUpdates::default();
        match self {
            Self::Objective(text) => updates.objectives.push(text),
            Self::Decision(text) => updates.decisions.push(text),
            Self::KeyFunction(text) => updates.key_functions.push(text),
            Self::Pattern(text) => updates.successful_patterns.push(text),
            Self::FailedApproach(text) => updates.failed_approaches.push(text),
            Self::Lesson(text) => updates.lessons.push(text),
            Self::Milestone(text) => updates.milestones.push(text),
            Self::Blocker(text) => updates.blockers.push(text),
            Self::NextStep(text) => updates.next_steps.push(text),
        }
        updates
    }
}

/// Sets `Summarizing` for its lifetime and `Accumulating` on drop, so a
/// cancelled pass does not leave the state stuck.
struct SummarizingPhase<'a>(&'a mut ManagerState);

impl<'a> SummarizingPhase<'a> {
    fn enter(state: &'a mut ManagerState) -> Self {
        *state = ManagerState::Summarizing;
        Self(state)
    }
}

impl Drop for SummarizingPhase<'_> {
    fn drop(&mut self) {
        *self.0 = ManagerState::Accumulating;
    }
}

/// Owns one project's live log and durable memory.
///
/// Holds the project's file lock for its whole lifetime; a second manager
/// for the same project and memory dir fails to open until this one drops.
pub struct MemoryManager {
    project: String,
    overflow_threshold: usize,
    retain_recent: usize,
    context_char_budget: usize,
    context_recent_entries: usize,
    summarize_timeout: Option<Duration>,
    store: ProjectStore,
    memory: ProjectMemory,
    log: ConversationLog,
    summarizer: Arc<dyn Summarizer>,
    state: ManagerState,
    load_outcome: LoadOutcome,
    dirty: bool,
    auto_summarize_suspended: bool,
    snapshot_tx: watch::Sender<Arc<ContextSnapshot>>,
    _lock: ProjectLock,
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("project", &self.project)
            .field("state", &self.state)
            .field("live_entries", &self.log.size())
            .field("dirty", &self.dirty)
            .finish_non_exhaustive()
    }
}

impl MemoryManager {
    /// Lock the project, then load (or create) its durable memory.
    ///
    /// A corrupt memory file does not fail the open: it is moved aside and
    /// the cause is reported by [`MemoryManager::load_outcome`].
    pub fn open(
        project: &str,
        config: &MemoryConfig,
        summarizer: Arc<dyn Summarizer>,
    ) -> Result<Self> {
        let store = ProjectStore::new(config.resolved_dir(), project)?;
        let lock = acquire_project_lock(store.dir(), project, "memory manager").map_err(
            |error| MemoryError::Persistence {
                path: store.dir().join("locks").join(format!("{project}.lock")),
                reason: format!("{error:#}"),
            },
        )?;

        let (memory, load_outcome) = store.load();
        if let Some(error) = load_outcome.error() {
            warn!(project, %error, "project memory recovered with defaults");
        }

        let initial = Arc::new(ContextSnapshot {
            memory: memory.clone(),
            pending_entries: 0,
            recent: Vec::new(),
            auto_summarize_suspended: false,
        });
        let (snapshot_tx, _) = watch::channel(initial);

        info!(project, path = %store.file_path().display(), "opened project memory");
        Ok(Self {
            project: project.to_string(),
            overflow_threshold: config.overflow_threshold,
            retain_recent: config.retain_recent,
            context_char_budget: config.context_char_budget,
            context_recent_entries: config.context_recent_entries,
            summarize_timeout: config.summarize_timeout(),
            store,
            memory,
            log: ConversationLog::new(),
            summarizer,
            state: ManagerState::Idle,
            load_outcome,
            dirty: false,
            auto_summarize_suspended: false,
            snapshot_tx,
            _lock: lock,
        })
    }

    pub fn project_name(&self) -> &str {
        &self.project
    }

    pub fn state(&self) -> ManagerState {
        self.state
    }

    pub fn load_outcome(&self) -> &LoadOutcome {
        &self.load_outcome
    }

    pub fn memory(&self) -> &ProjectMemory {
        &self.memory
    }

    pub fn live_entries(&self) -> impl Iterator<Item = &ConversationEntry> {
        self.log.iter()
    }

    pub fn live_count(&self) -> usize {
        self.log.size()
    }

    /// Durable state has changes a failed save did not write.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Automatic passes stop after a summarization failure until
    /// [`MemoryManager::summarize_now`] succeeds.
    pub fn auto_summarize_suspended(&self) -> bool {
        self.auto_summarize_suspended
    }

    /// Append an entry; runs a summarization pass if the log overflows.
    ///
    /// On a failed pass the drained entries are back in the log and the
    /// error is returned. The entry itself stays recorded either way.
    pub async fn record_entry(&mut self, entry: ConversationEntry) -> Result<RecordOutcome> {
        self.log.append(entry)?;
        self.state = ManagerState::Accumulating;
        self.publish();

        let live = self.log.size();
        if live <= self.overflow_threshold {
            return Ok(RecordOutcome::Appended { live });
        }
        if self.auto_summarize_suspended {
            debug!(project = %self.project, live, "over threshold, automatic summarization suspended");
            return Ok(RecordOutcome::Appended { live });
        }

        match self.run_summarization().await? {
            Some(report) => Ok(RecordOutcome::Summarized(report)),
            None => Ok(RecordOutcome::Appended {
                live: self.log.size(),
            }),
        }
    }

    pub async fn record(
        &mut self,
        agent: &str,
        kind: MessageKind,
        content: impl Into<String>,
    ) -> Result<RecordOutcome> {
        self.record_entry(ConversationEntry::new(agent, kind, content))
            .await
    }

    /// Log a handoff entry and remember the `from -> to` pattern.
    pub async fn record_handoff(
        &mut self,
        from_agent: &str,
        to_agent: &str,
        context: &str,
    ) -> Result<RecordOutcome> {
        let mut content = format!("Handing off to {to_agent}");
        if !context.trim().is_empty() {
            content.push_str(": ");
            content.push_str(context.trim());
        }
        let entry = ConversationEntry::new(from_agent, MessageKind::Handoff, content)
            .with_metadata("to_agent", to_agent);

        let pattern = format!("{from_agent} -> {to_agent}");
        let persisted = if self.memory.handoff_patterns.contains(&pattern) {
            Ok(())
        } else {
            self.memory.record_handoff_pattern(pattern);
            self.persist()
        };
        let recorded = self.record_entry(entry).await;
        persisted?;
        recorded
    }

    /// Log a file-tool call and track the files it created or edited.
    pub async fn observe_file_tool(
        &mut self,
        agent: &str,
        request: &FileToolRequest,
        outcome: std::result::Result<&FileToolOutput, &anyhow::Error>,
    ) -> Result<RecordOutcome> {
        let tool_name = request.capability().tool_name();
        let target = request.target();

        let (entry, tracked) = match outcome {
            Ok(output) => {
                let tracked = match request {
                    FileToolRequest::Create { path, .. } => {
                        self.memory.record_file_created(path.as_str())
                    }
                    FileToolRequest::Edit { path, .. } => {
                        self.memory.record_file_modified(path.as_str())
                    }
                    _ => false,
                };
                let entry = ConversationEntry::new(
                    agent,
                    MessageKind::Output,
                    format!("{tool_name}: {}", output.describe()),
                );
                (entry, tracked)
            }
            Err(error) => {
                let entry = ConversationEntry::new(
                    agent,
                    MessageKind::Error,
                    format!("{tool_name} {target} failed: {error:#}"),
                );
                (entry, false)
            }
        };
        let entry = entry
            .with_metadata("tool_name", tool_name)
            .with_metadata("file_path", target);

        let persisted = if tracked { self.persist() } else { Ok(()) };
        let recorded = self.record_entry(entry).await;
        persisted?;
        recorded
    }

    /// Log an opaque external tool result. A file path found in the text
    /// is tracked when the tool name marks it as a create or edit tool.
    pub async fn observe_external_tool(
        &mut self,
        agent: &str,
        tool_name: &str,
        result: &str,
    ) -> Result<RecordOutcome> {
        let path = extract_file_path(result);
        let tracked = match path.as_deref() {
            Some(path) if is_create_tool(tool_name) => self.memory.record_file_created(path),
            Some(path) if is_edit_tool(tool_name) => self.memory.record_file_modified(path),
            _ => false,
        };

        let mut entry = ConversationEntry::new(
            agent,
            MessageKind::Output,
            format!("Completed tool: {tool_name}"),
        )
        .with_metadata("tool_name", tool_name)
        .with_metadata("result_length", result.chars().count());
        if let Some(path) = path {
            entry = entry.with_metadata("file_path", path);
        }

        let persisted = if tracked { self.persist() } else { Ok(()) };
        let recorded = self.record_entry(entry).await;
        persisted?;
        recorded
    }

    /// Returns `false` (and writes nothing) for an already-known path.
    pub fn record_file_created(&mut self, path: &str) -> Result<bool> {
        if !self.memory.record_file_created(path) {
            return Ok(false);
        }
        self.commit_change()?;
        Ok(true)
    }

    /// Returns `false` (and writes nothing) for an already-known path.
    pub fn record_file_modified(&mut self, path: &str) -> Result<bool> {
        if !self.memory.record_file_modified(path) {
            return Ok(false);
        }
        self.commit_change()?;
        Ok(true)
    }

    pub fn apply_updates(&mut self, updates: MemoryUpdates) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        self.memory.apply(updates);
        self.commit_change()
    }

    pub fn note(&mut self, note: MemoryNote) -> Result<()> {
        self.apply_updates(note.into_updates())
    }

    pub fn set_requirements(&mut self, requirements: &str) -> Result<()> {
        self.memory.set_requirements(requirements);
        self.commit_change()
    }

    pub fn set_specialization(&mut self, agent: &str, role: &str) -> Result<()> {
        self.memory.set_specialization(agent, role);
        self.commit_change()
    }

    /// Returns `false` when no open blocker has that exact text.
    pub fn resolve_blocker(&mut self, blocker: &str) -> Result<bool> {
        if !self.memory.resolve_blocker(blocker) {
            return Ok(false);
        }
        self.commit_change()?;
        Ok(true)
    }

    /// Returns `false` when no next step has that exact text.
    pub fn complete_next_step(&mut self, step: &str) -> Result<bool> {
        if !self.memory.complete_next_step(step) {
            return Ok(false);
        }
        self.commit_change()?;
        Ok(true)
    }

    /// Drop every open blocker. Returns how many were removed.
    pub fn clear_blockers(&mut self) -> Result<usize> {
        let cleared = self.memory.current_blockers.len();
        if cleared > 0 {
            self.memory.clear_blockers();
            self.commit_change()?;
        }
        Ok(cleared)
    }

    /// Drop every listed next step. Returns how many were removed.
    pub fn clear_next_steps(&mut self) -> Result<usize> {
        let cleared = self.memory.next_steps.len();
        if cleared > 0 {
            self.memory.clear_next_steps();
            self.commit_change()?;
        }
        Ok(cleared)
    }

    /// Summarize everything but the retained tail, regardless of the
    /// threshold. Clears a suspension left by an earlier failure.
    ///
    /// Returns `None` when there is nothing beyond the retained tail.
    pub async fn summarize_now(&mut self) -> Result<Option<SummaryReport>> {
        self.run_summarization().await
    }

    /// Write the durable record now.
    pub fn flush(&mut self) -> Result<()> {
        let result = self.persist();
        self.publish();
        result
    }

    /// Rendered project context. Reads the last published snapshot only.
    pub fn context_summary(&self) -> String {
        render_context(&self.snapshot_tx.borrow(), self.context_char_budget)
    }

    /// Reader that keeps working while this manager is busy.
    pub fn context_handle(&self) -> ContextHandle {
        ContextHandle::new(self.snapshot_tx.subscribe(), self.context_char_budget)
    }

    async fn run_summarization(&mut self) -> Result<Option<SummaryReport>> {
        let live = self.log.size();
        let drain = live.saturating_sub(self.retain_recent);
        if drain == 0 {
            return Ok(None);
        }

        info!(project = %self.project, live, drain, "summarizing conversation log");
        let summarizer = Arc::clone(&self.summarizer);
        let limit = self.summarize_timeout;
        let outcome = {
            let _phase = SummarizingPhase::enter(&mut self.state);
            let guard = self.log.drain_guarded(drain)?;
            let pending = summarizer.summarize(guard.entries());
            let digest = match limit {
                Some(limit) => tokio::time::timeout(limit, pending)
                    .await
                    .unwrap_or_else(|_| {
                        Err(MemoryError::SummarizationUnavailable(format!(
                            "no digest within {}s",
                            limit.as_secs()
                        )))
                    }),
                None => pending.await,
            };
            digest.map(|digest| {
                let drained = guard.commit();
                (digest, drained.len())
            })
        };

        let (digest, drained) = match outcome {
            Ok(done) => done,
            Err(error) => {
                if matches!(error, MemoryError::SummarizationUnavailable(_)) {
                    self.auto_summarize_suspended = true;
                }
                warn!(
                    project = %self.project,
                    %error,
                    live = self.log.size(),
                    "summarization failed, entries restored"
                );
                self.publish();
                return Err(error);
            }
        };

        let report = SummaryReport {
            drained,
            retained: self.log.size(),
            digest_chars: digest.text.chars().count(),
        };
        self.memory.apply(digest.updates.clone());
        self.memory.record_digest(digest.to_record());
        self.auto_summarize_suspended = false;
        info!(
            project = %self.project,
            drained = report.drained,
            retained = report.retained,
            "summarization pass complete"
        );

        self.commit_change()?;
        Ok(Some(report))
    }

    /// Persist and publish after a change to the durable memory.
    fn commit_change(&mut self) -> Result<()> {
        let result = self.persist();
        self.publish();
        result
    }

    fn persist(&mut self) -> Result<()> {
        self.memory.touch();
        match self.store.save(&self.memory) {
            Ok(()) => {
                self.dirty = false;
                Ok(())
            }
            Err(error) => {
                self.dirty = true;
                warn!(project = %self.project, %error, "project memory not saved");
                Err(error)
            }
        }
    }

    fn publish(&self) {
        let snapshot = ContextSnapshot {
            memory: self.memory.clone(),
            pending_entries: self.log.size(),
            recent: self
                .log
                .recent(self.context_recent_entries)
                .cloned()
                .collect(),
            auto_summarize_suspended: self.auto_summarize_suspended,
        };
        self.snapshot_tx.send_replace(Arc::new(snapshot));
    }
}
