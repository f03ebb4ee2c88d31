use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use recall_core::{MemoryError, Result};
use serde::{Deserialize, Serialize};

/// Condensed record of one summarization pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestRecord {
    pub created_at: DateTime<Utc>,
    pub entry_count: usize,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub text: String,
}

/// Candidate additions to [`ProjectMemory`], applied as one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryUpdates {
    pub objectives: Vec<String>,
    pub decisions: Vec<String>,
    pub key_functions: Vec<String>,
    pub successful_patterns: Vec<String>,
    pub failed_approaches: Vec<String>,
    pub lessons: Vec<String>,
    pub milestones: Vec<String>,
    pub blockers: Vec<String>,
    pub next_steps: Vec<String>,
    pub handoff_patterns: Vec<String>,
}

impl MemoryUpdates {
    pub fn is_empty(&self) -> bool {
        self.objectives.is_empty()
            && self.decisions.is_empty()
            && self.key_functions.is_empty()
            && self.successful_patterns.is_empty()
            && self.failed_approaches.is_empty()
            && self.lessons.is_empty()
            && self.milestones.is_empty()
            && self.blockers.is_empty()
            && self.next_steps.is_empty()
            && self.handoff_patterns.is_empty()
    }
}

/// Durable facts about one project, persisted as `{project}_memory.json`.
///
/// List fields only grow, except `current_blockers` and `next_steps` which
/// shrink when an item is resolved. `files_created` and `files_modified`
/// have set semantics but keep first-seen order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectMemory {
    pub project_name: String,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub original_requirements: String,

    #[serde(default)]
    pub current_objectives: Vec<String>,
    #[serde(default)]
    pub architecture_decisions: Vec<String>,

    #[serde(default)]
    pub files_created: Vec<String>,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub key_functions: Vec<String>,

    #[serde(default)]
    pub successful_patterns: Vec<String>,
    #[serde(default)]
    pub failed_approaches: Vec<String>,
    #[serde(default)]
    pub lessons_learned: Vec<String>,

    #[serde(default)]
    pub milestones_completed: Vec<String>,
    #[serde(default)]
    pub current_blockers: Vec<String>,
    #[serde(default)]
    pub next_steps: Vec<String>,

    #[serde(default)]
    pub agent_specializations: BTreeMap<String, String>,
    #[serde(default)]
    pub handoff_patterns: Vec<String>,
    #[serde(default)]
    pub conversation_digests: Vec<DigestRecord>,
}

impl ProjectMemory {
    pub fn new(project_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            project_name: project_name.into(),
            created_at: now,
            last_updated: now,
            original_requirements: String::new(),
            current_objectives: Vec::new(),
            architecture_decisions: Vec::new(),
            files_created: Vec::new(),
            files_modified: Vec::new(),
            key_functions: Vec::new(),
            successful_patterns: Vec::new(),
            failed_approaches: Vec::new(),
            lessons_learned: Vec::new(),
            milestones_completed: Vec::new(),
            current_blockers: Vec::new(),
            next_steps: Vec::new(),
            agent_specializations: BTreeMap::new(),
            handoff_patterns: Vec::new(),
            conversation_digests: Vec::new(),
        }
    }

    pub fn set_requirements(&mut self, requirements: impl Into<String>) {
        self.original_requirements = requirements.into();
    }

    /// Returns `false` when the path was already recorded.
    pub fn record_file_created(&mut self, path: impl Into<String>) -> bool {
        push_unique(&mut self.files_created, path.into())
    }

    /// Returns `false` when the path was already recorded.
    pub fn record_file_modified(&mut self, path: impl Into<String>) -> bool {
        push_unique(&mut self.files_modified, path.into())
    }

    pub fn add_objective(&mut self, objective: impl Into<String>) {
        self.current_objectives.push(objective.into());
    }

    pub fn record_decision(&mut self, decision: impl Into<String>) {
        self.architecture_decisions.push(decision.into());
    }

    pub fn record_key_function(&mut self, name: impl Into<String>) {
        self.key_functions.push(name.into());
    }

    pub fn record_pattern(&mut self, pattern: impl Into<String>) {
        self.successful_patterns.push(pattern.into());
    }

    pub fn record_failed_approach(&mut self, approach: impl Into<String>) {
        self.failed_approaches.push(approach.into());
    }

    pub fn record_lesson(&mut self, lesson: impl Into<String>) {
        self.lessons_learned.push(lesson.into());
    }

    pub fn record_milestone(&mut self, milestone: impl Into<String>) {
        self.milestones_completed.push(milestone.into());
    }

    pub fn record_handoff_pattern(&mut self, pattern: impl Into<String>) {
        self.handoff_patterns.push(pattern.into());
    }

    pub fn set_specialization(&mut self, agent: impl Into<String>, role: impl Into<String>) {
        self.agent_specializations.insert(agent.into(), role.into());
    }

    /// Blockers are listed once; re-adding an open blocker is a no-op.
    pub fn add_blocker(&mut self, blocker: impl Into<String>) -> bool {
        push_unique(&mut self.current_blockers, blocker.into())
    }

    /// Remove a blocker by exact text. Returns `false` if it was not open.
    pub fn resolve_blocker(&mut self, blocker: &str) -> bool {
        remove_exact(&mut self.current_blockers, blocker)
    }

    pub fn clear_blockers(&mut self) {
        self.current_blockers.clear();
    }

    pub fn add_next_step(&mut self, step: impl Into<String>) -> bool {
        push_unique(&mut self.next_steps, step.into())
    }

    /// Remove a next step by exact text. Returns `false` if it was not listed.
    pub fn complete_next_step(&mut self, step: &str) -> bool {
        remove_exact(&mut self.next_steps, step)
    }

    pub fn clear_next_steps(&mut self) {
        self.next_steps.clear();
    }

    pub fn record_digest(&mut self, digest: DigestRecord) {
        self.conversation_digests.push(digest);
    }

    pub fn apply(&mut self, updates: MemoryUpdates) {
        let MemoryUpdates {
            objectives,
            decisions,
            key_functions,
            successful_patterns,
            failed_approaches,
            lessons,
            milestones,
            blockers,
            next_steps,
            handoff_patterns,
        } = updates;

        self.current_objectives.extend(objectives);
        self.architecture_decisions.extend(decisions);
        self.key_functions.extend(key_functions);
        self.successful_patterns.extend(successful_patterns);
        self.failed_approaches.extend(failed_approaches);
        self.lessons_learned.extend(lessons);
        self.milestones_completed.extend(milestones);
        self.handoff_patterns.extend(handoff_patterns);
        for blocker in blockers {
            self.add_blocker(blocker);
        }
        for step in next_steps {
            self.add_next_step(step);
        }
    }

    pub fn touch(&mut self) {
        let now = Utc::now();
        if now > self.last_updated {
            self.last_updated = now;
        }
    }

    pub fn serialize(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|error| MemoryError::CorruptState(format!("cannot encode memory: {error}")))
    }

    /// Parse a durable record. Missing list fields default to empty;
    /// missing required fields are a `CorruptState` error.
    pub fn deserialize(blob: &str) -> Result<Self> {
        let memory: Self = serde_json::from_str(blob)
            .map_err(|error| MemoryError::CorruptState(error.to_string()))?;
        if memory.project_name.trim().is_empty() {
            return Err(MemoryError::CorruptState(
                "project_name is empty".to_string(),
            ));
        }
        Ok(memory)
    }
}

fn push_unique(list: &mut Vec<String>, item: String) -> bool {
    if list.iter().any(|existing| *existing == item) {
        return false;
    }
    list.push(item);
    true
}

fn remove_exact(list: &mut Vec<String>, item: &str) -> bool {
    let before = list.len();
    list.retain(|existing| existing != item);
    list.len() != before
}
