use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use recall_config::{MemoryConfig, RecallConfig};
use recall_memory::{
    ContextSnapshot, ConversationEntry, DeterministicSummarizer, LoadOutcome, MemoryManager,
    MemoryNote, MessageKind, MetadataValue, ProjectMemory, ProjectStore, RecordOutcome,
    Summarizer, render_context, summarizer_from_config, validate_project_name,
};
use serde::Deserialize;

use crate::cli::{Cli, Commands, FileChange, NoteKind, ResolveKind};

pub async fn run(cli: Cli) -> Result<()> {
    let mut config = load_config(cli.config.as_deref())?.memory;
    if let Some(dir) = cli.memory_dir {
        config.dir = dir;
    }
    let project = resolve_project(cli.project)?;
    tracing::debug!(
        %project,
        dir = %config.resolved_dir().display(),
        "resolved memory settings"
    );

    match cli.command {
        Commands::Show => handle_show(&config, &project),
        Commands::Export { output } => handle_export(&config, &project, output.as_deref()),
        Commands::Requirements { text } => {
            open_manager(&config, &project, local_summarizer())?.set_requirements(&text)?;
            println!("Requirements recorded for '{project}'.");
            Ok(())
        }
        Commands::Note { kind, text } => {
            open_manager(&config, &project, local_summarizer())?.note(to_note(kind, text))?;
            println!("Noted {kind:?} for '{project}'.");
            Ok(())
        }
        Commands::Resolve { kind, text, all } => {
            handle_resolve(&config, &project, kind, text.as_deref(), all)
        }
        Commands::Files { change, path } => handle_files(&config, &project, change, &path),
        Commands::Replay {
            file,
            llm,
            summarize,
        } => handle_replay(&config, &project, &file, llm, summarize).await,
    }
}

fn handle_show(config: &MemoryConfig, project: &str) -> Result<()> {
    println!("{}", render_saved(config, project)?);
    Ok(())
}

/// Context summary of the durable record. Live entries held by a running
/// manager are not visible here.
fn render_saved(config: &MemoryConfig, project: &str) -> Result<String> {
    let snapshot = ContextSnapshot {
        memory: peek_memory(config, project)?,
        pending_entries: 0,
        recent: Vec::new(),
        auto_summarize_suspended: false,
    };
    Ok(render_context(&snapshot, config.context_char_budget))
}

fn handle_export(config: &MemoryConfig, project: &str, output: Option<&Path>) -> Result<()> {
    let blob = peek_memory(config, project)?.serialize()?;
    match output {
        Some(path) => {
            std::fs::write(path, blob)
                .with_context(|| format!("failed to write export: {}", path.display()))?;
            println!("Exported '{project}' memory to {}.", path.display());
        }
        None => println!("{blob}"),
    }
    Ok(())
}

fn handle_resolve(
    config: &MemoryConfig,
    project: &str,
    kind: ResolveKind,
    text: Option<&str>,
    all: bool,
) -> Result<()> {
    let mut manager = open_manager(config, project, local_summarizer())?;
    if all {
        let (cleared, label) = match kind {
            ResolveKind::Blocker => (manager.clear_blockers()?, "blocker(s)"),
            ResolveKind::NextStep => (manager.clear_next_steps()?, "next step(s)"),
        };
        println!("Cleared {cleared} {label} in '{project}'.");
        return Ok(());
    }
    let Some(text) = text else {
        bail!("pass the exact text to resolve, or --all");
    };
    let (resolved, label) = match kind {
        ResolveKind::Blocker => (manager.resolve_blocker(text)?, "blocker"),
        ResolveKind::NextStep => (manager.complete_next_step(text)?, "next step"),
    };
    if !resolved {
        bail!("No open {label} matching '{text}' in '{project}'.");
    }
    println!("Resolved {label}: {}", truncate_chars(text, 60));
    Ok(())
}

fn handle_files(config: &MemoryConfig, project: &str, change: FileChange, path: &str) -> Result<()> {
    let mut manager = open_manager(config, project, local_summarizer())?;
    let added = match change {
        FileChange::Created => manager.record_file_created(path)?,
        FileChange::Modified => manager.record_file_modified(path)?,
    };
    if added {
        println!("Tracked {path}.");
    } else {
        println!("{path} was already tracked.");
    }
    Ok(())
}

async fn handle_replay(
    config: &MemoryConfig,
    project: &str,
    file: &Path,
    llm: bool,
    summarize: bool,
) -> Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read replay log: {}", file.display()))?;
    let entries = parse_replay(&raw)
        .with_context(|| format!("invalid replay log: {}", file.display()))?;

    let summarizer = if llm {
        hosted_summarizer(config)?
    } else {
        local_summarizer()
    };
    let mut manager = open_manager(config, project, summarizer)?;

    let mut passes = 0usize;
    let total = entries.len();
    for entry in entries {
        if let RecordOutcome::Summarized(report) = manager.record_entry(entry).await? {
            passes += 1;
            println!(
                "Pass {passes}: summarized {} entries, {} live, digest {} chars",
                report.drained, report.retained, report.digest_chars
            );
        }
    }
    if summarize {
        if let Some(report) = manager.summarize_now().await? {
            passes += 1;
            println!(
                "Pass {passes}: summarized {} entries, {} live, digest {} chars",
                report.drained, report.retained, report.digest_chars
            );
        }
    }
    manager.flush()?;

    println!(
        "Replayed {total} entries into '{project}': {passes} summarization pass(es), {} live.",
        manager.live_count()
    );
    println!();
    println!("{}", manager.context_summary());
    Ok(())
}

#[derive(Debug, Deserialize)]
struct ReplayLine {
    agent: String,
    kind: MessageKind,
    content: String,
    #[serde(default)]
    tokens: Option<u32>,
    #[serde(default)]
    metadata: BTreeMap<String, MetadataValue>,
}

fn parse_replay(raw: &str) -> Result<Vec<ConversationEntry>> {
    let mut entries = Vec::new();
    for (idx, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let parsed: ReplayLine =
            serde_json::from_str(line).with_context(|| format!("line {}", idx + 1))?;
        let mut entry = ConversationEntry::new(parsed.agent, parsed.kind, parsed.content);
        if let Some(tokens) = parsed.tokens {
            entry = entry.with_tokens(tokens);
        }
        entry.metadata = parsed.metadata;
        entries.push(entry);
    }
    Ok(entries)
}

fn open_manager(
    config: &MemoryConfig,
    project: &str,
    summarizer: Arc<dyn Summarizer>,
) -> Result<MemoryManager> {
    let manager = MemoryManager::open(project, config, summarizer)?;
    if let LoadOutcome::Recovered { error, quarantined } = manager.load_outcome() {
        eprintln!("Warning: {error}. Starting from an empty memory.");
        if let Some(path) = quarantined {
            eprintln!("  Corrupt file moved to {}", path.display());
        }
    }
    Ok(manager)
}

/// Read-only load: takes no project lock and leaves a corrupt file in place.
fn peek_memory(config: &MemoryConfig, project: &str) -> Result<ProjectMemory> {
    let store = ProjectStore::new(config.resolved_dir(), project)?;
    store
        .peek()
        .with_context(|| format!("failed to read memory for '{project}'"))
}

fn local_summarizer() -> Arc<dyn Summarizer> {
    Arc::new(DeterministicSummarizer)
}

fn hosted_summarizer(config: &MemoryConfig) -> Result<Arc<dyn Summarizer>> {
    if config.llm.base_url.trim().is_empty() || config.llm.model_list().is_empty() {
        bail!("--llm requires memory.llm.base_url and memory.llm.models in the config");
    }
    let mut config = config.clone();
    config.llm.enabled = true;
    summarizer_from_config(&config)
}

fn load_config(path: Option<&Path>) -> Result<RecallConfig> {
    match path {
        Some(path) => RecallConfig::load_from(path),
        None => RecallConfig::load(),
    }
}

fn resolve_project(explicit: Option<String>) -> Result<String> {
    let project = match explicit {
        Some(project) => project,
        None => std::env::current_dir()
            .context("failed to read current directory")?
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .context("cannot derive a project name from the current directory; pass --project")?,
    };
    validate_project_name(&project)?;
    Ok(project)
}

fn to_note(kind: NoteKind, text: String) -> MemoryNote {
    match kind {
        NoteKind::Objective => MemoryNote::Objective(text),
        NoteKind::Decision => MemoryNote::Decision(text),
        NoteKind::KeyFunction => MemoryNote::KeyFunction(text),
        NoteKind::Pattern => MemoryNote::Pattern(text),
        NoteKind::FailedApproach => MemoryNote::FailedApproach(text),
        NoteKind::Lesson => MemoryNote::Lesson(text),
        NoteKind::Milestone => MemoryNote::Milestone(text),
        NoteKind::Blocker => MemoryNote::Blocker(text),
        NoteKind::NextStep => MemoryNote::NextStep(text),
    }
}

fn truncate_chars(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    let mut truncated: String = value.chars().take(max_chars).collect();
    truncated.push_str("...");
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_replay_reads_entries_and_metadata() {
        let raw = r#"{"agent":"planner","kind":"handoff","content":"to coder","metadata":{"to_agent":"coder"}}

{"agent":"coder","kind":"error","content":"boom","tokens":7}
"#;
        let entries = parse_replay(raw).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, MessageKind::Handoff);
        assert_eq!(
            entries[0].metadata.get("to_agent").and_then(MetadataValue::as_text),
            Some("coder")
        );
        assert_eq!(entries[1].tokens, 7);
        assert!(entries[1].is_error());
    }

    #[test]
    fn test_parse_replay_reports_line_number() {
        let raw = "{\"agent\":\"a\",\"kind\":\"output\",\"content\":\"ok\"}\n{\"agent\":\"a\",\"kind\":\"shout\",\"content\":\"x\"}";
        let err = parse_replay(raw).unwrap_err();
        assert_eq!(err.to_string(), "line 2");
    }

    #[test]
    fn test_resolve_project_validates_explicit_name() {
        assert_eq!(resolve_project(Some("P1".to_string())).unwrap(), "P1");
        assert!(resolve_project(Some("../escape".to_string())).is_err());
    }

    #[test]
    fn test_hosted_summarizer_requires_llm_settings() {
        let config = MemoryConfig::default();
        let err = hosted_summarizer(&config).err().unwrap();
        assert!(err.to_string().contains("--llm requires"));
    }

    #[tokio::test]
    async fn test_replay_summarizes_long_logs() {
        let dir = tempdir().unwrap();
        let config = MemoryConfig::in_dir(dir.path());
        let log = dir.path().join("log.jsonl");
        let lines: Vec<String> = (0..60)
            .map(|idx| format!(r#"{{"agent":"coder","kind":"output","content":"step {idx}"}}"#))
            .collect();
        std::fs::write(&log, lines.join("\n")).unwrap();

        handle_replay(&config, "P1", &log, false, false).await.unwrap();

        let manager = open_manager(&config, "P1", local_summarizer()).unwrap();
        assert_eq!(manager.memory().conversation_digests.len(), 1);
        assert_eq!(manager.memory().conversation_digests[0].entry_count, 41);
    }

    #[tokio::test]
    async fn test_show_and_export_work_while_project_is_held() {
        let dir = tempdir().unwrap();
        let config = MemoryConfig::in_dir(dir.path());
        let mut held = open_manager(&config, "P1", local_summarizer()).unwrap();
        held.set_requirements("ship the parser").unwrap();

        let summary = render_saved(&config, "P1").unwrap();
        assert!(summary.starts_with("PROJECT: P1"));
        assert!(summary.contains("ship the parser"));

        let out = dir.path().join("export.json");
        handle_show(&config, "P1").unwrap();
        handle_export(&config, "P1", Some(&out)).unwrap();
        let exported = ProjectMemory::deserialize(&std::fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(exported.original_requirements, "ship the parser");

        drop(held);
    }

    #[test]
    fn test_show_leaves_corrupt_file_in_place() {
        let dir = tempdir().unwrap();
        let config = MemoryConfig::in_dir(dir.path());
        let path = dir.path().join("P1_memory.json");
        std::fs::write(&path, "{ truncated").unwrap();

        let err = handle_show(&config, "P1").unwrap_err();
        assert!(format!("{err:#}").contains("failed to read memory for 'P1'"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{ truncated");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("short", 10), "short");
        assert_eq!(truncate_chars("abcdef", 3), "abc...");
    }
}
