use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "recall")]
#[command(about = "Project memory for multi-agent sessions", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Project name (defaults to the current directory name)
    #[arg(short, long, global = true)]
    pub project: Option<String>,

    /// Config file (defaults to ~/.config/recall/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override memory.dir from the config
    #[arg(long, global = true)]
    pub memory_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the context summary an agent would receive
    Show,

    /// Print the durable project memory as JSON
    Export {
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Record the project's original requirements
    Requirements { text: String },

    /// Add a fact to the project memory
    Note {
        #[arg(value_enum)]
        kind: NoteKind,
        text: String,
    },

    /// Resolve an open blocker or complete a next step (exact text)
    Resolve {
        #[arg(value_enum)]
        kind: ResolveKind,
        #[arg(required_unless_present = "all")]
        text: Option<String>,
        /// Clear the whole list
        #[arg(long, conflicts_with = "text")]
        all: bool,
    },

    /// Track a created or modified file
    Files {
        #[arg(value_enum)]
        change: FileChange,
        path: String,
    },

    /// Feed a JSONL conversation log through the manager
    Replay {
        /// One `{"agent", "kind", "content"}` object per line
        file: PathBuf,

        /// Narrate digests with the configured completion service
        #[arg(long)]
        llm: bool,

        /// Summarize everything but the retained tail at the end
        #[arg(long)]
        summarize: bool,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum NoteKind {
    Objective,
    Decision,
    KeyFunction,
    Pattern,
    FailedApproach,
    Lesson,
    Milestone,
    Blocker,
    NextStep,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ResolveKind {
    Blocker,
    NextStep,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum FileChange {
    Created,
    Modified,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_note_kind_parses_kebab_case() {
        let cli = Cli::try_parse_from(["recall", "-p", "P1", "note", "next-step", "ship it"]).unwrap();
        match cli.command {
            Commands::Note { kind, text } => {
                assert_eq!(kind, NoteKind::NextStep);
                assert_eq!(text, "ship it");
            }
            _ => panic!("expected note command"),
        }
        assert_eq!(cli.project.as_deref(), Some("P1"));
    }

    #[test]
    fn test_resolve_needs_text_or_all() {
        assert!(Cli::try_parse_from(["recall", "resolve", "blocker"]).is_err());
        assert!(Cli::try_parse_from(["recall", "resolve", "blocker", "x", "--all"]).is_err());

        let cli = Cli::try_parse_from(["recall", "resolve", "next-step", "--all"]).unwrap();
        match cli.command {
            Commands::Resolve { kind, text, all } => {
                assert_eq!(kind, ResolveKind::NextStep);
                assert_eq!(text, None);
                assert!(all);
            }
            _ => panic!("expected resolve command"),
        }
    }

    #[test]
    fn test_replay_flags() {
        let cli = Cli::try_parse_from(["recall", "replay", "log.jsonl", "--llm"]).unwrap();
        match cli.command {
            Commands::Replay {
                file,
                llm,
                summarize,
            } => {
                assert_eq!(file, PathBuf::from("log.jsonl"));
                assert!(llm);
                assert!(!summarize);
            }
            _ => panic!("expected replay command"),
        }
    }
}
