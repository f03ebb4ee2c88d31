use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MemoryError;

/// Kind of a conversation entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Input,
    Output,
    Handoff,
    Error,
}

impl MessageKind {
    pub const ALL: [MessageKind; 4] = [Self::Input, Self::Output, Self::Handoff, Self::Error];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
            Self::Handoff => "handoff",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| {
                MemoryError::Validation(format!(
                    "unknown message kind '{s}': expected one of input, output, handoff, error"
                ))
            })
    }
}

/// Capabilities of the file-tool collaborator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileCapability {
    Create,
    Read,
    Edit,
    List,
    Delete,
}

impl FileCapability {
    /// Tool name as exposed to agents.
    pub fn tool_name(&self) -> &'static str {
        match self {
            Self::Create => "create_file",
            Self::Read => "read_file",
            Self::Edit => "edit_file",
            Self::List => "list_files",
            Self::Delete => "delete_file",
        }
    }

    /// Whether a successful call changes files on disk.
    pub fn is_mutating(&self) -> bool {
        matches!(self, Self::Create | Self::Edit | Self::Delete)
    }
}

impl std::fmt::Display for FileCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tool_name())
    }
}
