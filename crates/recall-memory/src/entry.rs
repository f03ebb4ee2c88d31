use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use recall_core::{MemoryError, MessageKind, Result};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Scalar metadata value attached to an entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl MetadataValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl std::fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(value) => write!(f, "{value}"),
            Self::Integer(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
        }
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<usize> for MetadataValue {
    fn from(value: usize) -> Self {
        Self::Integer(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// One agent turn or tool event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub id: Ulid,
    pub timestamp: DateTime<Utc>,
    pub agent: String,
    pub kind: MessageKind,
    pub content: String,
    pub tokens: u32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, MetadataValue>,
}

impl ConversationEntry {
    /// New entry stamped now; `tokens` is estimated from `content`.
    pub fn new(agent: impl Into<String>, kind: MessageKind, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            id: Ulid::new(),
            timestamp: Utc::now(),
            agent: agent.into(),
            kind,
            tokens: estimate_tokens(&content),
            content,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_tokens(mut self, tokens: u32) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.kind == MessageKind::Error
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.agent.trim().is_empty() {
            return Err(MemoryError::Validation(
                "agent identifier must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Rough token count: one token per four chars, rounded up.
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count();
    u32::try_from(chars.div_ceil(4)).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_entry_estimates_tokens() {
        let entry = ConversationEntry::new("coder", MessageKind::Output, "abcdefghi");
        assert_eq!(entry.tokens, 3);
        assert!(entry.metadata.is_empty());
    }

    #[test]
    fn test_explicit_tokens_override_estimate() {
        let entry = ConversationEntry::new("coder", MessageKind::Input, "hi").with_tokens(120);
        assert_eq!(entry.tokens, 120);
    }

    #[test]
    fn test_estimate_counts_chars_not_bytes() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("日本語です"), 2);
    }

    #[test]
    fn test_validate_rejects_blank_agent() {
        let entry = ConversationEntry::new("  ", MessageKind::Input, "hello");
        assert!(matches!(entry.validate(), Err(MemoryError::Validation(_))));
    }

    #[test]
    fn test_metadata_serializes_as_plain_scalars() {
        let entry = ConversationEntry::new("planner", MessageKind::Handoff, "to coder")
            .with_metadata("to_agent", "coder")
            .with_metadata("attempt", 2_i64)
            .with_metadata("urgent", true);

        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["metadata"]["to_agent"], "coder");
        assert_eq!(json["metadata"]["attempt"], 2);
        assert_eq!(json["metadata"]["urgent"], true);
        assert_eq!(json["kind"], "handoff");

        let parsed: ConversationEntry = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, entry);
    }
}
