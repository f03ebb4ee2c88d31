use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::paths::default_memory_dir;

const DEFAULT_OVERFLOW_THRESHOLD: usize = 50;
const DEFAULT_RETAIN_RECENT: usize = 10;
const DEFAULT_CONTEXT_CHAR_BUDGET: usize = 4000;
const DEFAULT_CONTEXT_RECENT_ENTRIES: usize = 5;
const DEFAULT_SUMMARIZE_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Directory for `{project}_memory.json` files. Empty = XDG state dir.
    pub dir: PathBuf,
    /// Live entry count above which a summarization pass runs.
    pub overflow_threshold: usize,
    /// Most recent entries kept live after a summarization pass.
    pub retain_recent: usize,
    /// Upper bound (in chars) of the rendered context summary.
    pub context_char_budget: usize,
    /// How many live entries the context summary shows.
    pub context_recent_entries: usize,
    /// Deadline for one summarization call; 0 disables the deadline.
    pub summarize_timeout_secs: u64,
    /// Model requested from the completion service for digests.
    pub model_hint: String,
    /// Hosted completion service used for digest narration.
    pub llm: MemoryLlmConfig,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::new(),
            overflow_threshold: DEFAULT_OVERFLOW_THRESHOLD,
            retain_recent: DEFAULT_RETAIN_RECENT,
            context_char_budget: DEFAULT_CONTEXT_CHAR_BUDGET,
            context_recent_entries: DEFAULT_CONTEXT_RECENT_ENTRIES,
            summarize_timeout_secs: DEFAULT_SUMMARIZE_TIMEOUT_SECS,
            model_hint: String::new(),
            llm: MemoryLlmConfig::default(),
        }
    }
}

impl MemoryConfig {
    /// Config rooted at an explicit directory, other fields defaulted.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Self::default()
        }
    }

    pub fn resolved_dir(&self) -> PathBuf {
        if self.dir.as_os_str().is_empty() {
            default_memory_dir()
        } else {
            self.dir.clone()
        }
    }

    pub fn summarize_timeout(&self) -> Option<Duration> {
        (self.summarize_timeout_secs > 0).then(|| Duration::from_secs(self.summarize_timeout_secs))
    }

    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

/// `[memory.llm]`: hosted completion service for digest narration.
#[derive(Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MemoryLlmConfig {
    pub enabled: bool,
    /// OpenAI-compatible base URL; `/chat/completions` is appended.
    pub base_url: String,
    pub api_key: String,
    /// Failover order, comma separated. Rate-limited models are skipped.
    pub models: String,
}

impl MemoryLlmConfig {
    /// Key with everything but its last four characters hidden.
    pub fn redacted_api_key(&self) -> String {
        let chars: Vec<char> = self.api_key.chars().collect();
        match chars.len() {
            0 => String::new(),
            len if len <= 8 => "****".to_string(),
            len => format!("****{}", chars[len - 4..].iter().collect::<String>()),
        }
    }

    pub fn model_list(&self) -> Vec<String> {
        self.models
            .split(',')
            .filter_map(|name| {
                let name = name.trim();
                (!name.is_empty()).then(|| name.to_string())
            })
            .collect()
    }
}

impl fmt::Debug for MemoryLlmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryLlmConfig")
            .field("enabled", &self.enabled)
            .field("base_url", &self.base_url)
            .field("api_key", &self.redacted_api_key())
            .field("models", &self.model_list())
            .finish()
    }
}

impl fmt::Display for MemoryLlmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.enabled { "on" } else { "off" };
        write!(
            f,
            "llm {state} at {} [{}] key {}",
            self.base_url,
            self.model_list().join(", "),
            self.redacted_api_key()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{MemoryConfig, MemoryLlmConfig};

    #[derive(Debug, serde::Deserialize)]
    struct MemoryEnvelope {
        #[serde(default)]
        memory: MemoryConfig,
    }

    #[test]
    fn test_memory_config_defaults() {
        let parsed: MemoryEnvelope = toml::from_str("[memory]\n").unwrap();
        assert_eq!(parsed.memory.overflow_threshold, 50);
        assert_eq!(parsed.memory.retain_recent, 10);
        assert_eq!(parsed.memory.context_char_budget, 4000);
        assert_eq!(parsed.memory.context_recent_entries, 5);
        assert_eq!(parsed.memory.summarize_timeout_secs, 60);
        assert!(parsed.memory.dir.as_os_str().is_empty());
        assert!(!parsed.memory.llm.enabled);
        assert!(parsed.memory.is_default());
    }

    #[test]
    fn test_memory_config_full() {
        let toml = r#"
[memory]
dir = "/var/lib/recall"
overflow_threshold = 80
retain_recent = 20
context_char_budget = 2000
context_recent_entries = 8
summarize_timeout_secs = 0
model_hint = "gpt-4o-mini"

[memory.llm]
enabled = true
base_url = "https://api.openai.com/v1"
api_key = "sk-example-1234"
models = "gpt-4o-mini, gpt-4o"
"#;
        let parsed: MemoryEnvelope = toml::from_str(toml).unwrap();
        let memory = parsed.memory;
        assert_eq!(memory.resolved_dir(), std::path::PathBuf::from("/var/lib/recall"));
        assert_eq!(memory.overflow_threshold, 80);
        assert_eq!(memory.retain_recent, 20);
        assert_eq!(memory.context_char_budget, 2000);
        assert_eq!(memory.context_recent_entries, 8);
        assert_eq!(memory.summarize_timeout(), None);
        assert_eq!(memory.model_hint, "gpt-4o-mini");
        assert!(memory.llm.enabled);
        assert_eq!(memory.llm.model_list(), vec!["gpt-4o-mini", "gpt-4o"]);
    }

    #[test]
    fn test_empty_dir_resolves_to_state_dir() {
        let memory = MemoryConfig::default();
        assert!(memory.resolved_dir().ends_with("memory"));
    }

    #[test]
    fn test_memory_llm_debug_masks_api_key() {
        let llm = MemoryLlmConfig {
            enabled: true,
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: "sk-super-secret-5982".to_string(),
            models: "gpt-4o-mini".to_string(),
        };
        let debug = format!("{llm:?}");
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("****5982"));
        assert_eq!(
            llm.to_string(),
            "llm on at https://api.openai.com/v1 [gpt-4o-mini] key ****5982"
        );
    }

    #[test]
    fn test_short_api_key_is_fully_masked() {
        let llm = MemoryLlmConfig {
            api_key: "abcd".to_string(),
            ..MemoryLlmConfig::default()
        };
        assert_eq!(llm.redacted_api_key(), "****");
        assert_eq!(MemoryLlmConfig::default().redacted_api_key(), "");
    }
}
