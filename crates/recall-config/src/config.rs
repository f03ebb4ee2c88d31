use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::memory::MemoryConfig;
use crate::paths::config_file_path;

const MIN_CONTEXT_CHAR_BUDGET: usize = 200;

/// Root of `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecallConfig {
    #[serde(default)]
    pub memory: MemoryConfig,
}

impl RecallConfig {
    /// Load from the XDG config path.
    ///
    /// Returns `Default` if the file does not exist or if the config
    /// directory cannot be determined (e.g., no HOME in containers).
    pub fn load() -> Result<Self> {
        match config_file_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load from an explicit path. A missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file absent, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        validate_config(&config)
            .with_context(|| format!("Invalid config: {}", path.display()))?;
        Ok(config)
    }
}

/// Check cross-field constraints; every violation is listed in the error.
pub fn validate_config(config: &RecallConfig) -> Result<()> {
    let problems = memory_problems(&config.memory);
    if problems.is_empty() {
        return Ok(());
    }
    bail!("{}", problems.join("; "))
}

fn memory_problems(memory: &MemoryConfig) -> Vec<String> {
    let mut problems = Vec::new();

    if memory.overflow_threshold == 0 {
        problems.push("memory.overflow_threshold must be > 0 (got 0)".to_string());
    }
    if memory.retain_recent >= memory.overflow_threshold {
        problems.push(format!(
            "memory.retain_recent ({}) must be smaller than memory.overflow_threshold ({})",
            memory.retain_recent, memory.overflow_threshold
        ));
    }
    if memory.context_char_budget < MIN_CONTEXT_CHAR_BUDGET {
        problems.push(format!(
            "memory.context_char_budget ({}) is below the minimum of {MIN_CONTEXT_CHAR_BUDGET}",
            memory.context_char_budget
        ));
    }
    if memory.llm.enabled {
        if memory.llm.base_url.trim().is_empty() {
            problems.push("memory.llm.base_url is required when memory.llm.enabled".to_string());
        }
        if memory.llm.model_list().is_empty() {
            problems.push("memory.llm.models is required when memory.llm.enabled".to_string());
        }
    }

    problems
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryLlmConfig;

    #[test]
    fn test_load_missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = RecallConfig::load_from(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config, RecallConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[memory]\noverflow_threshold = 30\nretain_recent = 5\n",
        )
        .unwrap();

        let config = RecallConfig::load_from(&path).unwrap();
        assert_eq!(config.memory.overflow_threshold, 30);
        assert_eq!(config.memory.retain_recent, 5);
        assert_eq!(config.memory.context_char_budget, 4000);
    }

    #[test]
    fn test_load_rejects_malformed_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[memory\n").unwrap();

        let err = RecallConfig::load_from(&path).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to parse config"));
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[memory]\noverflow_threshold = 10\nretain_recent = 10\n").unwrap();

        let err = RecallConfig::load_from(&path).unwrap_err();
        assert!(format!("{err:#}").contains("retain_recent (10)"));
    }

    #[test]
    fn test_validate_default_passes() {
        assert!(validate_config(&RecallConfig::default()).is_ok());
    }

    #[test]
    fn test_validate_collects_all_problems() {
        let config = RecallConfig {
            memory: MemoryConfig {
                overflow_threshold: 0,
                context_char_budget: 10,
                llm: MemoryLlmConfig {
                    enabled: true,
                    ..MemoryLlmConfig::default()
                },
                ..MemoryConfig::default()
            },
        };

        let message = validate_config(&config).unwrap_err().to_string();
        assert!(message.contains("overflow_threshold must be > 0"));
        assert!(message.contains("retain_recent (10)"));
        assert!(message.contains("context_char_budget (10)"));
        assert!(message.contains("base_url is required"));
        assert!(message.contains("models is required"));
    }
}
