use std::path::PathBuf;

pub type Result<T, E = MemoryError> = std::result::Result<T, E>;

/// Failures surfaced by the memory subsystem.
///
/// `Validation` and `Range` are caller bugs and are never retried internally.
/// `SummarizationUnavailable` and `Persistence` are recoverable: live entries
/// and in-memory state are kept so the caller can try again.
#[derive(thiserror::Error, Debug)]
pub enum MemoryError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Cannot drain {requested} entries: only {available} live")]
    Range { requested: usize, available: usize },

    #[error("Corrupt project memory: {0}")]
    CorruptState(String),

    #[error("Summarization unavailable: {0}")]
    SummarizationUnavailable(String),

    #[error("Failed to persist project memory to {}: {reason}", path.display())]
    Persistence { path: PathBuf, reason: String },
}

impl MemoryError {
    /// Whether the caller may retry the failed operation without changes.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::SummarizationUnavailable(_) | Self::Persistence { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_validation() {
        let err = MemoryError::Validation("agent identifier is empty".into());
        assert_eq!(
            err.to_string(),
            "Validation failed: agent identifier is empty"
        );
    }

    #[test]
    fn test_display_range() {
        let err = MemoryError::Range {
            requested: 12,
            available: 3,
        };
        assert_eq!(err.to_string(), "Cannot drain 12 entries: only 3 live");
    }

    #[test]
    fn test_display_corrupt_state() {
        let err = MemoryError::CorruptState("missing field `project_name`".into());
        assert_eq!(
            err.to_string(),
            "Corrupt project memory: missing field `project_name`"
        );
    }

    #[test]
    fn test_display_summarization_unavailable() {
        let err = MemoryError::SummarizationUnavailable("status 503".into());
        assert_eq!(err.to_string(), "Summarization unavailable: status 503");
    }

    #[test]
    fn test_display_persistence() {
        let err = MemoryError::Persistence {
            path: PathBuf::from("/tmp/memory/P1_memory.json"),
            reason: "disk full".into(),
        };
        assert_eq!(
            err.to_string(),
            "Failed to persist project memory to /tmp/memory/P1_memory.json: disk full"
        );
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(MemoryError::SummarizationUnavailable(String::new()).is_recoverable());
        assert!(
            MemoryError::Persistence {
                path: PathBuf::new(),
                reason: String::new(),
            }
            .is_recoverable()
        );
        assert!(!MemoryError::Validation(String::new()).is_recoverable());
        assert!(
            !MemoryError::Range {
                requested: 1,
                available: 0,
            }
            .is_recoverable()
        );
        assert!(!MemoryError::CorruptState(String::new()).is_recoverable());
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<MemoryError>();
    }
}
