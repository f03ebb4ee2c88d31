//! One shared [`MemoryManager`] per project.
//!
//! Callers for the same project get the same manager behind an async
//! mutex, so writes to one project are serialized while different
//! projects proceed independently.

use std::collections::HashMap;
use std::sync::Arc;

use recall_config::MemoryConfig;
use recall_core::{MemoryError, Result};
use tokio::sync::Mutex;
use tracing::debug;

use crate::context::ContextHandle;
use crate::manager::MemoryManager;
use crate::summarizer::Summarizer;

pub type SharedManager = Arc<Mutex<MemoryManager>>;

pub struct MemoryRegistry {
    config: MemoryConfig,
    summarizer: Arc<dyn Summarizer>,
    managers: Mutex<HashMap<String, SharedManager>>,
    handles: Mutex<HashMap<String, ContextHandle>>,
}

impl MemoryRegistry {
    pub fn new(config: MemoryConfig, summarizer: Arc<dyn Summarizer>) -> Self {
        Self {
            config,
            summarizer,
            managers: Mutex::new(HashMap::new()),
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// The project's manager, opened on first request.
    pub async fn manager(&self, project: &str) -> Result<SharedManager> {
        let mut managers = self.managers.lock().await;
        if let Some(existing) = managers.get(project) {
            return Ok(Arc::clone(existing));
        }

        let manager = MemoryManager::open(project, &self.config, Arc::clone(&self.summarizer))?;
        self.handles
            .lock()
            .await
            .insert(project.to_string(), manager.context_handle());
        let shared = Arc::new(Mutex::new(manager));
        managers.insert(project.to_string(), Arc::clone(&shared));
        debug!(project, open = managers.len(), "registered project manager");
        Ok(shared)
    }

    /// Context reader for the project. Unlike locking the manager, reading
    /// through the handle never waits on a summarization pass.
    pub async fn context_handle(&self, project: &str) -> Result<ContextHandle> {
        if let Some(handle) = self.handles.lock().await.get(project) {
            return Ok(handle.clone());
        }
        self.manager(project).await?;
        self.handles
            .lock()
            .await
            .get(project)
            .cloned()
            .ok_or_else(|| {
                MemoryError::Validation(format!("project '{project}' was released while opening"))
            })
    }

    /// Forget the project's manager. Its lock is released once every
    /// caller holding the shared handle has dropped it.
    pub async fn release(&self, project: &str) -> bool {
        self.handles.lock().await.remove(project);
        self.managers.lock().await.remove(project).is_some()
    }

    pub async fn projects(&self) -> Vec<String> {
        let mut names: Vec<String> = self.managers.lock().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::summarizer::DeterministicSummarizer;
    use recall_core::MessageKind;
    use tempfile::tempdir;

    fn registry(dir: &std::path::Path) -> MemoryRegistry {
        MemoryRegistry::new(MemoryConfig::in_dir(dir), Arc::new(DeterministicSummarizer))
    }

    #[tokio::test]
    async fn test_same_project_shares_one_manager() {
        let dir = tempdir().unwrap();
        let registry = registry(dir.path());

        let first = registry.manager("P1").await.unwrap();
        let second = registry.manager("P1").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        first
            .lock()
            .await
            .record("coder", MessageKind::Output, "hello")
            .await
            .unwrap();
        assert_eq!(second.lock().await.live_count(), 1);
        assert_eq!(registry.projects().await, vec!["P1"]);
    }

    #[tokio::test]
    async fn test_projects_are_independent() {
        let dir = tempdir().unwrap();
        let registry = registry(dir.path());

        let p1 = registry.manager("P1").await.unwrap();
        let p2 = registry.manager("P2").await.unwrap();
        let _held = p1.lock().await;
        // P2 stays usable while P1 is locked.
        p2.lock()
            .await
            .record("tester", MessageKind::Input, "run tests")
            .await
            .unwrap();
        assert_eq!(registry.projects().await, vec!["P1", "P2"]);
    }

    #[tokio::test]
    async fn test_context_handle_reads_while_manager_locked() {
        let dir = tempdir().unwrap();
        let registry = registry(dir.path());
        let manager = registry.manager("P1").await.unwrap();
        manager
            .lock()
            .await
            .record("coder", MessageKind::Output, "wrote main.rs")
            .await
            .unwrap();

        let handle = registry.context_handle("P1").await.unwrap();
        let _busy = manager.lock().await;
        let summary = handle.context_summary();
        assert!(summary.contains("PROJECT: P1"));
        assert!(summary.contains("Pending entries: 1"));
    }

    #[tokio::test]
    async fn test_release_frees_project_lock() {
        let dir = tempdir().unwrap();
        let registry = registry(dir.path());
        let manager = registry.manager("P1").await.unwrap();
        assert!(registry.release("P1").await);
        assert!(!registry.release("P1").await);
        drop(manager);

        let other = MemoryRegistry::new(
            MemoryConfig::in_dir(dir.path()),
            Arc::new(DeterministicSummarizer),
        );
        assert!(other.manager("P1").await.is_ok());
    }
}
