use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result as AnyResult};
use chrono::Utc;
use recall_core::{MemoryError, Result};
use tracing::{debug, warn};

use crate::project::ProjectMemory;

const MEMORY_FILE_SUFFIX: &str = "_memory.json";

/// How the durable record was obtained when a manager opened.
#[derive(Debug)]
pub enum LoadOutcome {
    /// No file existed; a default record was created.
    Fresh,
    Loaded,
    /// The file was unreadable or malformed. It was moved aside and a
    /// default record is in use.
    Recovered {
        error: MemoryError,
        quarantined: Option<PathBuf>,
    },
}

impl LoadOutcome {
    pub fn error(&self) -> Option<&MemoryError> {
        match self {
            Self::Recovered { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// `{dir}/{project}_memory.json`, written atomically.
#[derive(Debug, Clone)]
pub struct ProjectStore {
    dir: PathBuf,
    project: String,
    file_path: PathBuf,
}

impl ProjectStore {
    pub fn new(dir: impl Into<PathBuf>, project: &str) -> Result<Self> {
        validate_project_name(project)?;
        let dir = dir.into();
        Ok(Self {
            file_path: dir.join(format!("{project}{MEMORY_FILE_SUFFIX}")),
            project: project.to_string(),
            dir,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn load(&self) -> (ProjectMemory, LoadOutcome) {
        if !self.file_path.exists() {
            debug!(project = %self.project, "no memory file, starting fresh");
            return (ProjectMemory::new(&self.project), LoadOutcome::Fresh);
        }

        match self.read_record() {
            Ok(memory) => (memory, LoadOutcome::Loaded),
            Err(error) => {
                let quarantined = self.quarantine();
                warn!(
                    project = %self.project,
                    path = %self.file_path.display(),
                    %error,
                    quarantined = ?quarantined,
                    "corrupt project memory, starting fresh"
                );
                (
                    ProjectMemory::new(&self.project),
                    LoadOutcome::Recovered { error, quarantined },
                )
            }
        }
    }

    /// Read the record without touching the file: a missing file reads as
    /// a fresh memory and a corrupt one is reported, never quarantined.
    /// Needs no project lock.
    pub fn peek(&self) -> Result<ProjectMemory> {
        if !self.file_path.exists() {
            return Ok(ProjectMemory::new(&self.project));
        }
        self.read_record()
    }

    fn read_record(&self) -> Result<ProjectMemory> {
        let blob = fs::read_to_string(&self.file_path).map_err(|error| {
            MemoryError::CorruptState(format!(
                "cannot read {}: {error}",
                self.file_path.display()
            ))
        })?;
        let memory = ProjectMemory::deserialize(&blob)?;
        if memory.project_name != self.project {
            return Err(MemoryError::CorruptState(format!(
                "{} belongs to project '{}', expected '{}'",
                self.file_path.display(),
                memory.project_name,
                self.project
            )));
        }
        Ok(memory)
    }

    fn quarantine(&self) -> Option<PathBuf> {
        let target = self.file_path.with_extension(format!(
            "json.corrupt-{}",
            Utc::now().timestamp()
        ));
        match fs::rename(&self.file_path, &target) {
            Ok(()) => Some(target),
            Err(error) => {
                warn!(path = %self.file_path.display(), %error, "failed to move corrupt memory aside");
                None
            }
        }
    }

    /// Replace the durable record. Readers see either the old or the new
    /// file, never a partial write.
    pub fn save(&self, memory: &ProjectMemory) -> Result<()> {
        let blob = memory.serialize()?;
        self.write_atomic(blob.as_bytes())
            .map_err(|error| MemoryError::Persistence {
                path: self.file_path.clone(),
                reason: format!("{error:#}"),
            })?;
        debug!(project = %self.project, path = %self.file_path.display(), "saved project memory");
        Ok(())
    }

    fn write_atomic(&self, bytes: &[u8]) -> AnyResult<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create memory dir: {}", self.dir.display()))?;

        let tmp_path = self.file_path.with_extension("json.tmp");
        let result = write_then_rename(&tmp_path, &self.file_path, bytes);
        if result.is_err() {
            let _ = fs::remove_file(&tmp_path);
        }
        result
    }
}

fn write_then_rename(tmp_path: &Path, final_path: &Path, bytes: &[u8]) -> AnyResult<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(tmp_path)
        .with_context(|| format!("failed to open temp memory file: {}", tmp_path.display()))?;
    set_file_mode_600(tmp_path)?;

    file.write_all(bytes)
        .context("failed to write project memory")?;
    file.sync_all()
        .context("failed to sync project memory")?;

    fs::rename(tmp_path, final_path).with_context(|| {
        format!(
            "failed to atomically replace memory file {}",
            final_path.display()
        )
    })
}

/// Project names become file names: no separators, no dot-only names.
pub fn validate_project_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| {
        Err(MemoryError::Validation(format!(
            "invalid project name '{name}': {reason}"
        )))
    };

    if name.trim().is_empty() {
        return invalid("must not be empty");
    }
    if name == "." || name == ".." {
        return invalid("must not be a relative path component");
    }
    if name.chars().any(|c| c == '/' || c == '\\' || c.is_control()) {
        return invalid("must not contain path separators or control characters");
    }
    Ok(())
}

#[cfg(unix)]
fn set_file_mode_600(path: &Path) -> AnyResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .with_context(|| format!("failed to chmod 600: {}", path.display()))
}

#[cfg(not(unix))]
fn set_file_mode_600(_path: &Path) -> AnyResult<()> {
    Ok(())
}
