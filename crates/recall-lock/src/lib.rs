//! Cross-process exclusion for one project's memory directory.
//!
//! The lock is a `flock(2)` on `{memory_dir}/locks/{project}.lock`. The kernel
//! drops it when the owning descriptor closes, so a crashed holder never
//! leaves a stale lock behind. The file body names the current holder.

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who holds a project lock, as recorded in the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub pid: u32,
    pub project: String,
    pub acquired_at: DateTime<Utc>,
    pub reason: String,
}

impl LockHolder {
    fn current(project: &str, reason: &str) -> Self {
        Self {
            pid: std::process::id(),
            project: project.to_string(),
            acquired_at: Utc::now(),
            reason: reason.to_string(),
        }
    }

    /// `None` when the file is missing, empty, or was written by something else.
    pub fn read_from(path: &Path) -> Option<Self> {
        let raw = fs::read_to_string(path).ok()?;
        serde_json::from_str(&raw).ok()
    }
}

/// Held exclusive lock. Dropping it unlocks.
pub struct ProjectLock {
    file: File,
    path: PathBuf,
}

impl std::fmt::Debug for ProjectLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ProjectLock").field(&self.path).finish()
    }
}

impl ProjectLock {
    /// Try once to take the lock; never waits for another holder.
    pub fn acquire(memory_dir: &Path, project: &str, reason: &str) -> Result<Self> {
        let dir = memory_dir.join("locks");
        fs::create_dir_all(&dir)
            .with_context(|| format!("cannot create lock directory {}", dir.display()))?;
        let path = dir.join(format!("{project}.lock"));

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("cannot open lock file {}", path.display()))?;

        if !try_flock(&file) {
            bail!(contention_message(&path, project));
        }

        let mut lock = Self { file, path };
        lock.stamp(&LockHolder::current(project, reason))?;
        Ok(lock)
    }

    pub fn lock_path(&self) -> &Path {
        &self.path
    }

    fn stamp(&mut self, holder: &LockHolder) -> Result<()> {
        let body = serde_json::to_vec(holder).context("cannot encode lock holder")?;
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file
            .write_all(&body)
            .and_then(|()| self.file.flush())
            .with_context(|| format!("cannot record holder in {}", self.path.display()))
    }
}

impl Drop for ProjectLock {
    fn drop(&mut self) {
        // SAFETY: the descriptor belongs to `self.file`, which is still open.
        // Closing it right after would release the lock anyway.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

/// Take the memory lock for `project` under `memory_dir`.
///
/// Fails immediately when another manager holds it; the error names the
/// holder's PID and reason when the lock file can be read.
pub fn acquire_project_lock(memory_dir: &Path, project: &str, reason: &str) -> Result<ProjectLock> {
    ProjectLock::acquire(memory_dir, project, reason)
}

fn try_flock(file: &File) -> bool {
    // SAFETY: `file` is open for the whole call; LOCK_NB keeps it from blocking.
    unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) == 0 }
}

fn contention_message(path: &Path, project: &str) -> String {
    match LockHolder::read_from(path) {
        Some(holder) => format!(
            "Project '{project}' memory locked by PID {} since {} ({})",
            holder.pid,
            holder.acquired_at.format("%Y-%m-%d %H:%M:%S UTC"),
            holder.reason
        ),
        None => format!("Project '{project}' memory is locked by another process"),
    }
}
