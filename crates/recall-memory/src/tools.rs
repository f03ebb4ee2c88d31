use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use recall_core::FileCapability;
use regex::Regex;
use tokio::fs;

/// One file-tool invocation. Paths are relative to the tool set's root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileToolRequest {
    Create { path: String, content: String },
    Read { path: String },
    Edit { path: String, content: String },
    List { dir: String },
    Delete { path: String },
}

impl FileToolRequest {
    pub fn capability(&self) -> FileCapability {
        match self {
            Self::Create { .. } => FileCapability::Create,
            Self::Read { .. } => FileCapability::Read,
            Self::Edit { .. } => FileCapability::Edit,
            Self::List { .. } => FileCapability::List,
            Self::Delete { .. } => FileCapability::Delete,
        }
    }

    pub fn target(&self) -> &str {
        match self {
            Self::Create { path, .. }
            | Self::Read { path }
            | Self::Edit { path, .. }
            | Self::Delete { path } => path,
            Self::List { dir } => dir,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileToolOutput {
    Created { path: String },
    Content(String),
    Edited { path: String },
    Listing(Vec<String>),
    Deleted { path: String },
}

impl FileToolOutput {
    /// One-line description for the conversation log.
    pub fn describe(&self) -> String {
        match self {
            Self::Created { path } => format!("created {path}"),
            Self::Content(content) => format!("read {} chars", content.chars().count()),
            Self::Edited { path } => format!("edited {path}"),
            Self::Listing(names) => format!("listed {} entries", names.len()),
            Self::Deleted { path } => format!("deleted {path}"),
        }
    }
}

/// File operations an agent may invoke.
#[async_trait]
pub trait FileToolSet: Send + Sync {
    async fn create_file(&self, path: &str, content: &str) -> Result<()>;
    async fn read_file(&self, path: &str) -> Result<String>;
    async fn edit_file(&self, path: &str, content: &str) -> Result<()>;
    async fn list_files(&self, dir: &str) -> Result<Vec<String>>;
    async fn delete_file(&self, path: &str) -> Result<()>;
}

/// Route a request to the matching [`FileToolSet`] operation.
pub async fn dispatch(tools: &dyn FileToolSet, request: &FileToolRequest) -> Result<FileToolOutput> {
    match request {
        FileToolRequest::Create { path, content } => {
            tools.create_file(path, content).await?;
            Ok(FileToolOutput::Created { path: path.clone() })
        }
        FileToolRequest::Read { path } => tools.read_file(path).await.map(FileToolOutput::Content),
        FileToolRequest::Edit { path, content } => {
            tools.edit_file(path, content).await?;
            Ok(FileToolOutput::Edited { path: path.clone() })
        }
        FileToolRequest::List { dir } => tools.list_files(dir).await.map(FileToolOutput::Listing),
        FileToolRequest::Delete { path } => {
            tools.delete_file(path).await?;
            Ok(FileToolOutput::Deleted { path: path.clone() })
        }
    }
}

/// [`FileToolSet`] over a local directory. Paths may not leave `root`.
#[derive(Debug, Clone)]
pub struct LocalFileTools {
    root: PathBuf,
}

impl LocalFileTools {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, relative: &str) -> Result<PathBuf> {
        let candidate = Path::new(relative);
        for component in candidate.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                Component::ParentDir => bail!("path escapes tool root: {relative}"),
                Component::RootDir | Component::Prefix(_) => {
                    bail!("absolute paths are not allowed: {relative}")
                }
            }
        }
        Ok(self.root.join(candidate))
    }
}

#[async_trait]
impl FileToolSet for LocalFileTools {
    async fn create_file(&self, path: &str, content: &str) -> Result<()> {
        let target = self.resolve(path)?;
        if fs::try_exists(&target).await.unwrap_or(false) {
            bail!("file already exists: {path}");
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create parent dir for {path}"))?;
        }
        fs::write(&target, content)
            .await
            .with_context(|| format!("failed to create {path}"))
    }

    async fn read_file(&self, path: &str) -> Result<String> {
        let target = self.resolve(path)?;
        fs::read_to_string(&target)
            .await
            .with_context(|| format!("failed to read {path}"))
    }

    async fn edit_file(&self, path: &str, content: &str) -> Result<()> {
        let target = self.resolve(path)?;
        let metadata = fs::metadata(&target)
            .await
            .with_context(|| format!("cannot edit missing file {path}"))?;
        if !metadata.is_file() {
            bail!("not a regular file: {path}");
        }
        fs::write(&target, content)
            .await
            .with_context(|| format!("failed to write {path}"))
    }

    async fn list_files(&self, dir: &str) -> Result<Vec<String>> {
        let target = self.resolve(dir)?;
        let mut reader = fs::read_dir(&target)
            .await
            .with_context(|| format!("failed to list {dir}"))?;
        let mut names = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let mut name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().await?.is_dir() {
                name.push('/');
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    async fn delete_file(&self, path: &str) -> Result<()> {
        let target = self.resolve(path)?;
        fs::remove_file(&target)
            .await
            .with_context(|| format!("failed to delete {path}"))
    }
}

/// Whether an external tool name denotes file creation.
pub fn is_create_tool(tool_name: &str) -> bool {
    let lowered = tool_name.to_ascii_lowercase();
    lowered.contains("create_file") || lowered.contains("filetool_create")
}

/// Whether an external tool name denotes editing an existing file.
pub fn is_edit_tool(tool_name: &str) -> bool {
    let lowered = tool_name.to_ascii_lowercase();
    lowered.contains("edit_file")
        || lowered.contains("write_file")
        || lowered.contains("filetool_edit")
}

const KNOWN_EXTENSIONS: &str = "tsx|ts|jsx|json|js|py|md|txt|yaml|yml|html|css|cpp|csv|cfg|conf|c|java|rb|go|rs|php|sh|sql|xml|log|ini|env|toml";

static PATH_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        format!(r#"(?i)\b(?:created|modified|wrote to|saved)\s+(?:file:?\s+)?([^\s'"]+\.(?:{KNOWN_EXTENSIONS}))\b"#),
        format!(r"'([^'\n]+\.(?:{KNOWN_EXTENSIONS}))'"),
        format!(r#""([^"\n]+\.(?:{KNOWN_EXTENSIONS}))""#),
        format!(r"(?:^|[\s:(=])([A-Za-z0-9_\-./]+\.(?:{KNOWN_EXTENSIONS}))\b"),
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

/// Best-effort file path in free-form tool output.
///
/// Tried in order: a verb phrase ("Created file: x.py"), a single-quoted
/// path, a double-quoted path, then any bare path with a known extension.
pub fn extract_file_path(result: &str) -> Option<String> {
    PATH_PATTERNS.iter().find_map(|pattern| {
        pattern
            .captures(result)
            .and_then(|captures| captures.get(1))
            .map(|found| found.as_str().to_string())
    })
}
