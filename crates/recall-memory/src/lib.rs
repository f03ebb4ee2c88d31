mod context;
mod entry;
mod llm_client;
mod log;
mod manager;
mod persist;
mod project;
pub mod registry;
mod summarizer;
pub mod tools;

pub use context::{ContextHandle, ContextSnapshot, render_context};
pub use entry::{ConversationEntry, MetadataValue, estimate_tokens};
pub use llm_client::{ApiClient, CompletionClient, ModelPool};
pub use log::{ConversationLog, DrainGuard};
pub use manager::{ManagerState, MemoryManager, MemoryNote, RecordOutcome, SummaryReport};
pub use persist::{LoadOutcome, ProjectStore, validate_project_name};
pub use project::{DigestRecord, MemoryUpdates, ProjectMemory};
pub use registry::{MemoryRegistry, SharedManager};
pub use summarizer::{
    DeterministicSummarizer, Digest, LlmSummarizer, Summarizer, summarizer_from_config,
};
pub use tools::{FileToolOutput, FileToolRequest, FileToolSet, LocalFileTools};

pub use recall_core::{FileCapability, MemoryError, MessageKind, Result};
