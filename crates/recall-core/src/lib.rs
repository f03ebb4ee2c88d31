//! Shared error taxonomy and closed enums for the recall workspace.

pub mod error;
pub mod types;

pub use error::{MemoryError, Result};
pub use types::{FileCapability, MessageKind};
