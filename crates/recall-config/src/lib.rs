//! Configuration loading and validation (`~/.config/recall/config.toml`).

pub mod config;
pub mod memory;
pub mod paths;

pub use config::{RecallConfig, validate_config};
pub use memory::{MemoryConfig, MemoryLlmConfig};
