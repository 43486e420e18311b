//! Shared data structures and utilities for the distributed crawler
//!
//! This crate contains the command codec, the multipart form encoding used
//! for result uploads, and common utilities used by both the coordinator and
//! worker components.

pub mod multipart;
pub mod protocol;
pub mod utils;

// Re-export commonly used types for convenience
pub use protocol::{Command, WrongCommandFormat};
pub use utils::{current_timestamp, params_to_filename};

/// Result type alias used throughout the shared crate
pub type Result<T> = anyhow::Result<T>;
