//! clipserve core - Configuration, error types, and shared types
//!
//! This crate provides the foundational types used across all clipserve crates.

pub mod config;
pub mod error;
pub mod types;

pub use config::{Config, ModelSettings, ServerConfig};
pub use error::{Error, Result};
pub use types::{Device, EMBEDDING_DIM, MODEL_DISPLAY_NAME};
