//! Error types for clipserve

use thiserror::Error;

/// Substrings that mark a failure as a transient network condition
const NETWORK_MARKERS: &[&str] = &["timeout", "timed out", "connection"];

/// Main error type for clipserve operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    /// Model could not be loaded and startup must not continue
    #[error("Startup failed: {0}")]
    StartupFatal(String),

    /// Inference was requested before the model finished loading
    #[error("Model not loaded")]
    NotReady,

    /// The uploaded bytes are not a recognized image
    #[error("Image decode error: {0}")]
    Decode(String),

    /// Preprocessing or model execution failed for a decodable image
    #[error("Inference error: {0}")]
    Inference(String),

    /// Transport failure while fetching model artifacts
    #[error("Network error: {0}")]
    Network(String),

    #[error("Model load error: {0}")]
    ModelLoad(String),

    #[error("File system error: {0}")]
    FileSystem(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Result type alias for clipserve operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this failure looks like a transient network condition.
    ///
    /// Transport errors always qualify. Any other error qualifies when its
    /// description mentions a timeout or a connection problem, which covers
    /// runtime errors that wrap an underlying socket failure.
    pub fn is_network(&self) -> bool {
        if matches!(self, Error::Network(_)) {
            return true;
        }
        let message = self.to_string().to_lowercase();
        NETWORK_MARKERS.iter().any(|m| message.contains(m))
    }

    /// Short, stable label for logs and counters
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::StartupFatal(_) => "startup",
            Error::NotReady => "not_ready",
            Error::Decode(_) => "decode",
            Error::Inference(_) => "inference",
            Error::Network(_) => "network",
            Error::ModelLoad(_) => "model_load",
            Error::FileSystem(_) => "filesystem",
            Error::Io(_) => "io",
            Error::Serialization(_) => "serialization",
            Error::Toml(_) => "toml",
            Error::InvalidArgument(_) => "invalid_argument",
        }
    }
}
