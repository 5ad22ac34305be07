//! Shared types used across clipserve crates

use serde::{Deserialize, Serialize};
use std::fmt;

/// Output dimension of the CLIP ViT-B/32 image projection
pub const EMBEDDING_DIM: usize = 512;

/// Human-readable name reported by the health endpoint
pub const MODEL_DISPLAY_NAME: &str = "CLIP ViT-B/32";

/// Compute device the model runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cpu,
    #[serde(rename = "cuda")]
    Accelerator,
}

impl Device {
    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Cpu => "cpu",
            Device::Accelerator => "cuda",
        }
    }

    pub fn is_accelerator(&self) -> bool {
        matches!(self, Device::Accelerator)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_display() {
        assert_eq!(Device::Cpu.to_string(), "cpu");
        assert_eq!(Device::Accelerator.to_string(), "cuda");
    }

    #[test]
    fn test_device_serializes_as_label() {
        assert_eq!(serde_json::to_string(&Device::Cpu).unwrap(), "\"cpu\"");
        assert_eq!(
            serde_json::to_string(&Device::Accelerator).unwrap(),
            "\"cuda\""
        );
    }
}
