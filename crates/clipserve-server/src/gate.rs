//! Readiness gate for the embedding engine
//!
//! The gate starts `NOT_READY` and flips to `READY` exactly once, when the
//! startup load hands it an engine. There is no way back: a broken engine
//! after startup needs a process restart.

use std::sync::{Arc, OnceLock};

use serde::Serialize;
use tracing::info;

use clipserve_core::{Device, Error, Result, MODEL_DISPLAY_NAME};
use clipserve_embeddings::EmbeddingEngine;

/// Health body returned by `GET /health`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum HealthReport {
    Healthy {
        status: &'static str,
        model_loaded: bool,
        device: Device,
        model_name: &'static str,
        embedding_dimension: usize,
    },
    Unhealthy {
        status: &'static str,
        model_loaded: bool,
        device: Option<Device>,
        message: &'static str,
    },
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthReport::Healthy { .. })
    }
}

/// Init-once, read-many handle on the engine state
#[derive(Debug, Default)]
pub struct ReadinessGate {
    device: OnceLock<Device>,
    engine: OnceLock<Arc<EmbeddingEngine>>,
}

impl ReadinessGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// A gate that is already ready, for tests and embedded use
    pub fn ready_with(engine: EmbeddingEngine) -> Self {
        let gate = Self::new();
        // Fresh gate: neither cell can already be set
        let _ = gate.device.set(engine.device());
        let _ = gate.engine.set(Arc::new(engine));
        gate
    }

    /// Record the device chosen for loading; only the first call takes effect
    pub fn set_device(&self, device: Device) {
        let _ = self.device.set(device);
    }

    pub fn device(&self) -> Option<Device> {
        self.device.get().copied()
    }

    /// Transition `NOT_READY → READY`
    pub fn mark_ready(&self, engine: EmbeddingEngine) -> Result<()> {
        let device = engine.device();
        self.engine
            .set(Arc::new(engine))
            .map_err(|_| Error::InvalidArgument("Engine is already initialized".into()))?;
        let _ = self.device.set(device);
        info!(device = %device, "Service ready to accept requests");
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.engine.get().is_some()
    }

    /// The engine, or [`Error::NotReady`] before startup has finished
    pub fn engine(&self) -> Result<Arc<EmbeddingEngine>> {
        self.engine.get().cloned().ok_or(Error::NotReady)
    }

    pub fn health(&self) -> HealthReport {
        match self.engine.get() {
            Some(engine) => HealthReport::Healthy {
                status: "healthy",
                model_loaded: true,
                device: engine.device(),
                model_name: MODEL_DISPLAY_NAME,
                embedding_dimension: engine.embedding_dim(),
            },
            None => HealthReport::Unhealthy {
                status: "unhealthy",
                model_loaded: false,
                device: self.device(),
                message: "Model not loaded",
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clipserve_embeddings::testing::mean_color_engine;
    use serde_json::json;

    #[test]
    fn test_gate_starts_not_ready() {
        let gate = ReadinessGate::new();
        assert!(!gate.is_ready());
        assert!(matches!(gate.engine(), Err(Error::NotReady)));
        assert!(!gate.health().is_healthy());
    }

    #[test]
    fn test_unhealthy_body_before_device_selection() {
        let gate = ReadinessGate::new();
        let body = serde_json::to_value(gate.health()).unwrap();
        assert_eq!(
            body,
            json!({
                "status": "unhealthy",
                "model_loaded": false,
                "device": null,
                "message": "Model not loaded"
            })
        );
    }

    #[test]
    fn test_unhealthy_body_reports_selected_device() {
        let gate = ReadinessGate::new();
        gate.set_device(Device::Accelerator);
        let body = serde_json::to_value(gate.health()).unwrap();
        assert_eq!(body["device"], "cuda");
        assert_eq!(body["status"], "unhealthy");
    }

    #[test]
    fn test_mark_ready_transitions_once() {
        let gate = ReadinessGate::new();
        gate.set_device(Device::Cpu);
        gate.mark_ready(mean_color_engine(Device::Cpu)).unwrap();

        assert!(gate.is_ready());
        assert!(gate.engine().is_ok());

        let body = serde_json::to_value(gate.health()).unwrap();
        assert_eq!(
            body,
            json!({
                "status": "healthy",
                "model_loaded": true,
                "device": "cpu",
                "model_name": "CLIP ViT-B/32",
                "embedding_dimension": 512
            })
        );

        // Second transition is rejected and the first engine stays
        assert!(gate.mark_ready(mean_color_engine(Device::Cpu)).is_err());
        assert!(gate.is_ready());
    }

    #[test]
    fn test_ready_with() {
        let gate = ReadinessGate::ready_with(mean_color_engine(Device::Cpu));
        assert!(gate.is_ready());
        assert_eq!(gate.device(), Some(Device::Cpu));
    }
}
