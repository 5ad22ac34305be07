//! Deterministic stand-ins for the vision model and model source
//!
//! Used by unit and integration tests across the workspace so the pipeline,
//! readiness gate and loader can be exercised without downloading weights.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};

use ndarray::{Array4, Axis};
use parking_lot::Mutex;

use clipserve_core::{Device, Error, Result, EMBEDDING_DIM};

use crate::inference::{EmbeddingEngine, VisionModel};
use crate::loader::ModelSource;
use crate::preprocess::PreprocessConfig;

/// Produces a vector derived from the per-channel means of its input
#[derive(Debug, Clone)]
pub struct MeanColorModel {
    dim: usize,
}

impl MeanColorModel {
    pub fn new() -> Self {
        Self::with_dim(EMBEDDING_DIM)
    }

    /// Emit vectors of a non-standard length
    pub fn with_dim(dim: usize) -> Self {
        Self { dim }
    }
}

impl Default for MeanColorModel {
    fn default() -> Self {
        Self::new()
    }
}

impl VisionModel for MeanColorModel {
    fn forward(&mut self, pixel_values: Array4<f32>) -> Result<Vec<f32>> {
        let channels = pixel_values.index_axis(Axis(0), 0);
        let means: Vec<f32> = channels
            .outer_iter()
            .map(|c| c.mean().unwrap_or(0.0))
            .collect();

        Ok((0..self.dim)
            .map(|i| (i as f32 + 1.0) * 0.01 + means[i % means.len()] * (i as f32 * 0.37).cos())
            .collect())
    }
}

/// Always fails with an inference error
#[derive(Debug, Clone)]
pub struct FailingVisionModel {
    cause: String,
}

impl FailingVisionModel {
    pub fn new(cause: impl Into<String>) -> Self {
        Self {
            cause: cause.into(),
        }
    }
}

impl VisionModel for FailingVisionModel {
    fn forward(&mut self, _pixel_values: Array4<f32>) -> Result<Vec<f32>> {
        Err(Error::Inference(self.cause.clone()))
    }
}

/// Build an engine around [`MeanColorModel`]
pub fn mean_color_engine(device: Device) -> EmbeddingEngine {
    EmbeddingEngine::new(
        Box::new(MeanColorModel::new()),
        PreprocessConfig::default(),
        device,
    )
}

/// Model source that fails with queued errors before succeeding
#[derive(Debug, Default)]
pub struct ScriptedSource {
    failures: Mutex<VecDeque<Error>>,
    calls: AtomicU32,
}

impl ScriptedSource {
    /// Fail once with each error in order, then succeed
    pub fn succeed_after(failures: Vec<Error>) -> Self {
        Self {
            failures: Mutex::new(failures.into()),
            calls: AtomicU32::new(0),
        }
    }

    /// Number of acquisition attempts made so far
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ModelSource for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    fn acquire(&self, device: Device) -> Result<EmbeddingEngine> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.failures.lock().pop_front() {
            Some(err) => Err(err),
            None => Ok(mean_color_engine(device)),
        }
    }
}
