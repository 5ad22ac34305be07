//! Image embedding inference using ONNX Runtime

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use ndarray::Array4;
use ort::execution_providers::CUDAExecutionProvider;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use parking_lot::Mutex;
use tracing::{debug, info};

use clipserve_core::{Device, Error, Result, EMBEDDING_DIM};

use crate::decode::CanonicalImage;
use crate::preprocess::PreprocessConfig;

/// Output name of the projected image embedding in CLIP vision exports
const IMAGE_EMBEDS_OUTPUT: &str = "image_embeds";

/// The opaque model call: preprocessed pixels in, raw embedding out
///
/// Implementations must not normalize; [`EmbeddingEngine`] owns
/// post-processing and the dimension contract.
pub trait VisionModel: Send {
    fn forward(&mut self, pixel_values: Array4<f32>) -> Result<Vec<f32>>;
}

/// CLIP vision tower backed by an ONNX Runtime session
pub struct OnnxVisionModel {
    session: Session,
    input_name: String,
    output_name: String,
}

impl std::fmt::Debug for OnnxVisionModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxVisionModel")
            .field("input_name", &self.input_name)
            .field("output_name", &self.output_name)
            .finish()
    }
}

impl OnnxVisionModel {
    /// Build a session for the model file on the given device
    pub fn load(model_path: &Path, device: Device, intra_threads: usize) -> Result<Self> {
        if !model_path.exists() {
            return Err(Error::ModelLoad(format!(
                "Model file not found: {}",
                model_path.display()
            )));
        }

        info!(path = %model_path.display(), device = %device, "Loading ONNX vision model");

        let mut builder = Session::builder()
            .map_err(|e| Error::ModelLoad(format!("Failed to create session builder: {}", e)))?;

        if device.is_accelerator() {
            builder = builder
                .with_execution_providers([CUDAExecutionProvider::default()
                    .build()
                    .error_on_failure()])
                .map_err(|e| {
                    Error::ModelLoad(format!("Failed to register CUDA provider: {}", e))
                })?;
        }

        let session = builder
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| Error::ModelLoad(format!("Failed to set optimization level: {}", e)))?
            .with_intra_threads(intra_threads.max(1))
            .map_err(|e| Error::ModelLoad(format!("Failed to set thread count: {}", e)))?
            .commit_from_file(model_path)
            .map_err(|e| Error::ModelLoad(format!("Failed to load ONNX model: {}", e)))?;

        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .unwrap_or_else(|| "pixel_values".into());
        let output_name = session
            .outputs
            .iter()
            .find(|o| o.name == IMAGE_EMBEDS_OUTPUT)
            .or_else(|| session.outputs.first())
            .map(|o| o.name.clone())
            .unwrap_or_else(|| IMAGE_EMBEDS_OUTPUT.into());

        debug!(input = %input_name, output = %output_name, "ONNX model loaded successfully");

        Ok(Self {
            session,
            input_name,
            output_name,
        })
    }
}

impl VisionModel for OnnxVisionModel {
    fn forward(&mut self, pixel_values: Array4<f32>) -> Result<Vec<f32>> {
        let input_tensor = Tensor::from_array(pixel_values)
            .map_err(|e| Error::Inference(format!("Failed to create input tensor: {}", e)))?;

        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => input_tensor])
            .map_err(|e| Error::Inference(format!("ONNX inference failed: {}", e)))?;

        let output = outputs.get(self.output_name.as_str()).ok_or_else(|| {
            Error::Inference(format!("No output '{}' from vision model", self.output_name))
        })?;

        let (_shape, data) = output
            .try_extract_tensor::<f32>()
            .map_err(|e| Error::Inference(format!("Failed to extract output tensor: {}", e)))?;

        Ok(data.to_vec())
    }
}

/// Thread-safe metrics for embedding performance tracking
#[derive(Debug, Default)]
pub struct EmbeddingMetrics {
    total_embeddings: AtomicU64,
    total_failures: AtomicU64,
    total_inference_time_us: AtomicU64,
}

impl EmbeddingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_embedding(&self, inference_time: Duration) {
        self.total_embeddings.fetch_add(1, Ordering::Relaxed);
        self.total_inference_time_us
            .fetch_add(inference_time.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let embeddings = self.total_embeddings.load(Ordering::Relaxed);
        let total_time =
            Duration::from_micros(self.total_inference_time_us.load(Ordering::Relaxed));
        let average_ms = if embeddings > 0 {
            total_time.as_secs_f64() * 1000.0 / embeddings as f64
        } else {
            0.0
        };

        MetricsSnapshot {
            total_embeddings: embeddings,
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_inference_time: total_time,
            average_inference_ms: average_ms,
        }
    }
}

/// A point-in-time snapshot of embedding metrics
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub total_embeddings: u64,
    pub total_failures: u64,
    pub total_inference_time: Duration,
    pub average_inference_ms: f64,
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Embeddings: {}, Failures: {}, Total time: {:.2}s, Avg: {:.1}ms",
            self.total_embeddings,
            self.total_failures,
            self.total_inference_time.as_secs_f64(),
            self.average_inference_ms
        )
    }
}

/// Loaded model plus preprocessing recipe, pinned to one device
///
/// Shared across requests behind an `Arc`. The model sits behind a mutex
/// because a session run needs exclusive access; nothing else is mutated by
/// `embed` apart from the metrics counters.
pub struct EmbeddingEngine {
    model: Mutex<Box<dyn VisionModel>>,
    preprocess: PreprocessConfig,
    device: Device,
    metrics: EmbeddingMetrics,
}

impl std::fmt::Debug for EmbeddingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingEngine")
            .field("preprocess", &self.preprocess)
            .field("device", &self.device)
            .finish()
    }
}

impl EmbeddingEngine {
    pub fn new(model: Box<dyn VisionModel>, preprocess: PreprocessConfig, device: Device) -> Self {
        Self {
            model: Mutex::new(model),
            preprocess,
            device,
            metrics: EmbeddingMetrics::new(),
        }
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Embedding dimension guaranteed by [`embed`](Self::embed)
    pub fn embedding_dim(&self) -> usize {
        EMBEDDING_DIM
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Generate a unit-length 512-dimensional embedding for an image
    pub fn embed(&self, image: &CanonicalImage) -> Result<Vec<f32>> {
        let start = Instant::now();
        let result = self.embed_internal(image);

        match &result {
            Ok(_) => self.metrics.record_embedding(start.elapsed()),
            Err(_) => self.metrics.record_failure(),
        }

        result
    }

    fn embed_internal(&self, image: &CanonicalImage) -> Result<Vec<f32>> {
        let pixel_values = self.preprocess.preprocess(image)?;

        let raw = {
            let mut model = self.model.lock();
            model.forward(pixel_values)?
        };

        if raw.len() != EMBEDDING_DIM {
            return Err(Error::Inference(format!(
                "Expected {}-dimensional embedding, model returned {}",
                EMBEDDING_DIM,
                raw.len()
            )));
        }

        let embedding = l2_normalize(&raw)?;
        debug!(dims = embedding.len(), "Generated image embedding");
        Ok(embedding)
    }
}

/// Scale a vector to unit Euclidean length
///
/// Non-finite components and zero vectors cannot be normalized and are
/// reported as inference errors.
pub fn l2_normalize(v: &[f32]) -> Result<Vec<f32>> {
    if v.iter().any(|x| !x.is_finite()) {
        return Err(Error::Inference(
            "Embedding contains non-finite values".into(),
        ));
    }

    let norm = v.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>().sqrt();
    if norm == 0.0 {
        return Err(Error::Inference("Embedding has zero norm".into()));
    }

    Ok(v.iter().map(|x| (*x as f64 / norm) as f32).collect())
}

/// Cosine similarity between two embeddings
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FailingVisionModel, MeanColorModel};
    use image::{Rgb, RgbImage};

    fn engine(model: Box<dyn VisionModel>) -> EmbeddingEngine {
        EmbeddingEngine::new(model, PreprocessConfig::default(), Device::Cpu)
    }

    fn image(color: [u8; 3]) -> CanonicalImage {
        CanonicalImage::from_rgb(RgbImage::from_pixel(64, 48, Rgb(color)))
    }

    fn norm(v: &[f32]) -> f32 {
        v.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    #[test]
    fn test_embed_is_unit_length_512() {
        let engine = engine(Box::new(MeanColorModel::new()));
        for color in [[0, 0, 0], [255, 255, 255], [12, 200, 99]] {
            let embedding = engine.embed(&image(color)).unwrap();
            assert_eq!(embedding.len(), 512);
            assert!((norm(&embedding) - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_embed_distinguishes_images() {
        let engine = engine(Box::new(MeanColorModel::new()));
        let red = engine.embed(&image([255, 0, 0])).unwrap();
        let blue = engine.embed(&image([0, 0, 255])).unwrap();
        let red_again = engine.embed(&image([255, 0, 0])).unwrap();

        assert_eq!(red, red_again);
        assert!(cosine_similarity(&red, &blue) < 0.999);
    }

    #[test]
    fn test_embed_failure_is_inference_error() {
        let engine = engine(Box::new(FailingVisionModel::new("CUDA out of memory")));
        let err = engine.embed(&image([1, 2, 3])).unwrap_err();
        assert!(matches!(err, Error::Inference(_)));
        assert!(err.to_string().contains("CUDA out of memory"));
        assert_eq!(engine.metrics().total_failures, 1);
    }

    #[test]
    fn test_embed_rejects_wrong_dimension() {
        let engine = engine(Box::new(MeanColorModel::with_dim(384)));
        let err = engine.embed(&image([1, 2, 3])).unwrap_err();
        assert!(err.to_string().contains("512"));
    }

    #[test]
    fn test_failed_embed_leaves_engine_usable() {
        let engine = engine(Box::new(MeanColorModel::new()));
        let empty = CanonicalImage::from_rgb(RgbImage::new(0, 0));
        assert!(engine.embed(&empty).is_err());
        assert!(engine.embed(&image([5, 5, 5])).is_ok());

        let metrics = engine.metrics();
        assert_eq!(metrics.total_embeddings, 1);
        assert_eq!(metrics.total_failures, 1);
    }

    #[test]
    fn test_l2_normalize() {
        let normalized = l2_normalize(&[3.0, 4.0]).unwrap();
        assert!((normalized[0] - 0.6).abs() < 1e-6);
        assert!((normalized[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize_rejects_zero_and_nan() {
        assert!(l2_normalize(&[0.0, 0.0]).is_err());
        assert!(l2_normalize(&[f32::NAN, 1.0]).is_err());
        assert!(l2_normalize(&[f32::INFINITY, 1.0]).is_err());
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_metrics_snapshot_display() {
        let metrics = EmbeddingMetrics::new();
        metrics.record_embedding(Duration::from_millis(10));
        metrics.record_embedding(Duration::from_millis(30));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_embeddings, 2);
        assert!((snapshot.average_inference_ms - 20.0).abs() < 1e-6);
        assert!(snapshot.to_string().contains("Embeddings: 2"));
    }
}
