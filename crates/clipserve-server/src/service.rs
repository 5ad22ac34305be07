//! Single and batch feature extraction
//!
//! Every request passes the readiness gate before any decoding happens.
//! Batches check the gate once, then run each item independently and in
//! order; an item's failure becomes that item's entry and never aborts the
//! rest of the batch.

use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info};

use clipserve_core::{Error, Result};
use clipserve_embeddings::{EmbeddingEngine, ImageDecoder};

use crate::gate::ReadinessGate;

/// One uploaded image
#[derive(Debug, Clone)]
pub struct ImageInput {
    pub filename: Option<String>,
    pub bytes: Vec<u8>,
}

impl ImageInput {
    pub fn new(filename: Option<String>, bytes: Vec<u8>) -> Self {
        Self { filename, bytes }
    }
}

/// Result of a single successful extraction
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Extraction {
    pub success: bool,
    pub embedding: Vec<f32>,
    pub dimension: usize,
}

impl Extraction {
    fn new(embedding: Vec<f32>) -> Self {
        Self {
            success: true,
            dimension: embedding.len(),
            embedding,
        }
    }
}

/// Outcome of one batch item
#[derive(Debug, Clone, PartialEq)]
pub enum BatchItem {
    Success {
        filename: Option<String>,
        embedding: Vec<f32>,
        dimension: usize,
    },
    Failure {
        filename: Option<String>,
        error: String,
    },
}

impl BatchItem {
    pub fn filename(&self) -> Option<&str> {
        match self {
            BatchItem::Success { filename, .. } | BatchItem::Failure { filename, .. } => {
                filename.as_deref()
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, BatchItem::Success { .. })
    }
}

/// Wire shape of a batch item: `{filename, success, embedding?, dimension?, error?}`
#[derive(Serialize)]
struct BatchItemBody<'a> {
    filename: Option<&'a str>,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    embedding: Option<&'a [f32]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dimension: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

impl Serialize for BatchItem {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let body = match self {
            BatchItem::Success {
                filename,
                embedding,
                dimension,
            } => BatchItemBody {
                filename: filename.as_deref(),
                success: true,
                embedding: Some(embedding.as_slice()),
                dimension: Some(*dimension),
                error: None,
            },
            BatchItem::Failure { filename, error } => BatchItemBody {
                filename: filename.as_deref(),
                success: false,
                embedding: None,
                dimension: None,
                error: Some(error.as_str()),
            },
        };
        body.serialize(serializer)
    }
}

/// Batch envelope; `success` is true whenever the batch was attempted
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchResult {
    pub success: bool,
    pub results: Vec<BatchItem>,
}

impl BatchResult {
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn failures(&self) -> usize {
        self.results.iter().filter(|r| !r.is_success()).count()
    }
}

/// Orchestrates gate → decode → embed for single and batch requests
#[derive(Debug, Clone)]
pub struct InferenceService {
    gate: Arc<ReadinessGate>,
    decoder: ImageDecoder,
}

impl InferenceService {
    pub fn new(gate: Arc<ReadinessGate>) -> Self {
        Self {
            gate,
            decoder: ImageDecoder::new(),
        }
    }

    pub fn gate(&self) -> &ReadinessGate {
        &self.gate
    }

    /// Extract the embedding of one image
    ///
    /// Fails with [`Error::NotReady`] before startup finished, otherwise with
    /// the decode or inference error of this image.
    pub fn extract(&self, input: &ImageInput) -> Result<Extraction> {
        let engine = self.gate.engine()?;

        match self.run_pipeline(&engine, &input.bytes) {
            Ok(embedding) => {
                info!(dimension = embedding.len(), "Extracted features");
                Ok(Extraction::new(embedding))
            }
            Err(e) => {
                error!(kind = e.kind(), error = %e, "Feature extraction failed");
                Err(e)
            }
        }
    }

    /// Extract embeddings for every image, isolating per-item failures
    ///
    /// The only error is [`Error::NotReady`], checked once for the whole batch.
    pub fn extract_batch(&self, inputs: &[ImageInput]) -> Result<BatchResult> {
        let engine = self.gate.engine()?;

        let results = inputs.iter().fold(Vec::with_capacity(inputs.len()), |mut acc, input| {
            acc.push(self.extract_item(&engine, input));
            acc
        });

        let result = BatchResult {
            success: true,
            results,
        };
        info!(
            items = result.len(),
            failures = result.failures(),
            "Processed batch"
        );
        Ok(result)
    }

    fn extract_item(&self, engine: &EmbeddingEngine, input: &ImageInput) -> BatchItem {
        match self.run_pipeline(engine, &input.bytes) {
            Ok(embedding) => BatchItem::Success {
                filename: input.filename.clone(),
                dimension: embedding.len(),
                embedding,
            },
            Err(e) => {
                error!(
                    filename = input.filename.as_deref().unwrap_or("<unnamed>"),
                    kind = e.kind(),
                    error = %e,
                    "Failed to process batch item"
                );
                BatchItem::Failure {
                    filename: input.filename.clone(),
                    error: e.to_string(),
                }
            }
        }
    }

    fn run_pipeline(&self, engine: &EmbeddingEngine, bytes: &[u8]) -> Result<Vec<f32>> {
        let image = self.decoder.decode(bytes)?;
        engine.embed(&image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clipserve_core::Device;
    use clipserve_embeddings::testing::{mean_color_engine, FailingVisionModel};
    use clipserve_embeddings::PreprocessConfig;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    fn png(color: [u8; 3]) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(RgbImage::from_pixel(32, 32, Rgb(color)))
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    fn ready_service() -> InferenceService {
        let gate = ReadinessGate::ready_with(mean_color_engine(Device::Cpu));
        InferenceService::new(Arc::new(gate))
    }

    fn input(name: &str, bytes: Vec<u8>) -> ImageInput {
        ImageInput::new(Some(name.to_string()), bytes)
    }

    #[test]
    fn test_extract_success() {
        let service = ready_service();
        let out = service.extract(&input("a.png", png([1, 2, 3]))).unwrap();
        assert!(out.success);
        assert_eq!(out.dimension, 512);
        assert_eq!(out.embedding.len(), 512);
    }

    #[test]
    fn test_extract_not_ready() {
        let service = InferenceService::new(Arc::new(ReadinessGate::new()));
        let err = service.extract(&input("a.png", png([1, 2, 3]))).unwrap_err();
        assert!(matches!(err, Error::NotReady));
    }

    #[test]
    fn test_extract_decode_error_keeps_gate_ready() {
        let service = ready_service();
        let err = service.extract(&input("bad.png", b"nope".to_vec())).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
        assert!(service.gate().is_ready());
        assert!(service.extract(&input("a.png", png([9, 9, 9]))).is_ok());
    }

    #[test]
    fn test_extract_inference_error() {
        let engine = clipserve_embeddings::EmbeddingEngine::new(
            Box::new(FailingVisionModel::new("device lost")),
            PreprocessConfig::default(),
            Device::Cpu,
        );
        let service = InferenceService::new(Arc::new(ReadinessGate::ready_with(engine)));
        let err = service.extract(&input("a.png", png([1, 2, 3]))).unwrap_err();
        assert!(matches!(err, Error::Inference(_)));
    }

    #[test]
    fn test_batch_isolates_failures_and_preserves_order() {
        let service = ready_service();
        let inputs = vec![
            input("a.png", png([255, 0, 0])),
            input("b.png", b"garbage".to_vec()),
            input("c.png", png([0, 0, 255])),
        ];

        let batch = service.extract_batch(&inputs).unwrap();
        assert!(batch.success);
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.failures(), 1);

        let names: Vec<_> = batch.results.iter().map(|r| r.filename()).collect();
        assert_eq!(names, vec![Some("a.png"), Some("b.png"), Some("c.png")]);
        assert!(batch.results[0].is_success());
        assert!(!batch.results[1].is_success());
        assert!(batch.results[2].is_success());

        // Items are independent of their neighbours
        let alone = service.extract(&inputs[2]).unwrap();
        match &batch.results[2] {
            BatchItem::Success { embedding, .. } => assert_eq!(embedding, &alone.embedding),
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[test]
    fn test_batch_not_ready_fails_whole_batch() {
        let service = InferenceService::new(Arc::new(ReadinessGate::new()));
        let result = service.extract_batch(&[input("a.png", png([1, 1, 1]))]);
        assert!(matches!(result, Err(Error::NotReady)));
    }

    #[test]
    fn test_empty_batch() {
        let batch = ready_service().extract_batch(&[]).unwrap();
        assert!(batch.success);
        assert!(batch.is_empty());
    }

    #[test]
    fn test_batch_item_wire_shape() {
        let ok = BatchItem::Success {
            filename: Some("a.png".into()),
            embedding: vec![1.0],
            dimension: 1,
        };
        let failed = BatchItem::Failure {
            filename: None,
            error: "Image decode error: bad".into(),
        };

        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            serde_json::json!({"filename": "a.png", "success": true, "embedding": [1.0], "dimension": 1})
        );
        assert_eq!(
            serde_json::to_value(&failed).unwrap(),
            serde_json::json!({"filename": null, "success": false, "error": "Image decode error: bad"})
        );
    }
}
