//! clipserve embeddings - image to vector
//!
//! Decodes uploaded images, applies the CLIP preprocessing recipe, runs the
//! ONNX vision tower and L2-normalizes its output. Model artifacts are fetched
//! into a local cache and loaded with retry and exponential backoff.

pub mod decode;
pub mod inference;
pub mod loader;
pub mod model;
pub mod preprocess;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use decode::{CanonicalImage, ImageDecoder};
pub use inference::{
    cosine_similarity, l2_normalize, EmbeddingEngine, MetricsSnapshot, OnnxVisionModel,
    VisionModel,
};
pub use loader::{select_device, LoadedModel, ModelLoader, ModelSource, OnnxModelSource, RetryPolicy};
pub use model::{ModelArtifacts, ModelManager};
pub use preprocess::PreprocessConfig;
