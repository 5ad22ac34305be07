//! clipserve server - HTTP surface for CLIP image embeddings
//!
//! Wires the readiness gate, the extraction service and the axum routes
//! together behind a [`ServerRunner`].

pub mod gate;
pub mod routes;
pub mod runner;
pub mod service;
pub mod status;

pub use gate::{HealthReport, ReadinessGate};
pub use routes::{router, ApiError, AppState};
pub use runner::ServerRunner;
pub use service::{BatchItem, BatchResult, Extraction, ImageInput, InferenceService};
pub use status::{ServerStatus, StatusReport};
