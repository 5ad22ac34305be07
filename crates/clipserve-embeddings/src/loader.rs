//! Resilient model loading with exponential backoff
//!
//! Startup is the only place clipserve retries anything. Transient network
//! failures while acquiring the model are retried with a doubling delay;
//! every other failure, and a network failure on the last attempt, is fatal.

use std::thread;
use std::time::{Duration, Instant};

use ort::execution_providers::{CUDAExecutionProvider, ExecutionProvider};
use tracing::{debug, error, info, warn};

use clipserve_core::{Device, Error, ModelSettings, Result, EMBEDDING_DIM};

use crate::inference::{EmbeddingEngine, OnnxVisionModel};
use crate::model::ModelManager;
use crate::preprocess::PreprocessConfig;

/// Pick the accelerator when its runtime is usable, otherwise the CPU
///
/// Builds without the `cuda` feature link a CPU-only runtime and never probe.
pub fn select_device() -> Device {
    if !cfg!(feature = "cuda") {
        debug!("Built without CUDA support, using CPU");
        return Device::Cpu;
    }
    match CUDAExecutionProvider::default().is_available() {
        Ok(true) => Device::Accelerator,
        Ok(false) => Device::Cpu,
        Err(e) => {
            debug!(error = %e, "Could not query CUDA availability, using CPU");
            Device::Cpu
        }
    }
}

/// How many times to attempt a load and how long to wait in between
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_retries: u32,
    /// Wait before the second attempt; doubles before each later one
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
        }
    }

    pub fn from_settings(settings: &ModelSettings) -> Self {
        Self::new(settings.max_retries, settings.retry_delay())
    }
}

/// Doubled wait before the following attempt, saturating at `Duration::MAX`
fn next_delay(delay: Duration) -> Duration {
    delay.saturating_mul(2)
}

/// Something that can produce a ready [`EmbeddingEngine`]
///
/// One call is one load attempt. The loader decides whether a failure is
/// worth another attempt.
pub trait ModelSource: Send + Sync {
    /// Identifier used in logs
    fn name(&self) -> &str;

    fn acquire(&self, device: Device) -> Result<EmbeddingEngine>;
}

/// Fetches the CLIP ONNX export through a [`ModelManager`] and builds the engine
#[derive(Debug)]
pub struct OnnxModelSource {
    manager: ModelManager,
    intra_threads: usize,
}

impl OnnxModelSource {
    pub fn new(manager: ModelManager, intra_threads: usize) -> Self {
        Self {
            manager,
            intra_threads,
        }
    }

    pub fn from_settings(settings: &ModelSettings) -> Result<Self> {
        Ok(Self::new(
            ModelManager::from_settings(settings)?,
            settings.intra_threads,
        ))
    }

    pub fn manager(&self) -> &ModelManager {
        &self.manager
    }
}

impl ModelSource for OnnxModelSource {
    fn name(&self) -> &str {
        self.manager.model_id()
    }

    fn acquire(&self, device: Device) -> Result<EmbeddingEngine> {
        let start = Instant::now();
        let artifacts = self.manager.ensure_model_available()?;
        info!(
            elapsed = %format!("{:.1}s", start.elapsed().as_secs_f64()),
            "Model files ready"
        );

        let preprocess = PreprocessConfig::from_file(&artifacts.preprocessor_path)?;

        info!(device = %device, "Moving model to device...");
        let model = OnnxVisionModel::load(&artifacts.model_path, device, self.intra_threads)?;

        Ok(EmbeddingEngine::new(Box::new(model), preprocess, device))
    }
}

/// Outcome of a successful load
#[derive(Debug)]
pub struct LoadedModel {
    pub engine: EmbeddingEngine,
    /// Attempts made, including the successful one
    pub attempts: u32,
    /// Total time spent sleeping between attempts
    pub backoff: Duration,
    /// Wall time of the whole load
    pub elapsed: Duration,
}

/// Drives a [`ModelSource`] under a [`RetryPolicy`]
pub struct ModelLoader<S> {
    source: S,
    policy: RetryPolicy,
}

impl<S: ModelSource> ModelLoader<S> {
    pub fn new(source: S, policy: RetryPolicy) -> Self {
        Self { source, policy }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Load the model, retrying transient network failures
    ///
    /// Blocks the calling thread while sleeping between attempts. Any error
    /// returned is [`Error::StartupFatal`].
    pub fn load(&self, device: Device) -> Result<LoadedModel> {
        let max_retries = self.policy.max_retries;
        let mut delay = self.policy.initial_delay;
        let mut backoff = Duration::ZERO;
        let start = Instant::now();

        info!(model = %self.source.name(), device = %device, "Loading CLIP model...");

        for attempt in 0..max_retries {
            if attempt > 0 {
                info!(
                    "Retry attempt {}/{} after {:.1}s delay...",
                    attempt + 1,
                    max_retries,
                    delay.as_secs_f64()
                );
                thread::sleep(delay);
                backoff = backoff.saturating_add(delay);
                delay = next_delay(delay);
            }

            match self.source.acquire(device) {
                Ok(engine) => {
                    let elapsed = start.elapsed();
                    info!(
                        model = %self.source.name(),
                        embedding_dimension = EMBEDDING_DIM,
                        device = %engine.device(),
                        attempts = attempt + 1,
                        total_load_time = %format!("{:.1}s", elapsed.as_secs_f64()),
                        "CLIP model loaded successfully"
                    );
                    return Ok(LoadedModel {
                        engine,
                        attempts: attempt + 1,
                        backoff,
                        elapsed,
                    });
                }
                Err(e) => {
                    warn!(attempt = attempt + 1, error = %e, "Model load attempt failed");

                    if !e.is_network() {
                        error!(error = %e, "Failed to load CLIP model");
                        return Err(Error::StartupFatal(e.to_string()));
                    }

                    if attempt + 1 < max_retries {
                        info!("Network issue detected. Will retry...");
                        continue;
                    }

                    error!(
                        attempts = max_retries,
                        "Failed to download model after multiple attempts; check network \
                         connectivity to the model host or pre-populate the cache directory"
                    );
                    return Err(Error::StartupFatal(format!(
                        "Failed to download model after {} attempts: {}",
                        max_retries, e
                    )));
                }
            }
        }

        Err(Error::StartupFatal(
            "No load attempts were made (max_retries is 0)".into(),
        ))
    }
}
