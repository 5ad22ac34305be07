//! Server runner for managing the service lifecycle
//!
//! Startup is strictly ordered: validate configuration, pick a device, load
//! the model (with retries), open the readiness gate, and only then bind the
//! listener. A fatal load aborts before any port is opened.

use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tracing::{error, info};

use clipserve_core::{Config, Error, Result, EMBEDDING_DIM, MODEL_DISPLAY_NAME};
use clipserve_embeddings::{
    select_device, ModelLoader, ModelSource, OnnxModelSource, RetryPolicy,
};

use crate::gate::ReadinessGate;
use crate::routes::{self, AppState};
use crate::service::InferenceService;

/// Owns the configuration and the readiness gate for one service instance
pub struct ServerRunner {
    config: Config,
    gate: Arc<ReadinessGate>,
}

impl ServerRunner {
    /// Create a runner; fails on invalid configuration
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            gate: Arc::new(ReadinessGate::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn gate(&self) -> &Arc<ReadinessGate> {
        &self.gate
    }

    /// Router wired to this runner's gate
    pub fn router(&self) -> Router {
        let state = Arc::new(AppState::new(InferenceService::new(Arc::clone(&self.gate))));
        routes::router(state, &self.config.server)
    }

    /// Load a model through `loader` on a blocking thread and open the gate
    pub async fn load_model<S>(&self, loader: ModelLoader<S>) -> Result<()>
    where
        S: ModelSource + 'static,
    {
        let device = select_device();
        self.gate.set_device(device);
        let policy = loader.policy();
        info!(
            device = %device,
            max_retries = policy.max_retries,
            retry_delay_secs = policy.initial_delay.as_secs_f64(),
            "Using device"
        );

        let loaded = tokio::task::spawn_blocking(move || loader.load(device))
            .await
            .map_err(|e| Error::StartupFatal(format!("Model load task failed: {}", e)))??;

        info!(
            attempts = loaded.attempts,
            backoff_secs = loaded.backoff.as_secs_f64(),
            elapsed = %format!("{:.1}s", loaded.elapsed.as_secs_f64()),
            "Model load finished"
        );
        self.gate.mark_ready(loaded.engine)
    }

    /// Bind and serve until Ctrl-C, using an already-opened gate
    pub async fn serve(&self) -> std::result::Result<(), anyhow::Error> {
        let address = self.config.server.bind_address();
        let listener = TcpListener::bind(&address).await?;

        info!(
            address = %address,
            model = MODEL_DISPLAY_NAME,
            embedding_dimension = EMBEDDING_DIM,
            "clipserve listening"
        );

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        info!("clipserve shutdown complete.");
        Ok(())
    }

    /// Full lifecycle with the ONNX model from the configured repository
    pub async fn run(self) -> std::result::Result<(), anyhow::Error> {
        info!(model_id = %self.config.model.model_id, "clipserve starting");

        let source = OnnxModelSource::from_settings(&self.config.model)?;
        let loader = ModelLoader::new(source, RetryPolicy::from_settings(&self.config.model));

        if let Err(e) = self.load_model(loader).await {
            error!(error = %e, "Startup aborted");
            return Err(e.into());
        }

        self.serve().await
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    info!("Shutting down service...");
}
