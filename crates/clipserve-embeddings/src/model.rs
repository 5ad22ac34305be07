//! Model artifact caching and download

use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use clipserve_core::{Error, ModelSettings, Result};

/// ONNX export of the vision tower, relative to the repository root
const MODEL_REMOTE_PATH: &str = "onnx/vision_model.onnx";
const PREPROCESSOR_REMOTE_PATH: &str = "preprocessor_config.json";

const MODEL_FILENAME: &str = "vision_model.onnx";
const PREPROCESSOR_FILENAME: &str = "preprocessor_config.json";

/// Suffix of partially downloaded files kept for resumption
const PARTIAL_EXTENSION: &str = "part";

/// Local paths of a model's artifacts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelArtifacts {
    /// Path to the ONNX vision model
    pub model_path: PathBuf,
    /// Path to the preprocessor config JSON
    pub preprocessor_path: PathBuf,
}

impl ModelArtifacts {
    pub fn exist(&self) -> bool {
        self.model_path.exists() && self.preprocessor_path.exists()
    }
}

/// Manages model downloading and storage
pub struct ModelManager {
    /// Cache root (e.g. `~/.cache/huggingface`)
    cache_root: PathBuf,
    /// Hugging Face repository id
    model_id: String,
    /// Artifact host
    base_url: String,
    /// Expected SHA256 of the ONNX file
    expected_sha256: Option<String>,
    agent: ureq::Agent,
}

impl std::fmt::Debug for ModelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelManager")
            .field("cache_root", &self.cache_root)
            .field("model_id", &self.model_id)
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl ModelManager {
    /// Create a manager from model settings
    pub fn from_settings(settings: &ModelSettings) -> Result<Self> {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(settings.connect_timeout_secs))
            .timeout_read(Duration::from_secs(settings.read_timeout_secs))
            .build();

        Ok(Self {
            cache_root: settings.resolved_cache_dir()?,
            model_id: settings.model_id.clone(),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            expected_sha256: settings.expected_sha256.as_ref().map(|h| h.to_lowercase()),
            agent,
        })
    }

    /// Create a manager with a custom cache root and default settings otherwise
    pub fn with_cache_root(cache_root: impl AsRef<Path>) -> Self {
        let settings = ModelSettings {
            cache_dir: Some(cache_root.as_ref().to_path_buf()),
            ..ModelSettings::default()
        };
        Self {
            cache_root: cache_root.as_ref().to_path_buf(),
            model_id: settings.model_id,
            base_url: settings.base_url,
            expected_sha256: None,
            agent: ureq::agent(),
        }
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Directory holding this model's files
    pub fn model_dir(&self) -> PathBuf {
        self.cache_root
            .join("clipserve")
            .join(self.model_id.replace('/', "--"))
    }

    pub fn artifacts(&self) -> ModelArtifacts {
        let dir = self.model_dir();
        ModelArtifacts {
            model_path: dir.join(MODEL_FILENAME),
            preprocessor_path: dir.join(PREPROCESSOR_FILENAME),
        }
    }

    /// Check if the model is available locally
    pub fn is_model_available(&self) -> bool {
        self.artifacts().exist()
    }

    fn remote_url(&self, remote_path: &str) -> String {
        format!("{}/{}/resolve/main/{}", self.base_url, self.model_id, remote_path)
    }

    /// Ensure every artifact is cached, downloading what is missing
    pub fn ensure_model_available(&self) -> Result<ModelArtifacts> {
        let artifacts = self.artifacts();

        fs::create_dir_all(self.model_dir()).map_err(|e| {
            Error::FileSystem(format!("Failed to create model directory: {}", e))
        })?;

        if !artifacts.model_path.exists() {
            info!(model = %self.model_id, "Downloading model files (this may take a while on first run)...");
            self.download_file(&self.remote_url(MODEL_REMOTE_PATH), &artifacts.model_path)?;
        } else {
            debug!("Model already exists at {:?}", artifacts.model_path);
        }

        if !artifacts.preprocessor_path.exists() {
            info!(model = %self.model_id, "Downloading preprocessor config...");
            self.download_file(
                &self.remote_url(PREPROCESSOR_REMOTE_PATH),
                &artifacts.preprocessor_path,
            )?;
        } else {
            debug!("Preprocessor config already exists at {:?}", artifacts.preprocessor_path);
        }

        if let Some(expected) = &self.expected_sha256 {
            let actual = compute_file_hash(&artifacts.model_path)?;
            if &actual != expected {
                warn!(expected = %expected, actual = %actual, "Model integrity check failed");
                // A corrupt file would fail the same way on every retry
                let _ = fs::remove_file(&artifacts.model_path);
                return Err(Error::ModelLoad(format!(
                    "Model checksum mismatch: expected {}, got {}",
                    expected, actual
                )));
            }
            debug!("Model checksum verified");
        }

        Ok(artifacts)
    }

    /// Download a file, resuming a previous partial download when possible
    fn download_file(&self, url: &str, dest: &Path) -> Result<()> {
        let temp_path = dest.with_extension(PARTIAL_EXTENSION);
        let resume_from = fs::metadata(&temp_path).map(|m| m.len()).unwrap_or(0);

        debug!(url, dest = ?dest, resume_from, "Downloading");

        let mut request = self.agent.get(url);
        if resume_from > 0 {
            request = request.set("Range", &format!("bytes={}-", resume_from));
        }

        let response = match request.call() {
            Ok(response) => response,
            Err(ureq::Error::Status(416, _)) if resume_from > 0 => {
                // Stale partial file; start over
                warn!(path = ?temp_path, "Discarding unresumable partial download");
                fs::remove_file(&temp_path)?;
                return self.download_file(url, dest);
            }
            Err(ureq::Error::Status(code, _)) => return Err(status_error(url, code)),
            Err(ureq::Error::Transport(transport)) => {
                return Err(Error::Network(format!("{}: {}", url, transport)));
            }
        };

        let resumed = resume_from > 0 && response.status() == 206;
        if resume_from > 0 && !resumed {
            debug!("Server ignored range request, restarting download");
        }

        let content_length = response
            .header("Content-Length")
            .and_then(|s| s.parse::<u64>().ok());
        if let Some(len) = content_length {
            info!("Downloading {} bytes...", len);
        }

        let mut file = if resumed {
            info!(offset = resume_from, "Resuming interrupted download");
            OpenOptions::new().append(true).open(&temp_path)
        } else {
            fs::File::create(&temp_path)
        }
        .map_err(|e| Error::FileSystem(format!("Failed to open temporary file: {}", e)))?;

        let mut reader = response.into_reader();
        let mut buffer = [0u8; 8192];
        let mut total_bytes = 0u64;
        let mut next_report = 10 * 1024 * 1024;

        loop {
            // Partial data stays on disk so the next attempt can resume
            let bytes_read = reader.read(&mut buffer).map_err(|e| {
                Error::Network(format!("Failed to read download data: {}", e))
            })?;

            if bytes_read == 0 {
                break;
            }

            file.write_all(&buffer[..bytes_read]).map_err(|e| {
                Error::FileSystem(format!("Failed to write model file: {}", e))
            })?;

            total_bytes += bytes_read as u64;

            if let Some(len) = content_length {
                if total_bytes >= next_report {
                    let percent = (total_bytes as f64 / len as f64) * 100.0;
                    debug!("Download progress: {:.1}%", percent);
                    next_report += 10 * 1024 * 1024;
                }
            }
        }

        file.flush().map_err(|e| {
            Error::FileSystem(format!("Failed to flush model file: {}", e))
        })?;
        drop(file);

        fs::rename(&temp_path, dest).map_err(|e| {
            Error::FileSystem(format!("Failed to move model file: {}", e))
        })?;

        info!("Downloaded {} bytes to {:?}", total_bytes, dest);
        Ok(())
    }
}

/// Compute the SHA256 hex digest of a file
/// Classify an HTTP error status from the artifact host
///
/// Throttling and server-side failures are transient and retried by the
/// loader; any other status is a permanent load failure.
fn status_error(url: &str, code: u16) -> Error {
    let message = format!("{} returned HTTP {}", url, code);
    if code == 429 || (500..600).contains(&code) {
        Error::Network(message)
    } else {
        Error::ModelLoad(message)
    }
}

pub fn compute_file_hash(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)
        .map_err(|e| Error::FileSystem(format!("Failed to open file for hashing: {}", e)))?;

    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = file.read(&mut buffer).map_err(|e| {
            Error::FileSystem(format!("Failed to read file for hashing: {}", e))
        })?;

        if bytes_read == 0 {
            break;
        }

        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}
