//! Configuration management for clipserve

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Environment variable naming the model artifact cache root
pub const CACHE_DIR_ENV: &str = "HF_HOME";

/// Main configuration for clipserve
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub model: ModelSettings,
}

impl Config {
    /// Load configuration from default locations, then apply environment overrides
    pub fn load() -> Result<Self> {
        let mut config = Self::load_file()?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Load configuration from the first existing default location
    fn load_file() -> Result<Self> {
        for path in Self::config_locations() {
            if path.exists() {
                info!(path = %path.display(), "Loading configuration");
                return Self::load_from_path(&path);
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(Self::default())
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Get default configuration file locations
    pub fn config_locations() -> Vec<PathBuf> {
        let mut locations = Vec::new();

        // 1. Current directory
        locations.push(PathBuf::from(".clipserve.toml"));

        // 2. User config directory
        if let Some(config_dir) = dirs::config_dir() {
            locations.push(config_dir.join("clipserve").join("config.toml"));
        }

        // 3. Home directory
        if let Some(home) = dirs::home_dir() {
            locations.push(home.join(".clipserve.toml"));
        }

        locations
    }

    /// Apply overrides from a key lookup (the process environment in production)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("CLIPSERVE_HOST") {
            self.server.host = host;
        }

        if let Some(port) = lookup("CLIPSERVE_PORT") {
            self.server.port = port.parse().map_err(|_| {
                Error::Config(format!("Invalid CLIPSERVE_PORT '{}'", port))
            })?;
        }

        if let Some(cache_dir) = lookup(CACHE_DIR_ENV) {
            if !cache_dir.is_empty() {
                self.model.cache_dir = Some(PathBuf::from(cache_dir));
            }
        }

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.server.log_level.to_lowercase().as_str()) {
            return Err(Error::Config(format!(
                "Invalid log_level '{}': must be one of {:?}",
                self.server.log_level, valid_log_levels
            )));
        }

        if self.server.max_upload_mb == 0 {
            return Err(Error::Config(
                "Invalid max_upload_mb 0: must be at least 1".into(),
            ));
        }

        if self.model.max_retries == 0 {
            return Err(Error::Config(
                "Invalid max_retries 0: at least one load attempt is required".into(),
            ));
        }

        let delay = self.model.retry_delay_secs;
        if !delay.is_finite() || delay < 0.0 {
            return Err(Error::Config(format!(
                "Invalid retry_delay_secs {}: must be a finite, non-negative number",
                delay
            )));
        }

        if self.model.model_id.trim().is_empty() {
            return Err(Error::Config("model_id must not be empty".into()));
        }

        if let Some(hash) = &self.model.expected_sha256 {
            if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(Error::Config(format!(
                    "Invalid expected_sha256 '{}': must be 64 hex characters",
                    hash
                )));
            }
        }

        Ok(())
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind
    pub host: String,
    /// Port to bind
    pub port: u16,
    /// Log level used when RUST_LOG is unset
    pub log_level: String,
    /// Maximum accepted request body in megabytes
    pub max_upload_mb: usize,
    /// Allow every origin, method and header
    pub cors_permissive: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8001,
            log_level: "info".to_string(),
            max_upload_mb: 32,
            cors_permissive: true,
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb.saturating_mul(1024 * 1024)
    }
}

/// Model acquisition configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// Hugging Face repository holding the ONNX export
    pub model_id: String,
    /// Base URL of the artifact host
    pub base_url: String,
    /// Cache root; falls back to `<user cache dir>/huggingface`
    pub cache_dir: Option<PathBuf>,
    /// Number of load attempts
    pub max_retries: u32,
    /// Delay before the first retry, doubled after each retry
    pub retry_delay_secs: f64,
    /// Optional SHA256 the downloaded model must match
    pub expected_sha256: Option<String>,
    /// ONNX Runtime intra-op threads
    pub intra_threads: usize,
    /// Connect timeout for artifact downloads
    pub connect_timeout_secs: u64,
    /// Read timeout for artifact downloads
    pub read_timeout_secs: u64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model_id: "Xenova/clip-vit-base-patch32".to_string(),
            base_url: "https://huggingface.co".to_string(),
            cache_dir: None,
            max_retries: 3,
            retry_delay_secs: 5.0,
            expected_sha256: None,
            intra_threads: 4,
            connect_timeout_secs: 30,
            read_timeout_secs: 300,
        }
    }
}

impl ModelSettings {
    /// Resolve the artifact cache root
    pub fn resolved_cache_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.cache_dir {
            return Ok(dir.clone());
        }
        dirs::cache_dir()
            .map(|dir| dir.join("huggingface"))
            .ok_or_else(|| Error::Config("Could not determine user cache directory".into()))
    }

    /// Initial retry delay; out-of-range values saturate instead of panicking
    pub fn retry_delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.retry_delay_secs.max(0.0)).unwrap_or(Duration::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.port, 8001);
        assert_eq!(config.server.host, "0.0.0.0");
        assert!(config.server.cors_permissive);
        assert_eq!(config.model.max_retries, 3);
        assert_eq!(config.model.retry_delay(), Duration::from_secs(5));
        assert!(config.model.cache_dir.is_none());
    }

    #[test]
    fn test_config_validation_default() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_config_validation_invalid_log_level() {
        let mut config = Config::default();
        config.server.log_level = "loud".to_string();
        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("Invalid log_level"));
    }

    #[test]
    fn test_config_validation_zero_retries() {
        let mut config = Config::default();
        config.model.max_retries = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_bad_sha() {
        let mut config = Config::default();
        config.model.expected_sha256 = Some("abc".into());
        assert!(config.validate().is_err());

        config.model.expected_sha256 = Some("a".repeat(64));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_retry_delay() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[model]\nretry_delay_secs = inf").unwrap();
        let config = Config::load_from_path(file.path()).unwrap();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
        assert_eq!(config.model.retry_delay(), Duration::MAX);

        let mut config = Config::default();
        config.model.retry_delay_secs = -1.0;
        assert!(config.validate().is_err());
        config.model.retry_delay_secs = f64::NAN;
        assert!(config.validate().is_err());
        config.model.retry_delay_secs = 0.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_toml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[server]
port = 9000

[model]
max_retries = 5
retry_delay_secs = 0.5
"#
        )
        .unwrap();

        let config = Config::load_from_path(file.path()).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.model.max_retries, 5);
        assert_eq!(config.model.retry_delay(), Duration::from_millis(500));
    }

    #[test]
    fn test_load_invalid_toml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[server\nport = ").unwrap();
        assert!(matches!(
            Config::load_from_path(file.path()),
            Err(Error::Toml(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_overrides(lookup_from(&[
                ("CLIPSERVE_PORT", "9100"),
                ("CLIPSERVE_HOST", "127.0.0.1"),
                ("HF_HOME", "/srv/models"),
            ]))
            .unwrap();

        assert_eq!(config.server.bind_address(), "127.0.0.1:9100");
        assert_eq!(
            config.model.resolved_cache_dir().unwrap(),
            PathBuf::from("/srv/models")
        );
    }

    #[test]
    fn test_env_override_bad_port() {
        let mut config = Config::default();
        let result = config.apply_overrides(lookup_from(&[("CLIPSERVE_PORT", "http")]));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_max_upload_bytes() {
        let config = ServerConfig::default();
        assert_eq!(config.max_upload_bytes(), 32 * 1024 * 1024);

        let huge = ServerConfig {
            max_upload_mb: usize::MAX,
            ..ServerConfig::default()
        };
        assert_eq!(huge.max_upload_bytes(), usize::MAX);
    }
}
