//! Configuration for the takeoff engine

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Upper bound for every interval and window setting (30 days)
pub const MAX_INTERVAL_SECS: u64 = 30 * 24 * 60 * 60;

/// Environment variable naming a TOML config file
pub const CONFIG_ENV: &str = "TAKEOFF_CONFIG";

/// Main engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TakeoffConfig {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Timeout monitor configuration
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Registry and output locations
    #[serde(default)]
    pub storage: StorageConfig,
    /// Confidence auditor (Ollama) configuration
    #[serde(default)]
    pub auditor: AuditorConfig,
    /// Remote stage service configuration
    #[serde(default)]
    pub stages: StageServiceConfig,
    /// Directory intake configuration
    #[serde(default)]
    pub intake: IntakeConfig,
}

impl TakeoffConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&raw)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)
            .map_err(|e| Error::Config(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the file named by `TAKEOFF_CONFIG`, or fall back to defaults
    pub fn from_env_or_default() -> Result<Self> {
        match std::env::var(CONFIG_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::load(path.trim()),
            _ => Ok(Self::default()),
        }
    }

    /// Check values that would make the engine misbehave at runtime
    pub fn validate(&self) -> Result<()> {
        check_interval("monitor.timeout_window_secs", self.monitor.timeout_window_secs)?;
        check_interval("monitor.monitor_interval_secs", self.monitor.monitor_interval_secs)?;
        if self.storage.scan_page_size == 0 {
            return Err(Error::Config("storage.scan_page_size must be > 0".into()));
        }
        if self.auditor.max_concurrency == 0 {
            return Err(Error::Config("auditor.max_concurrency must be > 0".into()));
        }
        if self.intake.enabled {
            check_interval("intake.poll_interval_secs", self.intake.poll_interval_secs)?;
        }
        Ok(())
    }
}

fn check_interval(name: &str, secs: u64) -> Result<()> {
    if secs == 0 || secs > MAX_INTERVAL_SECS {
        return Err(Error::Config(format!(
            "{} must be between 1 and {}, got {}",
            name, MAX_INTERVAL_SECS, secs
        )));
    }
    Ok(())
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host address
    pub host: String,
    /// Port number
    pub port: u16,
    /// Enable CORS
    pub enable_cors: bool,
    /// Maximum upload size in bytes (default: 200MB)
    pub max_upload_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            enable_cors: true,
            max_upload_size: 200 * 1024 * 1024, // drawing sets run large
        }
    }
}

/// Timeout & retry monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// How long a run may go without a heartbeat before it is stale (default: 300s)
    pub timeout_window_secs: u64,
    /// Grace windows granted to a stale run before it is failed (default: 3)
    pub max_retries: u32,
    /// Monitor wake cadence (default: 60s)
    pub monitor_interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            timeout_window_secs: 300,
            max_retries: 3,
            monitor_interval_secs: 60,
        }
    }
}

impl MonitorConfig {
    pub fn timeout_window(&self) -> Duration {
        Duration::from_secs(self.timeout_window_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }
}

/// Registry and output locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite registry file
    pub database_path: PathBuf,
    /// Root for result bundles and failure records
    pub output_dir: PathBuf,
    /// Where uploaded drawing sets are saved before submission
    pub upload_dir: PathBuf,
    /// Records fetched per registry scan page
    pub scan_page_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let base = dirs::data_local_dir()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
            .join("takeoff-engine");

        Self {
            database_path: base.join("runs.db"),
            output_dir: base.join("output"),
            upload_dir: base.join("uploads"),
            scan_page_size: 100,
        }
    }
}

/// Confidence auditor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditorConfig {
    /// Ollama base URL
    pub base_url: String,
    /// Vision model used to audit evidence
    pub model: String,
    /// Per-artifact request timeout in seconds
    pub timeout_secs: u64,
    /// Concurrent oracle calls per run
    pub max_concurrency: usize,
    /// Sampling temperature
    pub temperature: f32,
}

impl Default for AuditorConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "qwen3-vl:30b-a3b-instruct".to_string(),
            timeout_secs: 120,
            max_concurrency: 4,
            temperature: 0.0,
        }
    }
}

impl AuditorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Remote stage service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StageServiceConfig {
    /// Base URL of the extraction service
    pub base_url: String,
    /// Request timeout per stage in seconds (default: 900s)
    pub timeout_secs: u64,
}

impl Default for StageServiceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9000".to_string(),
            timeout_secs: 900,
        }
    }
}

/// Directory intake configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntakeConfig {
    /// Poll `input_dir` in the background
    pub enabled: bool,
    /// Directory watched for new drawing sets
    pub input_dir: PathBuf,
    /// Submitted files are moved here
    pub archive_dir: PathBuf,
    /// Poll cadence in seconds
    pub poll_interval_secs: u64,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            input_dir: PathBuf::from("input"),
            archive_dir: PathBuf::from("archive"),
            poll_interval_secs: 300,
        }
    }
}
