//! Configuration management for the segmentation service

use crate::transforms::IntensityRescale;
use crate::types::volume::{Geometry, DEFAULT_MAX_VOXELS};
use anyhow::{ensure, Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub model: ModelConfig,
    pub geometry: GeometryConfig,
    #[serde(default)]
    pub intensity: IntensityRescale,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub service: ServiceMetadata,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Inference model configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    /// Path to the ONNX model file
    pub path: String,
    /// Input tensor fed with the canonical-space batch
    #[serde(default = "default_input_tensor")]
    pub input_tensor: String,
    /// Output tensor holding the probability map
    #[serde(default = "default_output_tensor")]
    pub output_tensor: String,
    /// Number of threads for ONNX inference (default: 1)
    #[serde(default = "default_onnx_threads")]
    pub onnx_threads: usize,
}

fn default_input_tensor() -> String {
    "images".to_string()
}

fn default_output_tensor() -> String {
    "logits".to_string()
}

fn default_onnx_threads() -> usize {
    1
}

/// Canonical space the model was trained in. Both values are `[x, y, z]`.
#[derive(Debug, Clone, Deserialize)]
pub struct GeometryConfig {
    /// Voxel spacing in millimetres
    pub volume_resolution: [f64; 3],
    /// Voxel-count box
    pub volume_size: [usize; 3],
    /// Largest grid a request may decode or resample into
    #[serde(default = "default_max_voxels")]
    pub max_voxels: usize,
}

fn default_max_voxels() -> usize {
    DEFAULT_MAX_VOXELS
}

/// Network, access and scratch-storage configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Static access key; empty disables the check
    pub api_key: String,
    /// Periodically announce the service to a discovery registry
    pub announce: bool,
    pub registry_url: String,
    pub announce_interval_secs: u64,
    /// Largest accepted request body
    pub max_upload_bytes: usize,
    /// Requests processed at the same time; inference itself is serialised
    pub max_concurrent_requests: usize,
    /// Directory for per-request scratch files (default: OS temp dir)
    pub scratch_dir: Option<PathBuf>,
    /// Interval between metrics summaries in the log
    pub metrics_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9000,
            api_key: String::new(),
            announce: false,
            registry_url: "http://localhost:8001/announce".to_string(),
            announce_interval_secs: 60,
            max_upload_bytes: 512 * 1024 * 1024,
            max_concurrent_requests: 4,
            scratch_dir: None,
            metrics_interval_secs: 60,
        }
    }
}

impl ServerConfig {
    pub fn scratch_dir(&self) -> PathBuf {
        self.scratch_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// Descriptive metadata advertised to clients and the registry
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceMetadata {
    pub name: String,
    pub sid: String,
    pub modality: String,
    pub anatomy: String,
    pub description: String,
    pub dimensionality: u8,
}

impl Default for ServiceMetadata {
    fn default() -> Self {
        Self {
            name: "TEST".to_string(),
            sid: "0000000".to_string(),
            modality: "None".to_string(),
            anatomy: "None".to_string(),
            description: "None".to_string(),
            dimensionality: 3,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (json, pretty)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "config/service.toml";

impl AppConfig {
    /// Load configuration from the default file plus environment
    pub fn load() -> Result<Self> {
        Self::load_from_path(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific path plus environment
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load_with_overrides(path, Vec::new())
    }

    /// Layer file, `VOLSEG__*` environment variables and explicit overrides
    /// (highest precedence). Missing files are tolerated so a deployment can
    /// be configured from the environment or CLI alone.
    pub fn load_with_overrides<P: AsRef<Path>>(
        path: P,
        overrides: Vec<(String, config::Value)>,
    ) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::from(path.as_ref()).required(false))
            .add_source(
                Environment::with_prefix("VOLSEG")
                    .separator("__")
                    .try_parsing(true),
            );
        for (key, value) in overrides {
            builder = builder
                .set_override(key.as_str(), value)
                .with_context(|| format!("Invalid override for {key}"))?;
        }

        let config: AppConfig = builder
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject geometry the chains cannot be built from
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.geometry
                .volume_resolution
                .iter()
                .all(|r| r.is_finite() && *r > 0.0),
            "volume_resolution must be positive, got {:?}",
            self.geometry.volume_resolution
        );
        ensure!(
            self.geometry.volume_size.iter().all(|s| *s > 0),
            "volume_size must be positive, got {:?}",
            self.geometry.volume_size
        );
        let box_voxels = Geometry::new(self.geometry.volume_size, self.geometry.volume_resolution)
            .checked_voxel_count();
        ensure!(
            box_voxels.is_some_and(|count| count <= self.geometry.max_voxels),
            "volume_size {:?} exceeds max_voxels {}",
            self.geometry.volume_size,
            self.geometry.max_voxels
        );
        ensure!(
            self.server.max_concurrent_requests > 0,
            "max_concurrent_requests must be at least 1"
        );
        ensure!(!self.model.path.is_empty(), "model.path is required");
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig {
                path: "models/segmentation.onnx".to_string(),
                input_tensor: default_input_tensor(),
                output_tensor: default_output_tensor(),
                onnx_threads: default_onnx_threads(),
            },
            geometry: GeometryConfig {
                volume_resolution: [1.5, 1.5, 1.5],
                volume_size: [96, 96, 96],
                max_voxels: DEFAULT_MAX_VOXELS,
            },
            intensity: IntensityRescale::default(),
            server: ServerConfig::default(),
            service: ServiceMetadata::default(),
            logging: LoggingConfig::default(),
        }
    }
}
