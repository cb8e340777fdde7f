//! Command-line arguments layered over the configuration file

use crate::config::DEFAULT_CONFIG_PATH;
use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Parser)]
#[command(name = "volseg-service", version, about = "Volumetric segmentation inference service")]
pub struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// ONNX model file
    #[arg(long)]
    pub model_path: Option<String>,

    /// Input tensor name, e.g. `images:0`
    #[arg(long)]
    pub input_tensor_name: Option<String>,

    /// Output tensor name, e.g. `logits:0`
    #[arg(long)]
    pub output_tensor_name: Option<String>,

    #[arg(long)]
    pub port: Option<u16>,

    /// Announce the service to the discovery registry
    #[arg(long)]
    pub announce: bool,

    #[arg(long)]
    pub api_key: Option<String>,

    #[arg(long)]
    pub modality: Option<String>,

    #[arg(long)]
    pub anatomy: Option<String>,

    #[arg(long)]
    pub description: Option<String>,

    /// Model voxel spacing `x,y,z` in millimetres, or one value for all axes
    #[arg(long, value_parser = parse_triple::<f64>)]
    pub volume_resolution: Option<[f64; 3]>,

    /// Model box `x,y,z` in voxels, or one value for all axes
    #[arg(long, value_parser = parse_triple::<usize>)]
    pub volume_size: Option<[usize; 3]>,
}

/// Parse `"1.5,1.5,2"`, `"[96, 96, 64]"`, `"(1 1 1)"` or a single value
/// broadcast to all three axes.
pub fn parse_triple<T>(text: &str) -> Result<[T; 3]>
where
    T: FromStr + Copy,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let inner = text
        .trim()
        .trim_start_matches(['[', '('])
        .trim_end_matches([']', ')']);
    let values = inner
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<T>().with_context(|| format!("invalid component '{s}'")))
        .collect::<Result<Vec<T>>>()?;

    match values.as_slice() {
        [v] => Ok([*v; 3]),
        [x, y, z] => Ok([*x, *y, *z]),
        _ => bail!("expected 1 or 3 values, found {} in '{text}'", values.len()),
    }
}

impl Cli {
    /// Configuration overrides for every flag that was given
    pub fn overrides(&self) -> Vec<(String, config::Value)> {
        let mut overrides: Vec<(String, config::Value)> = Vec::new();
        let mut set = |key: &str, value: config::Value| overrides.push((key.to_string(), value));

        if let Some(v) = &self.model_path {
            set("model.path", v.clone().into());
        }
        if let Some(v) = &self.input_tensor_name {
            set("model.input_tensor", v.clone().into());
        }
        if let Some(v) = &self.output_tensor_name {
            set("model.output_tensor", v.clone().into());
        }
        if let Some(v) = self.port {
            set("server.port", i64::from(v).into());
        }
        if self.announce {
            set("server.announce", true.into());
        }
        if let Some(v) = &self.api_key {
            set("server.api_key", v.clone().into());
        }
        if let Some(v) = &self.modality {
            set("service.modality", v.clone().into());
        }
        if let Some(v) = &self.anatomy {
            set("service.anatomy", v.clone().into());
        }
        if let Some(v) = &self.description {
            set("service.description", v.clone().into());
        }
        if let Some(v) = self.volume_resolution {
            set("geometry.volume_resolution", v.to_vec().into());
        }
        if let Some(v) = self.volume_size {
            let v: Vec<i64> = v.iter().map(|&n| n as i64).collect();
            set("geometry.volume_size", v.into());
        }
        overrides
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    #[test]
    fn test_parse_triple_forms() {
        assert_eq!(parse_triple::<f64>("1.5,1.5,2").unwrap(), [1.5, 1.5, 2.0]);
        assert_eq!(parse_triple::<f64>("[1.5, 1.5, 2.5]").unwrap(), [1.5, 1.5, 2.5]);
        assert_eq!(parse_triple::<usize>("(96, 96, 64)").unwrap(), [96, 96, 64]);
        assert_eq!(parse_triple::<usize>("128").unwrap(), [128; 3]);
    }

    #[test]
    fn test_parse_triple_rejects_malformed() {
        assert!(parse_triple::<f64>("1.5,2").is_err());
        assert!(parse_triple::<usize>("a,b,c").is_err());
        assert!(parse_triple::<usize>("").is_err());
    }

    #[test]
    fn test_overrides_reach_config() {
        let cli = Cli::parse_from([
            "volseg-service",
            "--config",
            "does/not/exist.toml",
            "--model-path",
            "liver.onnx",
            "--input-tensor-name",
            "images:0",
            "--port",
            "9300",
            "--announce",
            "--anatomy",
            "Liver",
            "--volume-resolution",
            "[1.0, 1.0, 2.5]",
            "--volume-size",
            "64",
        ]);

        let config = AppConfig::load_with_overrides(&cli.config, cli.overrides()).unwrap();
        assert_eq!(config.model.path, "liver.onnx");
        assert_eq!(config.model.input_tensor, "images:0");
        assert_eq!(config.server.port, 9300);
        assert!(config.server.announce);
        assert_eq!(config.service.anatomy, "Liver");
        assert_eq!(config.service.name, "TEST");
        assert_eq!(config.geometry.volume_resolution, [1.0, 1.0, 2.5]);
        assert_eq!(config.geometry.volume_size, [64, 64, 64]);
    }

    #[test]
    fn test_no_flags_no_overrides() {
        let cli = Cli::parse_from(["volseg-service"]);
        assert!(cli.overrides().is_empty());
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_PATH));
    }
}
