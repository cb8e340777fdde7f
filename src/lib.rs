//! Volumetric Segmentation Service Library
//!
//! Normalises an uploaded 3D volume into the geometric and intensity space
//! a segmentation model was trained in, runs ONNX inference, and maps the
//! thresholded label volume back into the caller's original geometry.

pub mod cli;
pub mod codec;
pub mod config;
pub mod error;
pub mod metrics;
pub mod models;
pub mod service;
pub mod transforms;
pub mod types;

pub use config::AppConfig;
pub use error::{ServiceError, ServiceResult};
pub use models::inference::{InferenceRuntime, OnnxRuntime};
pub use service::{RawRequest, SegmentationService};
pub use types::{envelope::Envelope, record::Record, volume::Volume};
