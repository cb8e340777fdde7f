//! Segmentation model loading and inference

pub mod inference;
pub mod loader;

pub use inference::{InferenceAdapter, InferenceRuntime, OnnxRuntime};
pub use loader::{LoadedModel, ModelLoader};
