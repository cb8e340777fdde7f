//! ONNX model loader

use anyhow::{Context, Result};
use ort::session::{builder::GraphOptimizationLevel, Session};
use std::path::Path;
use tracing::{info, warn};

/// Loaded ONNX model with its resolved tensor names
pub struct LoadedModel {
    /// Model name (file stem)
    pub name: String,
    /// ONNX Runtime session
    pub session: Session,
    /// Input tensor fed with the canonical-space batch
    pub input_name: String,
    /// Output tensor holding the probability map
    pub output_name: String,
}

/// Loader for ONNX models
pub struct ModelLoader {
    /// Number of threads for ONNX inference
    onnx_threads: usize,
}

/// Find `wanted` among `available`, accepting graph-style names such as
/// `images:0` for a tensor exported as `images`.
fn resolve_tensor_name(wanted: &str, available: &[String]) -> Option<String> {
    if available.iter().any(|name| name == wanted) {
        return Some(wanted.to_string());
    }
    let stripped = wanted.split_once(':').map(|(base, _)| base)?;
    available.iter().find(|name| *name == stripped).cloned()
}

impl ModelLoader {
    /// Create a new model loader with specified number of threads
    pub fn with_threads(onnx_threads: usize) -> Result<Self> {
        // Initialize ONNX Runtime
        ort::init().commit()?;
        info!(onnx_threads = onnx_threads, "ONNX Runtime initialized");
        Ok(Self { onnx_threads })
    }

    /// Load the segmentation model and bind its declared input/output tensors
    pub fn load_model<P: AsRef<Path>>(
        &self,
        path: P,
        input_tensor: &str,
        output_tensor: &str,
    ) -> Result<LoadedModel> {
        let path = path.as_ref();
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "model".to_string());

        info!(model = %name, path = %path.display(), threads = self.onnx_threads, "Loading ONNX model");

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(self.onnx_threads)?
            .commit_from_file(path)
            .context(format!("Failed to load model from {:?}", path))?;

        let inputs: Vec<String> = session.inputs.iter().map(|i| i.name.clone()).collect();
        let outputs: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();

        let input_name = resolve_tensor_name(input_tensor, &inputs).with_context(|| {
            format!("Model has no input tensor '{input_tensor}' (inputs: {inputs:?})")
        })?;
        let output_name = resolve_tensor_name(output_tensor, &outputs).with_context(|| {
            format!("Model has no output tensor '{output_tensor}' (outputs: {outputs:?})")
        })?;

        if inputs.len() > 1 {
            warn!(model = %name, inputs = ?inputs, "Model declares extra inputs; only one is fed");
        }

        info!(
            model = %name,
            input = %input_name,
            output = %output_name,
            "Model loaded successfully"
        );

        Ok(LoadedModel {
            name,
            session,
            input_name,
            output_name,
        })
    }
}
