//! Inference runtime binding and the adapter that calls it once per request

use crate::config::ModelConfig;
use crate::error::{ServiceError, ServiceResult};
use crate::models::loader::{LoadedModel, ModelLoader};
use crate::transforms::unexpected;
use crate::types::record::{Record, Value, ELAPSED_TIME_FIELD};
use anyhow::Result;
use ndarray::{ArrayD, IxDyn};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info};

/// Executes the model graph on one canonical-space batch.
///
/// Implementations are shared process-wide, so `run` must be safe to call
/// from concurrent requests.
pub trait InferenceRuntime: Send + Sync {
    fn name(&self) -> &str;

    fn run(&self, input: &ArrayD<f32>) -> ServiceResult<ArrayD<f32>>;
}

/// ONNX Runtime session loaded once at start-up.
///
/// The session is behind a mutex: feed/fetch calls from concurrent requests
/// are serialised here and nowhere else.
pub struct OnnxRuntime {
    name: String,
    model: Mutex<LoadedModel>,
}

impl OnnxRuntime {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        let loader = ModelLoader::with_threads(config.onnx_threads)?;
        let model = loader.load_model(&config.path, &config.input_tensor, &config.output_tensor)?;
        info!(model = %model.name, "Inference runtime ready");
        Ok(Self {
            name: model.name.clone(),
            model: Mutex::new(model),
        })
    }
}

fn runtime_err(e: impl Into<anyhow::Error>) -> ServiceError {
    ServiceError::Runtime(e.into())
}

impl InferenceRuntime for OnnxRuntime {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, input: &ArrayD<f32>) -> ServiceResult<ArrayD<f32>> {
        use ort::value::Tensor;

        let shape: Vec<i64> = input.shape().iter().map(|&d| d as i64).collect();
        let data: Vec<f32> = input.iter().copied().collect();
        let input_tensor = Tensor::from_array((shape, data)).map_err(runtime_err)?;

        let mut model = self
            .model
            .lock()
            .map_err(|e| runtime_err(anyhow::anyhow!("Lock error: {}", e)))?;
        let LoadedModel {
            session,
            input_name,
            output_name,
            ..
        } = &mut *model;

        let outputs = session
            .run(ort::inputs![input_name.as_str() => input_tensor])
            .map_err(runtime_err)?;
        let output = outputs.get(output_name.as_str()).ok_or_else(|| {
            runtime_err(anyhow::anyhow!("Model produced no '{}' output", output_name))
        })?;

        let (out_shape, out_data) = output.try_extract_tensor::<f32>().map_err(runtime_err)?;
        let dims: Vec<usize> = out_shape.iter().map(|&d| d.max(0) as usize).collect();
        ArrayD::from_shape_vec(IxDyn(&dims), out_data.to_vec()).map_err(|e| {
            ServiceError::shape("inference", format!("output tensor is inconsistent: {e}"))
        })
    }
}

/// Binds the record's canonical-space batch to the runtime and stores the
/// raw probability map plus the wall-clock inference time.
pub struct InferenceAdapter {
    runtime: Arc<dyn InferenceRuntime>,
    input_field: String,
    output_field: String,
}

impl InferenceAdapter {
    pub fn new(runtime: Arc<dyn InferenceRuntime>, input_field: &str, output_field: &str) -> Self {
        Self {
            runtime,
            input_field: input_field.to_string(),
            output_field: output_field.to_string(),
        }
    }

    pub fn runtime_name(&self) -> &str {
        self.runtime.name()
    }

    /// Run the model once. Runtime failures propagate unchanged; there is no
    /// retry.
    pub fn infer(&self, mut record: Record) -> ServiceResult<Record> {
        const STAGE: &str = "inference";

        let batch = match record.require(&self.input_field, STAGE)? {
            [Value::Array(batch)] if batch.ndim() == 5 => batch,
            [other] => return Err(unexpected(STAGE, "a 5D array", other)),
            values => {
                return Err(ServiceError::shape(
                    STAGE,
                    format!("expected one batch, found {}", values.len()),
                ))
            }
        };

        let start = Instant::now();
        let output = self.runtime.run(batch)?;
        let elapsed = start.elapsed().as_secs_f64();

        if output.shape() != batch.shape() {
            return Err(ServiceError::shape(
                STAGE,
                format!(
                    "model returned {:?} for input {:?}",
                    output.shape(),
                    batch.shape()
                ),
            ));
        }

        debug!(
            model = %self.runtime.name(),
            elapsed_ms = elapsed * 1000.0,
            "Inference complete"
        );

        record.insert(self.output_field.clone(), vec![Value::Array(output)]);
        record.insert(ELAPSED_TIME_FIELD, vec![Value::Scalar(elapsed)]);
        Ok(record)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Runtime returning a constant probability map of the input's shape
    pub struct ConstantRuntime {
        pub value: f32,
        pub calls: AtomicUsize,
    }

    impl ConstantRuntime {
        pub fn new(value: f32) -> Self {
            Self {
                value,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl InferenceRuntime for ConstantRuntime {
        fn name(&self) -> &str {
            "constant"
        }

        fn run(&self, input: &ArrayD<f32>) -> ServiceResult<ArrayD<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ArrayD::from_elem(input.shape(), self.value))
        }
    }

    /// Runtime echoing its input, used for geometry round trips
    pub struct IdentityRuntime;

    impl InferenceRuntime for IdentityRuntime {
        fn name(&self) -> &str {
            "identity"
        }

        fn run(&self, input: &ArrayD<f32>) -> ServiceResult<ArrayD<f32>> {
            Ok(input.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::types::record::{IMAGE_FIELD, SEGMENTATION_FIELD};

    struct WrongShapeRuntime;

    impl InferenceRuntime for WrongShapeRuntime {
        fn name(&self) -> &str {
            "wrong_shape"
        }

        fn run(&self, _input: &ArrayD<f32>) -> ServiceResult<ArrayD<f32>> {
            Ok(ArrayD::zeros(vec![1, 2, 2, 2, 2]))
        }
    }

    struct FailingRuntime;

    impl InferenceRuntime for FailingRuntime {
        fn name(&self) -> &str {
            "failing"
        }

        fn run(&self, _input: &ArrayD<f32>) -> ServiceResult<ArrayD<f32>> {
            Err(ServiceError::Runtime(anyhow::anyhow!("out of memory")))
        }
    }

    fn batch_record() -> Record {
        Record::new().with(
            IMAGE_FIELD,
            vec![Value::Array(ArrayD::zeros(vec![1, 4, 4, 4, 1]))],
        )
    }

    #[test]
    fn test_infer_stores_output_and_elapsed_time() {
        let runtime = Arc::new(ConstantRuntime::new(0.6));
        let adapter = InferenceAdapter::new(runtime.clone(), IMAGE_FIELD, SEGMENTATION_FIELD);

        let record = adapter.infer(batch_record()).unwrap();
        assert_eq!(runtime.calls(), 1);
        match &record.get(SEGMENTATION_FIELD).unwrap()[0] {
            Value::Array(a) => {
                assert_eq!(a.shape(), &[1, 4, 4, 4, 1]);
                assert!(a.iter().all(|&v| v == 0.6));
            }
            other => panic!("expected array, found {}", other.kind()),
        }
        assert!(record.scalar(ELAPSED_TIME_FIELD).unwrap() >= 0.0);
    }

    #[test]
    fn test_infer_rejects_non_batch_input() {
        let runtime = Arc::new(ConstantRuntime::new(0.6));
        let adapter = InferenceAdapter::new(runtime.clone(), IMAGE_FIELD, SEGMENTATION_FIELD);
        let record = Record::new().with(
            IMAGE_FIELD,
            vec![Value::Array(ArrayD::zeros(vec![4, 4, 4]))],
        );

        assert_eq!(adapter.infer(record).unwrap_err().kind(), "shape_mismatch");
        assert_eq!(runtime.calls(), 0);
    }

    #[test]
    fn test_infer_rejects_output_shape_change() {
        let adapter = InferenceAdapter::new(Arc::new(WrongShapeRuntime), IMAGE_FIELD, SEGMENTATION_FIELD);
        assert_eq!(adapter.infer(batch_record()).unwrap_err().kind(), "shape_mismatch");
    }

    #[test]
    fn test_runtime_errors_propagate() {
        let adapter = InferenceAdapter::new(Arc::new(FailingRuntime), IMAGE_FIELD, SEGMENTATION_FIELD);
        let err = adapter.infer(batch_record()).unwrap_err();
        assert_eq!(err.kind(), "runtime");
        assert!(err.to_string().contains("out of memory"));
    }
}
