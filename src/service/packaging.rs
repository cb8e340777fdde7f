//! Thresholding and response packaging

use crate::codec;
use crate::error::{ServiceError, ServiceResult};
use crate::transforms::{unexpected, TransformChain};
use crate::types::envelope::Envelope;
use crate::types::record::{Record, Value, ELAPSED_TIME_FIELD, THRESHOLD_FIELD};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ndarray::ArrayD;
use std::io::Write;
use std::path::PathBuf;
use tracing::debug;
use uuid::Uuid;

const STAGE: &str = "packaging";

/// Binarise a probability map: strictly above `threshold` is foreground.
pub fn threshold(probabilities: &ArrayD<f32>, threshold: f64) -> ArrayD<f32> {
    probabilities.mapv(|p| if f64::from(p) > threshold { 1.0 } else { 0.0 })
}

/// What packaging produced besides the envelope
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PackageSummary {
    pub foreground_voxels: usize,
    pub total_voxels: usize,
    pub encoded_bytes: usize,
}

impl PackageSummary {
    pub fn foreground_fraction(&self) -> f64 {
        if self.total_voxels == 0 {
            0.0
        } else {
            self.foreground_voxels as f64 / self.total_voxels as f64
        }
    }
}

/// Thresholds the inference output, maps it back to the caller's geometry
/// and encodes it into the response envelope.
#[derive(Debug)]
pub struct Packager {
    inverse: TransformChain,
    segmentation_field: String,
    scratch_dir: PathBuf,
}

impl Packager {
    pub fn new(inverse: TransformChain, segmentation_field: &str, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            inverse,
            segmentation_field: segmentation_field.to_string(),
            scratch_dir: scratch_dir.into(),
        }
    }

    pub fn package(&self, record: Record) -> ServiceResult<Envelope> {
        self.package_with_summary(record).map(|(envelope, _)| envelope)
    }

    /// Either the full envelope is returned or the request fails. The
    /// `{uid}_seg.mha` scratch file is gone by the time this returns.
    pub fn package_with_summary(&self, mut record: Record) -> ServiceResult<(Envelope, PackageSummary)> {
        let cutoff = record
            .scalar(THRESHOLD_FIELD)
            .ok_or_else(|| ServiceError::shape(STAGE, "record has no threshold"))?;
        let elapsed = record.scalar(ELAPSED_TIME_FIELD).unwrap_or(0.0);
        let uid = record.uid().unwrap_or_else(Uuid::new_v4);

        let binarised = record
            .take_required(&self.segmentation_field, STAGE)?
            .into_iter()
            .map(|value| match value {
                Value::Array(probabilities) => Ok(Value::Array(threshold(&probabilities, cutoff))),
                other => Err(unexpected(STAGE, "an array", &other)),
            })
            .collect::<ServiceResult<Vec<_>>>()?;
        record.insert(self.segmentation_field.clone(), binarised);

        let mut record = self.inverse.apply(record)?;
        let volume = match record.take_required(&self.segmentation_field, STAGE)?.pop() {
            Some(Value::Grid(volume)) => volume,
            Some(other) => return Err(unexpected(STAGE, "a grid", &other)),
            None => return Err(ServiceError::shape(STAGE, "no segmentation to package")),
        };

        let labels = volume.as_f32(STAGE)?;
        let foreground_voxels = labels.iter().filter(|&&v| v > 0.0).count();
        let total_voxels = labels.len();

        let mut file = tempfile::Builder::new()
            .prefix(&format!("{uid}_seg"))
            .suffix(&format!(".{}", codec::EXTENSION))
            .rand_bytes(0)
            .tempfile_in(&self.scratch_dir)
            .map_err(|e| ServiceError::resource("creating segmentation scratch file", e))?;
        let encoded = codec::encode(&volume, true)?;
        file.write_all(&encoded)
            .and_then(|_| file.flush())
            .map_err(|e| ServiceError::resource("writing segmentation scratch file", e))?;

        let bytes = std::fs::read(file.path())
            .map_err(|e| ServiceError::resource("reading segmentation scratch file", e))?;
        file.close()
            .map_err(|e| ServiceError::resource("removing segmentation scratch file", e))?;

        let summary = PackageSummary {
            foreground_voxels,
            total_voxels,
            encoded_bytes: bytes.len(),
        };
        debug!(
            uid = %uid,
            encoded_bytes = summary.encoded_bytes,
            foreground_fraction = summary.foreground_fraction(),
            "Segmentation packaged"
        );

        Ok((Envelope::new(STANDARD.encode(&bytes), elapsed), summary))
    }
}
