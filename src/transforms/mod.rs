//! Reversible volume transforms and the chains that compose them.
//!
//! A [`Transform`] maps the values of its declared field(s) from one
//! representation to the next and leaves every other field alone. A
//! [`TransformChain`] runs its members left to right. Forward chains take a
//! scratch-file path to a 5D model batch; inverse chains mirror only the
//! geometry-relevant suffix and take a 5D label batch back to a grid in the
//! caller's geometry.

pub mod intensity;
pub mod io;
pub mod layout;
pub mod resolution;

pub use intensity::{CastToFloat32, IntensityRescale, RescaleIntensity};
pub use io::DecodeVolumeFile;
pub use layout::{ArrayToGrid, CropOrPadToSize, GridToArray, RestoreOriginalSize, StackBatch, UnstackBatch};
pub use resolution::{Interpolation, ResampleToOriginalResolution, ResampleToResolution};

use crate::error::{ServiceError, ServiceResult};
use crate::types::record::{Record, Value};
use std::fmt;
use tracing::debug;

/// Single-responsibility conversion step over one or more record fields
pub trait Transform: Send + Sync + fmt::Debug {
    /// Short stage name used in errors and logs
    fn name(&self) -> &'static str;

    /// Fields this transform writes. Everything else must come out untouched.
    fn fields(&self) -> Vec<String>;

    fn apply(&self, record: Record) -> ServiceResult<Record>;
}

/// Ordered, immutable composition of transforms
#[derive(Debug)]
pub struct TransformChain {
    transforms: Vec<Box<dyn Transform>>,
}

impl TransformChain {
    pub fn new(transforms: Vec<Box<dyn Transform>>) -> Self {
        Self { transforms }
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.transforms.iter().map(|t| t.name()).collect()
    }

    /// Run every transform in order; the first failure aborts the chain
    pub fn apply(&self, record: Record) -> ServiceResult<Record> {
        self.transforms.iter().try_fold(record, |record, transform| {
            debug!(stage = transform.name(), "Applying transform");
            transform.apply(record)
        })
    }
}

/// Error for a value whose representation does not fit the stage
pub(crate) fn unexpected(stage: &'static str, expected: &str, found: &Value) -> ServiceError {
    ServiceError::shape(stage, format!("expected {expected}, found {}", found.kind()))
}

/// Replace every value of `field` with `f(value)`
pub(crate) fn map_values<F>(
    record: &mut Record,
    field: &str,
    stage: &'static str,
    f: F,
) -> ServiceResult<()>
where
    F: FnMut(Value) -> ServiceResult<Value>,
{
    let values = record.take_required(field, stage)?;
    let mapped = values.into_iter().map(f).collect::<ServiceResult<Vec<_>>>()?;
    record.insert(field, mapped);
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::types::record::{Record, Value, THRESHOLD_FIELD, UIDS_FIELD};
    use crate::types::volume::{Geometry, Volume, VoxelBuffer};
    use ndarray::Array3;
    use uuid::Uuid;

    /// Ramp volume with distinct voxel values
    pub fn ramp_volume(size: [usize; 3], spacing: [f64; 3]) -> Volume {
        let geometry = Geometry::new(size, spacing);
        let data = Array3::from_shape_fn(geometry.array_shape(), |(z, y, x)| {
            (x + 2 * y + 3 * z) as u8
        });
        Volume::new(geometry, VoxelBuffer::UInt8(data)).unwrap()
    }

    /// Record with bystander fields so isolation can be checked
    pub fn record_with(field: &str, value: Value) -> Record {
        Record::new()
            .with(field, vec![value])
            .with(UIDS_FIELD, vec![Value::Uid(Uuid::nil())])
            .with(THRESHOLD_FIELD, vec![Value::Scalar(0.5)])
    }

    /// Assert that only `declared` fields differ between two records
    pub fn assert_isolated(before: &Record, after: &Record, declared: &[String]) {
        for (name, values) in before.fields() {
            if declared.iter().any(|d| d == name) {
                continue;
            }
            assert_eq!(after.get(name), Some(values.as_slice()), "field '{name}' changed");
        }
        for name in after.field_names() {
            assert!(
                before.contains(name) || declared.iter().any(|d| d == name),
                "undeclared field '{name}' appeared"
            );
        }
    }
}
